//! Reliability, staleness and retraining heuristics over a pattern's state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pattern::Pattern;

const RECENT_WINDOW: usize = 5;
const RECENT_FAILURE_LIMIT: usize = 3;
const MIN_USES_FOR_RATE: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    Unreliable,
    Low,
    Medium,
    High,
}

impl Reliability {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Reliability::High
        } else if score >= 0.6 {
            Reliability::Medium
        } else if score >= 0.4 {
            Reliability::Low
        } else {
            Reliability::Unreliable
        }
    }
}

impl fmt::Display for Reliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Reliability::Unreliable => "unreliable",
            Reliability::Low => "low",
            Reliability::Medium => "medium",
            Reliability::High => "high",
        };
        f.write_str(label)
    }
}

/// Why a pattern was flagged for retraining
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainingCause {
    LowSuccessRate,
    Stale,
    RecentFailures,
}

impl Pattern {
    /// Composite reliability in [0, 1]
    pub fn reliability_score(&self, now: DateTime<Utc>) -> f64 {
        let mut score = self.confidence() * (0.5 + 0.5 * self.success_rate());

        let age = self.age_days(now);
        if age > 30.0 {
            score *= 0.3;
        } else if age > 7.0 {
            score *= 0.7;
        }

        if self.usage_count() >= 5 {
            score *= 1.1;
        }

        score.clamp(0.0, 1.0)
    }

    pub fn reliability(&self, now: DateTime<Utc>) -> Reliability {
        Reliability::from_score(self.reliability_score(now))
    }

    /// Learned more than two weeks ago and unused for more than a week
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.age_days(now) > 14.0 && self.days_since_last_execution(now) > 7.0
    }

    /// Failures among the most recent recorded outcomes
    pub fn recent_failures(&self) -> usize {
        self.execution_history()
            .iter()
            .rev()
            .take(RECENT_WINDOW)
            .filter(|record| !record.success)
            .count()
    }

    pub fn retraining_causes(&self, now: DateTime<Utc>) -> Vec<RetrainingCause> {
        let mut causes = Vec::new();

        if self.usage_count() >= MIN_USES_FOR_RATE && self.success_rate() < 0.5 {
            causes.push(RetrainingCause::LowSuccessRate);
        }
        if self.is_stale(now) {
            causes.push(RetrainingCause::Stale);
        }
        if self.recent_failures() >= RECENT_FAILURE_LIMIT {
            causes.push(RetrainingCause::RecentFailures);
        }

        causes
    }

    /// Advisory: the pattern should go back through the training flow
    pub fn should_be_retrained(&self, now: DateTime<Utc>) -> bool {
        !self.retraining_causes(now).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::pattern::fixtures;
    use crate::pattern::{ActionKind, ExecutionRecord};
    use chrono::Duration;

    fn fail(pattern: &mut Pattern) {
        pattern.record_execution(ExecutionRecord::failure(
            fixtures::now(),
            FailureReason::CapabilityFailure,
            "not found",
            1,
        ));
    }

    fn succeed(pattern: &mut Pattern) {
        pattern.record_execution(ExecutionRecord::success(fixtures::now(), 1));
    }

    #[test]
    fn test_reliability_classes() {
        assert_eq!(Reliability::from_score(0.85), Reliability::High);
        assert_eq!(Reliability::from_score(0.6), Reliability::Medium);
        assert_eq!(Reliability::from_score(0.45), Reliability::Low);
        assert_eq!(Reliability::from_score(0.1), Reliability::Unreliable);
    }

    #[test]
    fn test_new_pattern_reliability() {
        let pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "#send");
        // 1.0 * (0.5 + 0) = 0.5
        assert_eq!(pattern.reliability(fixtures::now()), Reliability::Low);
    }

    #[test]
    fn test_reliability_age_penalty_and_usage_bonus() {
        let mut pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "#send");
        for _ in 0..5 {
            succeed(&mut pattern);
        }
        assert_eq!(pattern.reliability(fixtures::now()), Reliability::High);
        assert_eq!(pattern.reliability(fixtures::now() + Duration::days(10)), Reliability::High);
        // 1.25 * 0.3 * 1.1
        assert_eq!(pattern.reliability(fixtures::now() + Duration::days(40)), Reliability::Low);
    }

    #[test]
    fn test_recent_failures_trigger_retraining() {
        let mut pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "#send");
        for _ in 0..5 {
            succeed(&mut pattern);
        }
        fail(&mut pattern);
        fail(&mut pattern);
        assert!(!pattern.should_be_retrained(fixtures::now()));

        fail(&mut pattern);
        assert_eq!(pattern.retraining_causes(fixtures::now()), vec![RetrainingCause::RecentFailures]);
    }

    #[test]
    fn test_low_success_rate_needs_enough_uses() {
        let mut pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "#send");
        fail(&mut pattern);
        fail(&mut pattern);
        assert!(!pattern.retraining_causes(fixtures::now()).contains(&RetrainingCause::LowSuccessRate));

        succeed(&mut pattern);
        assert!(pattern.retraining_causes(fixtures::now()).contains(&RetrainingCause::LowSuccessRate));
    }

    #[test]
    fn test_staleness_uses_learning_time_when_never_run() {
        let pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "#send");
        assert!(!pattern.is_stale(fixtures::now() + Duration::days(10)));
        assert!(pattern.is_stale(fixtures::now() + Duration::days(15)));
        assert_eq!(
            pattern.retraining_causes(fixtures::now() + Duration::days(15)),
            vec![RetrainingCause::Stale]
        );
    }
}
