//! Scoring live requests against learned patterns
//!
//! Everything here is a pure function of the request, the pattern's committed
//! state and the configured thresholds. Age is measured against the request
//! timestamp, never the wall clock, so the same inputs always score the same.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::config::MatchingConfig;
use crate::pattern::{AutomationRequest, LOCATOR_KEYS, Pattern, Payload, RequestContext};

const HOSTNAME_WEIGHT: f64 = 3.0;
const PATH_WEIGHT: f64 = 2.0;
const FINGERPRINT_WEIGHT: f64 = 1.0;

const LOCATOR_MISMATCH_SCORE: f64 = 0.2;

const PAYLOAD_WEIGHT: f64 = 0.4;
const CONTEXT_WEIGHT: f64 = 0.3;
const CONFIDENCE_WEIGHT: f64 = 0.3;

/// Derived match factors for one (request, pattern) pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchCriteria {
    pub kind_match: bool,
    pub payload_similarity: f64,
    pub context_compatibility: f64,
    /// Informational only; not used to gate execution
    pub confidence_threshold: f64,
    pub overall_score: f64,
}

/// Why a pattern cannot be used in a request's context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ContextRejection {
    HostnameMismatch { expected: String, actual: String },
    PathIncompatible { compatibility: f64 },
    TooOld { age_days: f64 },
    FingerprintDrift { success_rate: f64 },
}

impl fmt::Display for ContextRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextRejection::HostnameMismatch { expected, actual } => {
                write!(f, "pattern learned on {expected}, request from {actual}")
            }
            ContextRejection::PathIncompatible { compatibility } => {
                write!(f, "path compatibility {compatibility:.2} too low")
            }
            ContextRejection::TooOld { age_days } => {
                write!(f, "pattern is {age_days:.1} days old")
            }
            ContextRejection::FingerprintDrift { success_rate } => {
                write!(f, "page structure changed and success rate {success_rate:.2} is not proven")
            }
        }
    }
}

/// A candidate pattern with its score for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMatch {
    pub pattern: Pattern,
    pub criteria: MatchCriteria,
    pub good: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MatchEngine {
    config: MatchingConfig,
}

impl MatchEngine {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn score(&self, request: &AutomationRequest, pattern: &Pattern) -> MatchCriteria {
        let kind_match = request.request_kind == pattern.request_kind;
        let payload_similarity = payload_similarity(&request.payload, &pattern.payload_shape);
        let context_compatibility = context_compatibility(&request.context, pattern);
        let confidence_threshold = confidence_threshold(pattern, request.context.timestamp);

        let overall_score = if kind_match {
            (PAYLOAD_WEIGHT * payload_similarity
                + CONTEXT_WEIGHT * context_compatibility
                + CONFIDENCE_WEIGHT * pattern.confidence())
            .clamp(0.0, 1.0)
        } else {
            0.0
        };

        MatchCriteria {
            kind_match,
            payload_similarity,
            context_compatibility,
            confidence_threshold,
            overall_score,
        }
    }

    /// Applicability gate for replaying without a human
    pub fn is_good_match(&self, criteria: &MatchCriteria) -> bool {
        criteria.kind_match
            && criteria.overall_score >= self.config.good_match_score
            && criteria.context_compatibility >= self.config.min_context_compatibility
    }

    pub fn check_context(&self, context: &RequestContext, pattern: &Pattern) -> Result<(), ContextRejection> {
        if context.hostname != pattern.origin.hostname {
            return Err(ContextRejection::HostnameMismatch {
                expected: pattern.origin.hostname.clone(),
                actual: context.hostname.clone(),
            });
        }

        let compatibility = path_compatibility(&context.pathname, &pattern.origin.path);
        if compatibility < self.config.min_path_compatibility {
            return Err(ContextRejection::PathIncompatible { compatibility });
        }

        let age_days = pattern.age_days(context.timestamp);
        if age_days > self.config.max_pattern_age_days {
            return Err(ContextRejection::TooOld { age_days });
        }

        if let (Some(live), Some(learned)) =
            (&context.structural_fingerprint, &pattern.origin.structural_fingerprint)
        {
            let success_rate = pattern.success_rate();
            if live != learned && success_rate <= self.config.fingerprint_drift_success_rate {
                return Err(ContextRejection::FingerprintDrift { success_rate });
            }
        }

        Ok(())
    }

    pub fn is_valid_for_context(&self, context: &RequestContext, pattern: &Pattern) -> bool {
        self.check_context(context, pattern).is_ok()
    }

    /// Score every context-valid candidate, best first.
    ///
    /// Ties on score are broken by confidence, then by id.
    pub fn rank<'a, I>(&self, request: &AutomationRequest, candidates: I) -> Vec<ScoredMatch>
    where
        I: IntoIterator<Item = &'a Pattern>,
    {
        let mut ranked: Vec<ScoredMatch> = candidates
            .into_iter()
            .filter(|pattern| match self.check_context(&request.context, pattern) {
                Ok(()) => true,
                Err(rejection) => {
                    tracing::trace!("Pattern {} skipped: {}", pattern.id, rejection);
                    false
                }
            })
            .map(|pattern| {
                let criteria = self.score(request, pattern);
                ScoredMatch { pattern: pattern.clone(), good: self.is_good_match(&criteria), criteria }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.criteria
                .overall_score
                .total_cmp(&a.criteria.overall_score)
                .then(b.pattern.confidence().total_cmp(&a.pattern.confidence()))
                .then(a.pattern.id.cmp(&b.pattern.id))
        });

        tracing::debug!(
            "Ranked {} candidates for {} on {}",
            ranked.len(),
            request.request_kind,
            request.context.hostname
        );

        ranked
    }

    /// Highest ranked candidate that clears the applicability gate
    pub fn best_match<'a, I>(&self, request: &AutomationRequest, candidates: I) -> Option<ScoredMatch>
    where
        I: IntoIterator<Item = &'a Pattern>,
    {
        self.rank(request, candidates).into_iter().find(|m| m.good)
    }
}

/// Average per-key similarity over the union of keys of both payloads
pub fn payload_similarity(request: &Payload, learned: &Payload) -> f64 {
    let keys: BTreeSet<&String> = request.keys().chain(learned.keys()).collect();
    if keys.is_empty() {
        return 1.0;
    }

    let total: f64 = keys
        .iter()
        .map(|key| match (request.get(*key), learned.get(*key)) {
            (Some(a), Some(b)) => value_similarity(key, a, b),
            _ => 0.0,
        })
        .sum();

    total / keys.len() as f64
}

fn value_similarity(key: &str, a: &serde_json::Value, b: &serde_json::Value) -> f64 {
    use serde_json::Value;

    if LOCATOR_KEYS.contains(&key) {
        return if a == b { 1.0 } else { LOCATOR_MISMATCH_SCORE };
    }

    match (a, b) {
        (Value::String(a), Value::String(b)) => string_similarity(a, b),
        _ if a == b => 1.0,
        _ => 0.0,
    }
}

/// `1 - levenshtein(a, b) / max(len)` over characters
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }

    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (previous[j + 1] + 1).min(current[j] + 1).min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

fn path_segments(path: &str) -> BTreeSet<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Shared path segments over all segments; identical paths are fully compatible
pub fn path_compatibility(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }

    let a = path_segments(a);
    let b = path_segments(b);
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }

    a.intersection(&b).count() as f64 / union as f64
}

fn context_compatibility(context: &RequestContext, pattern: &Pattern) -> f64 {
    let mut score = 0.0;
    let mut weight = HOSTNAME_WEIGHT + PATH_WEIGHT;

    if context.hostname == pattern.origin.hostname {
        score += HOSTNAME_WEIGHT;
    }
    score += PATH_WEIGHT * path_compatibility(&context.pathname, &pattern.origin.path);

    if let (Some(live), Some(learned)) =
        (&context.structural_fingerprint, &pattern.origin.structural_fingerprint)
    {
        weight += FINGERPRINT_WEIGHT;
        if live == learned {
            score += FINGERPRINT_WEIGHT;
        }
    }

    score / weight
}

fn confidence_threshold(pattern: &Pattern, at: chrono::DateTime<chrono::Utc>) -> f64 {
    let age_relief = (pattern.age_days(at) / 30.0 * 0.2).min(0.2);
    (0.6 + 0.2 * pattern.success_rate() - age_relief).max(0.4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::pattern::fixtures;
    use crate::pattern::{ActionKind, ExecutionRecord};
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::json;

    fn engine() -> MatchEngine {
        MatchEngine::default()
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
        assert!((string_similarity("Hello", "Hallo") - 0.8).abs() < 1e-9);
        assert_eq!(string_similarity("", ""), 1.0);
    }

    #[test]
    fn test_payload_similarity_rules() {
        let a: Payload = serde_json::from_value(json!({"selector": "#a", "value": "Hello"})).unwrap();
        let b: Payload = serde_json::from_value(json!({"selector": "#b", "value": "Hello"})).unwrap();
        assert!((payload_similarity(&a, &b) - 0.6).abs() < 1e-9);

        let c: Payload = serde_json::from_value(json!({"count": 3, "extra": true})).unwrap();
        let d: Payload = serde_json::from_value(json!({"count": 3})).unwrap();
        assert!((payload_similarity(&c, &d) - 0.5).abs() < 1e-9);

        assert_eq!(payload_similarity(&Payload::new(), &Payload::new()), 1.0);
    }

    #[test]
    fn test_path_compatibility() {
        assert_eq!(path_compatibility("/chat/new", "/chat/new"), 1.0);
        assert_eq!(path_compatibility("/", "/"), 1.0);
        assert!((path_compatibility("/chat/new", "/chat/old") - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(path_compatibility("/", "/chat"), 0.0);
    }

    #[test]
    fn test_identical_request_is_good_match() {
        let pattern = fixtures::pattern(ActionKind::FillText, "a.com", "/chat", "#prompt");
        let request = fixtures::request(ActionKind::FillText, "a.com", "/chat", "#prompt");

        let criteria = engine().score(&request, &pattern);
        assert!(criteria.kind_match);
        assert_eq!(criteria.payload_similarity, 1.0);
        assert_eq!(criteria.context_compatibility, 1.0);
        assert_eq!(criteria.overall_score, 1.0);
        assert!(engine().is_good_match(&criteria));
    }

    #[test]
    fn test_kind_mismatch_scores_zero() {
        let pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "#send");
        let request = fixtures::request(ActionKind::Submit, "a.com", "/", "#send");

        let criteria = engine().score(&request, &pattern);
        assert!(!criteria.kind_match);
        assert_eq!(criteria.overall_score, 0.0);
        assert!(!engine().is_good_match(&criteria));
    }

    #[test]
    fn test_confidence_threshold_is_diagnostic() {
        let mut pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "#send");
        let request = fixtures::request(ActionKind::Click, "a.com", "/", "#send");
        assert!((engine().score(&request, &pattern).confidence_threshold - 0.6).abs() < 1e-9);

        for _ in 0..4 {
            pattern.record_execution(ExecutionRecord::success(fixtures::now(), 1));
        }
        assert!((engine().score(&request, &pattern).confidence_threshold - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_hostname_mismatch_always_invalid() {
        let pattern = fixtures::pattern(ActionKind::Click, "b.com", "/", "#send");
        let request = fixtures::request(ActionKind::Click, "a.com", "/", "#send");

        assert!(!engine().is_valid_for_context(&request.context, &pattern));
        assert!(matches!(
            engine().check_context(&request.context, &pattern),
            Err(ContextRejection::HostnameMismatch { .. })
        ));
    }

    #[test]
    fn test_context_validity_gates() {
        let pattern = fixtures::pattern(ActionKind::Click, "a.com", "/chat/new", "#send");

        let mut far_path = fixtures::context("a.com", "/settings/profile");
        assert!(!engine().is_valid_for_context(&far_path, &pattern));
        far_path.pathname = "/chat/new".to_string();
        assert!(engine().is_valid_for_context(&far_path, &pattern));

        let mut later = fixtures::context("a.com", "/chat/new");
        later.timestamp = fixtures::now() + Duration::days(31);
        assert!(matches!(
            engine().check_context(&later, &pattern),
            Err(ContextRejection::TooOld { .. })
        ));
    }

    #[test]
    fn test_fingerprint_drift_needs_proven_pattern() {
        let mut definition = fixtures::definition(ActionKind::Click, "a.com", "/", "#send");
        definition.origin.structural_fingerprint = Some("v1".to_string());
        let mut pattern = crate::pattern::Pattern::new(definition, fixtures::now());

        let mut context = fixtures::context("a.com", "/");
        context.structural_fingerprint = Some("v2".to_string());
        assert!(!engine().is_valid_for_context(&context, &pattern));

        for _ in 0..9 {
            pattern.record_execution(ExecutionRecord::success(fixtures::now(), 1));
        }
        pattern.record_execution(ExecutionRecord::failure(
            fixtures::now(),
            FailureReason::CapabilityFailure,
            "miss",
            1,
        ));
        assert!(engine().is_valid_for_context(&context, &pattern));
    }

    #[test]
    fn test_rank_orders_and_filters() {
        let exact = fixtures::pattern(ActionKind::FillText, "a.com", "/chat", "#prompt");
        let other_locator = fixtures::pattern(ActionKind::FillText, "a.com", "/chat", "#other");
        let foreign = fixtures::pattern(ActionKind::FillText, "b.com", "/chat", "#prompt");
        let request = fixtures::request(ActionKind::FillText, "a.com", "/chat", "#prompt");

        let candidates = [other_locator.clone(), foreign, exact.clone()];
        let ranked = engine().rank(&request, &candidates);

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].pattern.id, exact.id);
        assert_eq!(ranked[1].pattern.id, other_locator.id);

        let best = engine().best_match(&request, &candidates).unwrap();
        assert_eq!(best.pattern.id, exact.id);
    }

    proptest! {
        #[test]
        fn prop_scoring_is_deterministic_and_bounded(
            value in "[a-zA-Z ]{0,12}",
            selector in "#[a-z]{1,6}",
            path in "/[a-z]{0,5}(/[a-z]{1,5})?",
            successes in 0usize..12,
        ) {
            let mut pattern = fixtures::pattern(ActionKind::FillText, "a.com", "/chat", "#prompt");
            for _ in 0..successes {
                pattern.record_execution(ExecutionRecord::success(fixtures::now(), 1));
            }

            let mut request = fixtures::request(ActionKind::FillText, "a.com", &path, &selector);
            request.payload.insert("value".to_string(), json!(value));

            let first = engine().score(&request, &pattern);
            let second = engine().score(&request, &pattern);
            prop_assert_eq!(first, second);
            prop_assert!((0.0..=1.0).contains(&first.overall_score));
            prop_assert!((0.0..=1.0).contains(&first.payload_similarity));
            prop_assert!((0.0..=1.0).contains(&first.context_compatibility));
        }
    }
}
