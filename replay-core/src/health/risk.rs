//! Risk assessment and ranked recommendations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::metrics::PerformanceMetrics;
use super::{Finding, HealthCategory, RuleStatus, Severity};
use crate::pattern::Pattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.6 {
            RiskLevel::Critical
        } else if score >= 0.4 {
            RiskLevel::High
        } else if score >= 0.2 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    LocatorBreakage,
    ExecutionFailure,
    StaleContext,
    PageDrift,
    DataExposure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Risk {
    pub risk_type: RiskType,
    pub likelihood: f64,
    pub impact: f64,
    pub description: String,
}

impl Risk {
    pub fn score(&self) -> f64 {
        self.likelihood * self.impact
    }

    pub fn level(&self) -> RiskLevel {
        RiskLevel::from_score(self.score())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risks: Vec<Risk>,
    pub overall: RiskLevel,
}

impl RiskAssessment {
    pub fn assess(
        pattern: &Pattern,
        findings: &[Finding],
        metrics: &PerformanceMetrics,
        now: DateTime<Utc>,
    ) -> Self {
        let mut risks = vec![
            Risk {
                risk_type: RiskType::LocatorBreakage,
                likelihood: 1.0 - metrics.locator_reliability,
                impact: 0.7,
                description: "The target element may no longer be found".to_string(),
            },
            Risk {
                risk_type: RiskType::ExecutionFailure,
                likelihood: metrics.error_proneness,
                impact: 0.6,
                description: "Replays may fail and lower confidence".to_string(),
            },
        ];

        let age_ratio = (pattern.age_days(now) / 30.0).min(1.0);
        if age_ratio > 0.0 {
            risks.push(Risk {
                risk_type: RiskType::StaleContext,
                likelihood: age_ratio,
                impact: 0.5,
                description: format!("Learned {:.0} days ago", pattern.age_days(now)),
            });
        }

        if pattern.origin.structural_fingerprint.is_none() {
            risks.push(Risk {
                risk_type: RiskType::PageDrift,
                likelihood: 0.3,
                impact: 0.4,
                description: "No page fingerprint to detect layout changes".to_string(),
            });
        }

        let security_failures = findings
            .iter()
            .filter(|f| f.category == HealthCategory::Security && f.status == RuleStatus::Failure)
            .count();
        if security_failures > 0 {
            risks.push(Risk {
                risk_type: RiskType::DataExposure,
                likelihood: (0.5 + 0.25 * security_failures as f64).min(1.0),
                impact: 1.0,
                description: format!("{security_failures} security rules failed"),
            });
        }

        risks.sort_by(|a, b| b.score().total_cmp(&a.score()));
        let overall = risks.first().map_or(RiskLevel::Low, Risk::level);

        Self { risks, overall }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Trivial,
    Moderate,
    Substantial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub effort: Effort,
    /// Expected health score gain, 0 to 1
    pub expected_impact: f64,
    pub action: String,
    pub source: String,
}

/// Recommendations from findings and significant risks, most urgent first
pub fn recommend(findings: &[Finding], risk: &RiskAssessment) -> Vec<Recommendation> {
    let mut recommendations: Vec<Recommendation> = findings
        .iter()
        .filter(|f| f.status != RuleStatus::Pass)
        .map(|f| {
            let priority = match (f.status, f.severity) {
                (_, Severity::Critical) => Priority::Critical,
                (RuleStatus::Failure, _) | (_, Severity::Error) => Priority::High,
                (_, Severity::Warning) => Priority::Medium,
                _ => Priority::Low,
            };
            let effort = if f.auto_fixable { Effort::Trivial } else { Effort::Moderate };

            Recommendation {
                priority,
                effort,
                expected_impact: f.severity.penalty() / 100.0,
                action: f.suggestion.clone().unwrap_or_else(|| format!("Address: {}", f.message)),
                source: f.rule_id.clone(),
            }
        })
        .collect();

    for r in risk.risks.iter().filter(|r| r.level() >= RiskLevel::High) {
        let action = match r.risk_type {
            RiskType::LocatorBreakage => "Record more stable fallback locators",
            RiskType::ExecutionFailure => "Retrain the pattern on the current page",
            RiskType::StaleContext => "Re-confirm the pattern on the current page",
            RiskType::PageDrift => "Capture a page fingerprint when relearning",
            RiskType::DataExposure => "Remove the pattern until its payload is cleaned",
        };

        recommendations.push(Recommendation {
            priority: if r.level() == RiskLevel::Critical { Priority::Critical } else { Priority::High },
            effort: Effort::Substantial,
            expected_impact: r.score(),
            action: action.to_string(),
            source: format!("risk.{:?}", r.risk_type).to_lowercase(),
        });
    }

    recommendations.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.expected_impact.total_cmp(&a.expected_impact))
            .then(a.effort.cmp(&b.effort))
    });

    recommendations
}
