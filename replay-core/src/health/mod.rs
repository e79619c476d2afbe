//! Pattern health auditing
//!
//! Reports are point-in-time snapshots computed from a cloned pattern, so a
//! concurrent execution can make a report stale but never inconsistent.

pub mod metrics;
pub mod risk;
pub mod rules;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::error::FailureReason;
use crate::events::ReplayEvent;
use crate::lifecycle::{Reliability, RetrainingCause};
use crate::pattern::{Pattern, PatternId};
use crate::store::{PatternStore, Result, StoreError};

pub use metrics::PerformanceMetrics;
pub use risk::{Effort, Priority, Recommendation, Risk, RiskAssessment, RiskLevel, RiskType};
pub use rules::{Issue, RuleContext, ValidationRule, default_rules};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthCategory {
    Syntax,
    Semantics,
    Performance,
    Reliability,
    Maintainability,
    Security,
    Compatibility,
    BestPractices,
}

impl HealthCategory {
    pub const ALL: [HealthCategory; 8] = [
        HealthCategory::Syntax,
        HealthCategory::Semantics,
        HealthCategory::Performance,
        HealthCategory::Reliability,
        HealthCategory::Maintainability,
        HealthCategory::Security,
        HealthCategory::Compatibility,
        HealthCategory::BestPractices,
    ];

    /// Weight of the category in the overall score
    pub fn weight(&self) -> f64 {
        match self {
            HealthCategory::Security => 2.0,
            HealthCategory::Semantics | HealthCategory::Reliability => 1.5,
            HealthCategory::Syntax | HealthCategory::Performance | HealthCategory::Compatibility => 1.0,
            HealthCategory::Maintainability | HealthCategory::BestPractices => 0.75,
        }
    }
}

impl fmt::Display for HealthCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthCategory::Syntax => "syntax",
            HealthCategory::Semantics => "semantics",
            HealthCategory::Performance => "performance",
            HealthCategory::Reliability => "reliability",
            HealthCategory::Maintainability => "maintainability",
            HealthCategory::Security => "security",
            HealthCategory::Compatibility => "compatibility",
            HealthCategory::BestPractices => "best-practices",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Points a failing rule of this severity costs its category
    pub fn penalty(&self) -> f64 {
        match self {
            Severity::Info => 5.0,
            Severity::Warning => 15.0,
            Severity::Error => 30.0,
            Severity::Critical => 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Pass,
    Warning,
    Failure,
}

/// Result of one rule against one pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    pub category: HealthCategory,
    pub status: RuleStatus,
    pub severity: Severity,
    pub message: String,
    pub suggestion: Option<String>,
    pub auto_fixable: bool,
}

impl Finding {
    fn from_rule(rule: &dyn ValidationRule, issue: Option<Issue>) -> Self {
        match issue {
            None => Self {
                rule_id: rule.id().to_string(),
                category: rule.category(),
                status: RuleStatus::Pass,
                severity: Severity::Info,
                message: "ok".to_string(),
                suggestion: None,
                auto_fixable: false,
            },
            Some(issue) => Self {
                rule_id: rule.id().to_string(),
                category: rule.category(),
                status: issue.status,
                severity: issue.severity,
                message: issue.message,
                suggestion: issue.suggestion,
                auto_fixable: rule.auto_fixable(),
            },
        }
    }

    /// Score deduction: warnings cost half of a failure
    pub fn penalty(&self) -> f64 {
        match self.status {
            RuleStatus::Pass => 0.0,
            RuleStatus::Warning => self.severity.penalty() * 0.5,
            RuleStatus::Failure => self.severity.penalty(),
        }
    }

    pub fn reason(&self) -> Option<FailureReason> {
        (self.status == RuleStatus::Failure).then_some(FailureReason::ValidationRuleFailure)
    }
}

/// Field-level change made by an auto-fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub pattern_id: PatternId,
    pub pattern_version: u32,
    pub generated_at: DateTime<Utc>,
    pub overall_score: f64,
    pub category_scores: BTreeMap<HealthCategory, f64>,
    /// Every rule's result, passes included
    pub checks: Vec<Finding>,
    pub metrics: PerformanceMetrics,
    pub risk: RiskAssessment,
    pub recommendations: Vec<Recommendation>,
    pub reliability: Reliability,
    pub retraining: Vec<RetrainingCause>,
}

impl HealthReport {
    /// Warnings and failures only
    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.checks.iter().filter(|f| f.status != RuleStatus::Pass)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Finding> {
        self.checks.iter().filter(|f| f.status == RuleStatus::Failure)
    }

    pub fn passed(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn has_auto_fixes(&self) -> bool {
        self.findings().any(|f| f.auto_fixable)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSummary {
    pub reports: Vec<HealthReport>,
    /// Patterns whose retraining heuristic fired in this audit
    pub flagged: Vec<PatternId>,
    pub average_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoFixReport {
    pub pattern_id: PatternId,
    pub changes: Vec<FieldChange>,
    /// Version after the fix; unchanged when nothing needed fixing
    pub version: u32,
}

pub struct HealthAuditor {
    rules: Vec<Box<dyn ValidationRule>>,
    config: HealthConfig,
    cache: DashMap<PatternId, HealthReport>,
}

impl HealthAuditor {
    pub fn new(config: HealthConfig) -> Self {
        Self { rules: default_rules(), config, cache: DashMap::new() }
    }

    pub fn with_rule(mut self, rule: Box<dyn ValidationRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> impl Iterator<Item = &dyn ValidationRule> {
        self.rules.iter().map(|r| r.as_ref())
    }

    /// Run every rule against `pattern` and cache the resulting snapshot
    pub fn audit(&self, pattern: &Pattern, now: DateTime<Utc>) -> HealthReport {
        let ctx = RuleContext { now, config: &self.config };

        let checks: Vec<Finding> = self
            .rules
            .iter()
            .map(|rule| {
                let issue = rule.check(pattern, &ctx);
                if let Some(issue) = &issue {
                    debug!("Rule {} on {}: {:?} {}", rule.id(), pattern.id, issue.status, issue.message);
                }
                Finding::from_rule(rule.as_ref(), issue)
            })
            .collect();

        let category_scores: BTreeMap<HealthCategory, f64> = HealthCategory::ALL
            .iter()
            .map(|category| {
                let penalty: f64 = checks.iter().filter(|f| f.category == *category).map(Finding::penalty).sum();
                (*category, (100.0 - penalty).clamp(0.0, 100.0))
            })
            .collect();

        let total_weight: f64 = HealthCategory::ALL.iter().map(HealthCategory::weight).sum();
        let overall_score =
            category_scores.iter().map(|(c, s)| c.weight() * s).sum::<f64>() / total_weight;

        let metrics = PerformanceMetrics::estimate(pattern);
        let risk = RiskAssessment::assess(pattern, &checks, &metrics, now);
        let recommendations = risk::recommend(&checks, &risk);

        let report = HealthReport {
            pattern_id: pattern.id,
            pattern_version: pattern.version(),
            generated_at: now,
            overall_score,
            category_scores,
            checks,
            metrics,
            risk,
            recommendations,
            reliability: pattern.reliability(now),
            retraining: pattern.retraining_causes(now),
        };

        self.cache.insert(pattern.id, report.clone());
        report
    }

    /// Cached report if it is younger than the configured TTL
    pub fn cached_report(&self, id: PatternId, now: DateTime<Utc>) -> Option<HealthReport> {
        let ttl = Duration::seconds(self.config.report_ttl_secs as i64);
        self.cache
            .get(&id)
            .filter(|report| now - report.generated_at < ttl)
            .map(|report| report.value().clone())
    }

    /// Cached report, regenerated when missing or expired
    pub fn report(&self, store: &PatternStore, id: PatternId, now: DateTime<Utc>) -> Result<HealthReport> {
        if let Some(report) = self.cached_report(id, now) {
            return Ok(report);
        }

        let pattern = store.get(id).ok_or(StoreError::NotFound(id))?;
        Ok(self.audit(&pattern, now))
    }

    pub fn invalidate(&self, id: PatternId) {
        self.cache.remove(&id);
    }

    /// Audit every stored pattern and track consecutive retraining flags
    pub async fn audit_store(&self, store: &PatternStore, now: DateTime<Utc>) -> Result<AuditSummary> {
        let mut summary = AuditSummary::default();

        for pattern in store.list() {
            let report = self.audit(&pattern, now);

            let flags = if report.retraining.is_empty() { 0 } else { pattern.retraining_flags() + 1 };
            if flags != pattern.retraining_flags() {
                store.set_retraining_flags(pattern.id, flags).await?;
            }
            if flags > 0 {
                summary.flagged.push(pattern.id);
            }

            store.events().publish(ReplayEvent::HealthReportGenerated {
                pattern_id: pattern.id,
                report: Box::new(report.clone()),
            });
            summary.reports.push(report);
        }

        if !summary.reports.is_empty() {
            summary.average_score =
                summary.reports.iter().map(|r| r.overall_score).sum::<f64>() / summary.reports.len() as f64;
        }

        info!(
            "Audited {} patterns, average score {:.1}, {} flagged for retraining",
            summary.reports.len(),
            summary.average_score,
            summary.flagged.len()
        );

        Ok(summary)
    }

    /// Apply every auto-fixable rule that currently fires on the pattern
    pub async fn auto_fix(&self, store: &PatternStore, id: PatternId) -> Result<AutoFixReport> {
        let original = store.get(id).ok_or(StoreError::NotFound(id))?;
        let ctx = RuleContext { now: Utc::now(), config: &self.config };

        let mut fixed = original.clone();
        let mut changes = Vec::new();
        for rule in self.rules.iter().filter(|r| r.auto_fixable()) {
            if rule.check(&fixed, &ctx).is_some() {
                changes.extend(rule.auto_fix(&mut fixed, &ctx));
            }
        }

        if changes.is_empty() {
            return Ok(AutoFixReport { pattern_id: id, changes, version: original.version() });
        }

        let updated = store
            .update(id, move |pattern| {
                pattern.payload_shape = fixed.payload_shape;
                pattern.locator = fixed.locator;
                pattern.origin = fixed.origin;
            })
            .await?;
        self.invalidate(id);

        for change in &changes {
            info!("Auto-fixed {} on {}: {} -> {}", change.field, id, change.before, change.after);
        }

        Ok(AutoFixReport { pattern_id: id, changes, version: updated.version() })
    }

    /// Delete patterns flagged for retraining in `cleanup_threshold` consecutive audits
    pub async fn cleanup(&self, store: &PatternStore) -> Result<Vec<PatternId>> {
        let doomed: Vec<PatternId> = store
            .list()
            .into_iter()
            .filter(|p| p.retraining_flags() >= self.config.cleanup_threshold)
            .map(|p| p.id)
            .collect();

        for id in &doomed {
            store.delete(*id).await?;
            self.invalidate(*id);
        }

        if !doomed.is_empty() {
            info!("Cleanup removed {} patterns", doomed.len());
        }

        Ok(doomed)
    }
}

impl Default for HealthAuditor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{ActionKind, ExecutionRecord, LocatorHint, fixtures};
    use serde_json::json;

    #[test]
    fn test_clean_pattern_scores_high() {
        let auditor = HealthAuditor::default();
        let mut pattern = fixtures::pattern(ActionKind::FillText, "a.com", "/chat", "#prompt");
        pattern.locator = LocatorHint::new("#prompt").with_fallbacks(vec!["textarea".to_string()]);

        let report = auditor.audit(&pattern, fixtures::now());

        assert!(report.passed());
        assert_eq!(report.findings().count(), 0);
        assert_eq!(report.overall_score, 100.0);
        assert_eq!(report.category_scores.len(), 8);
        assert_eq!(report.checks.len(), auditor.rules().count());
    }

    #[test]
    fn test_failures_lower_category_score() {
        let auditor = HealthAuditor::default();
        let mut pattern = fixtures::pattern(ActionKind::FillText, "a.com", "/chat", "#prompt");
        pattern.payload_shape.insert("value".to_string(), json!("javascript:alert(1)"));

        let report = auditor.audit(&pattern, fixtures::now());

        assert!(!report.passed());
        assert_eq!(report.category_scores[&HealthCategory::Security], 40.0);
        assert!(report.overall_score < 100.0);
        assert_eq!(
            report.failures().next().and_then(Finding::reason),
            Some(FailureReason::ValidationRuleFailure)
        );
        assert_eq!(report.risk.overall, RiskLevel::Critical);
        assert_eq!(report.recommendations[0].priority, Priority::Critical);
    }

    #[test]
    fn test_report_cache_ttl() {
        let auditor = HealthAuditor::new(HealthConfig { report_ttl_secs: 60, ..HealthConfig::default() });
        let pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "#send");

        auditor.audit(&pattern, fixtures::now());
        assert!(auditor.cached_report(pattern.id, fixtures::now() + Duration::seconds(30)).is_some());
        assert!(auditor.cached_report(pattern.id, fixtures::now() + Duration::seconds(61)).is_none());
    }

    #[tokio::test]
    async fn test_auto_fix_reports_changes_and_versions() {
        let store = PatternStore::in_memory();
        let mut definition = fixtures::definition(ActionKind::Click, "a.com", "chat/", "#send");
        definition.locator.fallbacks = vec!["#send".to_string(), "button".to_string()];
        let pattern = store.create(definition).await.unwrap();

        let auditor = HealthAuditor::default();
        let report = auditor.auto_fix(&store, pattern.id).await.unwrap();

        let fields: Vec<&str> = report.changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["origin.path", "locator.fallbacks"]);
        assert_eq!(report.version, 2);

        let fixed = store.get(pattern.id).unwrap();
        assert_eq!(fixed.origin.path, "/chat");
        assert_eq!(fixed.locator.fallbacks, vec!["button"]);

        let again = auditor.auto_fix(&store, pattern.id).await.unwrap();
        assert!(again.changes.is_empty());
        assert_eq!(again.version, 2);
    }

    #[tokio::test]
    async fn test_auto_fix_waits_for_running_execution() {
        use crate::adapters::testing::ScriptedCapability;
        use crate::config::{LifecycleConfig, MatchingConfig};
        use crate::lifecycle::LifecycleManager;
        use crate::matching::MatchEngine;
        use std::sync::Arc;
        use std::time::Duration;

        let store = Arc::new(PatternStore::in_memory());
        let mut definition = fixtures::definition(ActionKind::Click, "a.com", "/app", "#send");
        definition.locator.fallbacks = vec!["#send".to_string(), "button".to_string()];
        let pattern = store.create(definition).await.unwrap();
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            MatchEngine::new(MatchingConfig::default()),
            Arc::new(ScriptedCapability::slow(Duration::from_millis(100))),
            LifecycleConfig::default(),
        ));

        let running = {
            let lifecycle = lifecycle.clone();
            let request = fixtures::request(ActionKind::Click, "a.com", "/app", "#send");
            tokio::spawn(async move { lifecycle.execute(pattern.id, &request).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = HealthAuditor::default().auto_fix(&store, pattern.id).await.unwrap();
        assert!(running.await.unwrap().unwrap().is_success());

        assert_eq!(report.version, 2);
        let stored = store.get(pattern.id).unwrap();
        assert_eq!(stored.usage_count(), 1);
        assert_eq!(stored.execution_history().len(), 1);
        assert_eq!(stored.locator.fallbacks, vec!["button"]);
    }

    #[tokio::test]
    async fn test_repeated_flags_lead_to_cleanup() {
        let store = PatternStore::in_memory();
        let healthy = store
            .create(fixtures::definition(ActionKind::Click, "a.com", "/", "#ok"))
            .await
            .unwrap();
        let failing = store
            .create(fixtures::definition(ActionKind::Click, "a.com", "/", "#broken"))
            .await
            .unwrap();
        let guard = store.lock(failing.id).await;
        for _ in 0..3 {
            store
                .record_execution(
                    &guard,
                    ExecutionRecord::failure(fixtures::now(), FailureReason::CapabilityFailure, "gone", 1),
                )
                .await
                .unwrap();
        }
        drop(guard);

        let auditor = HealthAuditor::default();
        let mut events = store.events().subscribe();

        for round in 1..=3 {
            let summary = auditor.audit_store(&store, fixtures::now()).await.unwrap();
            assert_eq!(summary.flagged, vec![failing.id]);
            assert_eq!(store.get(failing.id).unwrap().retraining_flags(), round);
            assert!(auditor.cleanup(&store).await.unwrap().len() <= usize::from(round == 3));
        }

        assert!(store.get(failing.id).is_none());
        assert!(store.get(healthy.id).is_some());
        assert!(matches!(events.recv().await.unwrap(), ReplayEvent::HealthReportGenerated { .. }));
    }

    #[tokio::test]
    async fn test_flags_reset_when_pattern_recovers() {
        let store = PatternStore::in_memory();
        let pattern = store
            .create(fixtures::definition(ActionKind::Click, "a.com", "/", "#send"))
            .await
            .unwrap();
        store.set_retraining_flags(pattern.id, 2).await.unwrap();

        let auditor = HealthAuditor::default();
        auditor.audit_store(&store, fixtures::now()).await.unwrap();
        assert_eq!(store.get(pattern.id).unwrap().retraining_flags(), 0);
    }
}
