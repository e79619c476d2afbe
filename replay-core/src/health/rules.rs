//! Built-in validation rules, at least one per health category

use chrono::{DateTime, Utc};
use locator_utils::{content, selector};
use serde_json::{Value, json};
use std::collections::HashSet;

use super::{FieldChange, HealthCategory, RuleStatus, Severity};
use crate::config::HealthConfig;
use crate::pattern::{AutomationAction, Pattern, Payload};

/// Inputs every rule may consult besides the pattern itself
pub struct RuleContext<'a> {
    pub now: DateTime<Utc>,
    pub config: &'a HealthConfig,
}

/// A defect reported by one rule
#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub status: RuleStatus,
    pub severity: Severity,
    pub message: String,
    pub suggestion: Option<String>,
}

impl Issue {
    pub fn warning(severity: Severity, message: impl Into<String>) -> Self {
        Self { status: RuleStatus::Warning, severity, message: message.into(), suggestion: None }
    }

    pub fn failure(severity: Severity, message: impl Into<String>) -> Self {
        Self { status: RuleStatus::Failure, severity, message: message.into(), suggestion: None }
    }

    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

pub trait ValidationRule: Send + Sync {
    fn id(&self) -> &'static str;

    fn category(&self) -> HealthCategory;

    /// `None` when the pattern passes
    fn check(&self, pattern: &Pattern, ctx: &RuleContext<'_>) -> Option<Issue>;

    fn auto_fixable(&self) -> bool {
        false
    }

    /// Repair the defect in place and report the fields that changed
    fn auto_fix(&self, _pattern: &mut Pattern, _ctx: &RuleContext<'_>) -> Vec<FieldChange> {
        Vec::new()
    }
}

pub fn default_rules() -> Vec<Box<dyn ValidationRule>> {
    vec![
        Box::new(LocatorSyntaxRule),
        Box::new(PayloadKeyRule),
        Box::new(RequiredFieldsRule),
        Box::new(PathFormatRule),
        Box::new(LocatorDepthRule),
        Box::new(FallbackChainRule),
        Box::new(SuccessRateRule),
        Box::new(RetrainingRule),
        Box::new(DuplicateFallbackRule),
        Box::new(StalenessRule),
        Box::new(ScriptInjectionRule),
        Box::new(SensitiveValueRule),
        Box::new(LocatorStrategyRule),
        Box::new(OriginRule),
        Box::new(StableIdentifierRule),
        Box::new(PositionalLocatorRule),
    ]
}

fn locator_change(before: &[String], after: &[String]) -> FieldChange {
    FieldChange { field: "locator.fallbacks".to_string(), before: json!(before), after: json!(after) }
}

// Syntax

pub struct LocatorSyntaxRule;

impl ValidationRule for LocatorSyntaxRule {
    fn id(&self) -> &'static str {
        "syntax.locator"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Syntax
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        if pattern.request_kind.targets_element() && pattern.locator.primary.trim().is_empty() {
            return Some(Issue::failure(Severity::Critical, "Primary locator is empty"));
        }

        let broken: Vec<&str> = pattern.locator.candidates().filter(|l| !selector::is_balanced(l)).collect();
        if broken.is_empty() {
            None
        } else {
            Some(
                Issue::failure(Severity::Error, format!("Unbalanced locator: {}", broken.join(", ")))
                    .suggest("Re-record the element to capture a well-formed locator"),
            )
        }
    }
}

pub struct PayloadKeyRule;

impl PayloadKeyRule {
    fn needs_fix(key: &str) -> bool {
        key.trim().is_empty() || key.trim() != key
    }
}

impl ValidationRule for PayloadKeyRule {
    fn id(&self) -> &'static str {
        "syntax.payload-keys"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Syntax
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        let bad = pattern.payload_shape.keys().filter(|k| Self::needs_fix(k)).count();
        (bad > 0).then(|| {
            Issue::warning(Severity::Warning, format!("{bad} payload keys are empty or padded"))
                .suggest("Trim payload keys")
        })
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn auto_fix(&self, pattern: &mut Pattern, _ctx: &RuleContext<'_>) -> Vec<FieldChange> {
        if !pattern.payload_shape.keys().any(|k| Self::needs_fix(k)) {
            return Vec::new();
        }

        let before = json!(pattern.payload_shape);
        let fixed: Payload = std::mem::take(&mut pattern.payload_shape)
            .into_iter()
            .filter(|(k, _)| !k.trim().is_empty())
            .map(|(k, v)| (k.trim().to_string(), v))
            .collect();
        pattern.payload_shape = fixed;

        vec![FieldChange { field: "payload_shape".to_string(), before, after: json!(pattern.payload_shape) }]
    }
}

// Semantics

pub struct RequiredFieldsRule;

impl ValidationRule for RequiredFieldsRule {
    fn id(&self) -> &'static str {
        "semantics.required-fields"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Semantics
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        AutomationAction::from_payload(pattern.request_kind, &pattern.payload_shape, Some(&pattern.locator.primary))
            .err()
            .map(|e| {
                Issue::failure(Severity::Error, format!("Learned payload cannot be replayed: {e}"))
                    .suggest("Retrain the pattern with a complete demonstration")
            })
    }
}

pub struct PathFormatRule;

impl PathFormatRule {
    fn normalize(path: &str) -> String {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        format!("/{}", segments.join("/"))
    }
}

impl ValidationRule for PathFormatRule {
    fn id(&self) -> &'static str {
        "semantics.path-format"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Semantics
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        let normalized = Self::normalize(&pattern.origin.path);
        (normalized != pattern.origin.path).then(|| {
            Issue::warning(Severity::Warning, format!("Origin path {:?} is not normalized", pattern.origin.path))
                .suggest(format!("Use {normalized}"))
        })
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn auto_fix(&self, pattern: &mut Pattern, _ctx: &RuleContext<'_>) -> Vec<FieldChange> {
        let normalized = Self::normalize(&pattern.origin.path);
        if normalized == pattern.origin.path {
            return Vec::new();
        }

        let before = json!(pattern.origin.path);
        pattern.origin.path = normalized;
        vec![FieldChange { field: "origin.path".to_string(), before, after: json!(pattern.origin.path) }]
    }
}

// Performance

pub struct LocatorDepthRule;

const MAX_LOCATOR_DEPTH: usize = 6;

impl ValidationRule for LocatorDepthRule {
    fn id(&self) -> &'static str {
        "performance.locator-depth"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Performance
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        let depth = selector::depth(&pattern.locator.primary);
        (depth > MAX_LOCATOR_DEPTH).then(|| {
            Issue::warning(Severity::Warning, format!("Locator has {depth} steps"))
                .suggest("Anchor the locator on a closer stable ancestor")
        })
    }
}

pub struct FallbackChainRule;

impl ValidationRule for FallbackChainRule {
    fn id(&self) -> &'static str {
        "performance.fallback-chain"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Performance
    }

    fn check(&self, pattern: &Pattern, ctx: &RuleContext<'_>) -> Option<Issue> {
        let count = pattern.locator.fallbacks.len();
        (count > ctx.config.max_fallbacks).then(|| {
            Issue::warning(
                Severity::Warning,
                format!("{count} fallback locators (limit {})", ctx.config.max_fallbacks),
            )
            .suggest("Drop the least specific fallbacks")
        })
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn auto_fix(&self, pattern: &mut Pattern, ctx: &RuleContext<'_>) -> Vec<FieldChange> {
        if pattern.locator.fallbacks.len() <= ctx.config.max_fallbacks {
            return Vec::new();
        }

        let before = pattern.locator.fallbacks.clone();
        pattern.locator.fallbacks.truncate(ctx.config.max_fallbacks);
        vec![locator_change(&before, &pattern.locator.fallbacks)]
    }
}

// Reliability

pub struct SuccessRateRule;

impl ValidationRule for SuccessRateRule {
    fn id(&self) -> &'static str {
        "reliability.success-rate"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Reliability
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        if pattern.usage_count() < 3 {
            return None;
        }

        let rate = pattern.success_rate();
        if rate < 0.5 {
            Some(
                Issue::failure(Severity::Error, format!("Success rate {:.0}%", rate * 100.0))
                    .suggest("Retrain the pattern"),
            )
        } else if rate < 0.8 {
            Some(Issue::warning(Severity::Warning, format!("Success rate {:.0}%", rate * 100.0)))
        } else {
            None
        }
    }
}

pub struct RetrainingRule;

impl ValidationRule for RetrainingRule {
    fn id(&self) -> &'static str {
        "reliability.retraining"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Reliability
    }

    fn check(&self, pattern: &Pattern, ctx: &RuleContext<'_>) -> Option<Issue> {
        let causes = pattern.retraining_causes(ctx.now);
        (!causes.is_empty()).then(|| {
            Issue::warning(Severity::Error, format!("Flagged for retraining: {causes:?}"))
                .suggest("Send the pattern through the training flow")
        })
    }
}

// Maintainability

pub struct DuplicateFallbackRule;

impl DuplicateFallbackRule {
    fn deduplicated(pattern: &Pattern) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::from([pattern.locator.primary.as_str()]);
        pattern
            .locator
            .fallbacks
            .iter()
            .filter(|l| seen.insert(l.as_str()))
            .cloned()
            .collect()
    }
}

impl ValidationRule for DuplicateFallbackRule {
    fn id(&self) -> &'static str {
        "maintainability.duplicate-fallbacks"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Maintainability
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        let duplicates = pattern.locator.fallbacks.len() - Self::deduplicated(pattern).len();
        (duplicates > 0).then(|| {
            Issue::warning(Severity::Info, format!("{duplicates} duplicate fallback locators"))
                .suggest("Remove repeated fallbacks")
        })
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn auto_fix(&self, pattern: &mut Pattern, _ctx: &RuleContext<'_>) -> Vec<FieldChange> {
        let fixed = Self::deduplicated(pattern);
        if fixed.len() == pattern.locator.fallbacks.len() {
            return Vec::new();
        }

        let before = std::mem::replace(&mut pattern.locator.fallbacks, fixed);
        vec![locator_change(&before, &pattern.locator.fallbacks)]
    }
}

pub struct StalenessRule;

impl ValidationRule for StalenessRule {
    fn id(&self) -> &'static str {
        "maintainability.staleness"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Maintainability
    }

    fn check(&self, pattern: &Pattern, ctx: &RuleContext<'_>) -> Option<Issue> {
        pattern.is_stale(ctx.now).then(|| {
            Issue::warning(
                Severity::Warning,
                format!("Unused for {:.0} days", pattern.days_since_last_execution(ctx.now)),
            )
        })
    }
}

// Security

pub struct ScriptInjectionRule;

impl ValidationRule for ScriptInjectionRule {
    fn id(&self) -> &'static str {
        "security.script-injection"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Security
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        let in_payload = pattern.payload_shape.iter().find_map(|(key, value)| match value {
            Value::String(s) if content::contains_script(s) => Some(key.as_str()),
            _ => None,
        });
        let in_locator = pattern.locator.candidates().any(content::contains_script);

        match (in_payload, in_locator) {
            (Some(key), _) => Some(
                Issue::failure(Severity::Critical, format!("Payload field '{key}' contains executable content"))
                    .suggest("Delete the pattern and relearn it from a trusted page"),
            ),
            (None, true) => Some(Issue::failure(Severity::Critical, "Locator contains executable content")),
            (None, false) => None,
        }
    }
}

pub struct SensitiveValueRule;

impl ValidationRule for SensitiveValueRule {
    fn id(&self) -> &'static str {
        "security.sensitive-values"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Security
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        let keys: Vec<&str> = pattern
            .payload_shape
            .iter()
            .filter(|(key, value)| {
                content::is_sensitive_key(key) && value.as_str().is_some_and(|s| !s.is_empty())
            })
            .map(|(key, _)| key.as_str())
            .collect();

        (!keys.is_empty()).then(|| {
            Issue::failure(Severity::Error, format!("Stored secret values: {}", keys.join(", ")))
                .suggest("Supply secrets in the request instead of learning them")
        })
    }
}

// Compatibility

pub struct LocatorStrategyRule;

impl ValidationRule for LocatorStrategyRule {
    fn id(&self) -> &'static str {
        "compatibility.locator-strategy"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Compatibility
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        let primary = &pattern.locator.primary;
        if selector::classify(primary) == selector::LocatorKind::XPathAbsolute {
            return Some(
                Issue::warning(Severity::Warning, "Absolute XPath breaks on any layout change")
                    .suggest("Prefer an id, test id or ARIA locator"),
            );
        }
        if selector::has_generated_id(primary) {
            return Some(
                Issue::warning(Severity::Warning, "Locator uses a framework-generated id")
                    .suggest("Prefer an attribute that survives re-rendering"),
            );
        }
        None
    }
}

pub struct OriginRule;

impl ValidationRule for OriginRule {
    fn id(&self) -> &'static str {
        "compatibility.origin"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::Compatibility
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        let host = &pattern.origin.hostname;
        if host.is_empty() || host.contains("://") || host.contains('/') || host.contains(char::is_whitespace) {
            Some(Issue::failure(Severity::Critical, format!("Invalid origin hostname {host:?}")))
        } else {
            None
        }
    }
}

// Best practices

pub struct StableIdentifierRule;

impl ValidationRule for StableIdentifierRule {
    fn id(&self) -> &'static str {
        "best-practices.stable-identifier"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::BestPractices
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        if !pattern.request_kind.targets_element() {
            return None;
        }

        let kind = selector::classify(&pattern.locator.primary);
        (!kind.is_stable_identifier() && pattern.locator.fallbacks.is_empty()).then(|| {
            Issue::warning(Severity::Info, format!("{kind:?} locator without fallbacks"))
                .suggest("Record fallback locators when learning")
        })
    }
}

pub struct PositionalLocatorRule;

impl ValidationRule for PositionalLocatorRule {
    fn id(&self) -> &'static str {
        "best-practices.positional"
    }

    fn category(&self) -> HealthCategory {
        HealthCategory::BestPractices
    }

    fn check(&self, pattern: &Pattern, _ctx: &RuleContext<'_>) -> Option<Issue> {
        selector::is_positional(&pattern.locator.primary).then(|| {
            Issue::warning(Severity::Warning, "Locator depends on element position")
                .suggest("Select by attribute rather than index")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{ActionKind, LocatorHint, fixtures};

    fn ctx(config: &HealthConfig) -> RuleContext<'_> {
        RuleContext { now: fixtures::now(), config }
    }

    #[test]
    fn test_every_category_has_a_rule() {
        let categories: HashSet<HealthCategory> = default_rules().iter().map(|r| r.category()).collect();
        assert_eq!(categories.len(), HealthCategory::ALL.len());
    }

    #[test]
    fn test_clean_pattern_passes_every_rule() {
        let config = HealthConfig::default();
        let mut pattern = fixtures::pattern(ActionKind::FillText, "a.com", "/chat", "#prompt");
        pattern.locator = LocatorHint::new("#prompt").with_fallbacks(vec!["textarea".to_string()]);

        for rule in default_rules() {
            assert_eq!(rule.check(&pattern, &ctx(&config)), None, "rule {}", rule.id());
        }
    }

    #[test]
    fn test_script_injection_is_critical() {
        let config = HealthConfig::default();
        let mut pattern = fixtures::pattern(ActionKind::FillText, "a.com", "/", "#prompt");
        pattern.payload_shape.insert("value".to_string(), json!("<script>steal()</script>"));

        let issue = ScriptInjectionRule.check(&pattern, &ctx(&config)).unwrap();
        assert_eq!(issue.status, RuleStatus::Failure);
        assert_eq!(issue.severity, Severity::Critical);
    }

    #[test]
    fn test_sensitive_values() {
        let config = HealthConfig::default();
        let mut pattern = fixtures::pattern(ActionKind::FillText, "a.com", "/login", "#pw");
        pattern.payload_shape.insert("password".to_string(), json!("hunter2"));
        assert!(SensitiveValueRule.check(&pattern, &ctx(&config)).is_some());

        pattern.payload_shape.insert("password".to_string(), json!(""));
        assert!(SensitiveValueRule.check(&pattern, &ctx(&config)).is_none());
    }

    #[test]
    fn test_missing_required_field() {
        let config = HealthConfig::default();
        let mut pattern = fixtures::pattern(ActionKind::FillText, "a.com", "/", "#prompt");
        pattern.payload_shape.remove("value");

        let issue = RequiredFieldsRule.check(&pattern, &ctx(&config)).unwrap();
        assert_eq!(issue.status, RuleStatus::Failure);
    }

    #[test]
    fn test_path_fix_reports_change() {
        let config = HealthConfig::default();
        let mut pattern = fixtures::pattern(ActionKind::Click, "a.com", "chat//new/", "#send");
        assert!(PathFormatRule.check(&pattern, &ctx(&config)).is_some());

        let changes = PathFormatRule.auto_fix(&mut pattern, &ctx(&config));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "origin.path");
        assert_eq!(changes[0].before, json!("chat//new/"));
        assert_eq!(pattern.origin.path, "/chat/new");
        assert!(PathFormatRule.auto_fix(&mut pattern, &ctx(&config)).is_empty());
    }

    #[test]
    fn test_fallback_fixes() {
        let config = HealthConfig { max_fallbacks: 2, ..HealthConfig::default() };
        let mut pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "#send");
        pattern.locator.fallbacks =
            vec!["#send".into(), "button".into(), "button".into(), ".send".into(), "form button".into()];

        let changes = DuplicateFallbackRule.auto_fix(&mut pattern, &ctx(&config));
        assert_eq!(changes.len(), 1);
        assert_eq!(pattern.locator.fallbacks, vec!["button", ".send", "form button"]);

        assert!(FallbackChainRule.check(&pattern, &ctx(&config)).is_some());
        FallbackChainRule.auto_fix(&mut pattern, &ctx(&config));
        assert_eq!(pattern.locator.fallbacks, vec!["button", ".send"]);
    }

    #[test]
    fn test_payload_key_fix() {
        let config = HealthConfig::default();
        let mut pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "#send");
        pattern.payload_shape.insert(" label ".to_string(), json!("Send"));
        pattern.payload_shape.insert("  ".to_string(), json!("junk"));

        let changes = PayloadKeyRule.auto_fix(&mut pattern, &ctx(&config));
        assert_eq!(changes.len(), 1);
        assert!(pattern.payload_shape.contains_key("label"));
        assert_eq!(pattern.payload_shape.len(), 2);
    }

    #[test]
    fn test_fragile_locators() {
        let config = HealthConfig::default();
        let pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "/html/body/div[2]/button");
        assert!(LocatorStrategyRule.check(&pattern, &ctx(&config)).is_some());
        assert!(PositionalLocatorRule.check(&pattern, &ctx(&config)).is_some());
        assert!(StableIdentifierRule.check(&pattern, &ctx(&config)).is_some());
    }
}
