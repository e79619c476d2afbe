//! Static performance estimates, derived without running the pattern

use locator_utils::selector;
use serde::{Deserialize, Serialize};

use crate::pattern::{ActionKind, Pattern};

const FALLBACK_COST_MS: f64 = 120.0;
const TYPING_COST_MS_PER_CHAR: f64 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub estimated_execution_ms: f64,
    /// 0 = trivial, 1 = deeply nested locator with a large payload
    pub structural_complexity: f64,
    pub locator_reliability: f64,
    pub error_proneness: f64,
    pub resource_usage: f64,
    /// How safely the step can run alongside others on the same page
    pub parallelizability: f64,
}

impl PerformanceMetrics {
    pub fn estimate(pattern: &Pattern) -> Self {
        let locator_reliability = locator_reliability(pattern);
        let structural_complexity = structural_complexity(pattern);

        let typed_chars = pattern
            .payload_shape
            .get("value")
            .and_then(|v| v.as_str())
            .map_or(0, |s| s.chars().count());
        let estimated_execution_ms = base_cost_ms(pattern.request_kind)
            + typed_chars as f64 * TYPING_COST_MS_PER_CHAR
            + pattern.locator.fallbacks.len() as f64 * FALLBACK_COST_MS * (1.0 - locator_reliability);

        let history_failure = if pattern.usage_count() == 0 { 0.5 } else { 1.0 - pattern.success_rate() };
        let error_proneness = ((1.0 - locator_reliability) * 0.5
            + history_failure * 0.3
            + structural_complexity * 0.2)
            .clamp(0.0, 1.0);

        Self {
            estimated_execution_ms,
            structural_complexity,
            locator_reliability,
            error_proneness,
            resource_usage: resource_usage(pattern.request_kind),
            parallelizability: parallelizability(pattern.request_kind),
        }
    }
}

fn base_cost_ms(kind: ActionKind) -> f64 {
    match kind {
        ActionKind::Click => 150.0,
        ActionKind::FillText => 100.0,
        ActionKind::SelectOption => 250.0,
        ActionKind::SelectProject => 300.0,
        ActionKind::Submit => 400.0,
        ActionKind::Navigate => 1500.0,
    }
}

fn resource_usage(kind: ActionKind) -> f64 {
    match kind {
        ActionKind::Navigate => 0.8,
        ActionKind::Submit => 0.5,
        ActionKind::SelectProject => 0.4,
        ActionKind::Click | ActionKind::FillText | ActionKind::SelectOption => 0.2,
    }
}

fn parallelizability(kind: ActionKind) -> f64 {
    match kind {
        ActionKind::Navigate | ActionKind::Submit => 0.1,
        ActionKind::SelectProject => 0.3,
        ActionKind::Click => 0.5,
        ActionKind::FillText | ActionKind::SelectOption => 0.7,
    }
}

/// Primary locator stability, raised a little by each usable fallback
fn locator_reliability(pattern: &Pattern) -> f64 {
    if !pattern.request_kind.targets_element() {
        return 1.0;
    }

    let primary = selector::stability_score(&pattern.locator.primary);
    let miss = pattern
        .locator
        .fallbacks
        .iter()
        .map(|l| 1.0 - selector::stability_score(l) * 0.5)
        .fold(1.0 - primary, |acc, m| acc * m);

    (1.0 - miss).clamp(0.0, 1.0)
}

fn structural_complexity(pattern: &Pattern) -> f64 {
    let depth = selector::depth(&pattern.locator.primary) as f64;
    let keys = pattern.payload_shape.len() as f64;
    ((depth + keys) / 12.0).clamp(0.0, 1.0)
}
