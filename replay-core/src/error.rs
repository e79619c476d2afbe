//! Failure taxonomy shared by execution, auditing and workflows

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable reason attached to every structured failure handed back to a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Pattern is not valid for the request's origin context
    ContextMismatch,
    /// Request-supplied confidence is below the execution floor
    LowConfidence,
    /// The capability adapter itself failed (locator not found, action rejected)
    CapabilityFailure,
    /// An execution or phase ran past its timeout
    ExecutionTimeout,
    /// A health rule failed
    ValidationRuleFailure,
    /// A workflow condition or data validation failed
    WorkflowConditionFailure,
    /// A workflow phase could not run because its dependencies never completed
    WorkflowDependencyUnmet,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::ContextMismatch => "context_mismatch",
            FailureReason::LowConfidence => "low_confidence",
            FailureReason::CapabilityFailure => "capability_failure",
            FailureReason::ExecutionTimeout => "execution_timeout",
            FailureReason::ValidationRuleFailure => "validation_rule_failure",
            FailureReason::WorkflowConditionFailure => "workflow_condition_failure",
            FailureReason::WorkflowDependencyUnmet => "workflow_dependency_unmet",
        }
    }

    /// Failures the pattern itself is accountable for (they move confidence)
    pub fn counts_against_pattern(&self) -> bool {
        matches!(self, FailureReason::CapabilityFailure | FailureReason::ExecutionTimeout)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
