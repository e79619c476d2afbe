//! Boundaries to external collaborators
//!
//! The capability adapter is the only place that knows how to touch a page,
//! and its `perform` call is the only suspension point in pattern execution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::FailureReason;
use crate::matching::ScoredMatch;
use crate::pattern::{AutomationAction, AutomationRequest, PatternDefinition, RequestContext};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CapabilityError {
    #[error("No element matches locator {0}")]
    LocatorNotFound(String),

    #[error("Action rejected: {0}")]
    Rejected(String),

    #[error("Capability unavailable: {0}")]
    Unavailable(String),
}

/// What a capability hands back after performing an action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl CapabilityOutput {
    pub fn with_data(data: serde_json::Value) -> Self {
        Self { data: Some(data) }
    }
}

/// Element a capability noticed on the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedElement {
    pub locator: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Perform `action` in the page identified by `context`
    async fn perform(
        &self,
        action: &AutomationAction,
        context: &RequestContext,
    ) -> Result<CapabilityOutput, CapabilityError>;

    /// Candidate elements currently visible; hosts without observation return none
    async fn observe(&self, _context: &RequestContext) -> Result<Vec<ObservedElement>, CapabilityError> {
        Ok(Vec::new())
    }
}

/// Answer from the training UI when no pattern qualified
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    Confirmed(PatternDefinition),
    Cancelled,
}

#[async_trait]
pub trait ConfirmationAdapter: Send + Sync {
    /// Ask a human to demonstrate or confirm the target for `request`
    async fn confirm(&self, request: &AutomationRequest, candidates: &[ScoredMatch]) -> Confirmation;
}

/// A workflow phase that needs a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRequest {
    pub run_id: Uuid,
    pub phase_id: String,
    pub reason: FailureReason,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionDecision {
    /// Run the phase again
    Resume,
    Skip,
    Abort,
}

#[async_trait]
pub trait InterventionAdapter: Send + Sync {
    async fn intervene(&self, request: &InterventionRequest) -> InterventionDecision;
}

/// Capability that performs nothing and reports success
#[derive(Debug, Default)]
pub struct DryRunCapability;

#[async_trait]
impl CapabilityAdapter for DryRunCapability {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn perform(
        &self,
        action: &AutomationAction,
        context: &RequestContext,
    ) -> Result<CapabilityOutput, CapabilityError> {
        tracing::info!(
            "[dry-run] {} {} on {}{}",
            action.kind(),
            action.target().unwrap_or("-"),
            context.hostname,
            context.pathname
        );
        Ok(CapabilityOutput::default())
    }
}
