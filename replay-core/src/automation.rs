//! Request dispatch: match, execute, or fall back to a human

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::adapters::{Confirmation, ConfirmationAdapter};
use crate::lifecycle::{ExecutionReport, LifecycleManager};
use crate::matching::{MatchCriteria, ScoredMatch};
use crate::pattern::{ActionError, AutomationRequest, PatternId};
use crate::store::Result;

/// What happened to one inbound request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutomationResult {
    /// An existing pattern qualified and was executed
    Replayed {
        criteria: MatchCriteria,
        report: ExecutionReport,
    },
    /// A human confirmed a new pattern, which was then executed
    Learned {
        pattern_id: PatternId,
        report: ExecutionReport,
    },
    /// The request payload cannot form a valid action
    Invalid { message: String },
    NoMatch { candidates: usize },
    Cancelled,
}

impl AutomationResult {
    pub fn report(&self) -> Option<&ExecutionReport> {
        match self {
            AutomationResult::Replayed { report, .. } | AutomationResult::Learned { report, .. } => Some(report),
            _ => None,
        }
    }
}

pub struct AutomationService {
    lifecycle: Arc<LifecycleManager>,
    confirmation: Option<Arc<dyn ConfirmationAdapter>>,
}

impl AutomationService {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle, confirmation: None }
    }

    pub fn with_confirmation(mut self, confirmation: Arc<dyn ConfirmationAdapter>) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Candidates for `request` on its origin, best first
    pub fn candidates(&self, request: &AutomationRequest) -> Vec<ScoredMatch> {
        let patterns = self.lifecycle.store().for_origin(&request.context.hostname);
        self.lifecycle.matcher().rank(request, &patterns)
    }

    pub async fn handle(&self, request: &AutomationRequest) -> Result<AutomationResult> {
        if let Err(e) = validate_request(request) {
            tracing::warn!("Rejecting request {:?}: {}", request.correlation_id, e);
            return Ok(AutomationResult::Invalid { message: e.to_string() });
        }

        let candidates = self.candidates(request);

        if let Some(best) = candidates.iter().find(|m| m.good) {
            tracing::debug!(
                "Replaying pattern {} (score {:.2})",
                best.pattern.id,
                best.criteria.overall_score
            );
            let report = self.lifecycle.execute(best.pattern.id, request).await?;
            return Ok(AutomationResult::Replayed { criteria: best.criteria, report });
        }

        let Some(confirmation) = &self.confirmation else {
            tracing::info!(
                "No pattern qualified for {} on {} ({} candidates)",
                request.request_kind,
                request.context.hostname,
                candidates.len()
            );
            return Ok(AutomationResult::NoMatch { candidates: candidates.len() });
        };

        match confirmation.confirm(request, &candidates).await {
            Confirmation::Confirmed(definition) => {
                let pattern = self.lifecycle.store().create(definition).await?;
                let report = self.lifecycle.execute(pattern.id, request).await?;
                Ok(AutomationResult::Learned { pattern_id: pattern.id, report })
            }
            Confirmation::Cancelled => {
                tracing::info!("Confirmation cancelled for {:?}", request.correlation_id);
                Ok(AutomationResult::Cancelled)
            }
        }
    }
}

/// Every non-locator field the action kind needs must be present
fn validate_request(request: &AutomationRequest) -> std::result::Result<(), ActionError> {
    match request.action() {
        Ok(_) => Ok(()),
        Err(ActionError::MissingField { field: "selector", .. }) => Ok(()),
        Err(e) => Err(e),
    }
}
