//! Pattern execution and outcome tracking
//!
//! Each execution attempt runs validate → execute → update → record → emit.
//! An attempt holds the store's lock on its pattern from validation to the
//! recorded outcome, so executions and edits of one pattern never interleave.
//! Attempts on different patterns run concurrently.

pub mod reliability;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::adapters::{CapabilityAdapter, CapabilityError, CapabilityOutput};
use crate::config::LifecycleConfig;
use crate::error::FailureReason;
use crate::events::ReplayEvent;
use crate::matching::MatchEngine;
use crate::pattern::{
    AutomationAction, AutomationRequest, ExecutionRecord, LOCATOR_KEYS, Pattern, PatternId, Payload,
};
use crate::store::{PatternGuard, PatternStore, Result, StoreError};

pub use reliability::{Reliability, RetrainingCause};

/// Details of a successful execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub action: AutomationAction,
    /// Locator that actually worked; differs from the primary when a fallback was used
    pub locator: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Structured result of one execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionReport {
    Succeeded {
        pattern_id: PatternId,
        outcome: ExecutionOutcome,
        confidence: f64,
    },
    Failed {
        pattern_id: PatternId,
        reason: FailureReason,
        message: String,
        /// Confidence after the attempt; unchanged when the attempt was rejected up front
        confidence: f64,
    },
}

impl ExecutionReport {
    pub fn pattern_id(&self) -> PatternId {
        match self {
            ExecutionReport::Succeeded { pattern_id, .. } | ExecutionReport::Failed { pattern_id, .. } => {
                *pattern_id
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionReport::Succeeded { .. })
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            ExecutionReport::Failed { reason, .. } => Some(*reason),
            ExecutionReport::Succeeded { .. } => None,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            ExecutionReport::Succeeded { confidence, .. } | ExecutionReport::Failed { confidence, .. } => {
                *confidence
            }
        }
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            ExecutionReport::Succeeded { outcome, .. } => outcome.data.as_ref(),
            ExecutionReport::Failed { .. } => None,
        }
    }
}

pub struct LifecycleManager {
    store: Arc<PatternStore>,
    matcher: MatchEngine,
    capability: Arc<dyn CapabilityAdapter>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<PatternStore>,
        matcher: MatchEngine,
        capability: Arc<dyn CapabilityAdapter>,
        config: LifecycleConfig,
    ) -> Self {
        Self { store, matcher, capability, config }
    }

    pub fn store(&self) -> &Arc<PatternStore> {
        &self.store
    }

    pub fn matcher(&self) -> &MatchEngine {
        &self.matcher
    }

    pub fn capability(&self) -> &Arc<dyn CapabilityAdapter> {
        &self.capability
    }

    /// Execute a stored pattern for `request`.
    ///
    /// Every execution failure comes back as [`ExecutionReport::Failed`]; `Err`
    /// is reserved for an unknown pattern id or a persistence failure.
    pub async fn execute(&self, id: PatternId, request: &AutomationRequest) -> Result<ExecutionReport> {
        let timeout = Duration::from_millis(self.config.execution_timeout_ms);
        self.execute_with_timeout(id, request, timeout).await
    }

    /// [`execute`](Self::execute) with a caller budget; the configured timeout still caps it
    pub async fn execute_with_timeout(
        &self,
        id: PatternId,
        request: &AutomationRequest,
        budget: Duration,
    ) -> Result<ExecutionReport> {
        let guard = self.store.lock_existing(id).await?;
        let pattern = self.store.get(id).ok_or(StoreError::NotFound(id))?;

        if let Err((reason, message)) = self.validate(&pattern, request) {
            return Ok(self.reject(&pattern, request, reason, message));
        }

        let action = match AutomationAction::from_payload(
            pattern.request_kind,
            &replay_payload(&pattern, request),
            Some(&pattern.locator.primary),
        ) {
            Ok(action) => action,
            Err(e) => {
                return Ok(self.reject(&pattern, request, FailureReason::CapabilityFailure, e.to_string()));
            }
        };

        let started = Instant::now();
        let timeout = budget.min(Duration::from_millis(self.config.execution_timeout_ms));
        let attempt = tokio::time::timeout(timeout, self.perform_with_fallbacks(&pattern, &action, request)).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let at = Utc::now();

        let report = match attempt {
            Ok(Ok((locator, output))) => {
                let updated = self.store.record_execution(&guard, ExecutionRecord::success(at, duration_ms)).await?;
                let outcome = ExecutionOutcome {
                    action: locator.as_deref().map_or_else(|| action.clone(), |l| action.retarget(l)),
                    locator,
                    duration_ms,
                    data: output.data,
                };

                info!("Pattern {} executed in {}ms", id, duration_ms);
                self.store.events().publish(ReplayEvent::PatternExecuted {
                    pattern_id: id,
                    outcome: outcome.clone(),
                    correlation_id: request.correlation_id.clone(),
                });

                ExecutionReport::Succeeded { pattern_id: id, outcome, confidence: updated.confidence() }
            }
            Ok(Err(e)) => {
                self.record_failure(&guard, request, FailureReason::CapabilityFailure, e.to_string(), duration_ms)
                    .await?
            }
            Err(_) => {
                let message = format!("Execution exceeded {}ms", timeout.as_millis());
                self.record_failure(&guard, request, FailureReason::ExecutionTimeout, message, duration_ms)
                    .await?
            }
        };

        Ok(report)
    }

    fn validate(
        &self,
        pattern: &Pattern,
        request: &AutomationRequest,
    ) -> std::result::Result<(), (FailureReason, String)> {
        if let Err(rejection) = self.matcher.check_context(&request.context, pattern) {
            return Err((FailureReason::ContextMismatch, rejection.to_string()));
        }

        let confidence = request
            .confidence
            .unwrap_or_else(|| self.matcher.score(request, pattern).overall_score);
        if confidence < self.config.min_request_confidence {
            return Err((
                FailureReason::LowConfidence,
                format!(
                    "Request confidence {:.2} below {:.2}",
                    confidence, self.config.min_request_confidence
                ),
            ));
        }

        Ok(())
    }

    /// Rejected before execution: reported and announced, but the pattern is untouched
    fn reject(
        &self,
        pattern: &Pattern,
        request: &AutomationRequest,
        reason: FailureReason,
        message: String,
    ) -> ExecutionReport {
        debug!("Pattern {} rejected ({}): {}", pattern.id, reason, message);

        self.store.events().publish(ReplayEvent::PatternExecutionFailed {
            pattern_id: pattern.id,
            reason,
            message: message.clone(),
            correlation_id: request.correlation_id.clone(),
        });

        ExecutionReport::Failed { pattern_id: pattern.id, reason, message, confidence: pattern.confidence() }
    }

    async fn record_failure(
        &self,
        guard: &PatternGuard,
        request: &AutomationRequest,
        reason: FailureReason,
        message: String,
        duration_ms: u64,
    ) -> Result<ExecutionReport> {
        let id = guard.id();
        let record = ExecutionRecord::failure(Utc::now(), reason, message.clone(), duration_ms);
        let updated = self.store.record_execution(guard, record).await?;

        warn!(
            "Pattern {} failed ({}): {} [confidence now {:.2}]",
            id,
            reason,
            message,
            updated.confidence()
        );
        self.store.events().publish(ReplayEvent::PatternExecutionFailed {
            pattern_id: id,
            reason,
            message: message.clone(),
            correlation_id: request.correlation_id.clone(),
        });

        Ok(ExecutionReport::Failed { pattern_id: id, reason, message, confidence: updated.confidence() })
    }

    /// Try the primary locator, then each fallback while the element is missing
    async fn perform_with_fallbacks(
        &self,
        pattern: &Pattern,
        action: &AutomationAction,
        request: &AutomationRequest,
    ) -> std::result::Result<(Option<String>, CapabilityOutput), CapabilityError> {
        if action.target().is_none() {
            let output = self.capability.perform(action, &request.context).await?;
            return Ok((None, output));
        }

        let mut last_error = None;
        for locator in pattern.locator.candidates() {
            let attempt = action.retarget(locator);
            match self.capability.perform(&attempt, &request.context).await {
                Ok(output) => return Ok((Some(locator.to_string()), output)),
                Err(CapabilityError::LocatorNotFound(missing)) => {
                    debug!("Locator {} not found, trying next", missing);
                    last_error = Some(CapabilityError::LocatorNotFound(missing));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| CapabilityError::LocatorNotFound(pattern.locator.primary.clone())))
    }
}

/// Learned payload overlaid with the request's own values.
///
/// The learned locator always wins, so locator keys from the request are dropped.
fn replay_payload(pattern: &Pattern, request: &AutomationRequest) -> Payload {
    let mut payload: Payload = pattern
        .payload_shape
        .iter()
        .filter(|(key, _)| !LOCATOR_KEYS.contains(&key.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (key, value) in &request.payload {
        if !LOCATOR_KEYS.contains(&key.as_str()) {
            payload.insert(key.clone(), value.clone());
        }
    }

    payload
}
