//! Typed outbound events
//!
//! Components publish onto a shared [`EventBus`]; consumers subscribe
//! explicitly and receive every event sent after they subscribed.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::FailureReason;
use crate::health::HealthReport;
use crate::lifecycle::ExecutionOutcome;
use crate::pattern::PatternId;
use crate::workflow::WorkflowResult;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayEvent {
    PatternLearned {
        pattern_id: PatternId,
    },
    PatternExecuted {
        pattern_id: PatternId,
        outcome: ExecutionOutcome,
        correlation_id: Option<String>,
    },
    PatternExecutionFailed {
        pattern_id: PatternId,
        reason: FailureReason,
        message: String,
        correlation_id: Option<String>,
    },
    HealthReportGenerated {
        pattern_id: PatternId,
        report: Box<HealthReport>,
    },
    WorkflowCompleted {
        run_id: Uuid,
        result: Box<WorkflowResult>,
    },
}

impl ReplayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ReplayEvent::PatternLearned { .. } => "pattern_learned",
            ReplayEvent::PatternExecuted { .. } => "pattern_executed",
            ReplayEvent::PatternExecutionFailed { .. } => "pattern_execution_failed",
            ReplayEvent::HealthReportGenerated { .. } => "health_report_generated",
            ReplayEvent::WorkflowCompleted { .. } => "workflow_completed",
        }
    }
}

/// Broadcast channel shared by every component of one deployment
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ReplayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplayEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: ReplayEvent) {
        tracing::trace!("Publishing {}", event.name());
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
