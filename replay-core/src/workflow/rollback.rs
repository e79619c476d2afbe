//! Checkpoints and rollback planning

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{DataMap, PhaseStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMethod {
    /// Put the data map back the way it was before the phase ran
    StateRestoration,
    /// Run the declared inverse steps
    InverseOperations,
    /// Leave cleanup to a human; the instructions are surfaced as a notification
    ManualCleanup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackStrategy {
    pub method: RollbackMethod,
    #[serde(default)]
    pub steps: Vec<PhaseStep>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase_id: String,
    /// Data map as the phase started; a clean rollback ends here
    pub data: DataMap,
    /// Number of phases already completed when the checkpoint was taken
    pub completed_before: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolledBackPhase {
    pub phase_id: String,
    pub method: Option<RollbackMethod>,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Phase whose checkpoint bounded the unwind; `None` unwinds the whole run
    pub checkpoint: Option<String>,
    pub phases: Vec<RolledBackPhase>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.phases.iter().all(|p| p.success)
    }
}

/// Snapshots taken while a run progresses
#[derive(Debug, Default)]
pub struct CheckpointLog {
    checkpoints: Vec<Checkpoint>,
    before: HashMap<String, DataMap>,
}

impl CheckpointLog {
    /// Called as a phase starts executing
    pub fn phase_started(
        &mut self,
        phase_id: &str,
        checkpoint: bool,
        restores_state: bool,
        data: &DataMap,
        completed: usize,
    ) {
        if checkpoint {
            tracing::debug!("Checkpoint before phase {}", phase_id);
            self.checkpoints.push(Checkpoint {
                phase_id: phase_id.to_string(),
                data: data.clone(),
                completed_before: completed,
            });
        }
        if restores_state {
            self.before.entry(phase_id.to_string()).or_insert_with(|| data.clone());
        }
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Data map as it was before `phase_id` first ran
    pub fn before(&self, phase_id: &str) -> Option<&DataMap> {
        self.before.get(phase_id)
    }

    /// Completed phases to unwind, most recent first, back to the latest checkpoint
    pub fn unwind_order<'a>(&self, completed: &'a [String]) -> Vec<&'a str> {
        let start = self.latest().map_or(0, |c| c.completed_before.min(completed.len()));
        completed[start..].iter().rev().map(String::as_str).collect()
    }
}
