//! Multi-phase automation runs
//!
//! A [`WorkflowDefinition`] declares phases with dependencies, conditional
//! rules, explicit data flow, error strategies, resources and rollback. The
//! [`WorkflowEngine`] drives every phase through
//! `pending → evaluating → executing → (completed | failed | skipped)` and the
//! run through `running → (succeeded | failed | aborted)`.

pub mod conditions;
pub mod data_flow;
pub mod engine;
pub mod resources;
pub mod rollback;

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::error::FailureReason;
use crate::health::Severity;
use crate::pattern::{AutomationAction, PatternId, Payload};

pub use conditions::{Condition, ConditionalRule, RuleAction};
pub use data_flow::{DataFlow, DataValidation, OutputBinding, Transformation};
pub use engine::{AbortHandle, WorkflowEngine};
pub use resources::{ConflictPolicy, ResourceAccess, ResourceDeclaration, ResourcePolicy, ResourceUse};
pub use rollback::{RollbackMethod, RollbackReport, RollbackStrategy};

/// Key/value data accumulated across the phases of one run
pub type DataMap = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Dependency error: {0}")]
    DependencyError(String),

    #[error("Phase {phase} jumps to unknown phase {target}")]
    UnknownJumpTarget { phase: String, target: String },

    #[error("Phase {0} uses jump-to, which is only allowed in sequential workflows")]
    JumpInParallel(String),

    #[error("Phase {phase} uses undeclared resource {resource}")]
    UnknownResource { phase: String, resource: String },

    #[error("Workflow references unknown pattern {0}")]
    UnknownPattern(PatternId),

    #[error("No validator registered as {0}")]
    UnknownValidator(String),

    #[error("Invalid regex {pattern}: {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("Failed to read workflow {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse workflow: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// Phases that start together once every member is ready
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPoint {
    pub id: String,
    pub phases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Overrides the engine's concurrency bound for this workflow
    #[serde(default)]
    pub max_concurrent_phases: Option<usize>,
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
    #[serde(default)]
    pub sync_points: Vec<SyncPoint>,
    #[serde(default)]
    pub initial_data: DataMap,
    pub phases: Vec<WorkflowPhase>,
}

/// One unit of work inside a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseStep {
    /// Replay a stored pattern; `{{key}}` placeholders in string values are
    /// filled from the phase inputs
    Pattern {
        pattern_id: PatternId,
        #[serde(default)]
        payload: Payload,
    },
    /// Hand an action straight to the capability adapter
    Capability { action: AutomationAction },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ErrorStrategy {
    Retry { max_retries: u32 },
    Skip,
    /// Run an alternative pattern in place of the failed steps
    Fallback { pattern_id: PatternId },
    Abort,
    ManualIntervention,
}

/// Response to one declared failure type; `on: None` matches any failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandler {
    #[serde(default)]
    pub on: Option<FailureReason>,
    #[serde(flatten)]
    pub strategy: ErrorStrategy,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    /// Emit a notification at the handler's severity
    #[serde(default = "default_notify")]
    pub notify: bool,
}

fn default_severity() -> Severity {
    Severity::Warning
}

fn default_notify() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPhase {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub steps: Vec<PhaseStep>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<ConditionalRule>,
    #[serde(default)]
    pub data_flow: DataFlow,
    #[serde(default)]
    pub error_handlers: Vec<ErrorHandler>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Snapshot the data map before this phase runs
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(default)]
    pub rollback: Option<RollbackStrategy>,
    #[serde(default)]
    pub resources: Vec<ResourceUse>,
}

impl WorkflowPhase {
    pub fn handler_for(&self, reason: FailureReason) -> Option<&ErrorHandler> {
        self.error_handlers.iter().find(|h| h.on.is_none_or(|on| on == reason))
    }

    pub fn pattern_ids(&self) -> impl Iterator<Item = PatternId> + '_ {
        let steps = self.steps.iter().filter_map(|s| match s {
            PhaseStep::Pattern { pattern_id, .. } => Some(*pattern_id),
            PhaseStep::Capability { .. } => None,
        });
        let fallbacks = self.error_handlers.iter().filter_map(|h| match h.strategy {
            ErrorStrategy::Fallback { pattern_id } => Some(pattern_id),
            _ => None,
        });
        let inverse = self
            .rollback
            .iter()
            .flat_map(|r| r.steps.iter())
            .filter_map(|s| match s {
                PhaseStep::Pattern { pattern_id, .. } => Some(*pattern_id),
                PhaseStep::Capability { .. } => None,
            });
        steps.chain(fallbacks).chain(inverse)
    }
}

impl WorkflowDefinition {
    /// Load a definition from a `.json` or `.toml` file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.display().to_string(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|e| WorkflowError::Parse(e.to_string())),
            _ => serde_json::from_str(&content).map_err(|e| WorkflowError::Parse(e.to_string())),
        }
    }

    pub fn phase(&self, id: &str) -> Option<&WorkflowPhase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    /// Structural checks; returns phase ids in a dependency-respecting order
    pub fn validate(&self) -> Result<Vec<String>> {
        if self.phases.is_empty() {
            return Err(WorkflowError::InvalidDefinition(format!("workflow {} has no phases", self.id)));
        }

        let mut graph = DiGraph::<&str, ()>::new();
        let mut node_map: HashMap<&str, NodeIndex> = HashMap::new();
        for phase in &self.phases {
            if node_map.contains_key(phase.id.as_str()) {
                return Err(WorkflowError::DuplicatePhase(phase.id.clone()));
            }
            node_map.insert(&phase.id, graph.add_node(&phase.id));
        }

        let declared: HashMap<&str, ResourcePolicy> =
            self.resources.iter().map(|r| (r.name.as_str(), r.policy)).collect();
        let synchronized: HashSet<&str> =
            self.sync_points.iter().flat_map(|s| s.phases.iter().map(String::as_str)).collect();

        for phase in &self.phases {
            for dependency in &phase.depends_on {
                let Some(&from) = node_map.get(dependency.as_str()) else {
                    return Err(WorkflowError::UnknownDependency {
                        phase: phase.id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                graph.add_edge(from, node_map[phase.id.as_str()], ());
            }

            if let Some(rule) = &phase.condition {
                for target in rule.jump_targets() {
                    if self.mode == ExecutionMode::Parallel {
                        return Err(WorkflowError::JumpInParallel(phase.id.clone()));
                    }
                    if !node_map.contains_key(target) {
                        return Err(WorkflowError::UnknownJumpTarget {
                            phase: phase.id.clone(),
                            target: target.to_string(),
                        });
                    }
                }
                rule.when.compile_check()?;
            }

            for resource in &phase.resources {
                match declared.get(resource.name.as_str()) {
                    None => {
                        return Err(WorkflowError::UnknownResource {
                            phase: phase.id.clone(),
                            resource: resource.name.clone(),
                        });
                    }
                    Some(ResourcePolicy::Synchronized) if !synchronized.contains(phase.id.as_str()) => {
                        return Err(WorkflowError::InvalidDefinition(format!(
                            "phase {} uses synchronized resource {} outside any sync point",
                            phase.id, resource.name
                        )));
                    }
                    Some(_) => {}
                }
            }

            phase.data_flow.compile_check()?;
        }

        for sync in &self.sync_points {
            if let Some(unknown) = sync.phases.iter().find(|p| !node_map.contains_key(p.as_str())) {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "sync point {} names unknown phase {unknown}",
                    sync.id
                )));
            }
        }

        toposort(&graph, None)
            .map_err(|_| WorkflowError::DependencyError("Circular dependency detected".to_string()))?;

        Ok(self.execution_order().into_iter().map(|i| self.phases[i].id.clone()).collect())
    }

    /// Phase indices with every phase after its dependencies; ties keep declaration order.
    ///
    /// Phases caught in a cycle are appended in declaration order.
    pub fn execution_order(&self) -> Vec<usize> {
        let mut waiting = vec![0usize; self.phases.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.phases.len()];
        for (index, phase) in self.phases.iter().enumerate() {
            for dependency in &phase.depends_on {
                if let Some(upstream) = self.phase_index(dependency) {
                    dependents[upstream].push(index);
                    waiting[index] += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> =
            (0..self.phases.len()).filter(|&i| waiting[i] == 0).map(Reverse).collect();
        let mut order = Vec::with_capacity(self.phases.len());
        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            for &dependent in &dependents[index] {
                waiting[dependent] -= 1;
                if waiting[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() < self.phases.len() {
            let placed: HashSet<usize> = order.iter().copied().collect();
            order.extend((0..self.phases.len()).filter(|i| !placed.contains(i)));
        }
        order
    }

    /// Every pattern the workflow may execute
    pub fn pattern_ids(&self) -> Vec<PatternId> {
        let mut ids: Vec<PatternId> = self.phases.iter().flat_map(|p| p.pattern_ids()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Evaluating,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Failed | PhaseStatus::Skipped)
    }

    /// Skipped phases satisfy their dependents
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase_id: String,
    pub status: PhaseStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub reason: Option<FailureReason>,
    #[serde(default)]
    pub message: Option<String>,
}

impl PhaseRecord {
    fn pending(phase_id: &str) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            status: PhaseStatus::Pending,
            attempts: 0,
            duration_ms: 0,
            reason: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub phase_id: String,
    pub attempt: u32,
    pub reason: FailureReason,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub phase_id: String,
    pub severity: Severity,
    pub message: String,
}

/// Final state of one run, handed to the caller and published as an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub status: RunStatus,
    /// Records in declaration order
    pub phases: Vec<PhaseRecord>,
    /// Phase ids in completion order
    pub completed: Vec<String>,
    pub data: DataMap,
    pub errors: Vec<ErrorLogEntry>,
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub rollback: Option<RollbackReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn phase(&self, id: &str) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.phase_id == id)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}
