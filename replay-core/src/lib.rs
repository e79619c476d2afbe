//! Core functionality for pattern replay
//!
//! This crate learns how a human performed an action on a web page, stores it
//! as a pattern, and replays it for later requests that match. Patterns gain or
//! lose confidence with every execution, are audited for health, and can be
//! chained into multi-phase workflows.

pub mod adapters;
pub mod automation;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod matching;
pub mod pattern;
pub mod store;
pub mod workflow;


pub use adapters::{CapabilityAdapter, ConfirmationAdapter, DryRunCapability, InterventionAdapter};
pub use automation::{AutomationResult, AutomationService};
pub use config::ReplayConfig;
pub use error::FailureReason;
pub use events::{EventBus, ReplayEvent};
pub use health::{HealthAuditor, HealthReport};
pub use lifecycle::{ExecutionReport, LifecycleManager};
pub use matching::{MatchCriteria, MatchEngine};
pub use pattern::{ActionKind, AutomationAction, AutomationRequest, Pattern, PatternDefinition, PatternId};
pub use store::{MergeStrategy, PatternStore};
pub use workflow::{WorkflowDefinition, WorkflowEngine, WorkflowResult};
