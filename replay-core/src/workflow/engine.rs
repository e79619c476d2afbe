//! Workflow execution
//!
//! Sequential runs walk phases in dependency order, declaration order breaking
//! ties, and honour jump-to rules.
//! Parallel runs launch every phase whose dependencies have resolved, bounded
//! by a semaphore, and gate sync-point members until all of them are ready.
//! Each phase attempt is wrapped in the phase timeout; failures go through the
//! phase's declared error handlers. Pattern steps get the rest of that budget
//! as their execution timeout and run on their own task, so every execution a
//! run starts is recorded even when the phase times out or the run is aborted.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::conditions::RuleAction;
use super::data_flow::{ValidatorRegistry, fill_templates};
use super::resources::{ConflictPolicy, ResourceManager, resolve_conflict};
use super::rollback::{CheckpointLog, RollbackMethod, RollbackReport, RolledBackPhase};
use super::{
    DataMap, ErrorLogEntry, ErrorStrategy, ExecutionMode, Notification, PhaseRecord, PhaseStatus, PhaseStep,
    Result, RunStatus, WorkflowDefinition, WorkflowError, WorkflowPhase, WorkflowResult,
};
use crate::adapters::{InterventionAdapter, InterventionDecision, InterventionRequest};
use crate::config::WorkflowConfig;
use crate::error::FailureReason;
use crate::events::ReplayEvent;
use crate::health::Severity;
use crate::lifecycle::{ExecutionReport, LifecycleManager};
use crate::pattern::{AutomationAction, AutomationRequest, Payload, RequestContext};

/// Times a human may resume the same phase before it escalates
const MAX_INTERVENTIONS: u32 = 3;

/// Cancels a running workflow; in-flight phases stop and rollback runs
#[derive(Debug, Clone)]
pub struct AbortHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender: Arc::new(sender) }
    }

    pub fn abort(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

async fn aborted(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[derive(Debug, Clone)]
struct StepFailure {
    reason: FailureReason,
    message: String,
}

impl StepFailure {
    fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self { reason, message: message.into() }
    }

    fn condition(message: impl ToString) -> Self {
        Self::new(FailureReason::WorkflowConditionFailure, message.to_string())
    }
}

#[derive(Debug)]
enum PhaseOutcome {
    Completed { outputs: DataMap },
    Skipped { message: String },
    /// `escalation` is the run status the failure forces
    Failed { failure: StepFailure, escalation: RunStatus },
}

impl PhaseOutcome {
    fn failed(failure: StepFailure, escalation: RunStatus) -> Self {
        PhaseOutcome::Failed { failure, escalation }
    }
}

#[derive(Debug)]
struct PhaseRun {
    index: usize,
    outcome: PhaseOutcome,
    attempts: u32,
    duration_ms: u64,
    errors: Vec<ErrorLogEntry>,
    notifications: Vec<Notification>,
}

impl PhaseRun {
    fn is_completed(&self) -> bool {
        matches!(self.outcome, PhaseOutcome::Completed { .. })
    }
}

/// Collects the error log and notifications of one phase while it runs
#[derive(Default)]
struct PhaseJournal {
    attempts: u32,
    errors: Vec<ErrorLogEntry>,
    notifications: Vec<Notification>,
}

impl PhaseJournal {
    fn error(&mut self, phase_id: &str, failure: &StepFailure) {
        self.errors.push(ErrorLogEntry {
            phase_id: phase_id.to_string(),
            attempt: self.attempts,
            reason: failure.reason,
            message: failure.message.clone(),
            at: Utc::now(),
        });
    }

    fn notify(&mut self, phase_id: &str, severity: Severity, message: String) {
        self.notifications.push(notification(phase_id, severity, message));
    }

    fn finish(self, index: usize, outcome: PhaseOutcome, started: Instant) -> PhaseRun {
        PhaseRun {
            index,
            outcome,
            attempts: self.attempts,
            duration_ms: started.elapsed().as_millis() as u64,
            errors: self.errors,
            notifications: self.notifications,
        }
    }
}

/// Log a notification at its severity and return the record
fn notification(phase_id: &str, severity: Severity, message: String) -> Notification {
    match severity {
        Severity::Info => info!("[{}] {}", phase_id, message),
        Severity::Warning => warn!("[{}] {}", phase_id, message),
        Severity::Error | Severity::Critical => error!("[{}] {}", phase_id, message),
    }
    Notification { phase_id: phase_id.to_string(), severity, message }
}

/// Everything a phase needs to run on its own task
struct PhaseTask {
    index: usize,
    phase: WorkflowPhase,
    data: DataMap,
    run_id: Uuid,
    context: RequestContext,
    resources: Arc<ResourceManager>,
}

struct StepContext<'a> {
    run_id: Uuid,
    phase_id: &'a str,
    context: &'a RequestContext,
    deadline: Instant,
}

struct RunContext {
    run_id: Uuid,
    context: RequestContext,
    resources: Arc<ResourceManager>,
}

impl RunContext {
    fn task(&self, index: usize, phase: &WorkflowPhase, data: &DataMap) -> PhaseTask {
        PhaseTask {
            index,
            phase: phase.clone(),
            data: data.clone(),
            run_id: self.run_id,
            context: self.context.clone(),
            resources: Arc::clone(&self.resources),
        }
    }
}

/// Mutable record of one run, owned by that run alone
struct WorkflowExecutionState {
    current_phase: usize,
    records: Vec<PhaseRecord>,
    /// Phase ids in completion order
    completed: Vec<String>,
    data: DataMap,
    /// Output key → index of the phase that last wrote it
    writers: HashMap<String, usize>,
    errors: Vec<ErrorLogEntry>,
    notifications: Vec<Notification>,
    checkpoints: CheckpointLog,
    status: RunStatus,
}

impl WorkflowExecutionState {
    fn new(definition: &WorkflowDefinition) -> Self {
        Self {
            current_phase: 0,
            records: definition.phases.iter().map(|p| PhaseRecord::pending(&p.id)).collect(),
            completed: Vec::new(),
            data: definition.initial_data.clone(),
            writers: HashMap::new(),
            errors: Vec::new(),
            notifications: Vec::new(),
            checkpoints: CheckpointLog::default(),
            status: RunStatus::Running,
        }
    }

    fn set_status(&mut self, index: usize, status: PhaseStatus) {
        let record = &mut self.records[index];
        debug!("Phase {}: {:?} -> {:?}", record.phase_id, record.status, status);
        record.status = status;
    }

    fn start_phase(&mut self, definition: &WorkflowDefinition, index: usize) {
        let phase = &definition.phases[index];
        let restores_state =
            phase.rollback.as_ref().is_some_and(|r| r.method == RollbackMethod::StateRestoration);
        self.checkpoints
            .phase_started(&phase.id, phase.checkpoint, restores_state, &self.data, self.completed.len());
        self.current_phase = index;
        self.set_status(index, PhaseStatus::Executing);
    }

    fn abort_phase(&mut self, index: usize) {
        self.set_status(index, PhaseStatus::Failed);
        self.records[index].message = Some("aborted".to_string());
    }

    /// Write phase outputs, reconciling overlaps with writes from unordered phases
    fn merge_outputs(
        &mut self,
        definition: &WorkflowDefinition,
        index: usize,
        outputs: DataMap,
        resources: &ResourceManager,
    ) -> std::result::Result<(), String> {
        let parallel = definition.mode == ExecutionMode::Parallel;
        let phase = &definition.phases[index];

        for (key, value) in outputs {
            let value = match (self.writers.get(&key), self.data.get(&key)) {
                (Some(&writer), Some(existing))
                    if parallel && writer != index && !depends_on(definition, index, writer) =>
                {
                    let policy = resources
                        .write_conflict(&phase.resources, &definition.phases[writer].resources)
                        .unwrap_or(ConflictPolicy::Override);
                    resolve_conflict(policy, &key, existing, value)?
                }
                _ => value,
            };
            self.data.insert(key.clone(), value);
            self.writers.insert(key, index);
        }
        Ok(())
    }

    /// Pending phases that can no longer start
    fn fail_stalled(&mut self) {
        for index in 0..self.records.len() {
            if self.records[index].status == PhaseStatus::Pending {
                self.set_status(index, PhaseStatus::Failed);
                let record = &mut self.records[index];
                record.reason = Some(FailureReason::WorkflowDependencyUnmet);
                record.message = Some("never became ready".to_string());
                self.status = RunStatus::Failed;
            }
        }
    }
}

/// Whether `phase` depends on `ancestor`, directly or transitively
fn depends_on(definition: &WorkflowDefinition, phase: usize, ancestor: usize) -> bool {
    let mut stack = vec![phase];
    let mut seen = vec![false; definition.phases.len()];
    while let Some(current) = stack.pop() {
        for dependency in &definition.phases[current].depends_on {
            let Some(dep) = definition.phase_index(dependency) else {
                continue;
            };
            if dep == ancestor {
                return true;
            }
            if !seen[dep] {
                seen[dep] = true;
                stack.push(dep);
            }
        }
    }
    false
}

enum Readiness {
    Wait,
    Ready,
    Unmet(String),
}

fn readiness(definition: &WorkflowDefinition, index: usize, state: &WorkflowExecutionState) -> Readiness {
    for dependency in &definition.phases[index].depends_on {
        let Some(dep) = definition.phase_index(dependency) else {
            return Readiness::Unmet(dependency.clone());
        };
        let status = state.records[dep].status;
        if !status.is_terminal() {
            return Readiness::Wait;
        }
        if !status.satisfies_dependents() {
            return Readiness::Unmet(dependency.clone());
        }
    }
    Readiness::Ready
}

/// Sync-point members start only once every other member is ready or already started
fn sync_ready(definition: &WorkflowDefinition, index: usize, state: &WorkflowExecutionState) -> bool {
    let id = &definition.phases[index].id;
    definition
        .sync_points
        .iter()
        .filter(|s| s.phases.contains(id))
        .flat_map(|s| s.phases.iter())
        .filter_map(|member| definition.phase_index(member))
        .filter(|&member| member != index)
        .all(|member| {
            state.records[member].status != PhaseStatus::Pending
                || matches!(readiness(definition, member, state), Readiness::Ready)
        })
}

enum Gate {
    Run { repeat: u32 },
    Skip(String),
    Jump(String),
    Fail(StepFailure),
}

fn gate(definition: &WorkflowDefinition, index: usize, state: &mut WorkflowExecutionState) -> Gate {
    let phase = &definition.phases[index];
    for dependency in &phase.depends_on {
        let satisfied = definition
            .phase_index(dependency)
            .is_some_and(|dep| state.records[dep].status.satisfies_dependents());
        if !satisfied {
            return Gate::Fail(StepFailure::new(
                FailureReason::WorkflowDependencyUnmet,
                format!("dependency {dependency} of phase {} is not satisfied", phase.id),
            ));
        }
    }

    state.set_status(index, PhaseStatus::Evaluating);
    match phase.condition.as_ref().map(|rule| rule.evaluate(&state.data)) {
        None | Some(RuleAction::Continue) => Gate::Run { repeat: 0 },
        Some(RuleAction::Skip) => Gate::Skip("condition not met".to_string()),
        Some(RuleAction::JumpTo { phase }) => Gate::Jump(phase.clone()),
        Some(RuleAction::Repeat { max_times }) => Gate::Run { repeat: *max_times },
        Some(RuleAction::Fail { message }) => Gate::Fail(StepFailure::condition(
            message.clone().unwrap_or_else(|| format!("condition of phase {} failed", phase.id)),
        )),
    }
}

fn wants_repeat(phase: &WorkflowPhase, data: &DataMap) -> bool {
    phase
        .condition
        .as_ref()
        .is_some_and(|rule| matches!(rule.evaluate(data), RuleAction::Repeat { .. }))
}

/// Runs workflow definitions against a lifecycle manager
#[derive(Clone)]
pub struct WorkflowEngine {
    lifecycle: Arc<LifecycleManager>,
    config: WorkflowConfig,
    validators: ValidatorRegistry,
    intervention: Option<Arc<dyn InterventionAdapter>>,
}

impl WorkflowEngine {
    pub fn new(lifecycle: Arc<LifecycleManager>, config: WorkflowConfig) -> Self {
        Self { lifecycle, config, validators: ValidatorRegistry::default(), intervention: None }
    }

    pub fn with_intervention(mut self, intervention: Arc<dyn InterventionAdapter>) -> Self {
        self.intervention = Some(intervention);
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Register a named validator for `custom` data validations
    pub fn register_validator<F>(&self, name: impl Into<String>, validator: F)
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validators.register(name, validator);
    }

    /// Structural checks plus references to stored patterns and registered validators
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<Vec<String>> {
        let order = definition.validate()?;

        if let Some(missing) = definition.pattern_ids().into_iter().find(|id| !self.lifecycle.store().contains(*id)) {
            return Err(WorkflowError::UnknownPattern(missing));
        }

        let unknown_validator = definition
            .phases
            .iter()
            .flat_map(|p| p.data_flow.custom_validators())
            .find(|name| !self.validators.contains(name));
        if let Some(name) = unknown_validator {
            return Err(WorkflowError::UnknownValidator(name.to_string()));
        }

        Ok(order)
    }

    pub async fn run(&self, definition: &WorkflowDefinition, context: RequestContext) -> Result<WorkflowResult> {
        self.run_with_abort(definition, context, &AbortHandle::new()).await
    }

    /// Run to completion; only an invalid definition is an `Err`
    pub async fn run_with_abort(
        &self,
        definition: &WorkflowDefinition,
        context: RequestContext,
        abort: &AbortHandle,
    ) -> Result<WorkflowResult> {
        self.validate(definition)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            "Starting workflow {} run {} ({} phases, {:?})",
            definition.id,
            run_id,
            definition.phases.len(),
            definition.mode
        );

        let ctx = RunContext { run_id, context, resources: Arc::new(ResourceManager::new(&definition.resources)) };
        let mut state = WorkflowExecutionState::new(definition);
        let mut signal = abort.subscribe();

        match definition.mode {
            ExecutionMode::Sequential => self.run_sequential(definition, &mut state, &ctx, &mut signal).await,
            ExecutionMode::Parallel => self.run_parallel(definition, &mut state, &ctx, &mut signal).await,
        }

        if state.status == RunStatus::Running {
            state.status = RunStatus::Succeeded;
        }

        let rollback = match state.status {
            RunStatus::Aborted => Some(self.roll_back(definition, &mut state, &ctx).await),
            RunStatus::Failed if self.config.rollback_on_failure => {
                Some(self.roll_back(definition, &mut state, &ctx).await)
            }
            _ => None,
        };

        let result = WorkflowResult {
            run_id,
            workflow_id: definition.id.clone(),
            status: state.status,
            phases: state.records,
            completed: state.completed,
            data: state.data,
            errors: state.errors,
            notifications: state.notifications,
            rollback,
            started_at,
            finished_at: Utc::now(),
        };

        match result.status {
            RunStatus::Succeeded => info!("Workflow {} run {} succeeded", definition.id, run_id),
            status => error!("Workflow {} run {} ended {:?} at phase {}", definition.id, run_id, status, state.current_phase),
        }

        self.lifecycle
            .store()
            .events()
            .publish(ReplayEvent::WorkflowCompleted { run_id, result: Box::new(result.clone()) });

        Ok(result)
    }

    async fn run_sequential(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowExecutionState,
        ctx: &RunContext,
        signal: &mut watch::Receiver<bool>,
    ) {
        let order = definition.execution_order();
        let mut position = 0;
        let mut jumps = 0;

        while position < order.len() {
            let index = order[position];
            if *signal.borrow() {
                info!("Workflow {} aborted before phase {}", definition.id, definition.phases[index].id);
                state.status = RunStatus::Aborted;
                return;
            }
            state.current_phase = index;
            let phase = &definition.phases[index];

            match gate(definition, index, state) {
                Gate::Skip(message) => {
                    let run = PhaseJournal::default().finish(index, PhaseOutcome::Skipped { message }, Instant::now());
                    self.apply(definition, state, run, &ctx.resources);
                    position += 1;
                }
                Gate::Jump(target) => {
                    jumps += 1;
                    if jumps > self.config.max_jumps {
                        let failure = StepFailure::condition(format!("jump limit of {} reached", self.config.max_jumps));
                        let run = PhaseJournal::default().finish(
                            index,
                            PhaseOutcome::failed(failure, RunStatus::Failed),
                            Instant::now(),
                        );
                        self.apply(definition, state, run, &ctx.resources);
                        return;
                    }
                    debug!("Phase {} jumps to {}", phase.id, target);
                    let run = PhaseJournal::default().finish(
                        index,
                        PhaseOutcome::Skipped { message: format!("jumped to {target}") },
                        Instant::now(),
                    );
                    self.apply(definition, state, run, &ctx.resources);
                    let target = definition.phase_index(&target);
                    position = target.and_then(|t| order.iter().position(|&i| i == t)).unwrap_or(order.len());
                    if let Some(record) = target.and_then(|t| state.records.get_mut(t)) {
                        record.status = PhaseStatus::Pending;
                    }
                }
                Gate::Fail(failure) => {
                    let run = self.settle_gate_failure(index, phase, failure);
                    if self.apply(definition, state, run, &ctx.resources).is_some() {
                        return;
                    }
                    position += 1;
                }
                Gate::Run { repeat } => {
                    let mut repeats = 0;
                    loop {
                        state.start_phase(definition, index);
                        let task = ctx.task(index, phase, &state.data);
                        let run = tokio::select! {
                            run = self.execute_phase(task) => run,
                            _ = aborted(signal) => {
                                info!("Workflow {} aborted during phase {}", definition.id, phase.id);
                                state.abort_phase(index);
                                state.status = RunStatus::Aborted;
                                return;
                            }
                        };

                        let completed = run.is_completed();
                        if self.apply(definition, state, run, &ctx.resources).is_some() {
                            return;
                        }
                        if completed && repeats < repeat && wants_repeat(phase, &state.data) {
                            repeats += 1;
                            debug!("Repeating phase {} ({} of {})", phase.id, repeats, repeat);
                            continue;
                        }
                        break;
                    }
                    position += 1;
                }
            }
        }
    }

    async fn run_parallel(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowExecutionState,
        ctx: &RunContext,
        signal: &mut watch::Receiver<bool>,
    ) {
        let limit = definition.max_concurrent_phases.unwrap_or(self.config.max_concurrent_phases).max(1);
        let permits = Arc::new(Semaphore::new(limit));
        let mut tasks: JoinSet<PhaseRun> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut repeat_budget: HashMap<usize, u32> = HashMap::new();
        let mut repeats: HashMap<usize, u32> = HashMap::new();

        loop {
            if state.status == RunStatus::Running {
                self.launch_ready(definition, state, ctx, &permits, &mut tasks, &mut in_flight, &mut repeat_budget);
            }

            if in_flight.is_empty() {
                if state.status == RunStatus::Running {
                    state.fail_stalled();
                }
                break;
            }

            tokio::select! {
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    let run = match joined {
                        Ok((id, run)) => {
                            in_flight.remove(&id);
                            run
                        }
                        Err(e) => {
                            let Some(index) = in_flight.remove(&e.id()) else {
                                continue;
                            };
                            error!("Phase {} task failed: {}", definition.phases[index].id, e);
                            let failure = StepFailure::new(FailureReason::CapabilityFailure, e.to_string());
                            PhaseJournal::default().finish(
                                index,
                                PhaseOutcome::failed(failure, RunStatus::Failed),
                                Instant::now(),
                            )
                        }
                    };

                    let index = run.index;
                    let completed = run.is_completed();
                    match self.apply(definition, state, run, &ctx.resources) {
                        Some(RunStatus::Aborted) => {
                            cancel_in_flight(&mut tasks, &mut in_flight, state).await;
                            break;
                        }
                        Some(_) => {}
                        None if completed && state.status == RunStatus::Running => {
                            let budget = repeat_budget.get(&index).copied().unwrap_or(0);
                            let done = repeats.entry(index).or_default();
                            if *done < budget && wants_repeat(&definition.phases[index], &state.data) {
                                *done += 1;
                                debug!("Repeating phase {}", definition.phases[index].id);
                                self.spawn_phase(definition, index, state, ctx, &permits, &mut tasks, &mut in_flight);
                            }
                        }
                        None => {}
                    }
                }
                _ = aborted(signal) => {
                    info!("Workflow {} aborted with {} phases in flight", definition.id, in_flight.len());
                    cancel_in_flight(&mut tasks, &mut in_flight, state).await;
                    state.status = RunStatus::Aborted;
                    break;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn launch_ready(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowExecutionState,
        ctx: &RunContext,
        permits: &Arc<Semaphore>,
        tasks: &mut JoinSet<PhaseRun>,
        in_flight: &mut HashMap<tokio::task::Id, usize>,
        repeat_budget: &mut HashMap<usize, u32>,
    ) {
        loop {
            let mut progressed = false;

            for index in 0..definition.phases.len() {
                if state.status != RunStatus::Running {
                    return;
                }
                if state.records[index].status != PhaseStatus::Pending {
                    continue;
                }
                let phase = &definition.phases[index];

                let gated = match readiness(definition, index, state) {
                    Readiness::Wait => continue,
                    Readiness::Unmet(dependency) => Gate::Fail(StepFailure::new(
                        FailureReason::WorkflowDependencyUnmet,
                        format!("dependency {dependency} of phase {} is not satisfied", phase.id),
                    )),
                    Readiness::Ready if !sync_ready(definition, index, state) => continue,
                    Readiness::Ready => gate(definition, index, state),
                };
                progressed = true;

                match gated {
                    Gate::Run { repeat } => {
                        repeat_budget.insert(index, repeat);
                        self.spawn_phase(definition, index, state, ctx, permits, tasks, in_flight);
                    }
                    Gate::Skip(message) => {
                        let run =
                            PhaseJournal::default().finish(index, PhaseOutcome::Skipped { message }, Instant::now());
                        self.apply(definition, state, run, &ctx.resources);
                    }
                    Gate::Jump(target) => {
                        let failure = StepFailure::condition(format!("jump to {target} in a parallel workflow"));
                        let run = PhaseJournal::default().finish(
                            index,
                            PhaseOutcome::failed(failure, RunStatus::Failed),
                            Instant::now(),
                        );
                        self.apply(definition, state, run, &ctx.resources);
                    }
                    Gate::Fail(failure) => {
                        let run = self.settle_gate_failure(index, phase, failure);
                        self.apply(definition, state, run, &ctx.resources);
                    }
                }
            }

            if !progressed {
                return;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_phase(
        &self,
        definition: &WorkflowDefinition,
        index: usize,
        state: &mut WorkflowExecutionState,
        ctx: &RunContext,
        permits: &Arc<Semaphore>,
        tasks: &mut JoinSet<PhaseRun>,
        in_flight: &mut HashMap<tokio::task::Id, usize>,
    ) {
        state.start_phase(definition, index);
        let task = ctx.task(index, &definition.phases[index], &state.data);
        let engine = self.clone();
        let permits = Arc::clone(permits);

        let handle = tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            engine.execute_phase(task).await
        });
        in_flight.insert(handle.id(), index);
    }

    /// Record a finished phase; returns the run status when the phase escalated
    fn apply(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowExecutionState,
        run: PhaseRun,
        resources: &ResourceManager,
    ) -> Option<RunStatus> {
        let phase = &definition.phases[run.index];
        state.errors.extend(run.errors);
        state.notifications.extend(run.notifications);
        state.records[run.index].attempts += run.attempts;
        state.records[run.index].duration_ms += run.duration_ms;

        let outcome = match run.outcome {
            PhaseOutcome::Completed { outputs } => match state.merge_outputs(definition, run.index, outputs, resources) {
                Ok(()) => PhaseOutcome::Completed { outputs: DataMap::new() },
                Err(message) => PhaseOutcome::failed(StepFailure::condition(message), RunStatus::Failed),
            },
            other => other,
        };

        match outcome {
            PhaseOutcome::Completed { .. } => {
                state.set_status(run.index, PhaseStatus::Completed);
                let record = &mut state.records[run.index];
                record.reason = None;
                record.message = None;
                state.completed.retain(|id| id != &phase.id);
                state.completed.push(phase.id.clone());
                info!("Phase {} completed", phase.id);
                None
            }
            PhaseOutcome::Skipped { message } => {
                state.set_status(run.index, PhaseStatus::Skipped);
                debug!("Phase {} skipped: {}", phase.id, message);
                state.records[run.index].message = Some(message);
                None
            }
            PhaseOutcome::Failed { failure, escalation } => {
                state.set_status(run.index, PhaseStatus::Failed);
                error!("Phase {} failed ({}): {}", phase.id, failure.reason, failure.message);
                let record = &mut state.records[run.index];
                record.reason = Some(failure.reason);
                record.message = Some(failure.message);
                if state.status == RunStatus::Running || escalation == RunStatus::Aborted {
                    state.status = escalation;
                }
                Some(escalation)
            }
        }
    }

    /// Dependency and condition failures honour skip and abort handlers; anything else escalates
    fn settle_gate_failure(&self, index: usize, phase: &WorkflowPhase, failure: StepFailure) -> PhaseRun {
        let started = Instant::now();
        let mut journal = PhaseJournal::default();
        warn!("Phase {} cannot run: {}", phase.id, failure.message);
        journal.error(&phase.id, &failure);

        let outcome = match phase.handler_for(failure.reason) {
            Some(handler) => {
                if handler.notify {
                    journal.notify(&phase.id, handler.severity, format!("{}: {}", failure.reason, failure.message));
                }
                match handler.strategy {
                    ErrorStrategy::Skip => PhaseOutcome::Skipped { message: format!("skipped after {}", failure.reason) },
                    ErrorStrategy::Abort => PhaseOutcome::failed(failure, RunStatus::Aborted),
                    _ => PhaseOutcome::failed(failure, RunStatus::Failed),
                }
            }
            None => PhaseOutcome::failed(failure, RunStatus::Failed),
        };

        journal.finish(index, outcome, started)
    }

    async fn execute_phase(&self, task: PhaseTask) -> PhaseRun {
        let started = Instant::now();
        let phase = &task.phase;
        let mut journal = PhaseJournal::default();
        let _resources = task.resources.acquire(&phase.resources).await;

        let timeout = Duration::from_millis(phase.timeout_ms.unwrap_or(self.config.default_phase_timeout_ms));
        let mut retries = 0;
        let mut interventions = 0;

        let outcome = loop {
            journal.attempts += 1;
            debug!("Executing phase {} (attempt {})", phase.id, journal.attempts);

            let deadline = Instant::now() + timeout;
            let failure = match tokio::time::timeout(timeout, self.attempt(&task, deadline)).await {
                Ok(Ok(scope)) => break PhaseOutcome::Completed { outputs: phase.data_flow.collect_outputs(&scope) },
                Ok(Err(failure)) => failure,
                Err(_) => StepFailure::new(
                    FailureReason::ExecutionTimeout,
                    format!("phase {} timed out after {}ms", phase.id, timeout.as_millis()),
                ),
            };
            warn!("Phase {} attempt {} failed: {}", phase.id, journal.attempts, failure.message);
            journal.error(&phase.id, &failure);

            let Some(handler) = phase.handler_for(failure.reason) else {
                break PhaseOutcome::failed(failure, RunStatus::Failed);
            };
            if handler.notify {
                journal.notify(&phase.id, handler.severity, format!("{}: {}", failure.reason, failure.message));
            }

            match &handler.strategy {
                ErrorStrategy::Retry { max_retries } if retries < *max_retries => {
                    retries += 1;
                    info!("Retry attempt {} of {} for phase {}", retries, max_retries, phase.id);
                }
                ErrorStrategy::Retry { max_retries } => {
                    let message = format!("{} (gave up after {} retries)", failure.message, max_retries);
                    break PhaseOutcome::failed(StepFailure::new(failure.reason, message), RunStatus::Failed);
                }
                ErrorStrategy::Skip => {
                    break PhaseOutcome::Skipped { message: format!("skipped after {}", failure.reason) };
                }
                ErrorStrategy::Fallback { pattern_id } => {
                    journal.attempts += 1;
                    info!("Phase {} falling back to pattern {}", phase.id, pattern_id);
                    let deadline = Instant::now() + timeout;
                    break match tokio::time::timeout(timeout, self.attempt_fallback(&task, *pattern_id, deadline)).await {
                        Ok(Ok(scope)) => PhaseOutcome::Completed { outputs: phase.data_flow.collect_outputs(&scope) },
                        Ok(Err(failure)) => {
                            journal.error(&phase.id, &failure);
                            PhaseOutcome::failed(failure, RunStatus::Failed)
                        }
                        Err(_) => {
                            let failure = StepFailure::new(
                                FailureReason::ExecutionTimeout,
                                format!("fallback for phase {} timed out", phase.id),
                            );
                            journal.error(&phase.id, &failure);
                            PhaseOutcome::failed(failure, RunStatus::Failed)
                        }
                    };
                }
                ErrorStrategy::Abort => break PhaseOutcome::failed(failure, RunStatus::Aborted),
                ErrorStrategy::ManualIntervention => {
                    let Some(adapter) = &self.intervention else {
                        let message = format!("{} (no intervention available)", failure.message);
                        break PhaseOutcome::failed(StepFailure::new(failure.reason, message), RunStatus::Failed);
                    };

                    let request = InterventionRequest {
                        run_id: task.run_id,
                        phase_id: phase.id.clone(),
                        reason: failure.reason,
                        message: failure.message.clone(),
                    };
                    match adapter.intervene(&request).await {
                        InterventionDecision::Resume if interventions < MAX_INTERVENTIONS => {
                            interventions += 1;
                            info!("Resuming phase {} after intervention", phase.id);
                        }
                        InterventionDecision::Resume => {
                            let message = format!("{} (intervention limit reached)", failure.message);
                            break PhaseOutcome::failed(StepFailure::new(failure.reason, message), RunStatus::Failed);
                        }
                        InterventionDecision::Skip => {
                            break PhaseOutcome::Skipped { message: "skipped by intervention".to_string() };
                        }
                        InterventionDecision::Abort => break PhaseOutcome::failed(failure, RunStatus::Aborted),
                    }
                }
            }
        };

        journal.finish(task.index, outcome, started)
    }

    /// Prepare the phase scope and run every step
    async fn attempt(&self, task: &PhaseTask, deadline: Instant) -> std::result::Result<DataMap, StepFailure> {
        let mut scope = task
            .phase
            .data_flow
            .prepare(&task.data, &self.validators)
            .map_err(StepFailure::condition)?;

        let ctx = StepContext { run_id: task.run_id, phase_id: &task.phase.id, context: &task.context, deadline };
        self.run_steps(&task.phase.steps, &mut scope, &ctx).await?;
        Ok(scope)
    }

    /// Replace the phase steps with one execution of `pattern_id`
    async fn attempt_fallback(
        &self,
        task: &PhaseTask,
        pattern_id: crate::pattern::PatternId,
        deadline: Instant,
    ) -> std::result::Result<DataMap, StepFailure> {
        let mut scope = task
            .phase
            .data_flow
            .prepare(&task.data, &self.validators)
            .map_err(StepFailure::condition)?;

        let payload = task
            .phase
            .steps
            .iter()
            .find_map(|s| match s {
                PhaseStep::Pattern { payload, .. } => Some(payload.clone()),
                PhaseStep::Capability { .. } => None,
            })
            .unwrap_or_default();

        let ctx = StepContext { run_id: task.run_id, phase_id: &task.phase.id, context: &task.context, deadline };
        self.run_steps(&[PhaseStep::Pattern { pattern_id, payload }], &mut scope, &ctx).await?;
        Ok(scope)
    }

    /// Each step's data lands in the scope as `step<N>` and `result`
    async fn run_steps(
        &self,
        steps: &[PhaseStep],
        scope: &mut DataMap,
        ctx: &StepContext<'_>,
    ) -> std::result::Result<(), StepFailure> {
        for (i, step) in steps.iter().enumerate() {
            let value = self.run_step(step, scope, ctx).await?;
            scope.insert(format!("step{i}"), value.clone());
            scope.insert("result".to_string(), value);
        }
        Ok(())
    }

    async fn run_step(
        &self,
        step: &PhaseStep,
        scope: &DataMap,
        ctx: &StepContext<'_>,
    ) -> std::result::Result<Value, StepFailure> {
        match step {
            PhaseStep::Pattern { pattern_id, payload } => {
                let payload: Payload = payload
                    .iter()
                    .map(|(k, v)| fill_templates(v, scope).map(|v| (k.clone(), v)))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(StepFailure::condition)?;

                let Some(pattern) = self.lifecycle.store().get(*pattern_id) else {
                    return Err(StepFailure::new(
                        FailureReason::CapabilityFailure,
                        format!("pattern {pattern_id} no longer exists"),
                    ));
                };

                let request = AutomationRequest::new(pattern.request_kind, payload, ctx.context.clone())
                    .with_correlation_id(format!("{}/{}", ctx.run_id, ctx.phase_id))
                    .with_confidence(1.0);

                let budget = ctx.deadline.saturating_duration_since(Instant::now());
                let lifecycle = Arc::clone(&self.lifecycle);
                let pattern_id = *pattern_id;
                let execution =
                    tokio::spawn(async move { lifecycle.execute_with_timeout(pattern_id, &request, budget).await });

                match execution.await {
                    Ok(Ok(ExecutionReport::Succeeded { outcome, .. })) => Ok(outcome.data.unwrap_or(Value::Bool(true))),
                    Ok(Ok(ExecutionReport::Failed { reason, message, .. })) => Err(StepFailure::new(reason, message)),
                    Ok(Err(e)) => Err(StepFailure::new(FailureReason::CapabilityFailure, e.to_string())),
                    Err(e) => Err(StepFailure::new(FailureReason::CapabilityFailure, e.to_string())),
                }
            }
            PhaseStep::Capability { action } => {
                let template = serde_json::to_value(action).map_err(StepFailure::condition)?;
                let filled = fill_templates(&template, scope).map_err(StepFailure::condition)?;
                let action: AutomationAction = serde_json::from_value(filled).map_err(StepFailure::condition)?;

                self.lifecycle
                    .capability()
                    .perform(&action, ctx.context)
                    .await
                    .map(|output| output.data.unwrap_or(Value::Bool(true)))
                    .map_err(|e| StepFailure::new(FailureReason::CapabilityFailure, e.to_string()))
            }
        }
    }

    /// Unwind completed phases back to the latest checkpoint, most recent first.
    ///
    /// A clean unwind leaves the data map as it was when the checkpoint was taken.
    async fn roll_back(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowExecutionState,
        ctx: &RunContext,
    ) -> RollbackReport {
        let order: Vec<String> =
            state.checkpoints.unwind_order(&state.completed).into_iter().map(str::to_string).collect();
        let mut report = RollbackReport {
            checkpoint: state.checkpoints.latest().map(|c| c.phase_id.clone()),
            phases: Vec::new(),
        };
        if order.is_empty() {
            return report;
        }
        warn!("Rolling back {} phases of workflow {}", order.len(), definition.id);

        for phase_id in order {
            let Some(phase) = definition.phase(&phase_id) else {
                continue;
            };

            let entry = match &phase.rollback {
                None => RolledBackPhase {
                    phase_id,
                    method: None,
                    success: true,
                    message: Some("no rollback declared".to_string()),
                },
                Some(strategy) => match strategy.method {
                    RollbackMethod::StateRestoration => match state.checkpoints.before(&phase_id).cloned() {
                        Some(before) => {
                            state.data = before;
                            RolledBackPhase { phase_id, method: Some(strategy.method), success: true, message: None }
                        }
                        None => RolledBackPhase {
                            phase_id,
                            method: Some(strategy.method),
                            success: false,
                            message: Some("no snapshot recorded".to_string()),
                        },
                    },
                    RollbackMethod::InverseOperations => {
                        let mut scope = state.data.clone();
                        let timeout =
                            Duration::from_millis(phase.timeout_ms.unwrap_or(self.config.default_phase_timeout_ms));
                        let step_ctx = StepContext {
                            run_id: ctx.run_id,
                            phase_id: &phase_id,
                            context: &ctx.context,
                            deadline: Instant::now() + timeout,
                        };
                        let outcome = tokio::time::timeout(timeout, self.run_steps(&strategy.steps, &mut scope, &step_ctx)).await;
                        let message = match outcome {
                            Ok(Ok(())) => None,
                            Ok(Err(failure)) => Some(failure.message),
                            Err(_) => Some("inverse operations timed out".to_string()),
                        };
                        if let Some(message) = &message {
                            warn!("Rollback of phase {} failed: {}", phase_id, message);
                        }
                        RolledBackPhase {
                            success: message.is_none(),
                            phase_id,
                            method: Some(strategy.method),
                            message,
                        }
                    }
                    RollbackMethod::ManualCleanup => {
                        let message = strategy
                            .instructions
                            .clone()
                            .unwrap_or_else(|| format!("clean up after phase {phase_id} manually"));
                        state.notifications.push(notification(&phase_id, Severity::Warning, message.clone()));
                        RolledBackPhase { phase_id, method: Some(strategy.method), success: true, message: Some(message) }
                    }
                },
            };
            report.phases.push(entry);
        }

        if report.is_clean() {
            if let Some(checkpoint) = state.checkpoints.latest() {
                debug!("Restoring data captured at checkpoint {}", checkpoint.phase_id);
                state.data = checkpoint.data.clone();
            }
        }

        report
    }
}

async fn cancel_in_flight(
    tasks: &mut JoinSet<PhaseRun>,
    in_flight: &mut HashMap<tokio::task::Id, usize>,
    state: &mut WorkflowExecutionState,
) {
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    for (_, index) in in_flight.drain() {
        state.abort_phase(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{FixedIntervention, ScriptedCapability};
    use crate::adapters::{CapabilityAdapter, CapabilityError, CapabilityOutput};
    use crate::config::{LifecycleConfig, MatchingConfig};
    use crate::matching::MatchEngine;
    use crate::pattern::{ActionKind, fixtures};
    use crate::store::PatternStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine_with(capability: Arc<dyn CapabilityAdapter>) -> WorkflowEngine {
        let lifecycle = LifecycleManager::new(
            Arc::new(PatternStore::in_memory()),
            MatchEngine::new(MatchingConfig::default()),
            capability,
            LifecycleConfig::default(),
        );
        WorkflowEngine::new(Arc::new(lifecycle), WorkflowConfig::default())
    }

    fn workflow(value: Value) -> WorkflowDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn click(target: &str) -> Value {
        json!({"type": "capability", "action": {"kind": "click", "target": target}})
    }

    fn context() -> RequestContext {
        fixtures::context("a.com", "/app")
    }

    fn targets(capability: &ScriptedCapability) -> Vec<String> {
        capability.performed().iter().filter_map(|a| a.target().map(str::to_string)).collect()
    }

    #[tokio::test]
    async fn test_skipped_phase_satisfies_dependents() {
        let capability = Arc::new(ScriptedCapability::new());
        let engine = engine_with(capability.clone());
        let def = workflow(json!({
            "id": "abc",
            "phases": [
                {"id": "a", "steps": [click("#a")]},
                {"id": "b", "depends_on": ["a"], "steps": [click("#b")],
                 "condition": {"when": {"op": "exists", "key": "ready"}}},
                {"id": "c", "depends_on": ["b"], "steps": [click("#c")]}
            ]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(result.phase("b").unwrap().status, PhaseStatus::Skipped);
        assert_eq!(result.phase("c").unwrap().status, PhaseStatus::Completed);
        assert_eq!(result.completed, vec!["a", "c"]);
        assert_eq!(targets(&capability), vec!["#a", "#c"]);
    }

    #[tokio::test]
    async fn test_timeout_retried_then_escalated() {
        let capability = Arc::new(ScriptedCapability::slow(Duration::from_millis(200)));
        let engine = engine_with(capability.clone());
        let def = workflow(json!({
            "id": "slow",
            "phases": [{
                "id": "send",
                "timeout_ms": 20,
                "steps": [click("#send")],
                "error_handlers": [{"on": "execution_timeout", "strategy": "retry", "max_retries": 2}]
            }]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let send = result.phase("send").unwrap();
        assert_eq!(send.status, PhaseStatus::Failed);
        assert_eq!(send.attempts, 3);
        assert_eq!(send.reason, Some(FailureReason::ExecutionTimeout));
        assert_eq!(capability.calls(), 3);
        assert_eq!(result.errors.len(), 3);
        assert!(result.errors.iter().all(|e| e.reason == FailureReason::ExecutionTimeout));
    }

    #[tokio::test]
    async fn test_data_flows_through_declared_keys() {
        let capability = Arc::new(ScriptedCapability::new());
        let engine = engine_with(capability.clone());
        let def = workflow(json!({
            "id": "greet",
            "initial_data": {"name": "Ada"},
            "phases": [
                {"id": "compose", "data_flow": {
                    "inputs": {"who": "name"},
                    "transforms": [{"op": "format", "target": "greeting", "template": "Hello {{who}}"}],
                    "outputs": [{"key": "greeting"}]
                }},
                {"id": "type", "depends_on": ["compose"],
                 "steps": [{"type": "capability", "action": {"kind": "fill-text", "target": "#msg", "value": "{{text}}"}}],
                 "data_flow": {"inputs": {"text": "greeting"}}}
            ]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.data["greeting"], json!("Hello Ada"));
        assert_eq!(
            capability.performed(),
            vec![AutomationAction::FillText { target: "#msg".to_string(), value: "Hello Ada".to_string() }]
        );
    }

    #[tokio::test]
    async fn test_pattern_step_goes_through_lifecycle() {
        let capability = Arc::new(ScriptedCapability::new());
        let engine = engine_with(capability.clone());
        let pattern = engine
            .lifecycle
            .store()
            .create(fixtures::definition(ActionKind::FillText, "a.com", "/app", "#prompt"))
            .await
            .unwrap();

        let def = workflow(json!({
            "id": "ask",
            "initial_data": {"question": "Hi there"},
            "phases": [{
                "id": "ask",
                "steps": [{"type": "pattern", "pattern_id": pattern.id, "payload": {"value": "{{text}}"}}],
                "data_flow": {"inputs": {"text": "question"}}
            }]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(engine.lifecycle.store().get(pattern.id).unwrap().usage_count(), 1);
        assert_eq!(
            capability.performed(),
            vec![AutomationAction::FillText { target: "#prompt".to_string(), value: "Hi there".to_string() }]
        );
    }

    #[tokio::test]
    async fn test_skip_strategy_lets_run_continue() {
        let capability = Arc::new(ScriptedCapability::failing(1));
        let engine = engine_with(capability.clone());
        let def = workflow(json!({
            "id": "optional",
            "phases": [
                {"id": "banner", "steps": [click("#dismiss")], "error_handlers": [{"strategy": "skip", "severity": "info"}]},
                {"id": "send", "depends_on": ["banner"], "steps": [click("#send")]}
            ]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.phase("banner").unwrap().status, PhaseStatus::Skipped);
        assert_eq!(result.phase("send").unwrap().status, PhaseStatus::Completed);
        assert_eq!(result.notifications.len(), 1);
        assert_eq!(result.notifications[0].severity, Severity::Info);
    }

    #[tokio::test]
    async fn test_fallback_pattern_replaces_failed_steps() {
        let capability = Arc::new(ScriptedCapability::failing(1));
        let engine = engine_with(capability.clone());
        let backup = engine
            .lifecycle
            .store()
            .create(fixtures::definition(ActionKind::Click, "a.com", "/app", "#backup"))
            .await
            .unwrap();

        let def = workflow(json!({
            "id": "fallback",
            "phases": [{
                "id": "send",
                "steps": [click("#primary")],
                "error_handlers": [{"on": "capability_failure", "strategy": "fallback", "pattern_id": backup.id}]
            }]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.phase("send").unwrap().attempts, 2);
        assert_eq!(targets(&capability), vec!["#primary", "#backup"]);
        assert_eq!(engine.lifecycle.store().get(backup.id).unwrap().usage_count(), 1);
    }

    #[tokio::test]
    async fn test_abort_restores_state() {
        let capability = Arc::new(ScriptedCapability::with_results(vec![
            Ok(CapabilityOutput::default()),
            Err(CapabilityError::Rejected("closed".to_string())),
        ]));
        let engine = engine_with(capability.clone());
        let def = workflow(json!({
            "id": "abort",
            "phases": [
                {"id": "login", "steps": [click("#login")],
                 "data_flow": {"transforms": [{"op": "format", "target": "token", "template": "t-1"}],
                               "outputs": [{"key": "token"}]},
                 "rollback": {"method": "state_restoration"}},
                {"id": "pay", "depends_on": ["login"], "steps": [click("#pay")],
                 "error_handlers": [{"strategy": "abort", "severity": "critical"}]}
            ]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert_eq!(result.status, RunStatus::Aborted);
        assert_eq!(result.phase("pay").unwrap().status, PhaseStatus::Failed);
        let rollback = result.rollback.unwrap();
        assert_eq!(rollback.checkpoint, None);
        assert_eq!(rollback.phases.len(), 1);
        assert_eq!(rollback.phases[0].phase_id, "login");
        assert_eq!(rollback.phases[0].method, Some(RollbackMethod::StateRestoration));
        assert!(!result.data.contains_key("token"));
    }

    #[tokio::test]
    async fn test_rollback_stops_at_latest_checkpoint() {
        let capability = Arc::new(ScriptedCapability::with_results(vec![
            Ok(CapabilityOutput::default()),
            Ok(CapabilityOutput::default()),
            Err(CapabilityError::Rejected("closed".to_string())),
        ]));
        let engine = engine_with(capability.clone());
        let def = workflow(json!({
            "id": "checkpointed",
            "phases": [
                {"id": "open", "steps": [click("#open")],
                 "rollback": {"method": "manual_cleanup", "instructions": "close the tab"}},
                {"id": "draft", "depends_on": ["open"], "checkpoint": true, "steps": [click("#draft")],
                 "rollback": {"method": "inverse_operations", "steps": [click("#discard")]}},
                {"id": "send", "depends_on": ["draft"], "steps": [click("#send")],
                 "error_handlers": [{"strategy": "abort"}]}
            ]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert_eq!(result.status, RunStatus::Aborted);
        let rollback = result.rollback.unwrap();
        assert_eq!(rollback.checkpoint.as_deref(), Some("draft"));
        assert_eq!(rollback.phases.len(), 1);
        assert_eq!(rollback.phases[0].phase_id, "draft");
        assert!(rollback.is_clean());
        assert_eq!(targets(&capability).last().map(String::as_str), Some("#discard"));
        assert!(result.notifications.iter().all(|n| n.message != "close the tab"));
    }

    #[tokio::test]
    async fn test_manual_intervention() {
        let def = workflow(json!({
            "id": "manual",
            "phases": [{"id": "captcha", "steps": [click("#verify")],
                        "error_handlers": [{"strategy": "manual_intervention", "severity": "error"}]}]
        }));

        let unattended = engine_with(Arc::new(ScriptedCapability::failing(1)));
        let result = unattended.run(&def, context()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.phase("captcha").unwrap().message.as_deref().unwrap().contains("no intervention"));

        let skipped = engine_with(Arc::new(ScriptedCapability::failing(1)))
            .with_intervention(Arc::new(FixedIntervention(InterventionDecision::Skip)));
        let result = skipped.run(&def, context()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.phase("captcha").unwrap().status, PhaseStatus::Skipped);

        let resumed = engine_with(Arc::new(ScriptedCapability::failing(1)))
            .with_intervention(Arc::new(FixedIntervention(InterventionDecision::Resume)));
        let result = resumed.run(&def, context()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.phase("captcha").unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_jump_over_dependency_leaves_it_unmet() {
        let engine = engine_with(Arc::new(ScriptedCapability::new()));
        let def = workflow(json!({
            "id": "jump",
            "phases": [
                {"id": "a", "condition": {"when": {"op": "always"}, "then": {"action": "jump_to", "phase": "c"}}},
                {"id": "b", "steps": [click("#b")]},
                {"id": "c", "depends_on": ["b"], "steps": [click("#c")]}
            ]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.phase("b").unwrap().status, PhaseStatus::Pending);
        let c = result.phase("c").unwrap();
        assert_eq!(c.status, PhaseStatus::Failed);
        assert_eq!(c.reason, Some(FailureReason::WorkflowDependencyUnmet));
    }

    #[tokio::test]
    async fn test_repeat_until_condition_clears() {
        let capability = Arc::new(ScriptedCapability::new());
        let engine = engine_with(capability.clone());
        let def = workflow(json!({
            "id": "repeat",
            "initial_data": {"counter": 0},
            "phases": [{
                "id": "inc",
                "steps": [click("#more")],
                "condition": {
                    "when": {"op": "less_than", "key": "counter", "value": 2.0},
                    "then": {"action": "repeat", "max_times": 5},
                    "otherwise": {"action": "continue"}
                },
                "data_flow": {
                    "inputs": {"n": "counter"},
                    "transforms": [{"op": "calculate", "target": "next", "operation": "add", "operands": ["n", 1]}],
                    "outputs": [{"key": "counter", "from": "next"}]
                }
            }]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.data["counter"].as_f64(), Some(2.0));
        assert_eq!(capability.calls(), 2);
        assert_eq!(result.phase("inc").unwrap().attempts, 2);
    }

    struct ConcurrencyGauge {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CapabilityAdapter for ConcurrencyGauge {
        fn name(&self) -> &str {
            "gauge"
        }

        async fn perform(
            &self,
            _action: &AutomationAction,
            _context: &RequestContext,
        ) -> std::result::Result<CapabilityOutput, CapabilityError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(CapabilityOutput::default())
        }
    }

    #[tokio::test]
    async fn test_parallel_phases_bounded() {
        let gauge = Arc::new(ConcurrencyGauge { active: AtomicUsize::new(0), peak: AtomicUsize::new(0) });
        let engine = engine_with(gauge.clone());
        let def = workflow(json!({
            "id": "fan-out",
            "mode": "parallel",
            "max_concurrent_phases": 2,
            "phases": [
                {"id": "a", "steps": [click("#a")]},
                {"id": "b", "steps": [click("#b")]},
                {"id": "c", "steps": [click("#c")]},
                {"id": "d", "steps": [click("#d")]}
            ]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.completed.len(), 4);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_parallel_join_waits_for_all_dependencies() {
        let engine = engine_with(Arc::new(ScriptedCapability::new()));
        let def = workflow(json!({
            "id": "join",
            "mode": "parallel",
            "phases": [
                {"id": "a", "steps": [click("#a")]},
                {"id": "b", "steps": [click("#b")]},
                {"id": "c", "depends_on": ["a", "b"], "steps": [click("#c")]}
            ]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.completed.last().map(String::as_str), Some("c"));
    }

    #[tokio::test]
    async fn test_abort_handle_cancels_in_flight_phases() {
        let engine = engine_with(Arc::new(ScriptedCapability::slow(Duration::from_millis(500))));
        let def = workflow(json!({
            "id": "long",
            "mode": "parallel",
            "phases": [
                {"id": "a", "steps": [click("#a")]},
                {"id": "b", "steps": [click("#b")]}
            ]
        }));

        let abort = AbortHandle::new();
        let runner = {
            let engine = engine.clone();
            let abort = abort.clone();
            tokio::spawn(async move { engine.run_with_abort(&def, context(), &abort).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        abort.abort();
        let result = runner.await.unwrap().unwrap();

        assert_eq!(result.status, RunStatus::Aborted);
        assert!(abort.is_aborted());
        for id in ["a", "b"] {
            let record = result.phase(id).unwrap();
            assert_eq!(record.status, PhaseStatus::Failed);
            assert_eq!(record.message.as_deref(), Some("aborted"));
        }
        assert!(result.rollback.unwrap().phases.is_empty());
    }

    #[tokio::test]
    async fn test_shared_write_error_policy() {
        let engine = engine_with(Arc::new(ScriptedCapability::new()));
        let writer = |id: &str| {
            json!({
                "id": id,
                "steps": [click("#w")],
                "resources": [{"name": "out", "access": "write"}],
                "data_flow": {"transforms": [{"op": "format", "target": "x", "template": id}],
                              "outputs": [{"key": "x"}]}
            })
        };
        let def = workflow(json!({
            "id": "conflict",
            "mode": "parallel",
            "resources": [{"name": "out", "policy": "shared_write", "conflict": "error"}],
            "phases": [writer("a"), writer("b")]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let failed: Vec<&PhaseRecord> = result.phases.iter().filter(|p| p.status == PhaseStatus::Failed).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, Some(FailureReason::WorkflowConditionFailure));
    }

    #[tokio::test]
    async fn test_custom_validator_blocks_phase() {
        let capability = Arc::new(ScriptedCapability::new());
        let engine = engine_with(capability.clone());
        let def = workflow(json!({
            "id": "validated",
            "initial_data": {"title": ""},
            "phases": [{
                "id": "post",
                "steps": [click("#post")],
                "data_flow": {"inputs": {"t": "title"},
                              "validations": [{"rule": "custom", "key": "t", "validator": "non_empty"}]}
            }]
        }));

        assert!(matches!(engine.validate(&def), Err(WorkflowError::UnknownValidator(_))));

        engine.register_validator("non_empty", |v: &Value| {
            if v.as_str().is_some_and(|s| !s.is_empty()) { Ok(()) } else { Err("empty".to_string()) }
        });
        let result = engine.run(&def, context()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.phase("post").unwrap().reason, Some(FailureReason::WorkflowConditionFailure));
        assert_eq!(capability.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_pattern_rejected_before_run() {
        let engine = engine_with(Arc::new(ScriptedCapability::new()));
        let def = workflow(json!({
            "id": "missing",
            "phases": [{"id": "a", "steps": [{"type": "pattern", "pattern_id": Uuid::new_v4()}]}]
        }));

        assert!(matches!(engine.run(&def, context()).await, Err(WorkflowError::UnknownPattern(_))));
    }

    /// Next execution outcome published on the bus, skipping other events
    async fn next_execution(events: &mut tokio::sync::broadcast::Receiver<ReplayEvent>) -> ReplayEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
            if matches!(event, ReplayEvent::PatternExecuted { .. } | ReplayEvent::PatternExecutionFailed { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_dependency_declared_later_runs_first() {
        let capability = Arc::new(ScriptedCapability::new());
        let engine = engine_with(capability.clone());
        let def = workflow(json!({
            "id": "reordered",
            "phases": [
                {"id": "send", "depends_on": ["type"], "steps": [click("#send")]},
                {"id": "type", "steps": [click("#prompt")]}
            ]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(result.completed, vec!["type", "send"]);
        assert_eq!(targets(&capability), vec!["#prompt", "#send"]);
    }

    #[tokio::test]
    async fn test_timed_out_pattern_step_is_recorded() {
        let engine = engine_with(Arc::new(ScriptedCapability::slow(Duration::from_millis(300))));
        let pattern = engine
            .lifecycle
            .store()
            .create(fixtures::definition(ActionKind::Click, "a.com", "/app", "#send"))
            .await
            .unwrap();
        let mut events = engine.lifecycle.store().events().subscribe();
        let def = workflow(json!({
            "id": "slow-pattern",
            "phases": [{"id": "send", "timeout_ms": 20,
                        "steps": [{"type": "pattern", "pattern_id": pattern.id}]}]
        }));

        let result = engine.run(&def, context()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.phase("send").unwrap().reason, Some(FailureReason::ExecutionTimeout));

        match next_execution(&mut events).await {
            ReplayEvent::PatternExecutionFailed { pattern_id, reason, .. } => {
                assert_eq!(pattern_id, pattern.id);
                assert_eq!(reason, FailureReason::ExecutionTimeout);
            }
            other => panic!("unexpected event {}", other.name()),
        }
        let stored = engine.lifecycle.store().get(pattern.id).unwrap();
        assert_eq!(stored.usage_count(), 1);
        assert_eq!(stored.success_count(), 0);
        assert!((stored.confidence() - 0.9).abs() < 1e-9);
        assert_eq!(stored.execution_history().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_lets_pattern_execution_finish_recording() {
        let engine = engine_with(Arc::new(ScriptedCapability::slow(Duration::from_millis(150))));
        let pattern = engine
            .lifecycle
            .store()
            .create(fixtures::definition(ActionKind::Click, "a.com", "/app", "#send"))
            .await
            .unwrap();
        let mut events = engine.lifecycle.store().events().subscribe();
        let def = workflow(json!({
            "id": "aborted-pattern",
            "phases": [{"id": "send", "steps": [{"type": "pattern", "pattern_id": pattern.id}]}]
        }));

        let abort = AbortHandle::new();
        let runner = {
            let engine = engine.clone();
            let abort = abort.clone();
            tokio::spawn(async move { engine.run_with_abort(&def, context(), &abort).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abort.abort();

        let result = runner.await.unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Aborted);

        assert!(matches!(next_execution(&mut events).await, ReplayEvent::PatternExecuted { .. }));
        assert_eq!(engine.lifecycle.store().get(pattern.id).unwrap().usage_count(), 1);
    }

    #[tokio::test]
    async fn test_clean_rollback_returns_to_checkpoint_data() {
        let capability = Arc::new(ScriptedCapability::with_results(vec![
            Ok(CapabilityOutput::default()),
            Ok(CapabilityOutput::default()),
            Err(CapabilityError::Rejected("closed".to_string())),
        ]));
        let engine = engine_with(capability);
        let def = workflow(json!({
            "id": "checkpoint-data",
            "phases": [
                {"id": "open", "steps": [click("#open")],
                 "data_flow": {"transforms": [{"op": "format", "target": "tab", "template": "t-1"}],
                               "outputs": [{"key": "tab"}]}},
                {"id": "draft", "depends_on": ["open"], "checkpoint": true, "steps": [click("#draft")],
                 "data_flow": {"transforms": [{"op": "format", "target": "draft", "template": "d-1"}],
                               "outputs": [{"key": "draft"}]}},
                {"id": "send", "depends_on": ["draft"], "steps": [click("#send")],
                 "error_handlers": [{"strategy": "abort"}]}
            ]
        }));

        let result = engine.run(&def, context()).await.unwrap();

        assert_eq!(result.status, RunStatus::Aborted);
        assert!(result.rollback.unwrap().is_clean());
        assert_eq!(result.data.get("tab"), Some(&json!("t-1")));
        assert!(!result.data.contains_key("draft"));
    }

    #[tokio::test]
    async fn test_completion_event_published() {
        let engine = engine_with(Arc::new(ScriptedCapability::new()));
        let mut events = engine.lifecycle.store().events().subscribe();
        let def = workflow(json!({"id": "evt", "phases": [{"id": "a", "steps": [click("#a")]}]}));

        let result = engine.run(&def, context()).await.unwrap();

        match events.recv().await.unwrap() {
            ReplayEvent::WorkflowCompleted { run_id, result: published } => {
                assert_eq!(run_id, result.run_id);
                assert_eq!(published.status, RunStatus::Succeeded);
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }
}
