//! Workflow validation and execution

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use replay_core::pattern::RequestContext;
use replay_core::workflow::{AbortHandle, PhaseStatus, WorkflowResult};
use replay_core::{WorkflowDefinition, WorkflowEngine};

use crate::cli::console::ConsoleIntervention;
use crate::cli::context::ReplayContext;

#[derive(Debug, Args)]
pub struct WorkflowCommand {
    #[command(subcommand)]
    pub subcommand: WorkflowSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum WorkflowSubcommand {
    /// Check a definition without running it
    Validate {
        /// Workflow definition (.json or .toml)
        file: PathBuf,
    },

    /// Run a workflow against the dry-run capability
    Run {
        /// Workflow definition (.json or .toml)
        file: PathBuf,

        /// Hostname of the page the workflow drives
        #[arg(long)]
        host: String,

        /// Path of the page the workflow drives
        #[arg(long, default_value = "/")]
        path: String,

        /// Ask on the terminal when a phase needs manual intervention
        #[arg(long)]
        interactive: bool,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_workflow_command(command: WorkflowCommand, config: Option<&Path>) -> Result<()> {
    let ctx = ReplayContext::open(config).await?;
    let mut engine = WorkflowEngine::new(Arc::clone(&ctx.lifecycle), ctx.config.workflow.clone());

    match command.subcommand {
        WorkflowSubcommand::Validate { file } => {
            let definition = load(&file)?;
            let order = engine.validate(&definition)?;
            println!("Workflow {} is valid; phase order: {}", definition.id, order.join(" -> "));
        }
        WorkflowSubcommand::Run { file, host, path, interactive, json } => {
            let definition = load(&file)?;
            if interactive {
                engine = engine.with_intervention(Arc::new(ConsoleIntervention));
            }

            let context = RequestContext {
                url: format!("https://{host}{path}"),
                hostname: host,
                pathname: path,
                title: String::new(),
                timestamp: Utc::now(),
                structural_fingerprint: None,
            };

            let abort = AbortHandle::new();
            let on_interrupt = abort.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, aborting workflow");
                    on_interrupt.abort();
                }
            });

            let result = engine.run_with_abort(&definition, context, &abort).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
        }
    }

    Ok(())
}

fn load(file: &Path) -> Result<WorkflowDefinition> {
    let definition = WorkflowDefinition::from_file(file)
        .with_context(|| format!("Failed to load workflow from {}", file.display()))?;
    info!("Loaded workflow {} with {} phases", definition.id, definition.phases.len());
    Ok(definition)
}

fn print_result(result: &WorkflowResult) {
    println!("Workflow {} run {}: {:?}", result.workflow_id, result.run_id, result.status);

    for record in &result.phases {
        let status = match record.status {
            PhaseStatus::Completed => "done",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Failed => "FAILED",
            PhaseStatus::Pending => "not run",
            PhaseStatus::Evaluating | PhaseStatus::Executing => "interrupted",
        };
        print!("  {:<24} {:<12} attempts {:<3} {:>6}ms", record.phase_id, status, record.attempts, record.duration_ms);
        match (&record.reason, &record.message) {
            (Some(reason), Some(message)) => println!("  {reason}: {message}"),
            (None, Some(message)) => println!("  {message}"),
            _ => println!(),
        }
    }

    for notification in &result.notifications {
        println!("  [{:?}] {}: {}", notification.severity, notification.phase_id, notification.message);
    }

    if let Some(rollback) = &result.rollback {
        match &rollback.checkpoint {
            Some(checkpoint) => println!("Rolled back to checkpoint before {checkpoint}"),
            None => println!("Rolled back the whole run"),
        }
        for phase in &rollback.phases {
            let outcome = if phase.success { "ok" } else { "FAILED" };
            println!("  undo {:<19} {}", phase.phase_id, outcome);
        }
    }
}
