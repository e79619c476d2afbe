use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::commands::audit::AuditArgs;
use super::commands::config::ConfigCommand;
use super::commands::patterns::PatternsCommand;
use super::commands::requests::{LearnArgs, MatchArgs, RunArgs};
use super::commands::workflow::WorkflowCommand;

#[derive(Parser, Debug)]
#[command(
    name = "replay",
    version,
    about = "Replay - learn browser actions once, replay them on request",
    long_about = "Replay stores demonstrated page actions as patterns, matches incoming automation requests against them, tracks their reliability, and chains them into workflows."
)]
pub struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect and maintain stored patterns
    #[command(about = "List, show, delete, export and import stored patterns")]
    Patterns(PatternsCommand),

    /// Create a pattern from a demonstration
    #[command(about = "Learn a new pattern from a demonstration JSON file")]
    Learn(LearnArgs),

    /// Rank stored patterns against a request
    #[command(name = "match", about = "Print ranked candidate patterns for a request JSON file")]
    Match(MatchArgs),

    /// Dispatch a request
    #[command(about = "Dispatch a request through matching and execution (dry run)")]
    Run(RunArgs),

    /// Audit pattern health
    #[command(about = "Audit pattern health, apply auto-fixes, and clean up failing patterns")]
    Audit(AuditArgs),

    /// Run workflow definitions
    #[command(about = "Validate and run multi-phase workflows")]
    Workflow(WorkflowCommand),

    /// Show or write configuration
    #[command(about = "Show the effective configuration or write a default file")]
    Config(ConfigCommand),
}
