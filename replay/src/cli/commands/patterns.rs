//! Pattern store maintenance

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Args, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

use replay_core::store::{PatternExport, PatternQuery};
use replay_core::{ActionKind, MergeStrategy, Pattern, PatternId};

use crate::cli::context::{ReplayContext, read_json};

#[derive(Debug, Args)]
pub struct PatternsCommand {
    #[command(subcommand)]
    pub subcommand: PatternsSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum PatternsSubcommand {
    /// List stored patterns
    List {
        /// Only patterns learned on this hostname
        #[arg(long)]
        host: Option<String>,

        /// Only patterns of this action kind
        #[arg(long)]
        kind: Option<ActionKind>,

        /// Only patterns whose learned path starts with this prefix
        #[arg(long)]
        path_prefix: Option<String>,

        /// Only patterns at or above this confidence
        #[arg(long)]
        min_confidence: Option<f64>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one pattern in full
    Show { id: PatternId },

    /// Delete a pattern
    Delete { id: PatternId },

    /// Show earlier versions of a pattern, or restore one
    History {
        id: PatternId,

        /// Version to restore
        #[arg(long)]
        restore: Option<u32>,
    },

    /// Export patterns to a JSON file (stdout when no output is given)
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Export a single pattern as an expiring share
        #[arg(long)]
        share: Option<PatternId>,

        /// Lifetime of a share in hours
        #[arg(long, default_value = "24")]
        ttl_hours: i64,
    },

    /// Import patterns from an export file
    Import {
        file: PathBuf,

        /// How to resolve ids that already exist
        #[arg(long, value_enum, default_value_t = MergeArg::KeepExisting)]
        strategy: MergeArg,
    },

    /// Remove imported shares whose lifetime has passed
    Purge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MergeArg {
    KeepExisting,
    Replace,
    KeepNewest,
    Merge,
}

impl From<MergeArg> for MergeStrategy {
    fn from(arg: MergeArg) -> Self {
        match arg {
            MergeArg::KeepExisting => MergeStrategy::KeepExisting,
            MergeArg::Replace => MergeStrategy::Replace,
            MergeArg::KeepNewest => MergeStrategy::KeepNewest,
            MergeArg::Merge => MergeStrategy::Merge,
        }
    }
}

pub async fn handle_patterns_command(command: PatternsCommand, config: Option<&Path>) -> Result<()> {
    let ctx = ReplayContext::open(config).await?;

    match command.subcommand {
        PatternsSubcommand::List { host, kind, path_prefix, min_confidence, json } => {
            let query = PatternQuery { hostname: host, kind, path_prefix, min_confidence };
            let patterns = ctx.store.query(&query);
            if json {
                println!("{}", serde_json::to_string_pretty(&patterns)?);
            } else {
                print_table(&patterns);
            }
        }
        PatternsSubcommand::Show { id } => {
            let pattern = ctx.store.get(id).with_context(|| format!("Pattern {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&pattern)?);
            let now = Utc::now();
            println!();
            println!("Reliability:      {}", pattern.reliability(now));
            println!("Stale:            {}", pattern.is_stale(now));
            let causes = pattern.retraining_causes(now);
            if !causes.is_empty() {
                println!("Retraining due:   {causes:?}");
            }
        }
        PatternsSubcommand::Delete { id } => {
            let pattern = ctx.store.delete(id).await?;
            println!("Deleted pattern {} ({})", pattern.id, pattern.name);
        }
        PatternsSubcommand::History { id, restore: Some(version) } => {
            let pattern = ctx.store.restore_version(id, version).await?;
            println!("Restored {} from version {}; now at version {}", id, version, pattern.version());
        }
        PatternsSubcommand::History { id, restore: None } => {
            let current = ctx.store.get(id).with_context(|| format!("Pattern {id} not found"))?;
            let history = ctx.store.history(id);
            println!("Pattern {} is at version {}", id, current.version());
            if history.is_empty() {
                println!("No earlier versions recorded in this session");
            }
            for snapshot in history.iter().rev() {
                println!(
                    "  v{:<4} updated {}  confidence {:.2}  used {}",
                    snapshot.version(),
                    snapshot.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    snapshot.confidence(),
                    snapshot.usage_count()
                );
            }
        }
        PatternsSubcommand::Export { output, share, ttl_hours } => {
            let export = match share {
                Some(id) => ctx.store.share(id, Duration::hours(ttl_hours))?,
                None => ctx.store.export(),
            };
            let json = serde_json::to_string_pretty(&export)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("Exported {} patterns to {}", export.patterns.len(), path.display());
                    println!("Exported {} patterns to {}", export.patterns.len(), path.display());
                }
                None => println!("{json}"),
            }
        }
        PatternsSubcommand::Import { file, strategy } => {
            let export: PatternExport = read_json(&file)?;
            let summary = ctx.store.import(export, strategy.into()).await?;
            println!(
                "Imported from {}: {} added, {} replaced, {} merged, {} skipped",
                file.display(),
                summary.added,
                summary.replaced,
                summary.merged,
                summary.skipped
            );
        }
        PatternsSubcommand::Purge => {
            let removed = ctx.store.purge_expired(Utc::now()).await?;
            println!("Removed {} expired shares", removed.len());
        }
    }

    Ok(())
}

fn print_table(patterns: &[Pattern]) {
    if patterns.is_empty() {
        println!("No patterns stored");
        return;
    }

    let now = Utc::now();
    println!(
        "{:<36}  {:<14} {:<28} {:>6} {:>6} {:>6}  {}",
        "ID", "KIND", "ORIGIN", "CONF", "USES", "OK", "RELIABILITY"
    );
    for pattern in patterns {
        let origin = format!("{}{}", pattern.origin.hostname, pattern.origin.path);
        println!(
            "{:<36}  {:<14} {:<28} {:>6.2} {:>6} {:>6}  {}",
            pattern.id,
            pattern.request_kind.to_string(),
            origin,
            pattern.confidence(),
            pattern.usage_count(),
            pattern.success_count(),
            pattern.reliability(now)
        );
    }
}
