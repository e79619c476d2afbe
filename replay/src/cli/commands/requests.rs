//! Learning, matching and dispatching single requests

use anyhow::{Result, bail};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use replay_core::pattern::{ActionError, LocatorHint, PatternDefinition};
use replay_core::{AutomationRequest, AutomationResult, AutomationService, ExecutionReport};

use crate::cli::console::ConsoleConfirmation;
use crate::cli::context::{ReplayContext, read_json};

#[derive(Parser, Debug)]
pub struct LearnArgs {
    /// Demonstration JSON: the request plus the locator the human pointed at
    #[arg(help = "Path to a demonstration JSON file")]
    pub file: PathBuf,
}

#[derive(Parser, Debug)]
pub struct MatchArgs {
    /// Request JSON in the wire format
    #[arg(help = "Path to an automation request JSON file")]
    pub file: PathBuf,

    /// Show at most this many candidates
    #[arg(long, default_value = "10")]
    pub limit: usize,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Request JSON in the wire format
    #[arg(help = "Path to an automation request JSON file")]
    pub file: PathBuf,

    /// Prompt for a selector when no pattern qualifies
    #[arg(long)]
    pub interactive: bool,
}

/// A confirmed demonstration as recorded by the training UI
#[derive(Debug, Deserialize)]
struct Demonstration {
    #[serde(default)]
    name: Option<String>,
    request: AutomationRequest,
    locator: LocatorHint,
}

pub async fn learn(args: LearnArgs, config: Option<&Path>) -> Result<()> {
    let ctx = ReplayContext::open(config).await?;
    let demonstration: Demonstration = read_json(&args.file)?;

    // The selector comes from the locator, so only other missing fields are fatal
    match demonstration.request.action() {
        Ok(_) | Err(ActionError::MissingField { field: "selector", .. }) => {}
        Err(e) => bail!("Demonstration request is not a valid action: {e}"),
    }

    let mut definition = PatternDefinition::from_request(&demonstration.request, demonstration.locator);
    definition.name = demonstration.name;

    let pattern = ctx.store.create(definition).await?;
    info!("Learned pattern {} from {}", pattern.id, args.file.display());
    println!("Learned pattern {} ({})", pattern.id, pattern.name);
    Ok(())
}

pub async fn show_matches(args: MatchArgs, config: Option<&Path>) -> Result<()> {
    let ctx = ReplayContext::open(config).await?;
    let request: AutomationRequest = read_json(&args.file)?;
    let service = AutomationService::new(Arc::clone(&ctx.lifecycle));

    let candidates = service.candidates(&request);
    if candidates.is_empty() {
        println!("No stored pattern is valid on {}{}", request.context.hostname, request.context.pathname);
        return Ok(());
    }

    println!(
        "{:<36}  {:>7} {:>7} {:>7} {:>7}  {}",
        "ID", "SCORE", "PAYLOAD", "CONTEXT", "CONF", "GOOD"
    );
    for candidate in candidates.iter().take(args.limit) {
        println!(
            "{:<36}  {:>7.3} {:>7.3} {:>7.3} {:>7.2}  {}",
            candidate.pattern.id,
            candidate.criteria.overall_score,
            candidate.criteria.payload_similarity,
            candidate.criteria.context_compatibility,
            candidate.pattern.confidence(),
            if candidate.good { "yes" } else { "no" }
        );
    }
    Ok(())
}

pub async fn run(args: RunArgs, config: Option<&Path>) -> Result<()> {
    let ctx = ReplayContext::open(config).await?;
    let request: AutomationRequest = read_json(&args.file)?;

    let mut service = AutomationService::new(Arc::clone(&ctx.lifecycle));
    if args.interactive {
        service = service.with_confirmation(Arc::new(ConsoleConfirmation));
    }

    let result = service.handle(&request).await?;
    match &result {
        AutomationResult::Replayed { criteria, report } => {
            println!("Replayed pattern {} (score {:.2})", report.pattern_id(), criteria.overall_score);
            print_report(report);
        }
        AutomationResult::Learned { pattern_id, report } => {
            println!("Learned and executed pattern {pattern_id}");
            print_report(report);
        }
        AutomationResult::Invalid { message } => println!("Invalid request: {message}"),
        AutomationResult::NoMatch { candidates } => {
            println!("No pattern qualified ({candidates} candidates considered)")
        }
        AutomationResult::Cancelled => println!("Cancelled"),
    }
    Ok(())
}

fn print_report(report: &ExecutionReport) {
    match report {
        ExecutionReport::Succeeded { outcome, confidence, .. } => {
            println!("  {:?} in {}ms", outcome.action, outcome.duration_ms);
            if let Some(locator) = &outcome.locator {
                println!("  used fallback locator {locator}");
            }
            println!("  confidence now {confidence:.2}");
        }
        ExecutionReport::Failed { reason, message, confidence, .. } => {
            println!("  failed ({reason}): {message}");
            println!("  confidence now {confidence:.2}");
        }
    }
}
