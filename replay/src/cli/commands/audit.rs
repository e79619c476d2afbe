//! Pattern health auditing

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::path::Path;

use replay_core::health::RuleStatus;
use replay_core::{HealthAuditor, HealthReport, PatternId};

use crate::cli::context::ReplayContext;

#[derive(Parser, Debug)]
pub struct AuditArgs {
    /// Audit a single pattern
    #[arg(long)]
    pub id: Option<PatternId>,

    /// Apply auto-fixable rules before reporting
    #[arg(long)]
    pub fix: bool,

    /// Delete patterns that have been flagged for retraining too many audits in a row
    #[arg(long)]
    pub cleanup: bool,

    /// Print full reports as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: AuditArgs, config: Option<&Path>) -> Result<()> {
    let ctx = ReplayContext::open(config).await?;
    let auditor = HealthAuditor::new(ctx.config.health.clone());

    if args.fix {
        let ids: Vec<PatternId> = match args.id {
            Some(id) => vec![id],
            None => ctx.store.list().iter().map(|p| p.id).collect(),
        };
        for id in ids {
            let fixed = auditor.auto_fix(&ctx.store, id).await?;
            for change in &fixed.changes {
                println!("Fixed {} {}: {} -> {}", id, change.field, change.before, change.after);
            }
        }
    }

    let now = Utc::now();
    match args.id {
        Some(id) => {
            let report = auditor.report(&ctx.store, id, now)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        None => {
            let summary = auditor.audit_store(&ctx.store, now).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for report in &summary.reports {
                    print_report(report);
                    println!();
                }
                println!(
                    "Audited {} patterns, average score {:.1}, {} flagged for retraining",
                    summary.reports.len(),
                    summary.average_score,
                    summary.flagged.len()
                );
            }
        }
    }

    if args.cleanup {
        let removed = auditor.cleanup(&ctx.store).await?;
        for id in &removed {
            println!("Removed pattern {id}");
        }
        println!("Cleanup removed {} patterns", removed.len());
    }

    Ok(())
}

fn print_report(report: &HealthReport) {
    println!(
        "Pattern {} v{}: score {:.1}, reliability {}, risk {:?}",
        report.pattern_id, report.pattern_version, report.overall_score, report.reliability, report.risk.overall
    );

    for finding in report.findings() {
        let marker = match finding.status {
            RuleStatus::Failure => "FAIL",
            RuleStatus::Warning => "WARN",
            RuleStatus::Pass => "ok",
        };
        let fix = if finding.auto_fixable { " (auto-fixable)" } else { "" };
        println!("  [{}] {}: {}{}", marker, finding.rule_id, finding.message, fix);
        if let Some(suggestion) = &finding.suggestion {
            println!("         {suggestion}");
        }
    }

    if !report.retraining.is_empty() {
        println!("  Retraining due: {:?}", report.retraining);
    }
    for recommendation in &report.recommendations {
        println!("  -> {:?}: {}", recommendation.priority, recommendation.action);
    }
}
