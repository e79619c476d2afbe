//! Terminal prompts standing in for the training and intervention UIs

use async_trait::async_trait;
use std::io::Write;
use tracing::warn;

use replay_core::adapters::{
    Confirmation, ConfirmationAdapter, InterventionAdapter, InterventionDecision, InterventionRequest,
};
use replay_core::matching::ScoredMatch;
use replay_core::pattern::{LocatorHint, PatternDefinition};
use replay_core::AutomationRequest;

async fn prompt(question: String) -> Option<String> {
    let answer = tokio::task::spawn_blocking(move || {
        print!("{question}");
        std::io::stdout().flush().ok()?;
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    })
    .await;

    match answer {
        Ok(answer) => answer,
        Err(e) => {
            warn!("Prompt failed: {}", e);
            None
        }
    }
}

/// Asks for the selector of the element a human would have clicked
pub struct ConsoleConfirmation;

#[async_trait]
impl ConfirmationAdapter for ConsoleConfirmation {
    async fn confirm(&self, request: &AutomationRequest, candidates: &[ScoredMatch]) -> Confirmation {
        println!(
            "No pattern qualified for {} on {}{} ({} candidates).",
            request.request_kind,
            request.context.hostname,
            request.context.pathname,
            candidates.len()
        );

        match prompt("Selector to learn (empty to cancel): ".to_string()).await {
            Some(selector) if !selector.is_empty() => {
                Confirmation::Confirmed(PatternDefinition::from_request(request, LocatorHint::new(selector)))
            }
            _ => Confirmation::Cancelled,
        }
    }
}

/// Asks whether a failed workflow phase should resume, be skipped, or abort the run
pub struct ConsoleIntervention;

#[async_trait]
impl InterventionAdapter for ConsoleIntervention {
    async fn intervene(&self, request: &InterventionRequest) -> InterventionDecision {
        println!("Phase {} needs attention ({}): {}", request.phase_id, request.reason, request.message);

        loop {
            let Some(answer) = prompt("[r]esume, [s]kip or [a]bort? ".to_string()).await else {
                return InterventionDecision::Abort;
            };
            match answer.to_lowercase().as_str() {
                "r" | "resume" => return InterventionDecision::Resume,
                "s" | "skip" => return InterventionDecision::Skip,
                "a" | "abort" => return InterventionDecision::Abort,
                _ => println!("Please answer r, s or a."),
            }
        }
    }
}
