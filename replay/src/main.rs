use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
use cli::{Cli, Commands, commands};

fn main() -> Result<()> {
    // Parse CLI arguments first to get verbosity level
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = cli.config.as_deref();

    match cli.command {
        Commands::Patterns(command) => {
            info!("Patterns command: {:?}", command);
            tokio::runtime::Runtime::new()?.block_on(commands::patterns::handle_patterns_command(command, config))?;
        }
        Commands::Learn(args) => {
            info!("Learn command: {:?}", args);
            tokio::runtime::Runtime::new()?.block_on(commands::requests::learn(args, config))?;
        }
        Commands::Match(args) => {
            info!("Match command: {:?}", args);
            tokio::runtime::Runtime::new()?.block_on(commands::requests::show_matches(args, config))?;
        }
        Commands::Run(args) => {
            info!("Run command: {:?}", args);
            tokio::runtime::Runtime::new()?.block_on(commands::requests::run(args, config))?;
        }
        Commands::Audit(args) => {
            info!("Audit command: {:?}", args);
            tokio::runtime::Runtime::new()?.block_on(commands::audit::execute(args, config))?;
        }
        Commands::Workflow(command) => {
            info!("Workflow command: {:?}", command);
            tokio::runtime::Runtime::new()?.block_on(commands::workflow::handle_workflow_command(command, config))?;
        }
        Commands::Config(command) => {
            commands::config::execute(command, config)?;
        }
    }

    Ok(())
}
