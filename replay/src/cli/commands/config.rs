//! Configuration inspection

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

use replay_core::ReplayConfig;

use crate::cli::context::{DEFAULT_CONFIG_FILE, load_config};

#[derive(Debug, Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration as TOML
    Show,

    /// Write the default configuration
    Init {
        /// Destination file
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn execute(command: ConfigCommand, config: Option<&Path>) -> Result<()> {
    match command.subcommand {
        ConfigSubcommand::Show => {
            let config = load_config(config)?;
            print!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
        }
        ConfigSubcommand::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
            }
            ReplayConfig::default()
                .save(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}
