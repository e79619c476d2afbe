//! Wiring shared by every command: configuration, the file-backed store and the lifecycle

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use replay_core::adapters::DryRunCapability;
use replay_core::store::JsonFilePersistence;
use replay_core::{EventBus, LifecycleManager, MatchEngine, PatternStore, ReplayConfig};

/// Looked up in the working directory when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "replay.toml";

pub fn load_config(path: Option<&Path>) -> Result<ReplayConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !default.exists() {
                debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                return Ok(ReplayConfig::default());
            }
            default
        }
    };

    debug!("Loading configuration from {}", path.display());
    ReplayConfig::from_file(&path).with_context(|| format!("Failed to load configuration from {}", path.display()))
}

pub struct ReplayContext {
    pub config: ReplayConfig,
    pub store: Arc<PatternStore>,
    pub lifecycle: Arc<LifecycleManager>,
}

impl ReplayContext {
    pub async fn open(config_path: Option<&Path>) -> Result<Self> {
        let config = load_config(config_path)?;

        let persistence = Arc::new(JsonFilePersistence::new(&config.storage.path));
        let store = PatternStore::open(persistence, EventBus::new())
            .await
            .with_context(|| format!("Failed to open pattern store at {}", config.storage.path.display()))?;
        let store = Arc::new(store);

        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&store),
            MatchEngine::new(config.matching.clone()),
            Arc::new(DryRunCapability),
            config.lifecycle.clone(),
        ));

        Ok(Self { config, store, lifecycle })
    }
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}
