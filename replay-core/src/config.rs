//! Configuration for matching, lifecycle, auditing, workflows and storage
//!
//! Every section has defaults, so a partial TOML file only needs to name the
//! values it overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub matching: MatchingConfig,
    pub lifecycle: LifecycleConfig,
    pub health: HealthConfig,
    pub workflow: WorkflowConfig,
    pub storage: StorageConfig,
}

impl ReplayConfig {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;

        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;

        std::fs::write(path, content)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
    }
}

/// Thresholds used by the match engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum overall score for a match to be replayed without a human
    pub good_match_score: f64,
    /// Minimum context compatibility for a match to be replayed
    pub min_context_compatibility: f64,
    /// Minimum path compatibility for a pattern to be considered at all
    pub min_path_compatibility: f64,
    /// Patterns older than this are never valid for a context
    pub max_pattern_age_days: f64,
    /// Success rate a pattern needs to tolerate a changed page fingerprint
    pub fingerprint_drift_success_rate: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            good_match_score: 0.7,
            min_context_compatibility: 0.6,
            min_path_compatibility: 0.5,
            max_pattern_age_days: 30.0,
            fingerprint_drift_success_rate: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub min_request_confidence: f64,
    pub execution_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { min_request_confidence: 0.6, execution_timeout_ms: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive audits flagging a pattern for retraining before cleanup removes it
    pub cleanup_threshold: u32,
    /// How long a cached report is served before it is regenerated
    pub report_ttl_secs: u64,
    /// Longest fallback chain the performance rules accept
    pub max_fallbacks: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { cleanup_threshold: 3, report_ttl_secs: 300, max_fallbacks: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub default_phase_timeout_ms: u64,
    pub max_concurrent_phases: usize,
    /// Upper bound on jump-to transitions in one run
    pub max_jumps: usize,
    /// Roll back completed phases when a run fails, not only when it is aborted
    pub rollback_on_failure: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_phase_timeout_ms: 30_000,
            max_concurrent_phases: 4,
            max_jumps: 16,
            rollback_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: PathBuf::from(".replay/patterns") }
    }
}
