//! Project configuration file support.
//!
//! Loads configuration from `draftgate.toml` in the working directory.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Project-level configuration loaded from `draftgate.toml`
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Quality target a step's score must reach (0-100)
    pub target_score: Option<f64>,
    /// Retry budget per step
    pub max_iterations: Option<usize>,
    /// Database path override
    pub db_path: Option<PathBuf>,
    /// Executor-side configuration
    #[serde(default)]
    pub executor: CommandConfig,
    /// Validator-side configuration
    #[serde(default)]
    pub validator: CommandConfig,
}

/// Configuration for one external command
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub command: Option<String>,
}

/// The config file name
pub const CONFIG_FILE_NAME: &str = "draftgate.toml";

impl ProjectConfig {
    /// Load configuration from the working directory.
    ///
    /// Returns:
    /// - `Ok(Some(config))` if file exists and parses successfully
    /// - `Ok(None)` if file does not exist
    /// - `Err(...)` if file exists but fails to parse (hard error)
    pub fn load(working_dir: &Path) -> Result<Option<Self>> {
        let config_path = working_dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: ProjectConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        Ok(Some(config))
    }
}
