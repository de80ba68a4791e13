//! Configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// What `init` does when a component finds no persisted snapshot under
/// its storage key.
///
/// `InitEmpty` seeds and persists the empty/inactive default, which is
/// what a first run wants. `Fail` surfaces the typed load error, for
/// deployments that provision state out of band and want a missing blob
/// to be loud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingStatePolicy {
    Fail,
    #[default]
    InitEmpty,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub behavior: BehaviorSettings,

    /// Remote authorization backend; unset disables `unblock --auth`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSettings>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where component state blobs live.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageSettings {
    /// Data directory; platform default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BehaviorSettings {
    #[serde(default)]
    pub on_missing_state: MissingStatePolicy,

    /// Hours applied by `unblock` when no duration is given. Negative
    /// means forever.
    #[serde(default = "default_unblock_hours")]
    pub default_unblock_hours: f64,
}

/// Remote authorization backend settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthSettings {
    /// Base URL of the authorization backend (HTTPS).
    pub endpoint: String,

    /// How long to wait for a remote decision (seconds).
    #[serde(default = "default_wait_budget")]
    pub wait_budget_secs: u64,

    /// Decision poll cadence (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Random extra delay per poll to spread clients out (seconds).
    #[serde(default = "default_poll_jitter")]
    pub poll_jitter: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

// Default values
fn default_unblock_hours() -> f64 {
    1.0
}

fn default_wait_budget() -> u64 {
    600 // 10 minutes
}

fn default_poll_interval() -> u64 {
    3
}

fn default_poll_jitter() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BehaviorSettings {
    fn default() -> Self {
        Self {
            on_missing_state: MissingStatePolicy::default(),
            default_unblock_hours: default_unblock_hours(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if let Some(auth) = &self.auth {
            let parsed =
                url::Url::parse(&auth.endpoint).context("Invalid authorization endpoint URL")?;
            if parsed.scheme() != "https" {
                anyhow::bail!(
                    "Authorization endpoint must use HTTPS (got: {})",
                    parsed.scheme()
                );
            }
            if auth.wait_budget_secs == 0 {
                anyhow::bail!("auth.wait_budget_secs must be positive");
            }
            if auth.poll_interval == 0 {
                anyhow::bail!("auth.poll_interval must be positive");
            }
        }
        Ok(())
    }
}

/// Platform config file path.
pub fn get_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "sitegate")
        .context("Could not determine config directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}
