use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::{OrchestratorSettings, MAX_RETRIES};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Owner whose cache entries and queued writes this process manages
  #[serde(default = "default_owner_id")]
  pub owner_id: String,
  /// SQLite database (defaults to the platform data directory)
  pub database_path: Option<PathBuf>,
  /// Remote backend; sync commands are unavailable without one
  pub remote: Option<RemoteConfig>,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub url: String,
  /// Path of the REST API below `url`
  #[serde(default = "default_rest_path")]
  pub rest_path: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
  /// Attempts per entry before it is parked as failed
  pub max_retries: u32,
  pub settle_delay_ms: u64,
  pub refresh_interval_ms: u64,
  pub drain_interval_ms: u64,
  pub probe_interval_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: MAX_RETRIES,
      settle_delay_ms: 2_000,
      refresh_interval_ms: 5_000,
      drain_interval_ms: 30_000,
      probe_interval_ms: 10_000,
    }
  }
}

impl SyncConfig {
  pub fn orchestrator_settings(&self) -> OrchestratorSettings {
    OrchestratorSettings {
      settle_delay: Duration::from_millis(self.settle_delay_ms),
      refresh_interval: Duration::from_millis(self.refresh_interval_ms.max(1)),
      drain_interval: Duration::from_millis(self.drain_interval_ms.max(1)),
    }
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_millis(self.probe_interval_ms.max(1))
  }
}

fn default_owner_id() -> String {
  "default".to_string()
}

fn default_rest_path() -> String {
  "rest/v1".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

impl Default for Config {
  fn default() -> Self {
    Self {
      owner_id: default_owner_id(),
      database_path: None,
      remote: None,
      sync: SyncConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./outbox.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/outbox/config.yaml
  ///
  /// Without an explicit path, a missing file yields the defaults.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        tracing::debug!("no configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("outbox.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("outbox").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Remote settings, or an error for commands that cannot run without a backend.
  pub fn require_remote(&self) -> Result<&RemoteConfig> {
    self
      .remote
      .as_ref()
      .ok_or_else(|| eyre!("No remote configured. Add a `remote` section with a `url`."))
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks OUTBOX_API_KEY first, then SUPABASE_KEY as fallback.
  pub fn get_api_key() -> Option<String> {
    std::env::var("OUTBOX_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_KEY"))
      .ok()
  }
}
