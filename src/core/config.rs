//! Configuration
//!
//! TOML configuration of the recorder. Every field is optional; missing values fall back to
//! the defaults below. The bearer token and user id may also come from the environment.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use super::constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_DEBUG_TRAIL_LEN, DEFAULT_TELEMETRY_INTERVAL_SECS,
    DEFAULT_UPLOAD_TIMEOUT_SECS,
};
use crate::model::tag::{SessionTag, TagCatalog, TagRulesOverride};

pub const TOKEN_ENV: &str = "HRV_RECORDER_TOKEN";
pub const USER_ID_ENV: &str = "HRV_RECORDER_USER_ID";

/// Ingestion service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the ingestion service, without the upload path.
    pub base_url: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Bearer credential issued by the auth collaborator.
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout_secs: DEFAULT_UPLOAD_TIMEOUT_SECS,
            token: None,
        }
    }
}

/// Sensor connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub connect_timeout_secs: u64,
    pub telemetry_interval_secs: u64,
    /// Connect only to devices whose name contains this string.
    pub name_filter: Option<String>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            telemetry_interval_secs: DEFAULT_TELEMETRY_INTERVAL_SECS,
            name_filter: None,
        }
    }
}

/// Top level configuration file structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Opaque user identifier attached to every session.
    pub user_id: String,
    /// Location of the persisted upload queue.
    pub queue_path: PathBuf,
    /// Number of entries kept in the debug trail.
    pub debug_trail_len: usize,
    /// Deliver queued sessions as soon as they are enqueued.
    pub auto_upload: bool,
    pub api: ApiConfig,
    pub sensor: SensorConfig,
    /// Per-tag duration overrides keyed by tag name.
    pub tags: BTreeMap<String, TagRulesOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            queue_path: PathBuf::from("upload_queue.json"),
            debug_trail_len: DEFAULT_DEBUG_TRAIL_LEN,
            auto_upload: true,
            api: ApiConfig::default(),
            sensor: SensorConfig::default(),
            tags: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Lets the environment override the credential and user id.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                self.api.token = Some(token);
            }
        }
        if let Ok(user_id) = std::env::var(USER_ID_ENV) {
            if !user_id.is_empty() {
                self.user_id = user_id;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.timeout_secs == 0 {
            return Err(anyhow!("api.timeout_secs must be greater than zero"));
        }
        if self.sensor.connect_timeout_secs == 0 {
            return Err(anyhow!("sensor.connect_timeout_secs must be greater than zero"));
        }
        if self.debug_trail_len == 0 {
            return Err(anyhow!("debug_trail_len must be greater than zero"));
        }
        self.catalog()?;
        Ok(())
    }

    /// Effective tag rules with the configured overrides applied.
    pub fn catalog(&self) -> Result<TagCatalog> {
        let mut overrides = BTreeMap::new();
        for (name, o) in &self.tags {
            let tag: SessionTag = name.parse()?;
            overrides.insert(tag, *o);
        }
        TagCatalog::with_overrides(&overrides)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.sensor.connect_timeout_secs)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.sensor.telemetry_interval_secs.max(1))
    }
}
