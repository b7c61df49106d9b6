use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Connection string for the control connection (schema loading, provisioning).
    pub setup_conn_str: String,
    /// Connection string for the replication connection.
    pub repl_conn_str: String,
    pub repl_slot: String,
    #[serde(default)]
    pub create_slot: bool,
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            file: None,
            save_interval_secs: default_save_interval_secs(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_CAPTURE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.source.validate()
    }
}

impl SourceConfig {
    pub fn new(
        setup_conn_str: impl Into<String>,
        repl_conn_str: impl Into<String>,
        repl_slot: impl Into<String>,
    ) -> Self {
        Self {
            setup_conn_str: setup_conn_str.into(),
            repl_conn_str: repl_conn_str.into(),
            repl_slot: repl_slot.into(),
            create_slot: false,
            report_interval_secs: default_report_interval_secs(),
            channel_capacity: default_channel_capacity(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.setup_conn_str.trim().is_empty() {
            return Err(Error::Config("setup_conn_str must not be empty".to_string()));
        }
        if self.repl_conn_str.trim().is_empty() {
            return Err(Error::Config("repl_conn_str must not be empty".to_string()));
        }
        validate_slot_name(&self.repl_slot)?;
        if self.report_interval_secs == 0 {
            return Err(Error::Config("report_interval_secs must be positive".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be positive".to_string()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::Config("connect_timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Slot names are spliced into replication commands, so only the characters
/// the server itself accepts for slot names are allowed.
fn validate_slot_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(Error::Config(format!(
            "replication slot name must be 1-63 bytes: {:?}",
            name
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(Error::Config(format!(
            "replication slot name may only contain lower case letters, numbers and underscores: {:?}",
            name
        )));
    }
    Ok(())
}

fn default_report_interval_secs() -> u64 {
    5
}

fn default_channel_capacity() -> usize {
    100
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_save_interval_secs() -> u64 {
    10
}
