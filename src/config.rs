use enumset::EnumSet;
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::PathBuf,
    time::Duration,
};

use crate::{error::ContactError, properties::ContactType};

/// Loader cache tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Idle ticks an entry stays strongly held before it is demoted to a weak handle.
    pub ttl_ticks: u32,
    pub tick_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            ttl_ticks: 2,
            tick_interval_secs: 120,
        }
    }
}

impl CacheSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Directory watcher tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    /// Delay before re-reading a file that vanished mid-update.
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    /// Immediate re-reads after a transient I/O failure.
    pub io_retries: u32,
    /// Queued raw events processed during teardown.
    pub drain_limit: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        WatchSettings {
            retry_delay_ms: 2000,
            max_retries: 5,
            io_retries: 5,
            drain_limit: 1024,
        }
    }
}

impl WatchSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactsConfig {
    pub root_dir: PathBuf,
    pub use_subfolders: bool,
    pub types: EnumSet<ContactType>,
    pub cache: CacheSettings,
    pub watch: WatchSettings,
}

impl Default for ContactsConfig {
    fn default() -> Self {
        ContactsConfig {
            root_dir: PathBuf::from("."),
            use_subfolders: true,
            types: EnumSet::all(),
            cache: CacheSettings::default(),
            watch: WatchSettings::default(),
        }
    }
}

impl ContactsConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        ContactsConfig {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }
}

pub trait ConfigProvider: Send + Sync {
    fn get_config(&self) -> Result<ContactsConfig, ContactError>;
    fn set_config(&self, config: &ContactsConfig) -> Result<(), ContactError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn get_config(&self) -> Result<ContactsConfig, ContactError> {
        tracing::debug!("Attempting to read contacts config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(ContactsConfig::default());
        }
        let content = read_to_string(&self.path)?;
        Ok(toml::from_str(&content)?)
    }

    fn set_config(&self, config: &ContactsConfig) -> Result<(), ContactError> {
        tracing::debug!("Attempting to write contacts config to: {:?}", &self.path);
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}
