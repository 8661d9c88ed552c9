use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::collectors::RawConfig;
use crate::error::ConfigError;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSettings {
    /// Default collection interval for every input
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Default per-cycle timeout; the interval when unset
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_interval")]
    pub flush_interval_secs: u64,
    /// Value of the `host` tag; the local hostname when unset
    pub hostname: Option<String>,
    #[serde(default)]
    pub omit_hostname: bool,
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_interval() -> u64 {
    10
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            timeout_secs: None,
            flush_interval_secs: default_interval(),
            hostname: None,
            omit_hostname: false,
            database: None,
            tags: BTreeMap::new(),
        }
    }
}

impl AgentSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// One `[[inputs]]` table. Keys that are not recognized here are handed to
/// the collector as options.
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    pub interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub name_override: Option<String>,
    pub name_prefix: Option<String>,
    pub name_suffix: Option<String>,
    pub precision_secs: Option<u64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(flatten)]
    pub options: RawConfig,
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.interval_secs == 0 {
            return Err(ConfigError::Invalid("agent.interval_secs must be positive".to_string()));
        }
        if self.agent.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "agent.flush_interval_secs must be positive".to_string(),
            ));
        }
        if self.agent.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid("agent.timeout_secs must be positive".to_string()));
        }

        for (i, input) in self.inputs.iter().enumerate() {
            if input.type_name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("inputs[{i}]: type must not be empty")));
            }
            if input.interval_secs == Some(0) || input.timeout_secs == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "inputs[{i}] ({}): interval and timeout must be positive",
                    input.type_name
                )));
            }
            if input.name_override.as_deref().is_some_and(|n| n.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "inputs[{i}] ({}): name_override must not be empty",
                    input.type_name
                )));
            }
        }
        Ok(())
    }

    /// Database path, defaulting to `~/.gatherer/gatherer.db`.
    pub fn database_path(&self) -> PathBuf {
        self.agent.database.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".gatherer")
                .join("gatherer.db")
        })
    }
}
