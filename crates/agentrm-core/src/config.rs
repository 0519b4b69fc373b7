//! agentrm.toml configuration parser.
//!
//! Every section and field is optional; a missing file section falls back
//! to the defaults below.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Resource pool agents land in when they report none.
pub const DEFAULT_RESOURCE_POOL: &str = "default";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RmConfig {
    pub agents: AgentsConfig,
    pub processor: ProcessorConfig,
    pub bus: BusConfig,
    pub state: StateConfig,
}

/// Per-agent capacity defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Zero-slot containers an enabled agent accepts.
    pub max_zero_slot_containers: usize,
    pub default_resource_pool: String,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_zero_slot_containers: 100,
            default_resource_pool: DEFAULT_RESOURCE_POOL.to_string(),
        }
    }
}

/// Per-agent processor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Bound of each agent's inbound command queue.
    pub queue_depth: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self { queue_depth: 64 }
    }
}

/// Allocation-event bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Events buffered per subscriber before the slowest one lags.
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Snapshot store location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/agentrm/agentrm.redb"),
        }
    }
}

impl RmConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: RmConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RmConfig::from_toml_str("").unwrap();
        assert_eq!(config, RmConfig::default());
        assert_eq!(config.agents.max_zero_slot_containers, 100);
        assert_eq!(config.agents.default_resource_pool, "default");
        assert_eq!(config.processor.queue_depth, 64);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let toml_str = r#"
[agents]
max_zero_slot_containers = 8

[state]
path = "/tmp/rm.redb"
"#;
        let config = RmConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.agents.max_zero_slot_containers, 8);
        assert_eq!(config.agents.default_resource_pool, "default");
        assert_eq!(config.state.path, PathBuf::from("/tmp/rm.redb"));
        assert_eq!(config.bus.capacity, 256);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = RmConfig::default();
        config.bus.capacity = 16;
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(RmConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn unknown_types_are_rejected() {
        let result = RmConfig::from_toml_str("[processor]\nqueue_depth = \"deep\"\n");
        assert!(result.is_err());
    }
}
