//! gridrm.toml configuration parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capacity::CapacityLimit;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RmConfig {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub node_sources: Vec<NodeSourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Ceiling on schedulable nodes; absent or -1 means unlimited.
    pub maximum_number_of_nodes: Option<i64>,
    /// Re-apply locks from the previous run.
    pub nodes_lock_restoration: bool,
    /// e.g. "30s", "500ms", "2m".
    pub node_acquisition_timeout: String,
    pub command_queue_capacity: usize,
    pub event_queue_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            maximum_number_of_nodes: None,
            nodes_lock_restoration: false,
            node_acquisition_timeout: "30s".to_string(),
            command_queue_capacity: 1024,
            event_queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// redb file; in-memory when absent.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSourceConfig {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl CoreConfig {
    pub fn capacity_limit(&self) -> Result<CapacityLimit, ConfigError> {
        CapacityLimit::from_config(self.maximum_number_of_nodes).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "maximum_number_of_nodes must be -1 or non-negative, got {:?}",
                self.maximum_number_of_nodes
            ))
        })
    }

    pub fn acquisition_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.node_acquisition_timeout).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "node_acquisition_timeout is not a duration: {:?}",
                self.node_acquisition_timeout
            ))
        })
    }
}

impl RmConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RmConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.core.capacity_limit()?;
        self.core.acquisition_timeout()?;
        if self.core.command_queue_capacity == 0 || self.core.event_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue capacities must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.node_sources {
            if source.name.is_empty() {
                return Err(ConfigError::Invalid("node source without a name".to_string()));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate node source {:?}",
                    source.name
                )));
            }
        }
        Ok(())
    }
}

/// Parse "500ms", "30s" or "2m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = RmConfig::from_toml_str("").unwrap();
        assert_eq!(config.core.capacity_limit().unwrap(), CapacityLimit::Unlimited);
        assert!(!config.core.nodes_lock_restoration);
        assert_eq!(config.core.acquisition_timeout().unwrap(), Duration::from_secs(30));
        assert!(config.state.path.is_none());
        assert!(config.node_sources.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let toml_str = r#"
[core]
maximum_number_of_nodes = 4
nodes_lock_restoration = true
node_acquisition_timeout = "500ms"

[state]
path = "/var/lib/gridrm/gridrm.redb"

[[node_sources]]
name = "static"
nodes = ["pnp://host-a:1099/n1", "pnp://host-b:1099/n2"]

[[node_sources]]
name = "spare"
"#;
        let config = RmConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.core.capacity_limit().unwrap(), CapacityLimit::AtMost(4));
        assert!(config.core.nodes_lock_restoration);
        assert_eq!(config.core.acquisition_timeout().unwrap(), Duration::from_millis(500));
        assert_eq!(config.core.command_queue_capacity, 1024);
        assert_eq!(config.node_sources.len(), 2);
        assert_eq!(config.node_sources[0].nodes.len(), 2);
        assert!(config.node_sources[1].nodes.is_empty());
    }

    #[test]
    fn minus_one_means_unlimited() {
        let config = RmConfig::from_toml_str("[core]\nmaximum_number_of_nodes = -1\n").unwrap();
        assert_eq!(config.core.capacity_limit().unwrap(), CapacityLimit::Unlimited);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(RmConfig::from_toml_str("[core]\nmaximum_number_of_nodes = -5\n").is_err());
        assert!(RmConfig::from_toml_str("[core]\nnode_acquisition_timeout = \"soon\"\n").is_err());
        assert!(RmConfig::from_toml_str("[core]\nevent_queue_capacity = 0\n").is_err());

        let duplicate = r#"
[[node_sources]]
name = "static"
[[node_sources]]
name = "static"
"#;
        assert!(matches!(
            RmConfig::from_toml_str(duplicate),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn renders_back_to_toml() {
        let mut config = RmConfig::default();
        config.core.maximum_number_of_nodes = Some(8);
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("maximum_number_of_nodes = 8"));
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("invalid"), None);
    }

    #[test]
    fn parse_duration_rejects_overflowing_minutes() {
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);
        assert_eq!(
            parse_duration(&format!("{}m", u64::MAX / 60)),
            Some(Duration::from_secs(u64::MAX / 60 * 60))
        );
    }
}
