//! Agent configuration
//!
//! Handles:
//! - Kernel control-channel address and node identity (token, name, address)
//! - Local paths (instance data, backups) and container runtime settings
//! - Cross-platform storage (TOML under the OS config dir) with env overrides

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// host:port of the kernel control channel
    pub backend_addr: String,
    pub node_name: String,
    /// Address the node is reachable at; also used to reach local RCON ports
    pub node_address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub node_token: String,
    pub data_path: PathBuf,
    pub report_interval_secs: u64,
    pub reconnect_backoff_secs: u64,
    pub docker_bin: String,
    pub container_prefix: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend_addr: "localhost:9090".to_string(),
            node_name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "hearth-node".to_string()),
            node_address: "127.0.0.1".to_string(),
            node_token: String::new(),
            data_path: PathBuf::from("/opt/hearth/data"),
            report_interval_secs: 10,
            reconnect_backoff_secs: 5,
            docker_bin: "docker".to_string(),
            container_prefix: "hearth-".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load config from `$HEARTH_AGENT_CONFIG` or the OS-specific location,
    /// then apply environment overrides
    pub async fn load() -> Result<Self> {
        let config_path = match std::env::var("HEARTH_AGENT_CONFIG") {
            Ok(path) => PathBuf::from(path),
            Err(_) => Self::config_file_path()?,
        };
        let mut config = Self::load_file(&config_path).await?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub async fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(v) = non_empty("HEARTH_BACKEND_ADDR") {
            self.backend_addr = v;
        }
        if let Some(v) = non_empty("HEARTH_NODE_NAME") {
            self.node_name = v;
        }
        if let Some(v) = non_empty("HEARTH_NODE_ADDR") {
            self.node_address = v;
        }
        if let Some(v) = non_empty("HEARTH_NODE_TOKEN") {
            self.node_token = v;
        }
        if let Some(v) = non_empty("HEARTH_DATA_PATH") {
            self.data_path = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_token.trim().is_empty() {
            bail!("node token is not set (HEARTH_NODE_TOKEN or node_token in config)");
        }
        if self.backend_addr.trim().is_empty() {
            bail!("backend address is empty");
        }
        Ok(())
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("hearth-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_path.join("backups")
    }

    pub fn container_name(&self, instance_id: &str) -> String {
        format!("{}{}", self.container_prefix, instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.backend_addr, "localhost:9090");
        assert_eq!(config.report_interval(), Duration::from_secs(10));
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(config.container_name("abc"), "hearth-abc");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HEARTH_BACKEND_ADDR", "10.0.0.2:9090"),
            ("HEARTH_NODE_TOKEN", "secret-token"),
            ("HEARTH_DATA_PATH", "/srv/hearth"),
            ("HEARTH_NODE_NAME", ""),
        ]
        .into_iter()
        .collect();
        let mut config = AgentConfig::default();
        let default_name = config.node_name.clone();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.backend_addr, "10.0.0.2:9090");
        assert_eq!(config.node_token, "secret-token");
        assert_eq!(config.backups_dir(), PathBuf::from("/srv/hearth/backups"));
        assert_eq!(config.node_name, default_name);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_partial_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "node_token = \"tok\"\ncontainer_prefix = \"vh-\"\n").unwrap();

        let config = AgentConfig::load_file(&path).await.unwrap();
        assert_eq!(config.node_token, "tok");
        assert_eq!(config.container_name("x"), "vh-x");
        assert_eq!(config.docker_bin, "docker");
    }

    #[test]
    fn test_config_file_path() {
        if let Ok(path) = AgentConfig::config_file_path() {
            assert!(path.to_string_lossy().contains("hearth-agent"));
            assert!(path.to_string_lossy().ends_with("config.toml"));
        }
    }
}
