//! System identification for Hearth agents
//!
//! Builds the `register` frame sent first on every control stream:
//! - Pretty OS name (`/etc/os-release`, falling back to sysinfo)
//! - Kernel version and hostname
//! - Container runtime version (probed by the caller)

use crate::config::AgentConfig;
use hearth_protocol::NodeInfo;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, info};

/// System information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os_info: String,
    pub kernel_version: String,
    pub architecture: String,
}

impl SystemInfo {
    /// Discover static system information
    pub async fn discover() -> Self {
        let os_release = tokio::fs::read_to_string("/etc/os-release").await.ok();
        let os_info = os_release
            .as_deref()
            .and_then(pretty_name)
            .or_else(System::long_os_version)
            .unwrap_or_else(|| "Unknown OS".to_string());

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_default();
        let kernel_version = System::kernel_version().unwrap_or_default();
        let architecture = std::env::consts::ARCH.to_string();

        info!("Discovery complete - Hostname: {}, OS: {}, kernel {}", hostname, os_info, kernel_version);

        SystemInfo { hostname, os_info, kernel_version, architecture }
    }

    /// Identity frame for this node
    pub fn node_info(&self, config: &AgentConfig, runtime_version: &str) -> NodeInfo {
        debug!("Building identity for node {}", config.node_name);
        NodeInfo {
            token: config.node_token.clone(),
            name: config.node_name.clone(),
            address: config.node_address.clone(),
            os_info: self.os_info.clone(),
            kernel_version: self.kernel_version.clone(),
            runtime_version: runtime_version.to_string(),
            hostname: self.hostname.clone(),
        }
    }
}

/// `PRETTY_NAME="..."` from an os-release file
fn pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pretty_name_parsing() {
        let release = "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nPRETTY_NAME=\"Ubuntu 22.04.4 LTS\"\nID=ubuntu\n";
        assert_eq!(pretty_name(release).as_deref(), Some("Ubuntu 22.04.4 LTS"));
        assert_eq!(pretty_name("ID=alpine\n"), None);
    }

    #[tokio::test]
    async fn test_node_info_carries_identity() {
        let info = SystemInfo::discover().await;
        let config = AgentConfig {
            node_token: "tok".into(),
            node_name: "alpha".into(),
            ..AgentConfig::default()
        };
        let node = info.node_info(&config, "24.0.7");
        assert_eq!(node.token, "tok");
        assert_eq!(node.name, "alpha");
        assert_eq!(node.runtime_version, "24.0.7");
        assert!(!node.os_info.is_empty());
    }
}
