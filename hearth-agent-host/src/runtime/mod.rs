//! Container runtime adapter
//!
//! Everything the agent does to game servers goes through `ContainerRuntime`,
//! keyed by the stable container name `<prefix><instance_id>`. The shipped
//! implementation shells out to the docker CLI (`docker.rs`).

mod docker;
#[cfg(test)]
pub mod fake;

pub use docker::DockerCli;

use crate::config::AgentConfig;
use chrono::{DateTime, Utc};
use hearth_protocol::InstanceConfig;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Label carrying the instance id on every managed container
pub const INSTANCE_LABEL: &str = "hearth.instance";
/// Container-side port answering A2S queries
pub const QUERY_PORT_KEY: &str = "2457/udp";
pub const DEFAULT_IMAGE: &str = "lloesche/valheim-server:latest";

const GAME_CONTAINER_PORT: u16 = 2456;
const QUERY_CONTAINER_PORT: u16 = 2457;
const STATUS_CONTAINER_PORT: u16 = 80;
const RCON_CONTAINER_PORT: u16 = 2458;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no such image: {0}")]
    NoSuchImage(String),
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("docker {op} failed: {stderr}")]
    Command { op: &'static str, stderr: String },
    #[error("failed to run container runtime: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected runtime output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
    pub protocol: Protocol,
}

/// Everything needed to create one game server container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub env: Vec<(String, String)>,
    /// (host path, container path)
    pub volumes: Vec<(PathBuf, String)>,
    pub labels: Vec<(String, String)>,
}

impl ContainerSpec {
    pub fn for_instance(config: &AgentConfig, instance: &InstanceConfig) -> Self {
        let id = &instance.instance_id;
        let mut ports = vec![
            PortMapping { host: instance.game_port, container: GAME_CONTAINER_PORT, protocol: Protocol::Udp },
            PortMapping {
                host: instance.game_port.saturating_add(1),
                container: QUERY_CONTAINER_PORT,
                protocol: Protocol::Udp,
            },
            PortMapping { host: instance.status_port, container: STATUS_CONTAINER_PORT, protocol: Protocol::Tcp },
        ];
        let mut env = vec![
            ("SERVER_NAME".to_string(), instance.name.clone()),
            ("WORLD_NAME".to_string(), instance.world_name.clone()),
            ("SERVER_PASS".to_string(), instance.password.clone()),
            ("STATUS_HTTP".to_string(), "true".to_string()),
            ("STATUS_HTTP_PORT".to_string(), STATUS_CONTAINER_PORT.to_string()),
        ];
        if instance.rcon_configured() {
            ports.push(PortMapping { host: instance.rcon_port, container: RCON_CONTAINER_PORT, protocol: Protocol::Tcp });
            env.push(("ENABLE_RCON".to_string(), "true".to_string()));
            env.push(("RCON_PORT".to_string(), RCON_CONTAINER_PORT.to_string()));
            env.push(("RCON_PASS".to_string(), instance.rcon_password.clone()));
        }

        let image = if instance.image.trim().is_empty() {
            DEFAULT_IMAGE.to_string()
        } else {
            instance.image.clone()
        };

        Self {
            name: config.container_name(id),
            image,
            ports,
            env,
            volumes: vec![(config.data_path.join(id).join("config"), "/config".to_string())],
            labels: vec![(INSTANCE_LABEL.to_string(), id.clone())],
        }
    }
}

/// One managed container as seen by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub instance_id: String,
    pub name: String,
    /// Raw runtime state ("running", "exited", ...)
    pub state: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDetails {
    pub status: String,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    /// Container port key ("2457/udp") to the first published host port
    pub host_ports: HashMap<String, u16>,
}

impl ContainerDetails {
    pub fn host_port(&self, key: &str) -> Option<u16> {
        self.host_ports.get(key).copied()
    }

    pub fn uptime_secs(&self, now: DateTime<Utc>) -> u64 {
        match self.started_at {
            Some(started) if self.running => (now - started).num_seconds().max(0) as u64,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub mem_bytes: u64,
}

/// Operations the agent needs from a container runtime
pub trait ContainerRuntime: Send + Sync + 'static {
    fn version(&self) -> impl Future<Output = Result<String, RuntimeError>> + Send;

    /// Create without pulling; a missing image is `RuntimeError::NoSuchImage`
    fn create(&self, spec: &ContainerSpec) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn pull(&self, image: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn start(&self, name: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn stop(&self, name: &str, grace: Duration) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn restart(&self, name: &str, grace: Duration) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn kill(&self, name: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Force-remove; a container that does not exist is not an error
    fn remove(&self, name: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn list_managed(&self) -> impl Future<Output = Result<Vec<ContainerSummary>, RuntimeError>> + Send;

    fn inspect(&self, name: &str) -> impl Future<Output = Result<ContainerDetails, RuntimeError>> + Send;

    fn stats(&self, name: &str) -> impl Future<Output = Result<ContainerStats, RuntimeError>> + Send;

    /// Follow the container log, sending each line, until `cancel` fires,
    /// the receiver goes away or the runtime ends the stream
    fn stream_logs(
        &self,
        name: &str,
        tail: usize,
        cancel: CancellationToken,
        lines: mpsc::Sender<String>,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(rcon: bool) -> InstanceConfig {
        InstanceConfig {
            instance_id: "inst-1".into(),
            name: "Vikings".into(),
            world_name: "Midgard".into(),
            password: "hunter22".into(),
            image: String::new(),
            game_port: 2456,
            status_port: 6456,
            rcon_port: if rcon { 7456 } else { 0 },
            rcon_password: if rcon { "rc".into() } else { String::new() },
        }
    }

    #[test]
    fn test_spec_without_rcon() {
        let config = AgentConfig { data_path: PathBuf::from("/srv/hearth"), ..AgentConfig::default() };
        let spec = ContainerSpec::for_instance(&config, &instance(false));

        assert_eq!(spec.name, "hearth-inst-1");
        assert_eq!(spec.image, DEFAULT_IMAGE);
        assert_eq!(spec.ports.len(), 3);
        assert_eq!(spec.ports[1], PortMapping { host: 2457, container: 2457, protocol: Protocol::Udp });
        assert!(!spec.env.iter().any(|(k, _)| k == "ENABLE_RCON"));
        assert_eq!(spec.volumes, vec![(PathBuf::from("/srv/hearth/inst-1/config"), "/config".to_string())]);
        assert_eq!(spec.labels, vec![(INSTANCE_LABEL.to_string(), "inst-1".to_string())]);
    }

    #[test]
    fn test_spec_with_rcon() {
        let spec = ContainerSpec::for_instance(&AgentConfig::default(), &instance(true));

        assert!(spec.ports.contains(&PortMapping { host: 7456, container: 2458, protocol: Protocol::Tcp }));
        let env: HashMap<_, _> = spec.env.iter().cloned().collect();
        assert_eq!(env["ENABLE_RCON"], "true");
        assert_eq!(env["RCON_PORT"], "2458");
        assert_eq!(env["RCON_PASS"], "rc");
        assert_eq!(env["SERVER_PASS"], "hunter22");
    }

    #[test]
    fn test_uptime_only_while_running() {
        let now = Utc::now();
        let mut details = ContainerDetails {
            status: "running".into(),
            running: true,
            started_at: Some(now - chrono::Duration::seconds(90)),
            host_ports: HashMap::new(),
        };
        assert_eq!(details.uptime_secs(now), 90);
        details.running = false;
        assert_eq!(details.uptime_secs(now), 0);
    }
}
