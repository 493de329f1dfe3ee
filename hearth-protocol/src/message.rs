//! Control-channel message types.
//!
//! Node → kernel frames are `AgentMessage`, internally tagged by `"type"`.
//! Kernel → node frames are `BackendCommand`. Heartbeat and sync are full
//! snapshots: there is no per-message acknowledgement for them, a lost one is
//! superseded by the next.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Every frame a node agent can send to the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Identity frame, sent first on every new stream.
    Register(NodeInfo),
    Heartbeat(HeartbeatData),
    /// Full snapshot of every instance the node currently sees.
    Sync(InstanceSyncData),
    Ack(CommandAck),
    Log(LogChunk),
}

impl AgentMessage {
    /// Token carried by identity-bearing frames.
    pub fn token(&self) -> Option<&str> {
        match self {
            AgentMessage::Register(info) => Some(&info.token),
            AgentMessage::Heartbeat(hb) => Some(&hb.token),
            AgentMessage::Sync(sync) => Some(&sync.token),
            AgentMessage::Ack(_) | AgentMessage::Log(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentMessage::Register(_) => "register",
            AgentMessage::Heartbeat(_) => "heartbeat",
            AgentMessage::Sync(_) => "sync",
            AgentMessage::Ack(_) => "ack",
            AgentMessage::Log(_) => "log",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub token: String,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub os_info: String,
    #[serde(default)]
    pub kernel_version: String,
    #[serde(default)]
    pub runtime_version: String,
    #[serde(default)]
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub token: String,
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub disk_free: u64,
    pub disk_total: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSyncData {
    pub token: String,
    pub instances: Vec<InstanceReport>,
}

/// One instance as observed by its node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    pub instance_id: String,
    pub status: InstanceStatus,
    /// Raw container runtime state ("running", "exited", ...).
    #[serde(default)]
    pub runtime_status: String,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub mem_bytes: u64,
    #[serde(default)]
    pub uptime_secs: u64,
    #[serde(default)]
    pub player_count: u32,
    #[serde(default)]
    pub max_players: u32,
    #[serde(default)]
    pub game_version: String,
    #[serde(default)]
    pub world_time: String,
}

impl InstanceReport {
    pub fn new(instance_id: impl Into<String>, status: InstanceStatus) -> Self {
        Self {
            instance_id: instance_id.into(),
            status,
            runtime_status: String::new(),
            cpu_percent: 0.0,
            mem_bytes: 0,
            uptime_secs: 0,
            player_count: 0,
            max_players: 0,
            game_version: String::new(),
            world_time: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Offline,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply to a `BackendCommand`, correlated by `command_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command_id: String,
    pub success: bool,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandAck {
    pub fn ok(command_id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: true,
            result: result.into(),
            error: None,
        }
    }

    pub fn failed(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: false,
            result: String::new(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogChunk {
    pub instance_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Create,
    Start,
    Stop,
    Restart,
    Kill,
    Delete,
    Rcon,
    Backup,
    StreamLogsStart,
    StreamLogsStop,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Create => "CREATE",
            CommandKind::Start => "START",
            CommandKind::Stop => "STOP",
            CommandKind::Restart => "RESTART",
            CommandKind::Kill => "KILL",
            CommandKind::Delete => "DELETE",
            CommandKind::Rcon => "RCON",
            CommandKind::Backup => "BACKUP",
            CommandKind::StreamLogsStart => "STREAM_LOGS_START",
            CommandKind::StreamLogsStop => "STREAM_LOGS_STOP",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Port and credential configuration of the targeted instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub instance_id: String,
    pub name: String,
    pub world_name: String,
    pub password: String,
    pub image: String,
    pub game_port: u16,
    pub status_port: u16,
    pub rcon_port: u16,
    pub rcon_password: String,
}

impl InstanceConfig {
    pub fn rcon_configured(&self) -> bool {
        self.rcon_port != 0 && !self.rcon_password.is_empty()
    }
}

/// Kernel → node command frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCommand {
    /// Caller-generated, unique per command.
    pub command_id: String,
    pub kind: CommandKind,
    #[serde(default)]
    pub config: InstanceConfig,
    /// RCON command text, backup note, ...
    #[serde(default)]
    pub payload: String,
}

impl BackendCommand {
    pub fn new(command_id: impl Into<String>, kind: CommandKind, config: InstanceConfig) -> Self {
        Self {
            command_id: command_id.into(),
            kind,
            config,
            payload: String::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }
}
