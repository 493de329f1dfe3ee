/**
 * MODÈLES DE LA FLOTTE - Nœuds, instances, sauvegardes et journal d'opérations
 *
 * RÔLE : Lignes persistées par le store + vues JSON exposées (API, hub).
 * Les vues n'exposent jamais le token d'un nœud.
 */

use hearth_protocol::{InstanceConfig, InstanceReport, InstanceStatus, NodeInfo};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub disk_free: u64,
    pub disk_total: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Bearer token, clé de routage du canal de contrôle
    pub token: String,
    pub name: String,
    pub address: String,
    pub status: NodeStatus,
    pub last_heartbeat: Option<OffsetDateTime>,
    pub metrics: NodeMetrics,
    pub os_info: String,
    pub kernel_version: String,
    pub runtime_version: String,
    pub hostname: String,
    pub created_at: OffsetDateTime,
}

impl Node {
    pub fn new(id: String, token: String, name: String, address: String) -> Self {
        Self {
            id,
            token,
            name,
            address,
            status: NodeStatus::Offline,
            last_heartbeat: None,
            metrics: NodeMetrics::default(),
            os_info: String::new(),
            kernel_version: String::new(),
            runtime_version: String::new(),
            hostname: String::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Trame d'identité : descripteurs OS + passage online
    pub fn apply_identity(&mut self, info: &NodeInfo, now: OffsetDateTime) {
        if !info.name.is_empty() {
            self.name = info.name.clone();
        }
        if !info.address.is_empty() {
            self.address = info.address.clone();
        }
        self.os_info = info.os_info.clone();
        self.kernel_version = info.kernel_version.clone();
        self.runtime_version = info.runtime_version.clone();
        self.hostname = info.hostname.clone();
        self.status = NodeStatus::Online;
        self.last_heartbeat = Some(now);
    }

    pub fn view(&self) -> NodeView {
        NodeView {
            id: self.id.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            status: self.status,
            last_heartbeat: self.last_heartbeat.map(fmt_time),
            metrics: self.metrics.clone(),
            os_info: self.os_info.clone(),
            kernel_version: self.kernel_version.clone(),
            runtime_version: self.runtime_version.clone(),
            hostname: self.hostname.clone(),
            created_at: fmt_time(self.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeView {
    pub id: String,
    pub name: String,
    pub address: String,
    pub status: NodeStatus,
    pub last_heartbeat: Option<String>,
    pub metrics: NodeMetrics,
    pub os_info: String,
    pub kernel_version: String,
    pub runtime_version: String,
    pub hostname: String,
    pub created_at: String,
}

/// Réponse de création : seul moment où le token est renvoyé à l'opérateur
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCreated {
    #[serde(flatten)]
    pub node: NodeView,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceTelemetry {
    pub cpu_percent: f64,
    pub mem_bytes: u64,
    pub uptime_secs: u64,
    pub player_count: u32,
    pub max_players: u32,
    pub game_version: String,
    pub world_time: String,
    pub runtime_status: String,
}

impl InstanceTelemetry {
    pub fn from_report(report: &InstanceReport) -> Self {
        Self {
            cpu_percent: report.cpu_percent,
            mem_bytes: report.mem_bytes,
            uptime_secs: report.uptime_secs,
            player_count: report.player_count,
            max_players: report.max_players,
            game_version: report.game_version.clone(),
            world_time: report.world_time.clone(),
            runtime_status: report.runtime_status.clone(),
        }
    }

    /// Remise à zéro CPU/mémoire/uptime d'une instance non rapportée
    pub fn zero_usage(&mut self) {
        self.cpu_percent = 0.0;
        self.mem_bytes = 0;
        self.uptime_secs = 0;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: String,
    pub node_id: String,
    pub name: String,
    pub world_name: String,
    pub password: String,
    pub image: String,
    pub game_port: u16,
    pub status_port: u16,
    pub rcon_port: u16,
    pub rcon_password: String,
    pub status: InstanceStatus,
    pub telemetry: InstanceTelemetry,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Instance {
    pub fn config(&self) -> InstanceConfig {
        InstanceConfig {
            instance_id: self.id.clone(),
            name: self.name.clone(),
            world_name: self.world_name.clone(),
            password: self.password.clone(),
            image: self.image.clone(),
            game_port: self.game_port,
            status_port: self.status_port,
            rcon_port: self.rcon_port,
            rcon_password: self.rcon_password.clone(),
        }
    }

    pub fn view(&self) -> InstanceView {
        InstanceView {
            id: self.id.clone(),
            node_id: self.node_id.clone(),
            name: self.name.clone(),
            world_name: self.world_name.clone(),
            image: self.image.clone(),
            game_port: self.game_port,
            status_port: self.status_port,
            rcon_port: self.rcon_port,
            status: self.status,
            telemetry: self.telemetry.clone(),
            created_at: fmt_time(self.created_at),
            updated_at: fmt_time(self.updated_at),
        }
    }
}

/// Vue API : mots de passe masqués
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceView {
    pub id: String,
    pub node_id: String,
    pub name: String,
    pub world_name: String,
    pub image: String,
    pub game_port: u16,
    pub status_port: u16,
    pub rcon_port: u16,
    pub status: InstanceStatus,
    pub telemetry: InstanceTelemetry,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    pub id: String,
    pub instance_id: String,
    pub kind: BackupKind,
    pub file_path: String,
    pub size_bytes: u64,
    pub note: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Journal d'audit des actions opérateur
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationLog {
    pub id: String,
    pub node_id: Option<String>,
    pub instance_id: Option<String>,
    pub action: String,
    pub detail: String,
    pub success: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub fn fmt_time(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_default()
}
