/**
 * STORE DE LA FLOTTE - Collaborateur de persistance des nœuds et instances
 *
 * RÔLE :
 * Interface `FleetStore` appelée par le canal de contrôle, la réconciliation,
 * le moniteur et les opérations opérateur.
 *
 * FONCTIONNEMENT :
 * - Chaque méthode = une "instruction" unique, atomique à elle seule
 * - Aucune atomicité multi-instructions n'est supposée par les appelants
 * - `MemoryStore` : maps en RwLock + persistance JSON optionnelle (flush)
 *
 * UTILITÉ DANS HEARTH :
 * 🎯 Vue coordinateur de la flotte (statuts, télémétrie, ports alloués)
 * 🎯 Sauvegardes enregistrées + journal d'audit des opérations
 */

use crate::models::{
    BackupRecord, Instance, InstanceTelemetry, Node, NodeStatus, OperationLog,
};
use hearth_protocol::{HeartbeatData, InstanceReport, InstanceStatus, NodeInfo};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

/// Port de jeu de référence quand le nœud n'a encore aucune instance
pub const BASE_GAME_PORT: u16 = 2446;
pub const GAME_PORT_STEP: u16 = 10;
pub const STATUS_PORT_OFFSET: u16 = 4000;
pub const RCON_PORT_OFFSET: u16 = 5000;

const MAX_OPERATION_LOG: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("unknown node token")]
    UnknownToken,
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("no free port range on node {0}")]
    PortsExhausted(String),
    #[error("persistence error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Demande de création d'instance (ports alloués par le store)
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub node_id: String,
    pub name: String,
    pub world_name: String,
    pub password: String,
    pub image: String,
    pub rcon_password: String,
}

pub trait FleetStore: Send + Sync {
    fn create_node(&self, name: &str, address: &str) -> Result<Node, StoreError>;
    /// Refusé tant que le nœud possède des instances
    fn delete_node(&self, id: &str) -> Result<Node, StoreError>;
    fn node(&self, id: &str) -> Option<Node>;
    fn node_by_token(&self, token: &str) -> Option<Node>;
    fn list_nodes(&self) -> Vec<Node>;
    fn mark_node_online(&self, info: &NodeInfo, now: OffsetDateTime) -> Result<Node, StoreError>;
    fn record_heartbeat(&self, heartbeat: &HeartbeatData, now: OffsetDateTime) -> Result<(), StoreError>;
    /// Signe de vie sans métriques (sync) : last_heartbeat = now, online
    fn touch_node(&self, token: &str, now: OffsetDateTime) -> bool;
    /// `true` si le nœud était online
    fn set_node_offline(&self, token: &str) -> bool;
    /// Passe offline les nœuds online dont le dernier signe de vie précède `cutoff`.
    /// Retourne les ids des nœuds basculés.
    fn mark_stale_nodes_offline(&self, cutoff: OffsetDateTime) -> Vec<String>;
    /// Force offline toute instance appartenant à un nœud offline
    fn cascade_offline_instances(&self) -> usize;

    fn create_instance(&self, new: NewInstance) -> Result<Instance, StoreError>;
    fn instance(&self, id: &str) -> Option<Instance>;
    fn list_instances(&self, node_id: Option<&str>) -> Vec<Instance>;
    fn set_instance_status(&self, id: &str, status: InstanceStatus) -> Result<(), StoreError>;
    fn delete_instance(&self, id: &str) -> Result<Instance, StoreError>;
    /// Met à jour l'instance (id, nœud propriétaire). `false` si inconnue.
    fn apply_instance_report(&self, token: &str, report: &InstanceReport, now: OffsetDateTime) -> bool;
    /// Force stopped + télémétrie à zéro pour les instances du nœud absentes de `reported`
    fn sweep_unreported(&self, token: &str, reported: &HashSet<String>, now: OffsetDateTime) -> usize;

    fn insert_backup(&self, record: BackupRecord) -> Result<(), StoreError>;
    fn list_backups(&self, instance_id: &str) -> Vec<BackupRecord>;
    fn append_operation(&self, entry: OperationLog);
    /// Plus récentes en premier
    fn list_operations(&self, limit: usize) -> Vec<OperationLog>;

    /// Persiste l'état courant (no-op sans fichier)
    fn flush(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FleetData {
    nodes: HashMap<String, Node>,
    instances: HashMap<String, Instance>,
    backups: Vec<BackupRecord>,
    operations: VecDeque<OperationLog>,
}

impl FleetData {
    fn node_id_for_token(&self, token: &str) -> Option<String> {
        self.nodes.values().find(|n| n.token == token).map(|n| n.id.clone())
    }
}

pub struct MemoryStore {
    data: RwLock<FleetData>,
    data_file: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { data: RwLock::new(FleetData::default()), data_file: None }
    }

    /// Charge le fichier s'il existe. Aucun flux n'est attaché au démarrage :
    /// tous les nœuds repartent offline.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                FleetData::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            info!("[store] no existing fleet file, starting fresh");
            FleetData::default()
        };
        for node in data.nodes.values_mut() {
            node.status = NodeStatus::Offline;
        }
        info!(
            "[store] loaded {} nodes, {} instances from {}",
            data.nodes.len(),
            data.instances.len(),
            path.display()
        );
        Ok(Self { data: RwLock::new(data), data_file: Some(path) })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetStore for MemoryStore {
    fn create_node(&self, name: &str, address: &str) -> Result<Node, StoreError> {
        let mut data = self.data.write();
        if data.nodes.values().any(|n| n.address == address) {
            return Err(StoreError::Conflict(format!("a node with address {address} already exists")));
        }
        let node = Node::new(
            Uuid::new_v4().to_string(),
            Uuid::new_v4().to_string(),
            name.to_string(),
            address.to_string(),
        );
        data.nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    fn delete_node(&self, id: &str) -> Result<Node, StoreError> {
        let mut data = self.data.write();
        if data.instances.values().any(|i| i.node_id == id) {
            return Err(StoreError::Conflict(format!("node {id} still owns instances")));
        }
        data.nodes.remove(id).ok_or_else(|| StoreError::NodeNotFound(id.to_string()))
    }

    fn node(&self, id: &str) -> Option<Node> {
        self.data.read().nodes.get(id).cloned()
    }

    fn node_by_token(&self, token: &str) -> Option<Node> {
        self.data.read().nodes.values().find(|n| n.token == token).cloned()
    }

    fn list_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.data.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        nodes
    }

    fn mark_node_online(&self, info: &NodeInfo, now: OffsetDateTime) -> Result<Node, StoreError> {
        let mut data = self.data.write();
        let node = data
            .nodes
            .values_mut()
            .find(|n| n.token == info.token)
            .ok_or(StoreError::UnknownToken)?;
        node.apply_identity(info, now);
        Ok(node.clone())
    }

    fn record_heartbeat(&self, heartbeat: &HeartbeatData, now: OffsetDateTime) -> Result<(), StoreError> {
        let mut data = self.data.write();
        let node = data
            .nodes
            .values_mut()
            .find(|n| n.token == heartbeat.token)
            .ok_or(StoreError::UnknownToken)?;
        node.metrics.cpu_usage = heartbeat.cpu_usage;
        node.metrics.mem_usage = heartbeat.mem_usage;
        node.metrics.disk_free = heartbeat.disk_free;
        node.metrics.disk_total = heartbeat.disk_total;
        node.metrics.uptime_secs = heartbeat.uptime_secs;
        node.status = NodeStatus::Online;
        node.last_heartbeat = Some(now);
        Ok(())
    }

    fn touch_node(&self, token: &str, now: OffsetDateTime) -> bool {
        let mut data = self.data.write();
        match data.nodes.values_mut().find(|n| n.token == token) {
            Some(node) => {
                node.status = NodeStatus::Online;
                node.last_heartbeat = Some(now);
                true
            }
            None => false,
        }
    }

    fn set_node_offline(&self, token: &str) -> bool {
        let mut data = self.data.write();
        match data.nodes.values_mut().find(|n| n.token == token) {
            Some(node) if node.status == NodeStatus::Online => {
                node.status = NodeStatus::Offline;
                true
            }
            _ => false,
        }
    }

    fn mark_stale_nodes_offline(&self, cutoff: OffsetDateTime) -> Vec<String> {
        let mut data = self.data.write();
        let mut stale = Vec::new();
        for node in data.nodes.values_mut() {
            let expired = node.last_heartbeat.map_or(true, |seen| seen < cutoff);
            if node.status == NodeStatus::Online && expired {
                node.status = NodeStatus::Offline;
                stale.push(node.id.clone());
            }
        }
        stale
    }

    fn cascade_offline_instances(&self) -> usize {
        let mut data = self.data.write();
        let FleetData { nodes, instances, .. } = &mut *data;
        let now = OffsetDateTime::now_utc();
        let mut changed = 0;
        for instance in instances.values_mut() {
            let node_offline = nodes
                .get(&instance.node_id)
                .map_or(true, |n| n.status == NodeStatus::Offline);
            if node_offline && instance.status != InstanceStatus::Offline {
                instance.status = InstanceStatus::Offline;
                instance.updated_at = now;
                changed += 1;
            }
        }
        changed
    }

    fn create_instance(&self, new: NewInstance) -> Result<Instance, StoreError> {
        let mut data = self.data.write();
        if !data.nodes.contains_key(&new.node_id) {
            return Err(StoreError::NodeNotFound(new.node_id));
        }
        let highest = data
            .instances
            .values()
            .filter(|i| i.node_id == new.node_id)
            .map(|i| i.game_port)
            .max()
            .unwrap_or(BASE_GAME_PORT)
            .max(BASE_GAME_PORT);
        let game_port = highest
            .checked_add(GAME_PORT_STEP)
            .filter(|p| p.checked_add(RCON_PORT_OFFSET).is_some())
            .ok_or_else(|| StoreError::PortsExhausted(new.node_id.clone()))?;

        let now = OffsetDateTime::now_utc();
        let instance = Instance {
            id: Uuid::new_v4().to_string(),
            node_id: new.node_id,
            name: new.name,
            world_name: new.world_name,
            password: new.password,
            image: new.image,
            game_port,
            status_port: game_port + STATUS_PORT_OFFSET,
            rcon_port: game_port + RCON_PORT_OFFSET,
            rcon_password: new.rcon_password,
            status: InstanceStatus::Creating,
            telemetry: InstanceTelemetry::default(),
            created_at: now,
            updated_at: now,
        };
        data.instances.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    fn instance(&self, id: &str) -> Option<Instance> {
        self.data.read().instances.get(id).cloned()
    }

    fn list_instances(&self, node_id: Option<&str>) -> Vec<Instance> {
        let data = self.data.read();
        let mut list: Vec<Instance> = data
            .instances
            .values()
            .filter(|i| node_id.map_or(true, |n| i.node_id == n))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    fn set_instance_status(&self, id: &str, status: InstanceStatus) -> Result<(), StoreError> {
        let mut data = self.data.write();
        let instance = data
            .instances
            .get_mut(id)
            .ok_or_else(|| StoreError::InstanceNotFound(id.to_string()))?;
        instance.status = status;
        instance.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    fn delete_instance(&self, id: &str) -> Result<Instance, StoreError> {
        self.data
            .write()
            .instances
            .remove(id)
            .ok_or_else(|| StoreError::InstanceNotFound(id.to_string()))
    }

    fn apply_instance_report(&self, token: &str, report: &InstanceReport, now: OffsetDateTime) -> bool {
        let mut data = self.data.write();
        let Some(node_id) = data.node_id_for_token(token) else {
            return false;
        };
        match data.instances.get_mut(&report.instance_id) {
            Some(instance) if instance.node_id == node_id => {
                instance.status = report.status;
                instance.telemetry = InstanceTelemetry::from_report(report);
                instance.updated_at = now;
                true
            }
            _ => {
                debug!("[store] report for unknown instance {} from node {}", report.instance_id, node_id);
                false
            }
        }
    }

    fn sweep_unreported(&self, token: &str, reported: &HashSet<String>, now: OffsetDateTime) -> usize {
        let mut data = self.data.write();
        let Some(node_id) = data.node_id_for_token(token) else {
            return 0;
        };
        let mut swept = 0;
        for instance in data.instances.values_mut() {
            if instance.node_id != node_id || reported.contains(&instance.id) {
                continue;
            }
            instance.status = InstanceStatus::Stopped;
            instance.telemetry.zero_usage();
            instance.updated_at = now;
            swept += 1;
        }
        swept
    }

    fn insert_backup(&self, record: BackupRecord) -> Result<(), StoreError> {
        let mut data = self.data.write();
        if !data.instances.contains_key(&record.instance_id) {
            return Err(StoreError::InstanceNotFound(record.instance_id));
        }
        data.backups.push(record);
        Ok(())
    }

    fn list_backups(&self, instance_id: &str) -> Vec<BackupRecord> {
        let data = self.data.read();
        let mut list: Vec<BackupRecord> = data
            .backups
            .iter()
            .filter(|b| b.instance_id == instance_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    fn append_operation(&self, entry: OperationLog) {
        let mut data = self.data.write();
        if data.operations.len() >= MAX_OPERATION_LOG {
            data.operations.pop_front();
        }
        data.operations.push_back(entry);
    }

    fn list_operations(&self, limit: usize) -> Vec<OperationLog> {
        self.data.read().operations.iter().rev().take(limit).cloned().collect()
    }

    fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.data_file else {
            return Ok(());
        };
        let content = {
            let data = self.data.read();
            serde_json::to_string_pretty(&*data)?
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
