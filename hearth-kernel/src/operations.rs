/**
 * OPÉRATIONS OPÉRATEUR - Actions métier appelées par l'API HTTP/WS
 *
 * RÔLE :
 * Création/suppression de nœuds et d'instances, actions de cycle de vie,
 * console RCON ; chaque action est tracée dans le journal d'audit.
 *
 * FONCTIONNEMENT :
 * - Actions fire-and-forget : le statut ne change qu'après envoi réussi
 * - RCON : configuration validée AVANT tout aller-retour réseau, attente bornée
 * - Les erreurs distinguent "nœud offline / pas de réponse" de "échec rapporté"
 */

use crate::commands::CommandError;
use crate::models::{Instance, InstanceView, Node, NodeCreated, OperationLog};
use crate::state::KernelState;
use crate::store::{NewInstance, StoreError};
use hearth_protocol::{BackendCommand, CommandKind, InstanceStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_IMAGE: &str = "lloesche/valheim-server:latest";

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("{0}")]
    NotConfigured(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("malformed result from node: {0}")]
    BadResult(String),
}

impl From<StoreError> for OperationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NodeNotFound(id) => OperationError::NotFound(format!("node {id}")),
            StoreError::InstanceNotFound(id) => OperationError::NotFound(format!("instance {id}")),
            StoreError::Conflict(msg) => OperationError::Conflict(msg),
            other => OperationError::Store(other),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub node_id: String,
    pub name: String,
    #[serde(default)]
    pub world_name: Option<String>,
    pub password: String,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InstanceCreated {
    #[serde(flatten)]
    pub instance: InstanceView,
    /// `false` si le nœud était offline au moment du CREATE
    pub dispatched: bool,
}

/// Actions fire-and-forget sur une instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Start,
    Stop,
    Restart,
    Kill,
    LogsStart,
    LogsStop,
}

impl InstanceAction {
    fn command_kind(self) -> CommandKind {
        match self {
            InstanceAction::Start => CommandKind::Start,
            InstanceAction::Stop => CommandKind::Stop,
            InstanceAction::Restart => CommandKind::Restart,
            InstanceAction::Kill => CommandKind::Kill,
            InstanceAction::LogsStart => CommandKind::StreamLogsStart,
            InstanceAction::LogsStop => CommandKind::StreamLogsStop,
        }
    }

    /// Statut transitoire posé après envoi ; le sync suivant fait foi
    fn pending_status(self) -> Option<InstanceStatus> {
        match self {
            InstanceAction::Start => Some(InstanceStatus::Starting),
            InstanceAction::Stop | InstanceAction::Restart => Some(InstanceStatus::Stopping),
            InstanceAction::Kill | InstanceAction::LogsStart | InstanceAction::LogsStop => None,
        }
    }
}

pub fn new_command_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn audit(
    state: &KernelState,
    node_id: Option<&str>,
    instance_id: Option<&str>,
    action: &str,
    detail: impl Into<String>,
    success: bool,
) {
    state.store.append_operation(OperationLog {
        id: Uuid::new_v4().to_string(),
        node_id: node_id.map(str::to_string),
        instance_id: instance_id.map(str::to_string),
        action: action.to_string(),
        detail: detail.into(),
        success,
        created_at: OffsetDateTime::now_utc(),
    });
}

fn persist(state: &KernelState) {
    if let Err(e) = state.store.flush() {
        warn!("[ops] failed to persist fleet: {e}");
    }
}

/// Instance + nœud propriétaire
pub fn locate(state: &KernelState, instance_id: &str) -> Result<(Instance, Node), OperationError> {
    let instance = state
        .store
        .instance(instance_id)
        .ok_or_else(|| OperationError::NotFound(format!("instance {instance_id}")))?;
    let node = state
        .store
        .node(&instance.node_id)
        .ok_or_else(|| OperationError::NotFound(format!("node {}", instance.node_id)))?;
    Ok((instance, node))
}

pub fn create_node(state: &KernelState, req: CreateNodeRequest) -> Result<NodeCreated, OperationError> {
    if req.name.trim().is_empty() || req.address.trim().is_empty() {
        return Err(OperationError::Invalid("name and address are required".into()));
    }
    let node = state.store.create_node(req.name.trim(), req.address.trim())?;
    audit(state, Some(&node.id), None, "create_node", &node.name, true);
    persist(state);
    info!("[ops] node {} ({}) created", node.name, node.id);
    Ok(NodeCreated { node: node.view(), token: node.token.clone() })
}

pub fn delete_node(state: &KernelState, node_id: &str) -> Result<(), OperationError> {
    let node = state.store.delete_node(node_id)?;
    if let Some(link) = state.nodes.get(&node.token) {
        link.close();
    }
    audit(state, Some(node_id), None, "delete_node", &node.name, true);
    persist(state);
    Ok(())
}

pub async fn create_instance(state: &KernelState, req: CreateInstanceRequest) -> Result<InstanceCreated, OperationError> {
    if req.name.trim().is_empty() {
        return Err(OperationError::Invalid("name is required".into()));
    }
    let node = state
        .store
        .node(&req.node_id)
        .ok_or_else(|| OperationError::NotFound(format!("node {}", req.node_id)))?;

    let instance = state.store.create_instance(NewInstance {
        node_id: node.id.clone(),
        name: req.name.trim().to_string(),
        world_name: req.world_name.filter(|w| !w.is_empty()).unwrap_or_else(|| req.name.trim().to_string()),
        password: req.password,
        image: req.image.filter(|i| !i.is_empty()).unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
        rcon_password: generate_secret(),
    })?;
    persist(state);

    // le command_id du CREATE est l'id de l'instance
    let command = BackendCommand::new(instance.id.clone(), CommandKind::Create, instance.config());
    let dispatched = match state.dispatcher.dispatch(&node.token, &command).await {
        Ok(()) => true,
        Err(e) => {
            warn!("[ops] CREATE for {} not delivered: {e}", instance.id);
            false
        }
    };
    audit(
        state,
        Some(&node.id),
        Some(&instance.id),
        "create_instance",
        format!("{} (game port {})", instance.name, instance.game_port),
        dispatched,
    );
    Ok(InstanceCreated { instance: instance.view(), dispatched })
}

pub async fn instance_action(
    state: &KernelState,
    instance_id: &str,
    action: InstanceAction,
) -> Result<InstanceView, OperationError> {
    let (instance, node) = locate(state, instance_id)?;
    let kind = action.command_kind();
    let command = BackendCommand::new(new_command_id(), kind, instance.config());

    let sent = state.dispatcher.dispatch(&node.token, &command).await;
    audit(state, Some(&node.id), Some(instance_id), kind.as_str(), "", sent.is_ok());
    sent?;

    if let Some(status) = action.pending_status() {
        state.store.set_instance_status(instance_id, status)?;
    }
    let updated = state.store.instance(instance_id).unwrap_or(instance);
    Ok(updated.view())
}

pub async fn delete_instance(state: &KernelState, instance_id: &str) -> Result<(), OperationError> {
    let (instance, node) = locate(state, instance_id)?;
    let command = BackendCommand::new(new_command_id(), CommandKind::Delete, instance.config());
    if let Err(e) = state.dispatcher.dispatch(&node.token, &command).await {
        warn!("[ops] DELETE for {instance_id} not delivered ({e}), removing row anyway");
    }
    state.store.delete_instance(instance_id)?;
    audit(state, Some(&node.id), Some(instance_id), "delete_instance", &instance.name, true);
    persist(state);
    Ok(())
}

/// Exécute une commande console ; sortie nettoyée des espaces
pub async fn rcon(state: &KernelState, instance_id: &str, command: &str) -> Result<String, OperationError> {
    let (instance, node) = locate(state, instance_id)?;
    ensure_rcon_configured(&instance)?;
    if command.trim().is_empty() {
        return Err(OperationError::Invalid("command is empty".into()));
    }

    let cmd = BackendCommand::new(new_command_id(), CommandKind::Rcon, instance.config()).with_payload(command);
    let result = state.dispatcher.execute(&node.token, &cmd, state.config.rcon_timeout()).await;
    audit(state, Some(&node.id), Some(instance_id), "rcon", command, result.is_ok());
    Ok(result?.trim().to_string())
}

pub fn ensure_rcon_configured(instance: &Instance) -> Result<(), OperationError> {
    if instance.rcon_port == 0 || instance.rcon_password.is_empty() {
        return Err(OperationError::NotConfigured(format!(
            "rcon is not configured for instance {}",
            instance.id
        )));
    }
    Ok(())
}

fn generate_secret() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    raw[..16].to_string()
}
