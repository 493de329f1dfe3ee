/**
 * API REST HEARTH - Serveur HTTP/WebSocket opérateur du kernel
 *
 * RÔLE :
 * Expose l'API sécurisée de Hearth : gestion de la flotte (nœuds, instances,
 * sauvegardes, journal d'audit) et flux temps réel (moniteur, logs, console RCON).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key
 * - Routes REST sous /api/v1, WebSockets sous /ws/v1
 * - Abonnés WS : signal "resync" si trou, puis backlog, puis live
 * - Erreurs métier → code HTTP + corps `{"error": "..."}`
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sauf /health
 * - Sur /ws/ le paramètre `api_key` est accepté (upgrade navigateur sans header)
 */

use crate::backups;
use crate::commands::CommandError;
use crate::health::KernelHealth;
use crate::models::{BackupKind, BackupRecord, InstanceView, NodeCreated, NodeView, OperationLog};
use crate::monitor::{logs_topic, MONITOR_TOPIC};
use crate::operations::{
    self, ensure_rcon_configured, locate, CreateInstanceRequest, CreateNodeRequest, InstanceAction,
    InstanceCreated, OperationError,
};
use crate::state::KernelState;
use crate::hub::Subscription;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, warn};

const DEFAULT_OPERATION_LIMIT: usize = 100;

impl IntoResponse for OperationError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            warn!("[http] {status}: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Code HTTP d'une erreur métier
pub fn status_for(err: &OperationError) -> StatusCode {
    match err {
        OperationError::NotFound(_) => StatusCode::NOT_FOUND,
        OperationError::Invalid(_) | OperationError::NotConfigured(_) => StatusCode::BAD_REQUEST,
        OperationError::Conflict(_) => StatusCode::CONFLICT,
        OperationError::Command(e) => match e {
            CommandError::NodeOffline | CommandError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            CommandError::Timeout { delivered: false, .. } => StatusCode::SERVICE_UNAVAILABLE,
            CommandError::Timeout { .. } | CommandError::Abandoned(_) => StatusCode::GATEWAY_TIMEOUT,
            CommandError::DuplicateId(_) => StatusCode::CONFLICT,
            CommandError::Rejected(_) => StatusCode::BAD_GATEWAY,
        },
        OperationError::BadResult(_) => StatusCode::BAD_GATEWAY,
        OperationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn require_api_key(State(app): State<KernelState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.config.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("[http] SECURITY: no api_key configured - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let from_header = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    let from_query = path.starts_with("/ws/")
        && Query::<HashMap<String, String>>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(params)| params.get("api_key").map(|v| v == expected))
            .unwrap_or(false);

    if !(from_header || from_query) {
        debug!("[http] unauthorized request to {path}");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: KernelState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/v1/nodes", get(list_nodes).post(create_node))
        .route("/api/v1/nodes/{id}", get(get_node).delete(delete_node))
        .route("/api/v1/instances", get(list_instances).post(create_instance))
        .route("/api/v1/instances/{id}", get(get_instance).delete(delete_instance))
        .route("/api/v1/instances/{id}/start", post(start_instance))
        .route("/api/v1/instances/{id}/stop", post(stop_instance))
        .route("/api/v1/instances/{id}/restart", post(restart_instance))
        .route("/api/v1/instances/{id}/kill", post(kill_instance))
        .route("/api/v1/instances/{id}/logs/start", post(start_logs))
        .route("/api/v1/instances/{id}/logs/stop", post(stop_logs))
        .route("/api/v1/instances/{id}/rcon", post(run_rcon))
        .route("/api/v1/instances/{id}/backups", get(list_backups).post(create_backup))
        .route("/api/v1/operations", get(list_operations))
        .route("/ws/v1/monitor", get(ws_monitor))
        .route("/ws/v1/logs/{id}", get(ws_logs))
        .route("/ws/v1/rcon/{id}", get(ws_rcon))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<KernelState>) -> Json<KernelHealth> {
    Json(app.health.get_health(&app))
}

// ----- Nœuds -----

async fn list_nodes(State(app): State<KernelState>) -> Json<Vec<NodeView>> {
    Json(app.store.list_nodes().iter().map(|n| n.view()).collect())
}

async fn create_node(
    State(app): State<KernelState>,
    Json(req): Json<CreateNodeRequest>,
) -> Result<(StatusCode, Json<NodeCreated>), OperationError> {
    let created = operations::create_node(&app, req)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_node(State(app): State<KernelState>, Path(id): Path<String>) -> Result<Json<NodeView>, OperationError> {
    let node = app
        .store
        .node(&id)
        .ok_or_else(|| OperationError::NotFound(format!("node {id}")))?;
    Ok(Json(node.view()))
}

async fn delete_node(State(app): State<KernelState>, Path(id): Path<String>) -> Result<StatusCode, OperationError> {
    operations::delete_node(&app, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ----- Instances -----

#[derive(Debug, Deserialize)]
struct InstanceFilter {
    node_id: Option<String>,
}

async fn list_instances(
    State(app): State<KernelState>,
    Query(filter): Query<InstanceFilter>,
) -> Json<Vec<InstanceView>> {
    let instances = app.store.list_instances(filter.node_id.as_deref());
    Json(instances.iter().map(|i| i.view()).collect())
}

async fn create_instance(
    State(app): State<KernelState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<InstanceCreated>), OperationError> {
    let created = operations::create_instance(&app, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_instance(
    State(app): State<KernelState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceView>, OperationError> {
    let instance = app
        .store
        .instance(&id)
        .ok_or_else(|| OperationError::NotFound(format!("instance {id}")))?;
    Ok(Json(instance.view()))
}

async fn delete_instance(State(app): State<KernelState>, Path(id): Path<String>) -> Result<StatusCode, OperationError> {
    operations::delete_instance(&app, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn act(app: &KernelState, id: &str, action: InstanceAction) -> Result<Json<InstanceView>, OperationError> {
    Ok(Json(operations::instance_action(app, id, action).await?))
}

async fn start_instance(State(app): State<KernelState>, Path(id): Path<String>) -> Result<Json<InstanceView>, OperationError> {
    act(&app, &id, InstanceAction::Start).await
}

async fn stop_instance(State(app): State<KernelState>, Path(id): Path<String>) -> Result<Json<InstanceView>, OperationError> {
    act(&app, &id, InstanceAction::Stop).await
}

async fn restart_instance(State(app): State<KernelState>, Path(id): Path<String>) -> Result<Json<InstanceView>, OperationError> {
    act(&app, &id, InstanceAction::Restart).await
}

async fn kill_instance(State(app): State<KernelState>, Path(id): Path<String>) -> Result<Json<InstanceView>, OperationError> {
    act(&app, &id, InstanceAction::Kill).await
}

async fn start_logs(State(app): State<KernelState>, Path(id): Path<String>) -> Result<Json<InstanceView>, OperationError> {
    act(&app, &id, InstanceAction::LogsStart).await
}

async fn stop_logs(State(app): State<KernelState>, Path(id): Path<String>) -> Result<Json<InstanceView>, OperationError> {
    act(&app, &id, InstanceAction::LogsStop).await
}

#[derive(Debug, Deserialize)]
struct RconRequest {
    command: String,
}

async fn run_rcon(
    State(app): State<KernelState>,
    Path(id): Path<String>,
    Json(req): Json<RconRequest>,
) -> Result<Json<serde_json::Value>, OperationError> {
    let output = operations::rcon(&app, &id, &req.command).await?;
    Ok(Json(json!({ "output": output })))
}

// ----- Sauvegardes / audit -----

async fn list_backups(
    State(app): State<KernelState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<BackupRecord>>, OperationError> {
    if app.store.instance(&id).is_none() {
        return Err(OperationError::NotFound(format!("instance {id}")));
    }
    Ok(Json(app.store.list_backups(&id)))
}

#[derive(Debug, Deserialize)]
struct BackupRequest {
    #[serde(default)]
    note: String,
}

async fn create_backup(
    State(app): State<KernelState>,
    Path(id): Path<String>,
    body: Option<Json<BackupRequest>>,
) -> Result<(StatusCode, Json<BackupRecord>), OperationError> {
    let note = body.map(|Json(req)| req.note).unwrap_or_default();
    let timeout = app.config.backup_timeout();
    let record = backups::create_backup(&app, &id, &note, BackupKind::Manual, timeout).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
struct OperationsQuery {
    limit: Option<usize>,
}

async fn list_operations(
    State(app): State<KernelState>,
    Query(q): Query<OperationsQuery>,
) -> Json<Vec<OperationLog>> {
    Json(app.store.list_operations(q.limit.unwrap_or(DEFAULT_OPERATION_LIMIT)))
}

// ----- WebSockets -----

#[derive(Debug, Deserialize)]
struct SeqParams {
    #[serde(default)]
    last_seq: u64,
}

async fn ws_monitor(
    ws: WebSocketUpgrade,
    State(app): State<KernelState>,
    Query(params): Query<SeqParams>,
) -> Response {
    let subscription = app.hub.subscribe(MONITOR_TOPIC, params.last_seq);
    ws.on_upgrade(move |socket| stream_subscription(socket, subscription))
}

async fn ws_logs(
    ws: WebSocketUpgrade,
    State(app): State<KernelState>,
    Path(id): Path<String>,
    Query(params): Query<SeqParams>,
) -> Result<Response, OperationError> {
    if app.store.instance(&id).is_none() {
        return Err(OperationError::NotFound(format!("instance {id}")));
    }
    let subscription = app.hub.subscribe(&logs_topic(&id), params.last_seq);
    Ok(ws.on_upgrade(move |socket| stream_subscription(socket, subscription)))
}

/// Resync éventuel, backlog, puis live jusqu'à fermeture côté client
async fn stream_subscription(socket: WebSocket, mut subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();

    if let Some(gap) = subscription.gap() {
        match serde_json::to_string(&gap.resync_envelope()) {
            Ok(text) => {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("[http] failed to serialize resync: {e}"),
        }
    }
    for published in subscription.take_backlog() {
        if sender.send(Message::Text(published.payload.to_string().into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            next = subscription.recv() => match next {
                Some(published) => {
                    if sender.send(Message::Text(published.payload.to_string().into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("[http] subscriber {} disconnected", subscription.id());
}

#[derive(Debug, Deserialize)]
struct ConsoleFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: String,
}

async fn ws_rcon(
    ws: WebSocketUpgrade,
    State(app): State<KernelState>,
    Path(id): Path<String>,
) -> Result<Response, OperationError> {
    let (instance, _) = locate(&app, &id)?;
    ensure_rcon_configured(&instance)?;
    Ok(ws.on_upgrade(move |socket| rcon_console(socket, app, id)))
}

async fn rcon_console(mut socket: WebSocket, app: KernelState, instance_id: String) {
    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let reply = match serde_json::from_str::<ConsoleFrame>(text.as_str()) {
            Ok(frame) if frame.kind == "command" => match operations::rcon(&app, &instance_id, &frame.data).await {
                Ok(output) => json!({ "type": "response", "data": { "output": output } }),
                Err(e) => json!({ "type": "response", "data": { "error": e.to_string() } }),
            },
            Ok(_) => continue,
            Err(e) => json!({ "type": "response", "data": { "error": format!("malformed frame: {e}") } }),
        };
        if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
            break;
        }
    }
    debug!("[http] rcon console for {instance_id} closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_errors_map_to_gateway_codes() {
        let offline = OperationError::Command(CommandError::NodeOffline);
        assert_eq!(status_for(&offline), StatusCode::SERVICE_UNAVAILABLE);

        let lost = OperationError::Command(CommandError::Timeout { command_id: "c".into(), delivered: false });
        assert_eq!(status_for(&lost), StatusCode::SERVICE_UNAVAILABLE);

        let slow = OperationError::Command(CommandError::Timeout { command_id: "c".into(), delivered: true });
        assert_eq!(status_for(&slow), StatusCode::GATEWAY_TIMEOUT);

        let failed = OperationError::Command(CommandError::Rejected("container not found".into()));
        assert_eq!(status_for(&failed), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn operator_errors_map_to_client_codes() {
        assert_eq!(status_for(&OperationError::NotFound("instance x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&OperationError::NotConfigured("rcon".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&OperationError::Conflict("node has instances".into())), StatusCode::CONFLICT);
    }
}
