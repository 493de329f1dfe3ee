/**
 * CANAL DE CONTRÔLE - Serveur des flux persistants agent ↔ kernel
 *
 * RÔLE :
 * Accepte un flux TCP par nœud, identifie le nœud par son token, route les
 * commandes vers le flux le plus récent de chaque token et distribue les
 * trames entrantes (heartbeat, sync, ack, log) aux composants concernés.
 *
 * FONCTIONNEMENT :
 * - Une tâche de réception par flux : ordre des sync garanti par nœud
 * - `NodeRegistry` : token → `NodeLink` (RwLock, lectures majoritaires)
 * - Envois sérialisés par flux (`SharedWriter`), jamais de verrou global
 *   tenu pendant une écriture réseau
 * - Écriture bornée (SEND_TIMEOUT) : un nœud qui ne lit plus voit son flux fermé
 * - Ré-attache d'un token : échange atomique + fermeture explicite de
 *   l'ancien flux
 * - Fin de boucle de réception (toute cause) : mapping retiré (s'il est
 *   encore le nôtre) et nœud marqué offline
 */

use crate::commands::{short_token, CommandError};
use crate::monitor::publish_log_chunk;
use crate::reconcile::apply_sync;
use crate::state::KernelState;
use hearth_protocol::{frame_reader, read_message, AgentMessage, BackendCommand, FrameError, SharedWriter};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Délai maximal d'une écriture sur un flux, attente du verrou comprise
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Flux attaché d'un nœud
pub struct NodeLink {
    id: u64,
    peer: String,
    writer: SharedWriter,
    send_timeout: Duration,
    closed: CancellationToken,
}

impl NodeLink {
    pub fn new<W>(id: u64, peer: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            peer: peer.into(),
            writer: SharedWriter::new(writer),
            send_timeout: SEND_TIMEOUT,
            closed: CancellationToken::new(),
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&self, command: &BackendCommand) -> Result<(), CommandError> {
        if self.closed.is_cancelled() {
            return Err(CommandError::NodeOffline);
        }
        let outcome = tokio::select! {
            // fermé pendant l'attente du verrou d'écriture
            _ = self.closed.cancelled() => return Err(CommandError::NodeOffline),
            res = tokio::time::timeout(self.send_timeout, self.writer.send(command)) => res,
        };
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // flux cassé : la boucle de réception se termine et nettoie
                self.close();
                Err(CommandError::Transport(e))
            }
            Err(_) => {
                // trame peut-être à moitié écrite : le flux n'est plus utilisable
                warn!(
                    "[channel] stream {} to {} stalled for {:?}, closing",
                    self.id, self.peer, self.send_timeout
                );
                self.close();
                Err(CommandError::Transport(FrameError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "node stopped reading its control stream",
                ))))
            }
        }
    }

    /// Demande la fin de la boucle de réception de ce flux
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Registre token → flux actif, un seul flux par token
pub struct NodeRegistry {
    links: RwLock<HashMap<String, Arc<NodeLink>>>,
    next_id: AtomicU64,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self { links: RwLock::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    pub fn next_link_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Attache `link` pour `token`. L'ancien flux éventuel est fermé et retourné.
    pub fn attach(&self, token: &str, link: Arc<NodeLink>) -> Option<Arc<NodeLink>> {
        let previous = self.links.write().insert(token.to_string(), Arc::clone(&link));
        match previous {
            Some(old) if !Arc::ptr_eq(&old, &link) => {
                old.close();
                Some(old)
            }
            _ => None,
        }
    }

    /// Retire le mapping seulement s'il pointe encore sur `link_id`
    pub fn detach(&self, token: &str, link_id: u64) -> bool {
        let mut links = self.links.write();
        if links.get(token).is_some_and(|l| l.id() == link_id) {
            links.remove(token);
            true
        } else {
            false
        }
    }

    pub fn get(&self, token: &str) -> Option<Arc<NodeLink>> {
        self.links.read().get(token).cloned()
    }

    pub fn is_connected(&self, token: &str) -> bool {
        self.links.read().contains_key(token)
    }

    pub fn connected_count(&self) -> usize {
        self.links.read().len()
    }

    /// Écrit sur le flux actif du token ; le verrou du registre est relâché avant l'envoi
    pub async fn send(&self, token: &str, command: &BackendCommand) -> Result<(), CommandError> {
        let link = self.get(token).ok_or(CommandError::NodeOffline)?;
        link.send(command).await?;
        debug!(
            "[channel] {} {} → node {}",
            command.kind,
            command.command_id,
            short_token(token)
        );
        Ok(())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("unknown node token")]
    UnknownToken,
    #[error("stream already identified as another node")]
    TokenMismatch,
}

/// Boucle d'acceptation du canal de contrôle
pub async fn serve(listener: TcpListener, state: KernelState) {
    if let Ok(addr) = listener.local_addr() {
        info!("[channel] control channel listening on {addr}");
    }
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("[channel] set_nodelay failed for {peer}: {e}");
                }
                let state = state.clone();
                tokio::spawn(async move {
                    run_session(stream, peer.to_string(), state).await;
                });
            }
            Err(e) => {
                warn!("[channel] accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Boucle de réception d'un flux, jusqu'à EOF, erreur ou remplacement
pub async fn run_session<S>(stream: S, peer: String, state: KernelState)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = frame_reader(read_half);
    let link = Arc::new(NodeLink::new(state.nodes.next_link_id(), peer, write_half));
    let mut token: Option<String> = None;
    state.health.stream_accepted();
    debug!("[channel] stream {} opened from {}", link.id(), link.peer());

    loop {
        let frame = tokio::select! {
            _ = link.closed() => {
                info!("[channel] stream {} from {} closed by kernel", link.id(), link.peer());
                break;
            }
            frame = read_message::<AgentMessage, _>(&mut reader) => frame,
        };
        match frame {
            Ok(Some(msg)) => {
                if let Err(e) = handle_message(&state, &link, &mut token, msg) {
                    warn!("[channel] rejecting stream from {}: {e}", link.peer());
                    break;
                }
            }
            Ok(None) => {
                debug!("[channel] stream {} ended by peer", link.id());
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!("[channel] skipping malformed frame from {}: {e}", link.peer());
            }
            Err(e) => {
                warn!("[channel] stream {} from {} failed: {e}", link.id(), link.peer());
                break;
            }
        }
    }

    if let Some(token) = token {
        if state.nodes.detach(&token, link.id()) && state.store.set_node_offline(&token) {
            info!("[channel] node {} disconnected, marked offline", short_token(&token));
        }
    }
    link.close();
    match tokio::time::timeout(link.send_timeout, link.writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("[channel] closing stream {}: {e}", link.id()),
        Err(_) => debug!("[channel] closing stream {} timed out", link.id()),
    }
}

fn handle_message(
    state: &KernelState,
    link: &Arc<NodeLink>,
    token: &mut Option<String>,
    msg: AgentMessage,
) -> Result<(), SessionError> {
    let now = OffsetDateTime::now_utc();
    match msg {
        AgentMessage::Register(info) => {
            if token.as_deref().is_some_and(|t| t != info.token) {
                return Err(SessionError::TokenMismatch);
            }
            let node = state
                .store
                .mark_node_online(&info, now)
                .map_err(|_| SessionError::UnknownToken)?;
            adopt(state, link, token, &info.token);
            info!(
                "[channel] node {} ({}) registered from {} [{}; runtime {}]",
                node.name,
                node.id,
                link.peer(),
                info.os_info,
                info.runtime_version
            );
        }
        AgentMessage::Heartbeat(heartbeat) => {
            identify(state, link, token, &heartbeat.token)?;
            if let Err(e) = state.store.record_heartbeat(&heartbeat, now) {
                warn!("[channel] heartbeat not recorded: {e}");
            }
        }
        AgentMessage::Sync(sync) => {
            identify(state, link, token, &sync.token)?;
            apply_sync(state.store.as_ref(), &sync.token, &sync, now);
        }
        AgentMessage::Ack(ack) => {
            state.commands.resolve(ack);
        }
        AgentMessage::Log(chunk) => {
            publish_log_chunk(&state.hub, &chunk);
        }
    }
    Ok(())
}

/// Identifie le flux par le token d'une trame heartbeat/sync
fn identify(
    state: &KernelState,
    link: &Arc<NodeLink>,
    token: &mut Option<String>,
    claimed: &str,
) -> Result<(), SessionError> {
    match token.as_deref() {
        Some(current) if current == claimed => Ok(()),
        Some(_) => Err(SessionError::TokenMismatch),
        None => {
            if state.store.node_by_token(claimed).is_none() {
                return Err(SessionError::UnknownToken);
            }
            adopt(state, link, token, claimed);
            Ok(())
        }
    }
}

fn adopt(state: &KernelState, link: &Arc<NodeLink>, token: &mut Option<String>, claimed: &str) {
    if token.is_none() {
        *token = Some(claimed.to_string());
    }
    if let Some(old) = state.nodes.attach(claimed, Arc::clone(link)) {
        state.health.stream_superseded();
        info!(
            "[channel] node {} re-attached from {}, superseding stream {} from {}",
            short_token(claimed),
            link.peer(),
            old.id(),
            old.peer()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(registry: &NodeRegistry) -> Arc<NodeLink> {
        let (ours, _theirs) = tokio::io::duplex(1024);
        Arc::new(NodeLink::new(registry.next_link_id(), "test", ours))
    }

    #[tokio::test]
    async fn reattach_swaps_and_closes_superseded_link() {
        let registry = NodeRegistry::new();
        let first = link(&registry);
        let second = link(&registry);

        assert!(registry.attach("tok", Arc::clone(&first)).is_none());
        let superseded = registry.attach("tok", Arc::clone(&second)).unwrap();
        assert_eq!(superseded.id(), first.id());
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.get("tok").unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn stale_detach_keeps_newer_mapping() {
        let registry = NodeRegistry::new();
        let first = link(&registry);
        let second = link(&registry);
        registry.attach("tok", Arc::clone(&first));
        registry.attach("tok", Arc::clone(&second));

        assert!(!registry.detach("tok", first.id()));
        assert!(registry.is_connected("tok"));
        assert!(registry.detach("tok", second.id()));
        assert_eq!(registry.connected_count(), 0);
    }

    #[tokio::test]
    async fn attaching_the_same_link_twice_is_harmless() {
        let registry = NodeRegistry::new();
        let only = link(&registry);
        registry.attach("tok", Arc::clone(&only));
        assert!(registry.attach("tok", Arc::clone(&only)).is_none());
        assert!(!only.is_closed());
    }

    #[tokio::test]
    async fn stalled_peer_bounds_send_and_closes_link() {
        let registry = NodeRegistry::new();
        // l'autre extrémité ne lit jamais
        let (ours, _theirs) = tokio::io::duplex(256);
        let stalled = Arc::new(
            NodeLink::new(registry.next_link_id(), "stalled", ours).with_send_timeout(Duration::from_millis(100)),
        );
        registry.attach("tok", Arc::clone(&stalled));
        let cmd = BackendCommand::new("c1", hearth_protocol::CommandKind::Start, Default::default())
            .with_payload("x".repeat(4096));

        let queued = tokio::spawn({
            let stalled = Arc::clone(&stalled);
            let cmd = BackendCommand::new("c2", hearth_protocol::CommandKind::Stop, Default::default());
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                stalled.send(&cmd).await
            }
        });

        let err = tokio::time::timeout(Duration::from_secs(2), registry.send("tok", &cmd))
            .await
            .expect("send must be bounded")
            .unwrap_err();
        assert!(matches!(err, CommandError::Transport(_)));
        assert!(stalled.is_closed());

        let queued = tokio::time::timeout(Duration::from_secs(2), queued).await.expect("queued send released").unwrap();
        assert!(queued.is_err());
        assert!(matches!(registry.send("tok", &cmd).await, Err(CommandError::NodeOffline)));
    }

    #[tokio::test]
    async fn closed_link_refuses_commands() {
        let registry = NodeRegistry::new();
        let l = link(&registry);
        registry.attach("tok", Arc::clone(&l));
        l.close();

        let cmd = BackendCommand::new("c", hearth_protocol::CommandKind::Start, Default::default());
        assert!(matches!(registry.send("tok", &cmd).await, Err(CommandError::NodeOffline)));
    }
}
