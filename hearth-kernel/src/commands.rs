/**
 * CORRÉLATION COMMANDES/ACKS - Requête/réponse synchrone sur un flux asynchrone
 *
 * RÔLE :
 * Transforme le canal de contrôle (push) en appels "attendre CETTE réponse".
 *
 * FONCTIONNEMENT :
 * - `CommandRegistry` : command_id → slot de réponse oneshot (Mutex simple)
 * - `Dispatcher::dispatch` : fire-and-forget, succès = écrit sur le flux du nœud
 * - `Dispatcher::dispatch_and_wait` : enregistre le slot, envoie, attend l'ack
 *   ou le timeout ; le slot est retiré sur TOUS les chemins de sortie (succès,
 *   timeout, annulation du futur) via `PendingGuard`
 * - Ack tardif (plus de waiter) : ignoré
 *
 * NŒUD OFFLINE :
 * - dispatch → erreur `NodeOffline` immédiate
 * - dispatch_and_wait → attente bornée puis `Timeout { delivered: false }`,
 *   distinguable d'un timeout après livraison et d'un échec rapporté
 */

use crate::channel::NodeRegistry;
use hearth_protocol::{BackendCommand, CommandAck, FrameError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("node has no attached control channel")]
    NodeOffline,
    #[error("command {command_id} timed out (delivered: {delivered})")]
    Timeout { command_id: String, delivered: bool },
    #[error("command id {0} is already awaiting a reply")]
    DuplicateId(String),
    #[error("node reported failure: {0}")]
    Rejected(String),
    #[error("control channel write failed: {0}")]
    Transport(#[from] FrameError),
    #[error("command {0} was abandoned before a reply arrived")]
    Abandoned(String),
}

struct PendingCommand {
    generation: u64,
    node_token: String,
    reply: oneshot::Sender<CommandAck>,
    created_at: Instant,
}

/// Registre des commandes en attente d'ack
#[derive(Default)]
pub struct CommandRegistry {
    pending: Mutex<HashMap<String, PendingCommand>>,
    generation: AtomicU64,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, command_id: &str, node_token: &str) -> Result<(u64, oneshot::Receiver<CommandAck>), CommandError> {
        let (tx, rx) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock();
        if pending.contains_key(command_id) {
            return Err(CommandError::DuplicateId(command_id.to_string()));
        }
        pending.insert(
            command_id.to_string(),
            PendingCommand {
                generation,
                node_token: node_token.to_string(),
                reply: tx,
                created_at: Instant::now(),
            },
        );
        Ok((generation, rx))
    }

    /// Livre l'ack au waiter ; `false` si aucun waiter (ack tardif ou inconnu)
    pub fn resolve(&self, ack: CommandAck) -> bool {
        let entry = self.pending.lock().remove(&ack.command_id);
        match entry {
            Some(waiter) => {
                debug!(
                    "[commands] ack {} from node {} after {:?}",
                    ack.command_id,
                    short_token(&waiter.node_token),
                    waiter.created_at.elapsed()
                );
                let command_id = ack.command_id.clone();
                if waiter.reply.send(ack).is_err() {
                    debug!("[commands] waiter for {command_id} already gone");
                    return false;
                }
                true
            }
            None => {
                debug!("[commands] dropping ack for unknown command {}", ack.command_id);
                false
            }
        }
    }

    fn unregister(&self, command_id: &str, generation: u64) {
        let mut pending = self.pending.lock();
        if pending.get(command_id).is_some_and(|p| p.generation == generation) {
            pending.remove(command_id);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Retire l'enregistrement au drop : succès, timeout ou futur annulé
struct PendingGuard<'a> {
    registry: &'a CommandRegistry,
    command_id: String,
    generation: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.command_id, self.generation);
    }
}

/// Point d'entrée des couches opérateur vers les nœuds
#[derive(Clone)]
pub struct Dispatcher {
    nodes: Arc<NodeRegistry>,
    pending: Arc<CommandRegistry>,
}

impl Dispatcher {
    pub fn new(nodes: Arc<NodeRegistry>, pending: Arc<CommandRegistry>) -> Self {
        Self { nodes, pending }
    }

    /// Fire-and-forget : `Ok` signifie "écrit sur le flux", pas "exécuté"
    pub async fn dispatch(&self, node_token: &str, command: &BackendCommand) -> Result<(), CommandError> {
        self.nodes.send(node_token, command).await
    }

    /// Envoie et attend l'ack correspondant, au plus `timeout`
    pub async fn dispatch_and_wait(
        &self,
        node_token: &str,
        command: &BackendCommand,
        timeout: Duration,
    ) -> Result<CommandAck, CommandError> {
        let (generation, rx) = self.pending.register(&command.command_id, node_token)?;
        let _guard = PendingGuard {
            registry: &self.pending,
            command_id: command.command_id.clone(),
            generation,
        };

        let mut delivered = false;
        let exchange = async {
            match self.nodes.send(node_token, command).await {
                Ok(()) => delivered = true,
                Err(CommandError::NodeOffline) => {
                    debug!("[commands] {} queued for offline node, waiting out the timeout", command.command_id);
                }
                Err(e) => return Err(e),
            }
            rx.await.map_err(|_| CommandError::Abandoned(command.command_id.clone()))
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!("[commands] {} {} timed out after {:?}", command.kind, command.command_id, timeout);
                Err(CommandError::Timeout { command_id: command.command_id.clone(), delivered })
            }
        }
    }

    /// Comme `dispatch_and_wait`, un ack en échec devient `Rejected`
    pub async fn execute(
        &self,
        node_token: &str,
        command: &BackendCommand,
        timeout: Duration,
    ) -> Result<String, CommandError> {
        let ack = self.dispatch_and_wait(node_token, command, timeout).await?;
        if ack.success {
            Ok(ack.result)
        } else {
            Err(CommandError::Rejected(ack.error.unwrap_or_else(|| "unknown error".into())))
        }
    }

    pub fn pending(&self) -> &CommandRegistry {
        &self.pending
    }
}

pub(crate) fn short_token(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}
