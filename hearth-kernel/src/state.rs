/**
 * ÉTAT DU KERNEL - Registres partagés, construits une seule fois au démarrage
 *
 * Chaque composant reçoit ses registres par handle (pas de singleton global) :
 * store, flux des nœuds (token → lien), commandes en attente, hub, santé.
 */

use crate::channel::NodeRegistry;
use crate::commands::{CommandRegistry, Dispatcher};
use crate::config::KernelConfig;
use crate::health::HealthTracker;
use crate::hub::Hub;
use crate::store::FleetStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct KernelState {
    pub config: Arc<KernelConfig>,
    pub store: Arc<dyn FleetStore>,
    pub nodes: Arc<NodeRegistry>,
    pub commands: Arc<CommandRegistry>,
    pub dispatcher: Dispatcher,
    pub hub: Arc<Hub>,
    pub health: HealthTracker,
}

impl KernelState {
    pub fn new(config: KernelConfig, store: Arc<dyn FleetStore>) -> Self {
        let nodes = Arc::new(NodeRegistry::new());
        let commands = Arc::new(CommandRegistry::new());
        let hub = Arc::new(Hub::with_limits(config.hub_buffer_size, config.subscriber_queue_depth));
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&nodes), Arc::clone(&commands)),
            config: Arc::new(config),
            store,
            nodes,
            commands,
            hub,
            health: HealthTracker::new(),
        }
    }
}
