/**
 * MONITEUR DE FLOTTE - Liveness périodique + diffusion temps réel
 *
 * RÔLE :
 * - Toutes les 5s : balayage de liveness (nœuds silencieux > 30s → offline,
 *   cascade sur leurs instances, flux encore attaché fermé) puis snapshot
 *   "full_sync" sur le topic "monitor"
 * - Republie chaque trame de log d'agent en "log_chunk" sur "logs/<instance>"
 * - Persiste le store quand l'état structurel change (et périodiquement)
 */

use crate::hub::Hub;
use crate::reconcile::sweep_liveness;
use crate::state::KernelState;
use crate::store::FleetStore;
use hearth_protocol::LogChunk;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const MONITOR_TOPIC: &str = "monitor";
pub const FULL_SYNC: &str = "full_sync";
pub const LOG_CHUNK: &str = "log_chunk";

/// Flush du store au moins toutes les N itérations (métriques des heartbeats)
const FLUSH_EVERY_TICKS: u64 = 12;

pub fn logs_topic(instance_id: &str) -> String {
    format!("logs/{instance_id}")
}

pub fn publish_log_chunk(hub: &Hub, chunk: &LogChunk) -> u64 {
    hub.publish(
        &logs_topic(&chunk.instance_id),
        LOG_CHUNK,
        json!({ "instance_id": chunk.instance_id, "content": chunk.content }),
    )
}

/// Vue complète de la flotte (sans tokens ni mots de passe)
pub fn fleet_snapshot(store: &dyn FleetStore) -> Value {
    let nodes: Vec<_> = store.list_nodes().iter().map(|n| n.view()).collect();
    let instances: Vec<_> = store.list_instances(None).iter().map(|i| i.view()).collect();
    json!({ "nodes": nodes, "instances": instances })
}

/// Une itération du moniteur ; retourne le seq publié sur "monitor"
pub fn monitor_tick(state: &KernelState, now: OffsetDateTime) -> (bool, u64) {
    let outcome = sweep_liveness(state.store.as_ref(), now, state.config.liveness_window());
    for node_id in &outcome.nodes_offline {
        // un nœud silencieux mais encore attaché ne doit plus recevoir de commandes
        let link = state.store.node(node_id).and_then(|n| state.nodes.get(&n.token));
        if let Some(link) = link {
            info!("[monitor] closing stream {} of silent node {node_id}", link.id());
            link.close();
        }
    }
    if outcome.changed() {
        info!(
            "[monitor] {} node(s) and {} instance(s) went offline",
            outcome.nodes_offline.len(),
            outcome.instances_offline
        );
    }
    let seq = state.hub.publish(MONITOR_TOPIC, FULL_SYNC, fleet_snapshot(state.store.as_ref()));
    (outcome.changed(), seq)
}

pub fn spawn_monitor(state: KernelState) -> JoinHandle<()> {
    let period = state.config.sweep_interval();
    info!("[monitor] starting fleet monitor (every {}s)", period.as_secs());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        let mut ticks: u64 = 0;
        loop {
            interval.tick().await;
            ticks += 1;
            let (changed, _) = monitor_tick(&state, OffsetDateTime::now_utc());
            if changed || ticks % FLUSH_EVERY_TICKS == 0 {
                if let Err(e) = state.store.flush() {
                    warn!("[monitor] failed to persist fleet: {e}");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::channel::NodeLink;
    use crate::hub::Envelope;
    use crate::store::MemoryStore;
    use hearth_protocol::NodeInfo;
    use std::sync::Arc;

    #[test]
    fn log_chunks_land_on_the_instance_topic() {
        let hub = Hub::new();
        let mut sub = hub.subscribe("logs/i-1", 0);
        publish_log_chunk(&hub, &LogChunk { instance_id: "i-1".into(), content: "Game server connected".into() });

        let env: Envelope = serde_json::from_str(&sub.try_recv().unwrap().payload).unwrap();
        assert_eq!(env.kind, "log_chunk");
        assert_eq!(env.data["content"], "Game server connected");
        assert_eq!(env.data["instance_id"], "i-1");
    }

    #[test]
    fn tick_publishes_snapshot_without_tokens() {
        let store = Arc::new(MemoryStore::new());
        let node = store.create_node("alpha", "10.0.0.1").unwrap();
        let state = KernelState::new(KernelConfig::default(), store.clone());
        let mut sub = state.hub.subscribe(MONITOR_TOPIC, 0);

        let (_, seq) = monitor_tick(&state, OffsetDateTime::now_utc());
        assert_eq!(seq, 1);
        let payload = sub.try_recv().unwrap().payload;
        assert!(!payload.contains(&node.token));
        let env: Envelope = serde_json::from_str(&payload).unwrap();
        assert_eq!(env.kind, "full_sync");
        assert_eq!(env.data["nodes"][0]["name"], "alpha");
    }

    #[test]
    fn tick_reports_liveness_changes() {
        let store = Arc::new(MemoryStore::new());
        let node = store.create_node("alpha", "10.0.0.1").unwrap();
        let now = OffsetDateTime::now_utc();
        store
            .mark_node_online(&NodeInfo { token: node.token.clone(), ..Default::default() }, now)
            .unwrap();
        let state = KernelState::new(KernelConfig::default(), store.clone());

        assert!(!monitor_tick(&state, now + time::Duration::seconds(5)).0);
        assert!(monitor_tick(&state, now + time::Duration::seconds(45)).0);
    }

    #[tokio::test]
    async fn silent_node_link_is_closed_by_sweep() {
        let store = Arc::new(MemoryStore::new());
        let node = store.create_node("alpha", "10.0.0.1").unwrap();
        let now = OffsetDateTime::now_utc();
        store
            .mark_node_online(&NodeInfo { token: node.token.clone(), ..Default::default() }, now)
            .unwrap();
        let state = KernelState::new(KernelConfig::default(), store.clone());
        let (ours, _theirs) = tokio::io::duplex(1024);
        let link = Arc::new(NodeLink::new(state.nodes.next_link_id(), "test", ours));
        state.nodes.attach(&node.token, Arc::clone(&link));

        monitor_tick(&state, now + time::Duration::seconds(5));
        assert!(!link.is_closed());

        monitor_tick(&state, now + time::Duration::seconds(45));
        assert!(link.is_closed());
    }
}
