/**
 * RÉCONCILIATION D'ÉTAT - Snapshots des nœuds → vue coordinateur
 *
 * RÔLE :
 * - `apply_sync` : upsert de chaque instance rapportée, puis balayage des
 *   instances du nœud absentes du snapshot (stopped + télémétrie à zéro)
 * - `sweep_liveness` : nœuds silencieux depuis la fenêtre de liveness → offline,
 *   puis cascade offline sur leurs instances
 *
 * GARANTIES :
 * Les deux phases sont idempotentes : rejouer le même snapshot donne le même
 * état, un crash entre upsert et balayage est corrigé par le snapshot suivant.
 * L'ordre par nœud est celui de sa boucle de réception (une seule par flux).
 */

use crate::store::FleetStore;
use hearth_protocol::InstanceSyncData;
use std::collections::HashSet;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub updated: usize,
    pub unknown: usize,
    pub stopped: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessOutcome {
    pub nodes_offline: Vec<String>,
    pub instances_offline: usize,
}

impl LivenessOutcome {
    pub fn changed(&self) -> bool {
        !self.nodes_offline.is_empty() || self.instances_offline > 0
    }
}

/// Applique un snapshot `sync` reçu du nœud identifié par `token`
pub fn apply_sync(store: &dyn FleetStore, token: &str, sync: &InstanceSyncData, now: OffsetDateTime) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();
    store.touch_node(token, now);

    let mut reported = HashSet::with_capacity(sync.instances.len());
    for report in &sync.instances {
        reported.insert(report.instance_id.clone());
        if store.apply_instance_report(token, report, now) {
            outcome.updated += 1;
        } else {
            outcome.unknown += 1;
        }
    }
    outcome.stopped = store.sweep_unreported(token, &reported, now);

    if outcome.stopped > 0 || outcome.unknown > 0 {
        debug!(
            "[reconcile] sync: {} updated, {} unknown, {} forced to stopped",
            outcome.updated, outcome.unknown, outcome.stopped
        );
    }
    outcome
}

pub fn sweep_liveness(store: &dyn FleetStore, now: OffsetDateTime, window: Duration) -> LivenessOutcome {
    let cutoff = now - window;
    let nodes_offline = store.mark_stale_nodes_offline(cutoff);
    for node_id in &nodes_offline {
        info!("[reconcile] node {node_id} silent for more than {}s, marked offline", window.as_secs());
    }
    let instances_offline = store.cascade_offline_instances();
    LivenessOutcome { nodes_offline, instances_offline }
}
