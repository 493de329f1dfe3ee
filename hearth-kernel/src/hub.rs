/**
 * HUB DE DIFFUSION - Pub/sub par topic avec historique borné et rattrapage
 *
 * RÔLE :
 * Pousse l'état de la flotte ("monitor") et les logs ("logs/<instance>") vers
 * les abonnés WebSocket, et permet à un abonné qui se reconnecte de rattraper
 * les messages manqués via `last_seen_seq`.
 *
 * FONCTIONNEMENT :
 * - Topic = compteur seq strictement croissant + ring buffer (256) + abonnés
 * - publish : seq suivant, ajout au buffer (éviction du plus ancien), envoi
 *   non bloquant (try_send) vers chaque abonné ; file pleine = message perdu
 *   pour cet abonné, jamais de backpressure sur l'éditeur
 * - subscribe : replay des messages seq > last_seen_seq puis flux live, sans
 *   doublon ni trou entre les deux ; un trou au-delà du buffer est signalé (Gap)
 *
 * VERROUS : historique (Mutex) puis abonnés (RwLock), toujours dans cet ordre.
 * Aucun verrou n'est tenu pendant un envoi réseau.
 */

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_BUFFER_SIZE: usize = 256;
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Enveloppe publiée : `{type, seq, data, ts}` (ts en millisecondes)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub seq: u64,
    pub data: Value,
    pub ts: i64,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, seq: u64, data: Value) -> Self {
        Self { kind: kind.into(), seq, data, ts: now_millis() }
    }
}

/// Message publié, sérialisé une seule fois et partagé entre abonnés
#[derive(Debug, Clone)]
pub struct Published {
    pub seq: u64,
    pub payload: Arc<str>,
}

/// Rattrapage impossible : les messages entre `requested_after` et
/// `oldest_available` ont été évincés (ou le topic a redémarré)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub requested_after: u64,
    pub oldest_available: u64,
}

impl Gap {
    /// Enveloppe de contrôle envoyée avant le backlog
    pub fn resync_envelope(&self) -> Envelope {
        Envelope::new(
            "resync",
            0,
            serde_json::json!({
                "requested_after": self.requested_after,
                "oldest_available": self.oldest_available,
            }),
        )
    }
}

struct History {
    seq: u64,
    buffer: VecDeque<Published>,
}

pub struct Topic {
    name: String,
    history: Mutex<History>,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Published>>>,
    next_subscriber: AtomicU64,
    buffer_size: usize,
    queue_depth: usize,
}

impl Topic {
    fn new(name: &str, buffer_size: usize, queue_depth: usize) -> Self {
        Self {
            name: name.to_string(),
            history: Mutex::new(History { seq: 0, buffer: VecDeque::with_capacity(buffer_size) }),
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_seq(&self) -> u64 {
        self.history.lock().seq
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn buffered(&self) -> usize {
        self.history.lock().buffer.len()
    }

    pub fn publish(&self, kind: &str, data: Value) -> u64 {
        let mut history = self.history.lock();
        let seq = history.seq + 1;
        let envelope = Envelope::new(kind, seq, data);
        let payload: Arc<str> = match serde_json::to_string(&envelope) {
            Ok(json) => json.into(),
            Err(e) => {
                debug!("[hub] {}: unserializable message dropped: {e}", self.name);
                return history.seq;
            }
        };
        history.seq = seq;
        if history.buffer.len() >= self.buffer_size {
            history.buffer.pop_front();
        }
        let message = Published { seq, payload };
        history.buffer.push_back(message.clone());

        let subscribers = self.subscribers.read();
        for (id, tx) in subscribers.iter() {
            if tx.try_send(message.clone()).is_err() {
                debug!("[hub] {}: subscriber {id} lagging, message {seq} dropped", self.name);
            }
        }
        seq
    }

    fn subscribe(self: &Arc<Self>, last_seen_seq: u64) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let history = self.history.lock();
        let mut gap = None;
        let mut backlog = Vec::new();
        if last_seen_seq > 0 {
            let oldest_available = history.buffer.front().map_or(history.seq + 1, |m| m.seq);
            if last_seen_seq > history.seq || last_seen_seq + 1 < oldest_available {
                gap = Some(Gap { requested_after: last_seen_seq, oldest_available });
            }
            if last_seen_seq <= history.seq {
                backlog = history
                    .buffer
                    .iter()
                    .filter(|m| m.seq > last_seen_seq)
                    .cloned()
                    .collect();
            }
        }
        self.subscribers.write().insert(id, tx);
        drop(history);

        Subscription { id, topic: Arc::clone(self), backlog, gap, receiver: rx }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.write().remove(&id);
    }
}

/// Registre des topics, construit une fois au démarrage du kernel
pub struct Hub {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    buffer_size: usize,
    queue_depth: usize,
}

impl Hub {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_BUFFER_SIZE, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_limits(buffer_size: usize, queue_depth: usize) -> Self {
        Self { topics: RwLock::new(HashMap::new()), buffer_size, queue_depth }
    }

    /// Idempotent, sûr sous premier accès concurrent
    pub fn get_or_create_topic(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.read().get(name) {
            return Arc::clone(topic);
        }
        let mut topics = self.topics.write();
        Arc::clone(
            topics
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Topic::new(name, self.buffer_size, self.queue_depth))),
        )
    }

    pub fn publish(&self, topic: &str, kind: &str, data: Value) -> u64 {
        self.get_or_create_topic(topic).publish(kind, data)
    }

    pub fn subscribe(&self, topic: &str, last_seen_seq: u64) -> Subscription {
        self.get_or_create_topic(topic).subscribe(last_seen_seq)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Abonnement actif ; se désinscrit au drop
pub struct Subscription {
    id: u64,
    topic: Arc<Topic>,
    backlog: Vec<Published>,
    gap: Option<Gap>,
    receiver: mpsc::Receiver<Published>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn gap(&self) -> Option<Gap> {
        self.gap
    }

    /// Messages bufferisés seq > last_seen_seq, en ordre, à envoyer avant le live
    pub fn take_backlog(&mut self) -> Vec<Published> {
        std::mem::take(&mut self.backlog)
    }

    pub async fn recv(&mut self) -> Option<Published> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Published> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.topic.unsubscribe(self.id);
    }
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn seqs(messages: &[Published]) -> Vec<u64> {
        messages.iter().map(|m| m.seq).collect()
    }

    #[test]
    fn envelope_wire_shape() {
        let hub = Hub::new();
        let mut sub = hub.subscribe("monitor", 0);
        hub.publish("monitor", "full_sync", json!({"nodes": []}));

        let msg = sub.try_recv().unwrap();
        let env: Envelope = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(env.kind, "full_sync");
        assert_eq!(env.seq, 1);
        assert_eq!(env.data, json!({"nodes": []}));
        let raw: Value = serde_json::from_str(&msg.payload).unwrap();
        assert!(raw.get("type").is_some());
        assert!(raw["ts"].as_i64().unwrap() > 0);
    }

    #[test]
    fn buffer_evicts_oldest_first() {
        let hub = Hub::with_limits(4, 8);
        for i in 0..10 {
            hub.publish("t", "m", json!(i));
        }
        let topic = hub.get_or_create_topic("t");
        assert_eq!(topic.buffered(), 4);
        assert_eq!(topic.last_seq(), 10);

        let mut sub = hub.subscribe("t", 6);
        assert_eq!(sub.gap(), None);
        assert_eq!(seqs(&sub.take_backlog()), vec![7, 8, 9, 10]);
    }

    #[test]
    fn gap_beyond_buffer_is_signalled() {
        let hub = Hub::with_limits(4, 8);
        for i in 0..10 {
            hub.publish("t", "m", json!(i));
        }
        let mut sub = hub.subscribe("t", 2);
        assert_eq!(sub.gap(), Some(Gap { requested_after: 2, oldest_available: 7 }));
        assert_eq!(seqs(&sub.take_backlog()), vec![7, 8, 9, 10]);

        let resync = sub.gap().unwrap().resync_envelope();
        assert_eq!(resync.kind, "resync");
        assert_eq!(resync.data["oldest_available"], 7);
    }

    #[test]
    fn seq_from_a_previous_run_requires_resync() {
        let hub = Hub::new();
        hub.publish("t", "m", json!(1));
        let mut sub = hub.subscribe("t", 500);
        assert_eq!(sub.gap(), Some(Gap { requested_after: 500, oldest_available: 1 }));
        assert!(sub.take_backlog().is_empty());
    }

    #[test]
    fn backlog_precedes_live_messages_without_duplicates() {
        let hub = Hub::new();
        for i in 0..5 {
            hub.publish("t", "m", json!(i));
        }
        let mut sub = hub.subscribe("t", 3);
        hub.publish("t", "m", json!(5));

        let mut delivered = seqs(&sub.take_backlog());
        while let Some(msg) = sub.try_recv() {
            delivered.push(msg.seq);
        }
        assert_eq!(delivered, vec![4, 5, 6]);
    }

    #[test]
    fn full_subscriber_queue_drops_without_blocking() {
        let hub = Hub::with_limits(16, 2);
        let mut slow = hub.subscribe("t", 0);
        for i in 0..5 {
            hub.publish("t", "m", json!(i));
        }
        assert_eq!(slow.try_recv().unwrap().seq, 1);
        assert_eq!(slow.try_recv().unwrap().seq, 2);
        assert!(slow.try_recv().is_none());

        hub.publish("t", "m", json!("later"));
        assert_eq!(slow.try_recv().unwrap().seq, 6);
    }

    #[test]
    fn dropping_a_subscription_unsubscribes() {
        let hub = Hub::new();
        let topic = hub.get_or_create_topic("t");
        let sub = hub.subscribe("t", 0);
        assert_eq!(topic.subscriber_count(), 1);
        drop(sub);
        assert_eq!(topic.subscriber_count(), 0);
        assert_eq!(hub.topic_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishers_get_unique_increasing_seqs() {
        let hub = Arc::new(Hub::with_limits(1024, 1024));
        let mut sub = hub.subscribe("t", 0);

        let mut tasks = Vec::new();
        for p in 0..8 {
            let hub = Arc::clone(&hub);
            tasks.push(tokio::spawn(async move {
                (0..100).map(|i| hub.publish("t", "m", json!([p, i]))).collect::<Vec<u64>>()
            }));
        }
        let mut all = HashSet::new();
        for task in tasks {
            let issued = task.await.unwrap();
            assert!(issued.windows(2).all(|w| w[0] < w[1]));
            all.extend(issued);
        }
        assert_eq!(all.len(), 800);
        assert_eq!(hub.get_or_create_topic("t").last_seq(), 800);

        let mut last = 0;
        while let Some(msg) = sub.try_recv() {
            assert!(msg.seq > last);
            last = msg.seq;
        }
        assert_eq!(last, 800);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn get_or_create_is_idempotent_under_races() {
        let hub = Arc::new(Hub::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let hub = Arc::clone(&hub);
            tasks.push(tokio::spawn(async move { hub.get_or_create_topic("race") }));
        }
        let first = hub.get_or_create_topic("race");
        for task in tasks {
            assert!(Arc::ptr_eq(&first, &task.await.unwrap()));
        }
        assert_eq!(hub.topic_count(), 1);
    }
}
