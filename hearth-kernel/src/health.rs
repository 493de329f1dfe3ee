use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tracing::debug;

use crate::state::KernelState;

pub const HEALTH_TOPIC: &str = "kernel/health";

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub nodes_known: u32,
    pub nodes_connected: u32,
    pub instances: u32,
    pub pending_commands: u32,
    pub topics: u32,
    pub streams_accepted: u32,
    pub streams_superseded: u32,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    streams_accepted: Arc<AtomicU32>,
    streams_superseded: Arc<AtomicU32>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            streams_accepted: Arc::new(AtomicU32::new(0)),
            streams_superseded: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn stream_accepted(&self) {
        self.streams_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_superseded(&self) {
        self.streams_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_health(&self, state: &KernelState) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            nodes_known: state.store.list_nodes().len() as u32,
            nodes_connected: state.nodes.connected_count() as u32,
            instances: state.store.list_instances(None).len() as u32,
            pending_commands: state.commands.len() as u32,
            topics: state.hub.topic_count() as u32,
            streams_accepted: self.streams_accepted.load(Ordering::Relaxed),
            streams_superseded: self.streams_superseded.load(Ordering::Relaxed),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }

    /// Démarre la publication auto du health kernel sur le hub
    pub fn spawn_health_publisher(&self, state: KernelState) {
        let health_tracker = self.clone();

        task::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let health = health_tracker.get_health(&state);
                match serde_json::to_value(&health) {
                    Ok(data) => {
                        state.hub.publish(HEALTH_TOPIC, "kernel_health", data);
                        debug!(
                            "[health] published kernel health (uptime: {}s, nodes: {}/{})",
                            health.uptime_seconds, health.nodes_connected, health.nodes_known
                        );
                    }
                    Err(e) => debug!("[health] failed to serialize: {e}"),
                }
            }
        });
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb_str.parse::<u64>() {
                            return (kb as f32) / 1024.0; // KB -> MB
                        }
                    }
                }
            }
        }
    }

    0.0
}
