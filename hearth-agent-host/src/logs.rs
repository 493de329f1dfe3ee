//! Per-instance log-stream sessions
//!
//! At most one session per instance: starting a new one cancels the previous
//! session first. Each session carries a generation so a finishing task never
//! unregisters its own replacement.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
pub struct LogSessions {
    sessions: Mutex<HashMap<String, (u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl LogSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session, cancelling any prior one for `instance_id`
    pub fn start(&self, instance_id: &str) -> (u64, CancellationToken) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let previous = self
            .sessions
            .lock()
            .insert(instance_id.to_string(), (generation, token.clone()));
        if let Some((_, old)) = previous {
            debug!("Replacing log session for {}", instance_id);
            old.cancel();
        }
        (generation, token)
    }

    /// Unregister a session that ended on its own
    pub fn finish(&self, instance_id: &str, generation: u64) {
        let mut sessions = self.sessions.lock();
        if sessions.get(instance_id).is_some_and(|(g, _)| *g == generation) {
            sessions.remove(instance_id);
        }
    }

    /// Cancel the session for `instance_id`; false when none was running
    pub fn stop(&self, instance_id: &str) -> bool {
        match self.sessions.lock().remove(instance_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, (_, token)) in self.sessions.lock().drain() {
            token.cancel();
        }
    }

    pub fn active(&self) -> usize {
        self.sessions.lock().len()
    }
}
