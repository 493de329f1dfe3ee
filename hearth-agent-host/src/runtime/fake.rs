//! In-memory `ContainerRuntime` for unit tests

use super::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerStats, ContainerSummary, RuntimeError, QUERY_PORT_KEY,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub instance_id: String,
    pub state: String,
    pub query_port: Option<u16>,
    pub stats: ContainerStats,
}

#[derive(Default)]
pub struct FakeRuntime {
    pub containers: Mutex<HashMap<String, FakeContainer>>,
    pub images: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<String>>,
    pub log_lines: Mutex<Vec<String>>,
    pub fail_listing: Mutex<bool>,
}

impl FakeRuntime {
    pub fn with_images(images: &[&str]) -> Self {
        let runtime = Self::default();
        runtime.images.lock().extend(images.iter().map(|s| s.to_string()));
        runtime
    }

    pub fn add_container(&self, name: &str, instance_id: &str, state: &str) {
        self.containers.lock().insert(
            name.to_string(),
            FakeContainer {
                instance_id: instance_id.to_string(),
                state: state.to_string(),
                query_port: None,
                stats: ContainerStats::default(),
            },
        );
    }

    pub fn state_of(&self, name: &str) -> Option<String> {
        self.containers.lock().get(name).map(|c| c.state.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn set_state(&self, name: &str, state: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock();
        let container = containers.get_mut(name).ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        container.state = state.to_string();
        Ok(())
    }
}

impl ContainerRuntime for FakeRuntime {
    async fn version(&self) -> Result<String, RuntimeError> {
        Ok("fake-1.0".to_string())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.record(format!("create {}", spec.name));
        if !self.images.lock().contains(&spec.image) {
            return Err(RuntimeError::NoSuchImage(spec.image.clone()));
        }
        let instance_id = spec.labels.first().map(|(_, v)| v.clone()).unwrap_or_default();
        self.add_container(&spec.name, &instance_id, "created");
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.record(format!("pull {image}"));
        self.images.lock().insert(image.to_string());
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("start {name}"));
        self.set_state(name, "running")
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.record(format!("stop {name} {}", grace.as_secs()));
        self.set_state(name, "exited")
    }

    async fn restart(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.record(format!("restart {name} {}", grace.as_secs()));
        self.set_state(name, "running")
    }

    async fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("kill {name}"));
        self.set_state(name, "exited")
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("rm {name}"));
        self.containers.lock().remove(name);
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        if *self.fail_listing.lock() {
            return Err(RuntimeError::Command { op: "ps", stderr: "daemon unavailable".into() });
        }
        let mut list: Vec<_> = self
            .containers
            .lock()
            .iter()
            .map(|(name, c)| ContainerSummary {
                instance_id: c.instance_id.clone(),
                name: name.clone(),
                state: c.state.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn inspect(&self, name: &str) -> Result<ContainerDetails, RuntimeError> {
        let containers = self.containers.lock();
        let container = containers.get(name).ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        let running = container.state == "running";
        Ok(ContainerDetails {
            status: container.state.clone(),
            running,
            started_at: running.then(|| chrono::Utc::now() - chrono::Duration::seconds(60)),
            host_ports: container
                .query_port
                .map(|p| HashMap::from([(QUERY_PORT_KEY.to_string(), p)]))
                .unwrap_or_default(),
        })
    }

    async fn stats(&self, name: &str) -> Result<ContainerStats, RuntimeError> {
        let containers = self.containers.lock();
        containers.get(name).map(|c| c.stats).ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn stream_logs(
        &self,
        name: &str,
        _tail: usize,
        cancel: CancellationToken,
        lines: mpsc::Sender<String>,
    ) -> Result<(), RuntimeError> {
        self.record(format!("logs {name}"));
        let backlog = self.log_lines.lock().clone();
        for line in backlog {
            if lines.send(line).await.is_err() {
                return Ok(());
            }
        }
        cancel.cancelled().await;
        Ok(())
    }
}
