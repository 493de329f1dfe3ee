//! Command execution for Hearth agents
//!
//! Turns each `BackendCommand` into container runtime, RCON, backup or
//! log-session work and answers with exactly one `CommandAck`:
//! - CREATE pulls the image once and retries when the runtime lacks it
//! - STOP / RESTART give the server a 30s grace period
//! - DELETE tolerates a missing container and drops per-instance clients
//! - RCON and the pre-backup `save` validate the instance's RCON config first

use crate::backup::{self, BackupError};
use crate::config::AgentConfig;
use crate::logs::LogSessions;
use crate::rcon::{RconError, RconPool};
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::transport::Outbox;
use hearth_protocol::{AgentMessage, BackendCommand, CommandAck, CommandKind, InstanceConfig, LogChunk};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const STOP_GRACE: Duration = Duration::from_secs(30);
const LOG_TAIL_LINES: usize = 200;
const LOG_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("command has no instance id")]
    MissingInstance,
    #[error("rcon is not configured for instance {0}")]
    RconNotConfigured(String),
    #[error("empty rcon command")]
    EmptyCommand,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("rcon: {0}")]
    Rcon(#[from] RconError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error("failed to prepare instance data: {0}")]
    Io(#[from] std::io::Error),
}

pub struct CommandExecutor<R> {
    runtime: Arc<R>,
    config: Arc<AgentConfig>,
    rcon: Arc<RconPool>,
    logs: Arc<LogSessions>,
}

impl<R> Clone for CommandExecutor<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            config: self.config.clone(),
            rcon: self.rcon.clone(),
            logs: self.logs.clone(),
        }
    }
}

impl<R: ContainerRuntime> CommandExecutor<R> {
    pub fn new(runtime: Arc<R>, config: Arc<AgentConfig>) -> Self {
        Self {
            runtime,
            config,
            rcon: Arc::new(RconPool::new()),
            logs: Arc::new(LogSessions::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn logs(&self) -> &LogSessions {
        &self.logs
    }

    /// Run one command; never fails, errors become a failed ack
    pub async fn handle(&self, cmd: BackendCommand, outbox: &Outbox) -> CommandAck {
        let start_time = Instant::now();
        info!("Executing {} for instance {} ({})", cmd.kind, cmd.instance_id(), cmd.command_id);

        let result = self.execute(&cmd, outbox).await;
        let elapsed = start_time.elapsed().as_millis();

        match result {
            Ok(output) => {
                debug!("{} {} done in {}ms", cmd.kind, cmd.command_id, elapsed);
                CommandAck::ok(cmd.command_id, output)
            }
            Err(e) => {
                warn!("{} {} failed after {}ms: {}", cmd.kind, cmd.command_id, elapsed, e);
                CommandAck::failed(cmd.command_id, e.to_string())
            }
        }
    }

    async fn execute(&self, cmd: &BackendCommand, outbox: &Outbox) -> Result<String, ExecError> {
        let instance = &cmd.config;
        let id = instance.instance_id.as_str();
        if id.is_empty() {
            return Err(ExecError::MissingInstance);
        }
        let name = self.config.container_name(id);

        match cmd.kind {
            CommandKind::Create => self.create(instance).await,
            CommandKind::Start => {
                self.runtime.start(&name).await?;
                Ok(format!("started {name}"))
            }
            CommandKind::Stop => {
                self.runtime.stop(&name, STOP_GRACE).await?;
                Ok(format!("stopped {name}"))
            }
            CommandKind::Restart => {
                self.runtime.restart(&name, STOP_GRACE).await?;
                Ok(format!("restarted {name}"))
            }
            CommandKind::Kill => {
                self.runtime.kill(&name).await?;
                Ok(format!("killed {name}"))
            }
            CommandKind::Delete => {
                self.runtime.remove(&name).await?;
                if let Some(client) = self.rcon.remove(id) {
                    client.close().await;
                }
                self.logs.stop(id);
                Ok(format!("deleted {name}"))
            }
            CommandKind::Rcon => {
                if cmd.payload.trim().is_empty() {
                    return Err(ExecError::EmptyCommand);
                }
                self.rcon_exec(instance, &cmd.payload).await
            }
            CommandKind::Backup => self.backup(instance).await,
            CommandKind::StreamLogsStart => {
                self.start_log_stream(id, name, outbox.clone());
                Ok("log stream started".to_string())
            }
            CommandKind::StreamLogsStop => {
                if !self.logs.stop(id) {
                    debug!("No log stream running for {}", id);
                }
                Ok("log stream stopped".to_string())
            }
        }
    }

    async fn create(&self, instance: &InstanceConfig) -> Result<String, ExecError> {
        let spec = ContainerSpec::for_instance(&self.config, instance);
        for (host_dir, _) in &spec.volumes {
            tokio::fs::create_dir_all(host_dir).await?;
        }

        match self.runtime.create(&spec).await {
            Err(RuntimeError::NoSuchImage(image)) => {
                info!("Image {} not present, pulling", image);
                self.runtime.pull(&spec.image).await?;
                self.runtime.create(&spec).await?;
            }
            other => other?,
        }
        self.runtime.start(&spec.name).await?;
        Ok(format!("created {}", spec.name))
    }

    async fn rcon_exec(&self, instance: &InstanceConfig, command: &str) -> Result<String, ExecError> {
        if !instance.rcon_configured() {
            return Err(ExecError::RconNotConfigured(instance.instance_id.clone()));
        }
        let addr = format!("{}:{}", self.config.node_address, instance.rcon_port);
        let client = self.rcon.client(&instance.instance_id, &addr, &instance.rcon_password);
        Ok(client.execute(command).await?)
    }

    async fn backup(&self, instance: &InstanceConfig) -> Result<String, ExecError> {
        // flush the world to disk first; the archive is still taken when this fails
        if instance.rcon_configured() {
            if let Err(e) = self.rcon_exec(instance, "save").await {
                warn!("Pre-backup save for {} failed: {}", instance.instance_id, e);
            }
        }
        let archive =
            backup::create_backup(&self.config.data_path, &self.config.backups_dir(), &instance.instance_id).await?;
        Ok(archive.ack_result())
    }

    fn start_log_stream(&self, instance_id: &str, name: String, outbox: Outbox) {
        let (generation, cancel) = self.logs.start(instance_id);
        let (tx, mut rx) = mpsc::channel::<String>(LOG_CHANNEL_DEPTH);

        let chunk_id = instance_id.to_string();
        tokio::spawn(async move {
            while let Some(content) = rx.recv().await {
                let chunk = LogChunk { instance_id: chunk_id.clone(), content };
                if outbox.send(&AgentMessage::Log(chunk)).await.is_err() {
                    break;
                }
            }
        });

        let runtime = self.runtime.clone();
        let logs = self.logs.clone();
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = runtime.stream_logs(&name, LOG_TAIL_LINES, cancel, tx).await {
                warn!("Log stream for {} ended: {}", instance_id, e);
            }
            logs.finish(&instance_id, generation);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::DEFAULT_IMAGE;
    use hearth_protocol::{frame_reader, read_message, FrameReader, SharedWriter};
    use tokio::io::DuplexStream;

    struct Harness {
        executor: CommandExecutor<FakeRuntime>,
        runtime: Arc<FakeRuntime>,
        outbox: Outbox,
        kernel_side: FrameReader<DuplexStream>,
        data: tempfile::TempDir,
    }

    fn harness(runtime: FakeRuntime) -> Harness {
        let data = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            node_token: "tok".into(),
            data_path: data.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let runtime = Arc::new(runtime);
        let (agent_side, kernel_side) = tokio::io::duplex(64 * 1024);
        Harness {
            executor: CommandExecutor::new(runtime.clone(), Arc::new(config)),
            runtime,
            outbox: Outbox::new(SharedWriter::new(agent_side)),
            kernel_side: frame_reader(kernel_side),
            data,
        }
    }

    fn command(kind: CommandKind, id: &str) -> BackendCommand {
        let config = InstanceConfig {
            instance_id: id.into(),
            name: "Vikings".into(),
            game_port: 2456,
            status_port: 6456,
            ..Default::default()
        };
        BackendCommand::new(format!("cmd-{id}"), kind, config)
    }

    #[tokio::test]
    async fn test_create_pulls_missing_image_once() {
        let h = harness(FakeRuntime::default());
        let ack = h.executor.handle(command(CommandKind::Create, "a"), &h.outbox).await;

        assert!(ack.success, "{:?}", ack.error);
        assert_eq!(ack.command_id, "cmd-a");
        assert_eq!(
            h.runtime.calls(),
            vec![
                "create hearth-a".to_string(),
                format!("pull {DEFAULT_IMAGE}"),
                "create hearth-a".to_string(),
                "start hearth-a".to_string(),
            ]
        );
        assert_eq!(h.runtime.state_of("hearth-a").as_deref(), Some("running"));
        assert!(h.data.path().join("a/config").is_dir());
    }

    #[tokio::test]
    async fn test_create_with_local_image_skips_pull() {
        let h = harness(FakeRuntime::with_images(&[DEFAULT_IMAGE]));
        let ack = h.executor.handle(command(CommandKind::Create, "a"), &h.outbox).await;
        assert!(ack.success);
        assert!(!h.runtime.calls().iter().any(|c| c.starts_with("pull")));
    }

    #[tokio::test]
    async fn test_lifecycle_commands() {
        let h = harness(FakeRuntime::default());
        h.runtime.add_container("hearth-a", "a", "exited");

        assert!(h.executor.handle(command(CommandKind::Start, "a"), &h.outbox).await.success);
        assert!(h.executor.handle(command(CommandKind::Stop, "a"), &h.outbox).await.success);
        assert!(h.executor.handle(command(CommandKind::Restart, "a"), &h.outbox).await.success);
        assert!(h.executor.handle(command(CommandKind::Kill, "a"), &h.outbox).await.success);

        let calls = h.runtime.calls();
        assert!(calls.contains(&"stop hearth-a 30".to_string()));
        assert!(calls.contains(&"restart hearth-a 30".to_string()));
        assert_eq!(h.runtime.state_of("hearth-a").as_deref(), Some("exited"));

        let ack = h.executor.handle(command(CommandKind::Start, "ghost"), &h.outbox).await;
        assert!(!ack.success);
        assert!(ack.error.unwrap().contains("hearth-ghost"));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_container() {
        let h = harness(FakeRuntime::default());
        let (_, session) = h.executor.logs().start("a");

        let ack = h.executor.handle(command(CommandKind::Delete, "a"), &h.outbox).await;
        assert!(ack.success);
        assert!(session.is_cancelled());
    }

    #[tokio::test]
    async fn test_rcon_requires_configuration() {
        let h = harness(FakeRuntime::default());
        let ack = h
            .executor
            .handle(command(CommandKind::Rcon, "a").with_payload("save"), &h.outbox)
            .await;
        assert!(!ack.success);
        assert_eq!(ack.error.as_deref(), Some("rcon is not configured for instance a"));

        let ack = h.executor.handle(command(CommandKind::Rcon, "a"), &h.outbox).await;
        assert_eq!(ack.error.as_deref(), Some("empty rcon command"));
    }

    #[tokio::test]
    async fn test_missing_instance_id_is_rejected() {
        let h = harness(FakeRuntime::default());
        let ack = h.executor.handle(command(CommandKind::Start, ""), &h.outbox).await;
        assert!(!ack.success);
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_backup_without_rcon_still_archives() {
        let h = harness(FakeRuntime::default());
        let worlds = h.data.path().join("a/config/worlds_local");
        std::fs::create_dir_all(&worlds).unwrap();
        std::fs::write(worlds.join("Midgard.fwl"), b"world").unwrap();

        let ack = h
            .executor
            .handle(command(CommandKind::Backup, "a").with_payload("auto"), &h.outbox)
            .await;
        assert!(ack.success, "{:?}", ack.error);
        let (path, size) = ack.result.rsplit_once('|').unwrap();
        assert!(path.contains("/backups/a-"));
        assert!(size.parse::<u64>().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_log_stream_forwards_lines_until_stopped() {
        let runtime = FakeRuntime::default();
        runtime.log_lines.lock().extend(["Game server connected".to_string(), "World saved".to_string()]);
        let mut h = harness(runtime);

        let ack = h.executor.handle(command(CommandKind::StreamLogsStart, "a"), &h.outbox).await;
        assert!(ack.success);

        for expected in ["Game server connected", "World saved"] {
            let msg: AgentMessage = read_message(&mut h.kernel_side).await.unwrap().unwrap();
            assert_eq!(msg, AgentMessage::Log(LogChunk { instance_id: "a".into(), content: expected.into() }));
        }
        assert_eq!(h.executor.logs().active(), 1);

        let ack = h.executor.handle(command(CommandKind::StreamLogsStop, "a"), &h.outbox).await;
        assert!(ack.success);
        assert_eq!(h.executor.logs().active(), 0);
    }
}
