//! Control-channel client
//!
//! One outbound TCP stream to the kernel, re-established forever:
//! register first, then a reporter task (heartbeat + sync every interval,
//! the first one immediately) runs beside the command reader. Each command
//! gets its own task and answers with one ack. When the stream ends the
//! reporter and every log session are torn down before the backoff.

use crate::config::AgentConfig;
use crate::discovery::SystemInfo;
use crate::execution::CommandExecutor;
use crate::inventory::collect_reports;
use crate::metrics::collect_heartbeat;
use crate::runtime::ContainerRuntime;
use anyhow::{Context, Result};
use hearth_protocol::{
    frame_reader, read_message, AgentMessage, BackendCommand, FrameError, FrameReader, InstanceSyncData,
    SharedWriter,
};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Write side of the current stream, shared by every task that reports
#[derive(Clone)]
pub struct Outbox {
    writer: Arc<SharedWriter>,
}

impl Outbox {
    pub fn new(writer: SharedWriter) -> Self {
        Self { writer: Arc::new(writer) }
    }

    pub async fn send(&self, msg: &AgentMessage) -> Result<(), FrameError> {
        self.writer.send(msg).await
    }
}

pub struct Agent<R> {
    config: Arc<AgentConfig>,
    system: SystemInfo,
    executor: CommandExecutor<R>,
}

impl<R: ContainerRuntime> Agent<R> {
    pub fn new(config: Arc<AgentConfig>, system: SystemInfo, executor: CommandExecutor<R>) -> Self {
        Self { config, system, executor }
    }

    /// Reconnect loop; connectivity failures are never fatal
    pub async fn run_forever(&self) {
        loop {
            match self.run_session().await {
                Ok(()) => info!("Control stream closed by kernel"),
                Err(e) => warn!("Control stream failed: {:#}", e),
            }
            let backoff = self.config.reconnect_backoff();
            info!("Reconnecting in {:?}", backoff);
            sleep(backoff).await;
        }
    }

    /// One connection lifetime, from connect to stream end
    pub async fn run_session(&self) -> Result<()> {
        let addr = &self.config.backend_addr;
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to kernel at {addr}"))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        let outbox = Outbox::new(SharedWriter::new(write_half));
        let mut reader = frame_reader(read_half);

        let runtime_version = match self.executor.runtime().version().await {
            Ok(version) => version,
            Err(e) => {
                warn!("Container runtime version unavailable: {}", e);
                "unknown".to_string()
            }
        };
        let identity = self.system.node_info(&self.config, &runtime_version);
        outbox
            .send(&AgentMessage::Register(identity))
            .await
            .context("Failed to send register frame")?;
        info!("Registered with kernel at {} as {}", addr, self.config.node_name);

        let mut reporter = tokio::spawn(report_loop(
            self.config.clone(),
            self.executor.runtime().clone(),
            outbox.clone(),
        ));

        let result = tokio::select! {
            res = self.read_commands(&mut reader, &outbox) => res,
            res = &mut reporter => match res {
                Ok(res) => res,
                Err(e) => Err(anyhow::anyhow!("reporter task failed: {e}")),
            },
        };

        reporter.abort();
        self.executor.logs().cancel_all();
        result
    }

    async fn read_commands<S>(&self, reader: &mut FrameReader<S>, outbox: &Outbox) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            match read_message::<BackendCommand, _>(reader).await {
                Ok(Some(cmd)) => {
                    debug!("Received {} ({})", cmd.kind, cmd.command_id);
                    let executor = self.executor.clone();
                    let outbox = outbox.clone();
                    tokio::spawn(async move {
                        let ack = executor.handle(cmd, &outbox).await;
                        if let Err(e) = outbox.send(&AgentMessage::Ack(ack)).await {
                            error!("Failed to send ack: {}", e);
                        }
                    });
                }
                Ok(None) => return Ok(()),
                Err(e) if e.is_recoverable() => warn!("Skipping malformed command frame: {}", e),
                Err(e) => return Err(e).context("Control stream read failed"),
            }
        }
    }
}

/// Heartbeat then sync, every report interval; a listing failure skips the
/// sync so the kernel never sees an empty snapshot by mistake
async fn report_loop<R: ContainerRuntime>(config: Arc<AgentConfig>, runtime: Arc<R>, outbox: Outbox) -> Result<()> {
    let mut ticker = interval(config.report_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let heartbeat = collect_heartbeat(&config.node_token, &config.data_path).await;
        outbox
            .send(&AgentMessage::Heartbeat(heartbeat))
            .await
            .context("Failed to send heartbeat")?;

        match collect_reports(runtime.as_ref()).await {
            Ok(instances) => {
                debug!("Syncing {} instances", instances.len());
                let sync = InstanceSyncData { token: config.node_token.clone(), instances };
                outbox.send(&AgentMessage::Sync(sync)).await.context("Failed to send sync")?;
            }
            Err(e) => warn!("Skipping sync, container listing failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use hearth_protocol::{frame_writer, write_message, CommandKind, InstanceConfig, InstanceStatus};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn agent_against(listener: &TcpListener, runtime: FakeRuntime) -> (Arc<Agent<FakeRuntime>>, tempfile::TempDir) {
        let data = tempfile::tempdir().unwrap();
        let config = Arc::new(AgentConfig {
            backend_addr: listener.local_addr().unwrap().to_string(),
            node_token: "node-token".into(),
            node_name: "alpha".into(),
            data_path: data.path().to_path_buf(),
            report_interval_secs: 60,
            reconnect_backoff_secs: 0,
            ..AgentConfig::default()
        });
        let system = SystemInfo::discover().await;
        let executor = CommandExecutor::new(Arc::new(runtime), config.clone());
        (Arc::new(Agent::new(config, system, executor)), data)
    }

    async fn next_frame<S: AsyncRead + Unpin>(reader: &mut FrameReader<S>) -> AgentMessage {
        timeout(WAIT, read_message::<AgentMessage, _>(reader))
            .await
            .expect("frame in time")
            .unwrap()
            .expect("stream open")
    }

    #[tokio::test]
    async fn test_session_registers_reports_and_acks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let runtime = FakeRuntime::default();
        runtime.add_container("hearth-a", "a", "exited");
        let (agent, _data) = agent_against(&listener, runtime).await;
        let session = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run_session().await }
        });

        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = socket.into_split();
        let mut reader = frame_reader(read_half);
        let mut writer = frame_writer(write_half);

        let AgentMessage::Register(info) = next_frame(&mut reader).await else { panic!("expected register") };
        assert_eq!(info.token, "node-token");
        assert_eq!(info.runtime_version, "fake-1.0");

        assert!(matches!(next_frame(&mut reader).await, AgentMessage::Heartbeat(hb) if hb.token == "node-token"));
        let AgentMessage::Sync(sync) = next_frame(&mut reader).await else { panic!("expected sync") };
        assert_eq!(sync.instances.len(), 1);
        assert_eq!(sync.instances[0].status, InstanceStatus::Stopped);

        let start = BackendCommand::new(
            "cmd-1",
            CommandKind::Start,
            InstanceConfig { instance_id: "a".into(), ..Default::default() },
        );
        write_message(&mut writer, &start).await.unwrap();
        let AgentMessage::Ack(ack) = next_frame(&mut reader).await else { panic!("expected ack") };
        assert_eq!(ack.command_id, "cmd-1");
        assert!(ack.success);

        drop(writer);
        drop(reader);
        let result = timeout(WAIT, session).await.unwrap().unwrap();
        assert!(result.is_ok(), "clean close is not an error: {result:?}");
        assert_eq!(agent.executor.logs().active(), 0);
    }

    #[tokio::test]
    async fn test_listing_failure_skips_sync() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let runtime = FakeRuntime::default();
        *runtime.fail_listing.lock() = true;
        let (agent, _data) = agent_against(&listener, runtime).await;
        tokio::spawn({
            let agent = agent.clone();
            async move { agent.run_session().await }
        });

        let (socket, _) = listener.accept().await.unwrap();
        let mut reader = frame_reader(socket);
        assert!(matches!(next_frame(&mut reader).await, AgentMessage::Register(_)));
        assert!(matches!(next_frame(&mut reader).await, AgentMessage::Heartbeat(_)));
        // next report is a minute away, so nothing else arrives
        let nothing = timeout(Duration::from_millis(500), read_message::<AgentMessage, _>(&mut reader)).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_reconnects_after_kernel_drops_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (agent, _data) = agent_against(&listener, FakeRuntime::default()).await;
        let runner = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run_forever().await }
        });

        for _ in 0..2 {
            let (socket, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
            let mut reader = frame_reader(socket);
            assert!(matches!(next_frame(&mut reader).await, AgentMessage::Register(_)));
            drop(reader);
        }
        runner.abort();
    }
}
