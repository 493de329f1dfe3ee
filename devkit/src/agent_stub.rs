/*!
Agent simulé pour tester le kernel sans Docker ni vrai nœud

Ouvre un vrai flux TCP vers le canal de contrôle, envoie des trames
`AgentMessage` choisies par le test et enregistre les commandes reçues.
*/

use anyhow::{anyhow, Result};
use hearth_protocol::{
    frame_reader, frame_writer, read_message, write_message, AgentMessage, BackendCommand, CommandAck,
    FrameReader, FrameWriter, HeartbeatData, InstanceReport, InstanceStatus, InstanceSyncData, LogChunk, NodeInfo,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Identité minimale d'un nœud de test
pub fn node_info(token: &str, name: &str) -> NodeInfo {
    NodeInfo {
        token: token.to_string(),
        name: name.to_string(),
        address: "127.0.0.1".to_string(),
        os_info: "linux (mock)".to_string(),
        kernel_version: "6.0.0-mock".to_string(),
        runtime_version: "mock 1.0".to_string(),
        hostname: name.to_string(),
    }
}

/// Rapport `running` avec de la télémétrie plausible
pub fn running_report(instance_id: &str, players: u32) -> InstanceReport {
    let mut report = InstanceReport::new(instance_id, InstanceStatus::Running);
    report.runtime_status = "running".to_string();
    report.cpu_percent = 35.0;
    report.mem_bytes = 2 * 1024 * 1024 * 1024;
    report.uptime_secs = 600;
    report.player_count = players;
    report.max_players = 10;
    report.game_version = "0.218.15".to_string();
    report
}

pub struct MockAgent {
    token: String,
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    received: Vec<BackendCommand>,
}

impl MockAgent {
    /// Connexion brute, sans trame d'identification
    pub async fn connect(addr: SocketAddr, token: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        log::info!("🔌 [MOCK] agent {} connected to {}", token, addr);
        Ok(Self {
            token: token.to_string(),
            reader: frame_reader(read_half),
            writer: frame_writer(write_half),
            received: Vec::new(),
        })
    }

    /// Connexion suivie d'un `register`
    pub async fn connect_registered(addr: SocketAddr, token: &str, name: &str) -> Result<Self> {
        let mut agent = Self::connect(addr, token).await?;
        agent.register(name).await?;
        Ok(agent)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn send(&mut self, msg: &AgentMessage) -> Result<()> {
        write_message(&mut self.writer, msg).await?;
        log::debug!("📤 [MOCK] {} sent {}", self.token, msg.kind());
        Ok(())
    }

    pub async fn register(&mut self, name: &str) -> Result<()> {
        let info = node_info(&self.token, name);
        self.send(&AgentMessage::Register(info)).await
    }

    pub async fn heartbeat(&mut self) -> Result<()> {
        let data = HeartbeatData {
            token: self.token.clone(),
            cpu_usage: 12.5,
            mem_usage: 40.0,
            disk_free: 50 * 1024 * 1024 * 1024,
            disk_total: 100 * 1024 * 1024 * 1024,
            uptime_secs: 3600,
        };
        self.send(&AgentMessage::Heartbeat(data)).await
    }

    pub async fn sync(&mut self, instances: Vec<InstanceReport>) -> Result<()> {
        let data = InstanceSyncData { token: self.token.clone(), instances };
        self.send(&AgentMessage::Sync(data)).await
    }

    pub async fn log(&mut self, instance_id: &str, content: &str) -> Result<()> {
        let chunk = LogChunk { instance_id: instance_id.to_string(), content: content.to_string() };
        self.send(&AgentMessage::Log(chunk)).await
    }

    pub async fn ack(&mut self, ack: CommandAck) -> Result<()> {
        self.send(&AgentMessage::Ack(ack)).await
    }

    /// Prochaine commande ; `None` si le kernel a fermé le flux
    pub async fn next_command(&mut self, wait: Duration) -> Result<Option<BackendCommand>> {
        let frame = timeout(wait, read_message::<BackendCommand, _>(&mut self.reader))
            .await
            .map_err(|_| anyhow!("no command within {:?}", wait))??;
        if let Some(cmd) = &frame {
            log::debug!("📥 [MOCK] {} received {} {}", self.token, cmd.kind, cmd.command_id);
            self.received.push(cmd.clone());
        }
        Ok(frame)
    }

    /// Comme `next_command`, mais un flux fermé est une erreur
    pub async fn expect_command(&mut self, wait: Duration) -> Result<BackendCommand> {
        self.next_command(wait)
            .await?
            .ok_or_else(|| anyhow!("control stream closed by kernel"))
    }

    /// Vrai si le kernel ferme le flux dans le délai (les commandes reçues entre-temps sont gardées)
    pub async fn closed_by_kernel(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(left, read_message::<BackendCommand, _>(&mut self.reader)).await {
                Ok(Ok(Some(cmd))) => self.received.push(cmd),
                Ok(Ok(None)) | Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }

    pub fn received_commands(&self) -> &[BackendCommand] {
        &self.received
    }

    /// Répond à chaque commande avec `handler` jusqu'à fermeture du flux.
    /// Retourne les commandes traitées.
    pub fn spawn_responder<F>(mut self, mut handler: F) -> JoinHandle<Vec<BackendCommand>>
    where
        F: FnMut(&BackendCommand) -> Option<CommandAck> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Ok(Some(cmd)) = read_message::<BackendCommand, _>(&mut self.reader).await {
                self.received.push(cmd.clone());
                if let Some(ack) = handler(&cmd) {
                    if self.ack(ack).await.is_err() {
                        break;
                    }
                }
            }
            self.received
        })
    }
}
