//! Source RCON client for game-server consoles
//!
//! One lazily-established, authenticated TCP connection per instance:
//! - Packet: LE `i32` size (id + type + body + 2 NULs), `i32` id, `i32` type, body, `\0\0`
//! - Auth (type 3) on first use; a reply of any other type than 2 fails auth
//! - Calls on one client are serialized by its connection lock
//! - Any error drops the connection; the next call re-authenticates
//! - A reused connection found dead on first use is redialled once; a timeout
//!   or a bad reply is never retried, the command may already have run

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const PACKET_AUTH: i32 = 3;
pub const PACKET_EXEC_COMMAND: i32 = 2;
pub const PACKET_AUTH_RESPONSE: i32 = 2;
pub const PACKET_RESPONSE_VALUE: i32 = 0;

const REQUEST_ID: i32 = 1;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const IO_TIMEOUT: Duration = Duration::from_secs(10);
/// id + type + two NULs
const MIN_PACKET_SIZE: i32 = 10;
const MAX_PACKET_SIZE: i32 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RconError {
    #[error("rcon connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("rcon connection to {0} timed out")]
    Timeout(String),
    #[error("rcon authentication failed")]
    AuthFailed,
    #[error("rcon protocol error: {0}")]
    Protocol(String),
}

impl RconError {
    /// The peer had already dropped the socket, so the command never ran
    fn is_stale_connection(&self) -> bool {
        match self {
            RconError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self { id, kind, body: body.into() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let size = body.len() as i32 + MIN_PACKET_SIZE;
        let mut buf = Vec::with_capacity(size as usize + 4);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    /// Decode the part after the size prefix; trailing NULs are trimmed from the body
    pub fn decode(frame: &[u8]) -> Result<Self, RconError> {
        if frame.len() < MIN_PACKET_SIZE as usize {
            return Err(RconError::Protocol(format!("packet too short ({} bytes)", frame.len())));
        }
        let id = i32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let kind = i32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let body = String::from_utf8_lossy(&frame[8..]).trim_end_matches('\0').to_string();
        Ok(Self { id, kind, body })
    }
}

async fn write_packet(stream: &mut TcpStream, packet: &Packet) -> Result<(), RconError> {
    stream.write_all(&packet.encode()).await?;
    Ok(())
}

async fn read_packet(stream: &mut TcpStream) -> Result<Packet, RconError> {
    let size = stream.read_i32_le().await?;
    if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        return Err(RconError::Protocol(format!("invalid packet size {size}")));
    }
    let mut frame = vec![0u8; size as usize];
    stream.read_exact(&mut frame).await?;
    Packet::decode(&frame)
}

/// Persistent, authenticated console connection to one game server
pub struct RconClient {
    addr: String,
    password: String,
    io_timeout: Duration,
    conn: AsyncMutex<Option<TcpStream>>,
}

impl RconClient {
    pub fn new(addr: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            password: password.into(),
            io_timeout: IO_TIMEOUT,
            conn: AsyncMutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn matches(&self, addr: &str, password: &str) -> bool {
        self.addr == addr && self.password == password
    }

    /// Run one console command and return its textual reply
    pub async fn execute(&self, command: &str) -> Result<String, RconError> {
        let mut conn = self.conn.lock().await;

        let reused = conn.is_some();
        match self.exchange(&mut conn, command).await {
            Ok(reply) => Ok(reply),
            // a connection dropped by the server between calls surfaces here
            Err(e) if reused && e.is_stale_connection() => {
                debug!("[rcon] {} stale connection ({e}), re-authenticating", self.addr);
                self.exchange(&mut conn, command).await
            }
            Err(e) => Err(e),
        }
    }

    async fn exchange(&self, conn: &mut Option<TcpStream>, command: &str) -> Result<String, RconError> {
        if conn.is_none() {
            *conn = Some(self.connect().await?);
        }
        let Some(stream) = conn.as_mut() else {
            return Err(RconError::Protocol("connection missing after connect".into()));
        };

        let result = match timeout(self.io_timeout, async {
            write_packet(stream, &Packet::new(REQUEST_ID, PACKET_EXEC_COMMAND, command)).await?;
            read_packet(stream).await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RconError::Timeout(self.addr.clone())),
        };

        match result {
            Ok(reply) => Ok(reply.body),
            Err(e) => {
                *conn = None;
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream, RconError> {
        let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| RconError::Timeout(self.addr.clone()))??;
        stream.set_nodelay(true)?;

        let reply = timeout(self.io_timeout, async {
            write_packet(&mut stream, &Packet::new(REQUEST_ID, PACKET_AUTH, self.password.as_str())).await?;
            read_packet(&mut stream).await
        })
        .await
        .map_err(|_| RconError::Timeout(self.addr.clone()))??;

        if reply.kind != PACKET_AUTH_RESPONSE || reply.id == -1 {
            warn!("[rcon] authentication to {} rejected", self.addr);
            return Err(RconError::AuthFailed);
        }
        info!("[rcon] authenticated to {}", self.addr);
        Ok(stream)
    }

    /// Drop the current connection, if any
    pub async fn close(&self) {
        self.conn.lock().await.take();
    }
}

/// One client per instance id; a changed address or password replaces the client
#[derive(Default)]
pub struct RconPool {
    clients: Mutex<HashMap<String, Arc<RconClient>>>,
}

impl RconPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, instance_id: &str, addr: &str, password: &str) -> Arc<RconClient> {
        let mut clients = self.clients.lock();
        match clients.get(instance_id) {
            Some(existing) if existing.matches(addr, password) => Arc::clone(existing),
            _ => {
                let client = Arc::new(RconClient::new(addr, password));
                clients.insert(instance_id.to_string(), Arc::clone(&client));
                client
            }
        }
    }

    pub fn remove(&self, instance_id: &str) -> Option<Arc<RconClient>> {
        self.clients.lock().remove(instance_id)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }
}
