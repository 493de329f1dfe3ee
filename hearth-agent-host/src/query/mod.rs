//! A2S_INFO query client (Source engine server query over UDP)
//!
//! Stateless: one datagram out, one datagram back, bounded deadlines.
//! A failed query means "unknown", never a fatal error for the caller.

use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

const INFO_REQUEST: &[u8] = b"\xFF\xFF\xFF\xFFTSource Engine Query\0";
const SIMPLE_HEADER: [u8; 4] = [0xFF; 4];
const INFO_RESPONSE: u8 = 0x49;
const MAX_DATAGRAM: usize = 1400;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("query socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("query to {0} timed out")]
    Timeout(String),
    #[error("invalid response header")]
    BadHeader,
    #[error("unexpected response type 0x{0:02x}")]
    BadType(u8),
    #[error("truncated response while reading {0}")]
    Truncated(&'static str),
}

/// Fields of an A2S_INFO reply that the agent reports
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerInfo {
    pub name: String,
    pub map: String,
    pub players: u8,
    pub max_players: u8,
    pub version: String,
}

/// Cursor over a reply; every read checks bounds
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self, field: &'static str) -> Result<u8, QueryError> {
        let b = *self.buf.get(self.pos).ok_or(QueryError::Truncated(field))?;
        self.pos += 1;
        Ok(b)
    }

    fn skip(&mut self, n: usize, field: &'static str) -> Result<(), QueryError> {
        if self.buf.len() < self.pos + n {
            return Err(QueryError::Truncated(field));
        }
        self.pos += n;
        Ok(())
    }

    fn cstring(&mut self, field: &'static str) -> Result<String, QueryError> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        let end = rest.iter().position(|&b| b == 0).ok_or(QueryError::Truncated(field))?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }
}

/// Parse a full A2S_INFO datagram (header included)
pub fn parse_info(datagram: &[u8]) -> Result<ServerInfo, QueryError> {
    if datagram.len() < 5 {
        return Err(QueryError::Truncated("header"));
    }
    if datagram[..4] != SIMPLE_HEADER {
        return Err(QueryError::BadHeader);
    }
    if datagram[4] != INFO_RESPONSE {
        return Err(QueryError::BadType(datagram[4]));
    }

    let mut r = Reader::new(&datagram[5..]);
    r.skip(1, "protocol")?;
    let name = r.cstring("name")?;
    let map = r.cstring("map")?;
    r.cstring("folder")?;
    r.cstring("game")?;
    r.skip(2, "app id")?;
    let players = r.byte("players")?;
    let max_players = r.byte("max players")?;
    // bots, server type, os, visibility, vac
    r.skip(5, "server flags")?;
    let version = r.cstring("version")?;

    Ok(ServerInfo { name, map, players, max_players, version })
}

/// One A2S_INFO round-trip to `addr` (host:port)
pub async fn query_info(addr: &str, deadline: Duration) -> Result<ServerInfo, QueryError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;

    let exchange = async {
        socket.send(INFO_REQUEST).await?;
        let mut buf = [0u8; MAX_DATAGRAM];
        let n = socket.recv(&mut buf).await?;
        Ok::<_, QueryError>(buf[..n].to_vec())
    };
    let datagram = timeout(deadline, exchange)
        .await
        .map_err(|_| QueryError::Timeout(addr.to_string()))??;
    parse_info(&datagram)
}
