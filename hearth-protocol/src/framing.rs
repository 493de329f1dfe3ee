// Length-delimited JSON framing for the control channel.
//
// Wire format: 4-byte big-endian length prefix, then a JSON document. The
// codec is tokio-util's `LengthDelimitedCodec` capped at `MAX_MESSAGE_SIZE`;
// an oversized prefix surfaces as an `InvalidData` I/O error and ends the
// stream.
//
// Concurrent writers on one stream would interleave frames, so every send
// goes through a `SharedWriter`: one async mutex per stream, never shared
// across streams.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Maximum allowed frame size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;
pub type FrameWriter<W> = FramedWrite<W, LengthDelimitedCodec>;

/// Type-erased write half, so TCP streams and in-memory pipes share one writer type.
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("stream error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    /// A payload that failed to decode inside an intact frame. The stream
    /// itself is still usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Json(_))
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_MESSAGE_SIZE)
        .new_codec()
}

pub fn frame_reader<R: AsyncRead>(reader: R) -> FrameReader<R> {
    FramedRead::new(reader, codec())
}

pub fn frame_writer<W: AsyncWrite>(writer: W) -> FrameWriter<W> {
    FramedWrite::new(writer, codec())
}

/// Read the next message. `Ok(None)` means the peer closed the stream cleanly.
///
/// Cancel-safe: a partially received frame stays buffered in the reader.
pub async fn read_message<T, R>(reader: &mut FrameReader<R>) -> Result<Option<T>, FrameError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    match reader.next().await {
        None => Ok(None),
        Some(frame) => {
            let bytes = frame?;
            Ok(Some(serde_json::from_slice(&bytes)?))
        }
    }
}

pub async fn write_message<T, W>(writer: &mut FrameWriter<W>, msg: &T) -> Result<(), FrameError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(msg)?;
    writer.send(Bytes::from(payload)).await?;
    Ok(())
}

/// Write half of one stream behind its exclusive send lock.
pub struct SharedWriter {
    inner: Mutex<FrameWriter<BoxedWrite>>,
}

impl SharedWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: BoxedWrite = Box::new(writer);
        Self {
            inner: Mutex::new(frame_writer(boxed)),
        }
    }

    pub async fn send<T: Serialize>(&self, msg: &T) -> Result<(), FrameError> {
        let mut writer = self.inner.lock().await;
        write_message(&mut *writer, msg).await
    }

    /// Flush and shut down the write half; the peer sees end-of-stream.
    pub async fn close(&self) -> Result<(), FrameError> {
        let mut writer = self.inner.lock().await;
        SinkExt::<Bytes>::close(&mut *writer).await?;
        Ok(())
    }
}
