//! Wire protocol of the Hearth control channel.
//!
//! Shared by the kernel (coordinator) and every node agent. One long-lived
//! TCP stream per node carries length-delimited JSON frames in both
//! directions:
//!
//! - `message`: `AgentMessage` (node → kernel) and `BackendCommand`
//!   (kernel → node), plus the payload structs they carry.
//! - `framing`: 4-byte big-endian length prefix over `tokio-util`'s
//!   `LengthDelimitedCodec`, typed read/write helpers, and `SharedWriter`,
//!   the per-stream send lock both sides write through.

pub mod framing;
pub mod message;

pub use framing::{
    frame_reader, frame_writer, read_message, write_message, BoxedWrite, FrameError, FrameReader,
    FrameWriter, SharedWriter, MAX_MESSAGE_SIZE,
};
pub use message::{
    AgentMessage, BackendCommand, CommandAck, CommandKind, HeartbeatData, InstanceConfig,
    InstanceReport, InstanceStatus, InstanceSyncData, LogChunk, NodeInfo,
};
