//! # svcwire-protocol
//!
//! Wire protocol for svcwire, a bidirectional RPC and event protocol over a
//! single persistent connection.
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - Rich values with inline `__type__` tags (dates, UUIDs, binary, errors)
//! - The message envelope shared by client and server
//! - Splitting of oversized messages and bounded reassembly

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod split;
pub mod value;

pub use codec::{Decoder, Encoder, Inbound, Outbound, Rejection, SplitConfig};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    ErrorResponse, EventAdd, EventEmit, EventInfos, EventNotify, EventRemove, Hello,
    ListenerInfo, Message, Progress, Reload, Request, Response, SplitFragment, UploadAck,
    UploadFragment, UploadHeader, Welcome,
};
pub use split::{Assembly, Reassembler};
pub use value::{EncodeMode, Value, WireError};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for a svcwire server.
pub const DEFAULT_PORT: u16 = 7420;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum size of one logical message after reassembly (100 MiB).
pub const MAX_MESSAGE_SIZE: u64 = 100 * 1024 * 1024;

/// Messages larger than this are split (3 MiB).
pub const DEFAULT_SPLIT_THRESHOLD: usize = 3 * 1024 * 1024;

/// Fragment size used when splitting (300 KiB).
pub const DEFAULT_SPLIT_CHUNK: usize = 300 * 1024;
