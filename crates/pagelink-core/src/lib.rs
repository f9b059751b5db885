//! PageLink Core - Shared types, wire formats, and configuration
//!
//! This crate contains the foundational types used by both peers of a
//! reading session. It has no dependencies on networking or async code.

pub mod config;
pub mod crypto;
pub mod error;
pub mod path;
pub mod protocol;
pub mod types;

pub use config::{Config, NetworkConfig, SessionConfig, TransferConfig};
pub use error::*;
pub use protocol::*;
pub use types::*;

/// Identifier of the pre-negotiated control channel
pub const CONTROL_CHANNEL_ID: ChannelId = 0;

/// Label of the control channel
pub const CONTROL_LABEL: &str = "ctrl";

/// Leading bytes of each file included in an abstract (preview) payload
pub const PREVIEW_SIZE: usize = 2048;

/// Default maximum size of a single channel message (256 KB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Lower bound for the sender's high watermark (1 MiB)
pub const HIGH_WATERMARK_FLOOR: usize = 1024 * 1024;

/// Chunks allowed in flight before the sender pauses
pub const HIGH_WATERMARK_CHUNKS: usize = 8;

/// Maximum encoded stream frame size (a full message plus framing overhead)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Wire protocol version, carried in signaling descriptions
pub const PROTOCOL_VERSION: u32 = 1;
