//! PageLink Daemon - peer session, transfer engine, and host/client roles
//!
//! This crate provides:
//! - A message-oriented transport abstraction (QUIC, plus an in-memory pair)
//! - The session event loop with role-based command dispatch
//! - Chunked, flow-controlled payload transfer over per-request channels
//! - The host, which serves a local library, and the client, which mirrors it
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  control: JSON commands  ┌──────────────┐
//! │   Client     │ ───────────────────────▶ │    Host      │
//! │ RemoteLibrary│                          │  Library     │
//! │              │ ◀─────────────────────── │              │
//! └──────┬───────┘  per-request channel:    └──────┬───────┘
//!        │          meta envelope + chunks         │
//!        ▼                                         ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   Session: channel table, pending slots, event loop         │
//! ├─────────────────────────────────────────────────────────────┤
//! │   Transport: QUIC streams per channel / in-memory loopback  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A request opens a fresh channel and names its id in the command; the
//! reply streams back over that channel and the request resolves when the
//! declared number of bytes has arrived.

pub mod client;
pub mod content;
pub mod correlator;
pub mod host;
pub mod net;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod transport;

pub use client::{split_previews, ClientPeer, RemoteEpisode, RemoteFile, RemoteLibrary};
pub use content::{ContentDir, ContentEntry, ContentError, ContentFile, FsDir, MemDir, MemFile};
pub use correlator::PendingTable;
pub use host::{HostPeer, Library};
pub use net::NetError;
pub use session::{ChannelTable, CommandHandler, Session, SessionError};
pub use signaling::{AnswerDescription, OfferDescription, SignalingError};
pub use transfer::{send_payload, PayloadAssembler, Progress, SendReport, TransferError};
pub use transport::mem::{loopback_pair, MemConfig, MemPeer, MemTransport};
pub use transport::quic::QuicTransport;
pub use transport::{
    ChannelEvent, ChannelMessage, DataChannel, Transport, TransportError, TransportEvent,
    TransportEvents,
};
