//! Transport abstraction
//!
//! A transport is one peer-to-peer connection carrying a pre-negotiated
//! control channel (id 0) and any number of ephemeral data channels. The
//! session layer only sees the `Transport` trait; concrete backends are the
//! in-memory loopback pair and QUIC.

pub mod channel;
pub mod mem;
pub mod quic;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use pagelink_core::{ChannelId, ChannelState, ConnectionState, ProtocolError};

pub use channel::{ChannelEvent, ChannelEvents, ChannelMessage, DataChannel};

/// Asynchronous notification from a transport
#[derive(Debug)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// The remote peer opened a data channel
    ChannelOffered(Arc<DataChannel>),
}

/// Receiver half of a transport's event stream
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A peer-to-peer connection
pub trait Transport: Send + Sync + 'static {
    fn connection_state(&self) -> ConnectionState;

    /// The pre-negotiated control channel
    fn control_channel(&self) -> Arc<DataChannel>;

    /// Largest single message the transport delivers intact
    fn max_message_size(&self) -> usize;

    /// Open a new data channel; the returned handle starts in the opening state
    fn open_channel(&self, label: &str) -> Result<Arc<DataChannel>, TransportError>;

    fn close(&self);
}

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("channel {id} is not open ({state:?})")]
    ChannelNotOpen { id: ChannelId, state: ChannelState },

    #[error("channel {0} closed")]
    ChannelClosed(ChannelId),

    #[error("no free channel ids")]
    IdsExhausted,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Connection state that only moves forward, reported on the event stream
pub(crate) struct StateCell {
    state: Mutex<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl StateCell {
    pub(crate) fn new() -> (Self, TransportEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Mutex::new(ConnectionState::New),
                events,
            },
            rx,
        )
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `next` if it is later in the lifecycle; returns whether it moved
    pub(crate) fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() || rank(next) <= rank(*state) {
            return false;
        }
        debug!("Connection state {:?} -> {:?}", *state, next);
        *state = next;
        let _ = self.events.send(TransportEvent::StateChanged(next));
        true
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Fail fast for operations that need a live connection
    pub(crate) fn require_connected(&self) -> Result<(), TransportError> {
        match self.get() {
            ConnectionState::Connected => Ok(()),
            state if state.is_terminal() => Err(TransportError::ConnectionClosed),
            _ => Err(TransportError::NotConnected),
        }
    }
}

fn rank(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::New => 0,
        ConnectionState::Connecting => 1,
        ConnectionState::Connected => 2,
        ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed => 3,
    }
}

/// Local channel id allocator
///
/// The offering side allocates odd ids and the answering side even ids, so
/// both ends can open channels without coordinating. Id 0 is never handed
/// out.
pub(crate) struct ChannelIds {
    next: Mutex<u32>,
}

impl ChannelIds {
    pub(crate) fn offerer() -> Self {
        Self {
            next: Mutex::new(1),
        }
    }

    pub(crate) fn answerer() -> Self {
        Self {
            next: Mutex::new(2),
        }
    }

    /// Allocate an id not present in `in_use`, pruning closed entries first
    pub(crate) fn allocate(
        &self,
        in_use: &DashMap<ChannelId, Arc<DataChannel>>,
    ) -> Result<ChannelId, TransportError> {
        in_use.retain(|_, channel| channel.state() != ChannelState::Closed);

        let mut next = self.next.lock();
        let parity = *next % 2;
        for _ in 0..=(u16::MAX as u32 / 2) {
            let candidate = *next as ChannelId;
            *next += 2;
            if *next > u16::MAX as u32 {
                *next = if parity == 1 { 1 } else { 2 };
            }
            if candidate != 0 && !in_use.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(TransportError::IdsExhausted)
    }
}

/// Close every channel in a table as if the remote end went away
pub(crate) fn close_all(channels: &DashMap<ChannelId, Arc<DataChannel>>) {
    let open: Vec<Arc<DataChannel>> = channels.iter().map(|e| e.value().clone()).collect();
    for channel in open {
        channel.on_remote_close();
    }
    channels.clear();
}
