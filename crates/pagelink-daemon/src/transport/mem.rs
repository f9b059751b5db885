//! In-memory loopback transport
//!
//! Two linked `MemTransport`s behave like a connected peer pair: channels
//! opened on one side are offered to the other, messages are delivered in
//! order, and an optional per-message delay makes flow control observable.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use pagelink_core::{
    ChannelId, ConnectionState, CONTROL_CHANNEL_ID, CONTROL_LABEL, DEFAULT_MAX_MESSAGE_SIZE,
};

use super::channel::{pump_outbound, ChannelMessage, DataChannel, FrameSink, Outbound};
use super::{close_all, ChannelIds, StateCell, Transport, TransportError, TransportEvent, TransportEvents};

/// Loopback configuration
#[derive(Debug, Clone)]
pub struct MemConfig {
    pub max_message_size: usize,
    /// Delay applied before each message reaches the peer
    pub frame_delay: Option<Duration>,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            frame_delay: None,
        }
    }
}

/// One end of a loopback pair
pub struct MemTransport {
    name: &'static str,
    state: StateCell,
    control: Arc<DataChannel>,
    control_queue: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    channels: DashMap<ChannelId, Arc<DataChannel>>,
    ids: ChannelIds,
    peer: Mutex<Weak<MemTransport>>,
    config: MemConfig,
}

/// A transport together with its event stream
pub struct MemPeer {
    pub transport: Arc<MemTransport>,
    pub events: TransportEvents,
}

/// Create a linked pair that has not connected yet
pub fn unconnected_pair(config: MemConfig) -> (MemPeer, MemPeer) {
    let offerer = MemTransport::new("offerer", ChannelIds::offerer(), config.clone());
    let answerer = MemTransport::new("answerer", ChannelIds::answerer(), config);

    *offerer.transport.peer.lock() = Arc::downgrade(&answerer.transport);
    *answerer.transport.peer.lock() = Arc::downgrade(&offerer.transport);

    (offerer, answerer)
}

/// Create a linked pair and bring it to the connected state
///
/// Must be called from within a tokio runtime.
pub fn loopback_pair(config: MemConfig) -> (MemPeer, MemPeer) {
    let (offerer, answerer) = unconnected_pair(config);
    connect(&offerer.transport, &answerer.transport);
    (offerer, answerer)
}

/// Drive both ends through connecting to connected
///
/// The control channel is open on both sides before `Connected` is reported.
pub fn connect(a: &Arc<MemTransport>, b: &Arc<MemTransport>) {
    a.state.advance(ConnectionState::Connecting);
    b.state.advance(ConnectionState::Connecting);

    for (local, remote) in [(a, b), (b, a)] {
        if let Some(queue) = local.control_queue.lock().take() {
            let sink = MemSink {
                peer: remote.control.clone(),
                delay: local.config.frame_delay,
            };
            tokio::spawn(pump_outbound(local.control.clone(), queue, sink));
        }
    }

    a.control.mark_open();
    b.control.mark_open();
    a.state.advance(ConnectionState::Connected);
    b.state.advance(ConnectionState::Connected);
    info!("Loopback pair connected");
}

impl MemTransport {
    fn new(name: &'static str, ids: ChannelIds, config: MemConfig) -> MemPeer {
        let (state, events) = StateCell::new();
        let (control, queue) = DataChannel::new(CONTROL_CHANNEL_ID, CONTROL_LABEL);
        let transport = Arc::new(Self {
            name,
            state,
            control,
            control_queue: Mutex::new(Some(queue)),
            channels: DashMap::new(),
            ids,
            peer: Mutex::new(Weak::new()),
            config,
        });
        MemPeer { transport, events }
    }

    fn peer(&self) -> Option<Arc<MemTransport>> {
        self.peer.lock().upgrade()
    }

    /// Channels currently tracked by this end
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Simulate the link dropping: both ends report disconnected
    pub fn disconnect(&self) {
        self.teardown(ConnectionState::Disconnected);
        if let Some(peer) = self.peer() {
            peer.teardown(ConnectionState::Disconnected);
        }
    }

    fn teardown(&self, state: ConnectionState) {
        if self.state.advance(state) {
            debug!(end = self.name, "Tearing down loopback transport ({:?})", state);
        }
        close_all(&self.channels);
        self.control.on_remote_close();
    }
}

impl Transport for MemTransport {
    fn connection_state(&self) -> ConnectionState {
        self.state.get()
    }

    fn control_channel(&self) -> Arc<DataChannel> {
        self.control.clone()
    }

    fn max_message_size(&self) -> usize {
        self.config.max_message_size
    }

    fn open_channel(&self, label: &str) -> Result<Arc<DataChannel>, TransportError> {
        self.state.require_connected()?;
        let peer = self.peer().ok_or(TransportError::ConnectionClosed)?;
        peer.state.require_connected()?;

        let id = self.ids.allocate(&self.channels)?;
        let (local, local_queue) = DataChannel::new(id, label);
        let (remote, remote_queue) = DataChannel::new(id, label);
        self.channels.insert(id, local.clone());
        peer.channels.insert(id, remote.clone());

        tokio::spawn(pump_outbound(
            local.clone(),
            local_queue,
            MemSink {
                peer: remote.clone(),
                delay: self.config.frame_delay,
            },
        ));
        tokio::spawn(pump_outbound(
            remote.clone(),
            remote_queue,
            MemSink {
                peer: local.clone(),
                delay: peer.config.frame_delay,
            },
        ));

        debug!(end = self.name, id, label, "Opening loopback channel");

        // Open completes asynchronously, as with a real transport
        let opened = local.clone();
        tokio::spawn(async move {
            remote.mark_open();
            peer.state.emit(TransportEvent::ChannelOffered(remote));
            opened.mark_open();
        });

        Ok(local)
    }

    fn close(&self) {
        self.teardown(ConnectionState::Closed);
        if let Some(peer) = self.peer() {
            peer.teardown(ConnectionState::Disconnected);
        }
    }
}

struct MemSink {
    peer: Arc<DataChannel>,
    delay: Option<Duration>,
}

#[async_trait]
impl FrameSink for MemSink {
    async fn write(&mut self, message: ChannelMessage) -> Result<(), TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.peer.state() == pagelink_core::ChannelState::Closed {
            return Err(TransportError::ChannelClosed(self.peer.id()));
        }
        self.peer.deliver(message);
        Ok(())
    }

    async fn finish(&mut self) {
        self.peer.on_remote_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelEvent;

    async fn next_offer(events: &mut TransportEvents) -> Arc<DataChannel> {
        loop {
            match events.recv().await {
                Some(TransportEvent::ChannelOffered(channel)) => return channel,
                Some(TransportEvent::StateChanged(_)) => continue,
                None => panic!("transport events ended"),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_sequence() {
        let (mut a, b) = unconnected_pair(MemConfig::default());
        assert_eq!(a.transport.connection_state(), ConnectionState::New);
        assert!(a.transport.open_channel("file").is_err());

        connect(&a.transport, &b.transport);
        let mut seen = Vec::new();
        for _ in 0..2 {
            if let Some(TransportEvent::StateChanged(state)) = a.events.recv().await {
                seen.push(state);
            }
        }
        assert_eq!(seen, vec![ConnectionState::Connecting, ConnectionState::Connected]);
        assert!(a.transport.control_channel().is_open());
    }

    #[tokio::test]
    async fn test_control_round_trip() {
        let (a, b) = loopback_pair(MemConfig::default());
        let mut inbound = b.transport.control_channel().take_events().unwrap();
        a.transport.control_channel().send_text("ping").unwrap();

        assert_eq!(inbound.recv().await, Some(ChannelEvent::Open));
        assert_eq!(
            inbound.recv().await,
            Some(ChannelEvent::Message(ChannelMessage::Text("ping".into())))
        );
    }

    #[tokio::test]
    async fn test_channel_offered_to_peer() {
        let (a, mut b) = loopback_pair(MemConfig::default());
        let local = a.transport.open_channel("file").unwrap();
        assert_eq!(local.id() % 2, 1);

        let remote = next_offer(&mut b.events).await;
        assert_eq!(remote.id(), local.id());
        assert_eq!(remote.label(), "file");

        let mut local_events = local.take_events().unwrap();
        assert_eq!(local_events.recv().await, Some(ChannelEvent::Open));
        remote.send_binary(vec![9u8; 4]).unwrap();
        assert_eq!(
            local_events.recv().await,
            Some(ChannelEvent::Message(ChannelMessage::Binary(vec![9u8; 4].into())))
        );

        local.close();
        assert_eq!(local_events.recv().await, Some(ChannelEvent::Close));
        let mut remote_events = remote.take_events().unwrap();
        loop {
            if remote_events.recv().await == Some(ChannelEvent::Close) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_close_disconnects_peer() {
        let (a, b) = loopback_pair(MemConfig::default());
        a.transport.close();
        assert_eq!(a.transport.connection_state(), ConnectionState::Closed);
        assert_eq!(b.transport.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(
            b.transport.open_channel("file"),
            Err(TransportError::ConnectionClosed)
        ));
    }
}
