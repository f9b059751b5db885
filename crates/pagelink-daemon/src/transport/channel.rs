//! Data channel handle shared by every transport backend
//!
//! A `DataChannel` is the unit the session and transfer engine work with:
//! messages are queued without blocking, the queued byte count is exposed as
//! the buffered amount, and inbound traffic arrives on a single-consumer
//! event stream. Backends drive the channel through the crate-private hooks
//! (`mark_open`, `deliver`, `mark_sent`, `mark_closed`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use pagelink_core::{ChannelId, ChannelState};

use super::TransportError;

/// Payload of a single channel message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    /// Bytes counted against the buffered amount
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inbound channel event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelMessage),
    Close,
}

/// Receiver half of a channel's event stream
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Work item for a backend's outbound pump
#[derive(Debug)]
pub(crate) enum Outbound {
    Message(ChannelMessage),
    Close,
}

/// Bidirectional, reliable, ordered message channel
pub struct DataChannel {
    id: ChannelId,
    label: String,
    state: Mutex<ChannelState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    buffered_low: Notify,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<ChannelEvents>>,
}

impl DataChannel {
    /// Create a channel in the opening state, along with its outbound queue
    pub(crate) fn new(
        id: ChannelId,
        label: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, queue) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            id,
            label: label.into(),
            state: Mutex::new(ChannelState::Opening),
            outbound,
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            buffered_low: Notify::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });
        (channel, queue)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Queue a message for delivery
    pub fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        let state = self.state.lock();
        if *state != ChannelState::Open {
            return Err(TransportError::ChannelNotOpen {
                id: self.id,
                state: *state,
            });
        }

        let len = message.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        if self.outbound.send(Outbound::Message(message)).is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            return Err(TransportError::ChannelClosed(self.id));
        }
        Ok(())
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(ChannelMessage::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.send(ChannelMessage::Binary(data.into()))
    }

    /// Bytes queued but not yet handed to the wire
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn buffered_amount_low_threshold(&self) -> usize {
        self.low_threshold.load(Ordering::SeqCst)
    }

    pub fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
    }

    /// Wait until the buffered amount drops to the low threshold
    ///
    /// Returns immediately once the channel is closed.
    pub async fn buffered_amount_low(&self) {
        loop {
            let notified = self.buffered_low.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.buffered_amount() <= self.buffered_amount_low_threshold()
                || self.state() == ChannelState::Closed
            {
                return;
            }
            notified.await;
        }
    }

    /// Begin closing the channel; queued messages are flushed first
    pub fn close(&self) {
        let mut state = self.state.lock();
        match *state {
            ChannelState::Opening | ChannelState::Open => {
                debug!(id = self.id, label = %self.label, "Closing channel");
                *state = ChannelState::Closing;
                let _ = self.outbound.send(Outbound::Close);
            }
            ChannelState::Closing | ChannelState::Closed => {}
        }
    }

    /// Take the inbound event stream; only the first caller receives it
    pub fn take_events(&self) -> Option<ChannelEvents> {
        self.events_rx.lock().take()
    }

    pub(crate) fn mark_open(&self) {
        let mut state = self.state.lock();
        if *state == ChannelState::Opening {
            *state = ChannelState::Open;
            let _ = self.events_tx.send(ChannelEvent::Open);
        }
    }

    pub(crate) fn deliver(&self, message: ChannelMessage) {
        if self.state() == ChannelState::Closed {
            trace!(id = self.id, "Dropping message for closed channel");
            return;
        }
        let _ = self.events_tx.send(ChannelEvent::Message(message));
    }

    pub(crate) fn mark_sent(&self, len: usize) {
        let previous = self
            .buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| {
                Some(b.saturating_sub(len))
            })
            .unwrap_or(0);
        if previous.saturating_sub(len) <= self.buffered_amount_low_threshold() {
            self.buffered_low.notify_waiters();
        }
    }

    pub(crate) fn mark_closed(&self) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        debug!(id = self.id, label = %self.label, "Channel closed");
        let _ = self.events_tx.send(ChannelEvent::Close);
        self.buffered_low.notify_waiters();
    }

    /// The remote end closed: stop the pump and mark the channel closed
    pub(crate) fn on_remote_close(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.mark_closed();
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .field("buffered", &self.buffered_amount())
            .finish()
    }
}

/// Write side of a backend, fed by `pump_outbound`
#[async_trait]
pub(crate) trait FrameSink: Send + 'static {
    async fn write(&mut self, message: ChannelMessage) -> Result<(), TransportError>;

    /// Signal end of stream to the remote end
    async fn finish(&mut self);
}

/// Drain a channel's outbound queue into a sink until the channel closes
pub(crate) async fn pump_outbound<S: FrameSink>(
    channel: Arc<DataChannel>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    mut sink: S,
) {
    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Message(message) => {
                let len = message.len();
                let result = sink.write(message).await;
                channel.mark_sent(len);
                if let Err(e) = result {
                    debug!(id = channel.id(), "Channel write failed: {}", e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    sink.finish().await;
    channel.mark_closed();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectSink(mpsc::UnboundedSender<ChannelMessage>);

    #[async_trait]
    impl FrameSink for CollectSink {
        async fn write(&mut self, message: ChannelMessage) -> Result<(), TransportError> {
            self.0
                .send(message)
                .map_err(|_| TransportError::ConnectionClosed)
        }

        async fn finish(&mut self) {}
    }

    #[test]
    fn test_send_requires_open() {
        let (channel, _queue) = DataChannel::new(3, "file");
        assert!(matches!(
            channel.send_text("early"),
            Err(TransportError::ChannelNotOpen { id: 3, .. })
        ));
        channel.mark_open();
        assert!(channel.send_text("hello").is_ok());
        assert_eq!(channel.buffered_amount(), 5);
    }

    #[test]
    fn test_events_taken_once() {
        let (channel, _queue) = DataChannel::new(1, "meta");
        assert!(channel.take_events().is_some());
        assert!(channel.take_events().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (channel, _queue) = DataChannel::new(1, "file");
        let mut events = channel.take_events().unwrap();
        channel.mark_open();
        channel.mark_closed();
        channel.mark_closed();
        assert_eq!(events.try_recv().unwrap(), ChannelEvent::Open);
        assert_eq!(events.try_recv().unwrap(), ChannelEvent::Close);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pump_drains_buffered_amount() {
        let (channel, queue) = DataChannel::new(5, "file");
        channel.mark_open();
        channel.set_buffered_amount_low_threshold(0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.send_binary(vec![1u8; 100]).unwrap();
        channel.send_binary(vec![2u8; 50]).unwrap();
        assert_eq!(channel.buffered_amount(), 150);

        tokio::spawn(pump_outbound(channel.clone(), queue, CollectSink(tx)));
        channel.buffered_amount_low().await;
        assert_eq!(channel.buffered_amount(), 0);

        assert_eq!(rx.recv().await.unwrap().len(), 100);
        assert_eq!(rx.recv().await.unwrap().len(), 50);

        channel.close();
        let mut events = channel.take_events().unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(events.recv().await, Some(ChannelEvent::Close));
        assert_eq!(channel.state(), ChannelState::Closed);
    }
}
