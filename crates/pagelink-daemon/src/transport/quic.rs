//! QUIC transport backend
//!
//! Each data channel is one bidirectional QUIC stream whose first frame is
//! `StreamFrame::Open { id, label }`. The control channel is the first
//! stream the answering peer opens; its open frame carries the session
//! token from the answer, and the offering peer only adopts a connection
//! presenting that token.
//!
//! ```text
//! offerer                                   answerer
//!   create_offer()  -- offer string -->     accept_offer()
//!   accept_answer() <-- answer string --    connect + Open{0, "ctrl", token}
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use pagelink_core::crypto::{try_generate_session_token, SessionToken};
use pagelink_core::{
    ChannelId, ConnectionState, NetworkConfig, ProtocolError, StreamFrame, CONTROL_CHANNEL_ID,
    CONTROL_LABEL, MAX_FRAME_SIZE,
};

use super::channel::{pump_outbound, ChannelMessage, DataChannel, FrameSink, Outbound};
use super::{close_all, ChannelIds, StateCell, Transport, TransportError, TransportEvent, TransportEvents};
use crate::net::{self, recv_frame, send_frame, NetError};
use crate::signaling::{local_candidates, AnswerDescription, OfferDescription, SignalingError};

/// Room left in a frame for bincode framing around a binary payload
const FRAME_OVERHEAD: usize = 64;

/// QUIC-backed transport
pub struct QuicTransport {
    inner: Arc<QuicInner>,
}

struct QuicInner {
    state: StateCell,
    control: Arc<DataChannel>,
    control_queue: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    channels: DashMap<ChannelId, Arc<DataChannel>>,
    ids: OnceLock<ChannelIds>,
    connection: OnceLock<Connection>,
    endpoint: Mutex<Option<Endpoint>>,
    expected_token: watch::Sender<Option<SessionToken>>,
    network: NetworkConfig,
    max_message_size: usize,
}

impl QuicTransport {
    pub fn new(network: NetworkConfig, max_message_size: usize) -> (Arc<Self>, TransportEvents) {
        let (state, events) = StateCell::new();
        let (control, queue) = DataChannel::new(CONTROL_CHANNEL_ID, CONTROL_LABEL);
        let (expected_token, _) = watch::channel(None);
        let inner = Arc::new(QuicInner {
            state,
            control,
            control_queue: Mutex::new(Some(queue)),
            channels: DashMap::new(),
            ids: OnceLock::new(),
            connection: OnceLock::new(),
            endpoint: Mutex::new(None),
            expected_token,
            network,
            max_message_size: max_message_size.min(MAX_FRAME_SIZE - FRAME_OVERHEAD),
        });
        (Arc::new(Self { inner }), events)
    }

    /// Bind a server endpoint and describe it to the answering peer
    ///
    /// Incoming connections are accepted right away but only adopted once
    /// `accept_answer` supplies the matching session token.
    pub fn create_offer(&self) -> Result<String, SignalingError> {
        if self.inner.ids.set(ChannelIds::offerer()).is_err() {
            return Err(SignalingError::WrongState("signaling already started"));
        }

        let (endpoint, fingerprint) = net::create_server_endpoint(&self.inner.network)?;
        let port = endpoint
            .local_addr()
            .map_err(|e| NetError::Endpoint(e.to_string()))?
            .port();
        let candidates = local_candidates(self.inner.network.bind, port);
        *self.inner.endpoint.lock() = Some(endpoint.clone());

        tokio::spawn(accept_session(self.inner.clone(), endpoint));

        OfferDescription::new(fingerprint, candidates).encode()
    }

    /// Consume an offer, start connecting, and produce the answer string
    pub fn accept_offer(&self, offer: &str) -> Result<String, SignalingError> {
        let offer = OfferDescription::decode(offer)?;
        let fingerprint = offer.fingerprint()?;
        if self.inner.ids.set(ChannelIds::answerer()).is_err() {
            return Err(SignalingError::WrongState("signaling already started"));
        }

        let token =
            try_generate_session_token().map_err(|e| SignalingError::Random(e.to_string()))?;
        let endpoint = net::create_client_endpoint_with_pinned_cert(&self.inner.network, fingerprint)?;
        *self.inner.endpoint.lock() = Some(endpoint.clone());

        self.inner.state.advance(ConnectionState::Connecting);
        tokio::spawn(connect_session(
            self.inner.clone(),
            endpoint,
            offer.candidates,
            token,
        ));

        AnswerDescription::new(token).encode()
    }

    /// Consume the answer to a previously created offer
    pub fn accept_answer(&self, answer: &str) -> Result<(), SignalingError> {
        let token = AnswerDescription::decode(answer)?.token()?;
        if self.inner.endpoint.lock().is_none() {
            return Err(SignalingError::WrongState("no offer has been created"));
        }
        if !self.inner.state.advance(ConnectionState::Connecting) {
            return Err(SignalingError::WrongState("answer already accepted"));
        }
        self.inner.expected_token.send_replace(Some(token));
        Ok(())
    }

    /// Local address of the endpoint, once signaling has started
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner
            .endpoint
            .lock()
            .as_ref()
            .and_then(|endpoint| endpoint.local_addr().ok())
    }
}

impl Transport for QuicTransport {
    fn connection_state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    fn control_channel(&self) -> Arc<DataChannel> {
        self.inner.control.clone()
    }

    fn max_message_size(&self) -> usize {
        self.inner.max_message_size
    }

    fn open_channel(&self, label: &str) -> Result<Arc<DataChannel>, TransportError> {
        self.inner.state.require_connected()?;
        let connection = self
            .inner
            .connection
            .get()
            .cloned()
            .ok_or(TransportError::NotConnected)?;
        let ids = self.inner.ids.get().ok_or(TransportError::NotConnected)?;

        let id = ids.allocate(&self.inner.channels)?;
        let (channel, queue) = DataChannel::new(id, label);
        self.inner.channels.insert(id, channel.clone());

        let opening = channel.clone();
        let label = label.to_string();
        tokio::spawn(async move {
            let (mut send, recv) = match connection.open_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    warn!(id, "Failed to open stream: {}", e);
                    opening.mark_closed();
                    return;
                }
            };
            let open = StreamFrame::Open {
                id,
                label,
                token: None,
            };
            if let Err(e) = send_frame(&mut send, &open).await {
                warn!(id, "Failed to announce channel: {}", e);
                opening.mark_closed();
                return;
            }
            attach(opening.clone(), queue, send, recv);
            opening.mark_open();
        });

        Ok(channel)
    }

    fn close(&self) {
        if let Some(connection) = self.inner.connection.get() {
            connection.close(VarInt::from_u32(0), b"closed");
        }
        if let Some(endpoint) = self.inner.endpoint.lock().take() {
            endpoint.close(VarInt::from_u32(0), b"closed");
        }
        self.inner.teardown(ConnectionState::Closed);
    }
}

impl QuicInner {
    fn established(self: &Arc<Self>, connection: Connection, send: SendStream, recv: RecvStream) {
        if self.connection.set(connection.clone()).is_err() {
            connection.close(VarInt::from_u32(2), b"session already established");
            return;
        }
        if let Some(queue) = self.control_queue.lock().take() {
            attach(self.control.clone(), queue, send, recv);
        }
        self.control.mark_open();
        self.state.advance(ConnectionState::Connected);
        info!(remote = %connection.remote_address(), "Session established");

        tokio::spawn(accept_channels(self.clone(), connection.clone()));
        tokio::spawn(monitor(self.clone(), connection));
    }

    fn teardown(&self, state: ConnectionState) {
        self.state.advance(state);
        close_all(&self.channels);
        self.control.on_remote_close();
    }
}

/// Offerer: adopt the first connection presenting the expected token
async fn accept_session(inner: Arc<QuicInner>, endpoint: Endpoint) {
    let wait = Duration::from_secs(inner.network.connect_timeout_secs);

    while let Some(incoming) = endpoint.accept().await {
        let connection = match incoming.await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Incoming handshake failed: {}", e);
                continue;
            }
        };
        info!(remote = %connection.remote_address(), "Incoming connection");

        match accept_control(&inner, &connection, wait).await {
            Ok((send, recv)) => {
                inner.established(connection, send, recv);
                return;
            }
            Err(e) => {
                warn!(remote = %connection.remote_address(), "Rejected connection: {}", e);
                connection.close(VarInt::from_u32(1), b"unauthorized");
            }
        }
    }

    debug!("Endpoint stopped accepting");
    if inner.connection.get().is_none() {
        inner.state.advance(ConnectionState::Failed);
    }
}

async fn accept_control(
    inner: &QuicInner,
    connection: &Connection,
    wait: Duration,
) -> Result<(SendStream, RecvStream), NetError> {
    let (send, mut recv) = tokio::time::timeout(wait, connection.accept_bi())
        .await
        .map_err(|_| NetError::Connect("timed out waiting for control stream".into()))?
        .map_err(|e| NetError::Receive(e.to_string()))?;

    let presented = match recv_frame(&mut recv).await? {
        Some(StreamFrame::Open {
            id: CONTROL_CHANNEL_ID,
            token: Some(token),
            ..
        }) => token,
        Some(_) => {
            return Err(NetError::Protocol(ProtocolError::UnexpectedFrame(
                "control stream must open channel 0 with a token",
            )))
        }
        None => return Err(NetError::Receive("stream finished before open".into())),
    };

    // The answer may not have been pasted yet
    let mut expected = inner.expected_token.subscribe();
    let token = loop {
        if let Some(token) = *expected.borrow_and_update() {
            break token;
        }
        if expected.changed().await.is_err() {
            return Err(NetError::Connect("transport dropped".into()));
        }
    };

    if presented != token {
        return Err(NetError::Protocol(ProtocolError::UnexpectedFrame(
            "session token mismatch",
        )));
    }
    Ok((send, recv))
}

/// Answerer: connect to the offer's candidates and open the control stream
async fn connect_session(
    inner: Arc<QuicInner>,
    endpoint: Endpoint,
    candidates: Vec<std::net::SocketAddr>,
    token: SessionToken,
) {
    let timeout = Duration::from_secs(inner.network.connect_timeout_secs);
    let connection = match net::connect_any(&endpoint, &candidates, timeout).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!("Could not reach offering peer: {}", e);
            inner.state.advance(ConnectionState::Failed);
            return;
        }
    };

    let (mut send, recv) = match connection.open_bi().await {
        Ok(streams) => streams,
        Err(e) => {
            warn!("Failed to open control stream: {}", e);
            inner.state.advance(ConnectionState::Failed);
            return;
        }
    };

    let open = StreamFrame::Open {
        id: CONTROL_CHANNEL_ID,
        label: CONTROL_LABEL.into(),
        token: Some(token),
    };
    if let Err(e) = send_frame(&mut send, &open).await {
        warn!("Failed to present session token: {}", e);
        inner.state.advance(ConnectionState::Failed);
        return;
    }

    inner.established(connection, send, recv);
}

/// Turn streams opened by the remote peer into offered channels
async fn accept_channels(inner: Arc<QuicInner>, connection: Connection) {
    loop {
        let (send, mut recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                debug!("Stopped accepting channels: {}", e);
                return;
            }
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            match recv_frame(&mut recv).await {
                Ok(Some(StreamFrame::Open { id, label, .. })) if id != CONTROL_CHANNEL_ID => {
                    let (channel, queue) = DataChannel::new(id, label);
                    inner.channels.insert(id, channel.clone());
                    attach(channel.clone(), queue, send, recv);
                    channel.mark_open();
                    inner.state.emit(TransportEvent::ChannelOffered(channel));
                }
                Ok(other) => warn!("Stream opened without a channel frame: {:?}", other),
                Err(e) => warn!("Failed to read channel open: {}", e),
            }
        });
    }
}

/// Map connection loss onto the session state
async fn monitor(inner: Arc<QuicInner>, connection: Connection) {
    let reason = connection.closed().await;
    let state = match reason {
        quinn::ConnectionError::LocallyClosed | quinn::ConnectionError::ApplicationClosed(_) => {
            ConnectionState::Closed
        }
        quinn::ConnectionError::TimedOut | quinn::ConnectionError::Reset => {
            ConnectionState::Disconnected
        }
        _ => ConnectionState::Failed,
    };
    info!("Connection ended: {} ({:?})", reason, state);
    inner.teardown(state);
}

fn attach(
    channel: Arc<DataChannel>,
    queue: mpsc::UnboundedReceiver<Outbound>,
    send: SendStream,
    recv: RecvStream,
) {
    tokio::spawn(pump_outbound(channel.clone(), queue, QuicSink { send }));
    tokio::spawn(read_frames(channel, recv));
}

async fn read_frames(channel: Arc<DataChannel>, mut recv: RecvStream) {
    loop {
        match recv_frame(&mut recv).await {
            Ok(Some(StreamFrame::Text(text))) => channel.deliver(ChannelMessage::Text(text)),
            Ok(Some(StreamFrame::Binary(data))) => {
                channel.deliver(ChannelMessage::Binary(data.into()))
            }
            Ok(Some(StreamFrame::Open { .. })) => {
                warn!(id = channel.id(), "Duplicate open frame");
                break;
            }
            Ok(None) => break,
            Err(e) => {
                debug!(id = channel.id(), "Channel read ended: {}", e);
                break;
            }
        }
    }
    channel.on_remote_close();
}

struct QuicSink {
    send: SendStream,
}

#[async_trait]
impl FrameSink for QuicSink {
    async fn write(&mut self, message: ChannelMessage) -> Result<(), TransportError> {
        let frame = match message {
            ChannelMessage::Text(text) => StreamFrame::Text(text),
            ChannelMessage::Binary(data) => StreamFrame::Binary(data.to_vec()),
        };
        send_frame(&mut self.send, &frame)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn finish(&mut self) {
        let _ = self.send.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelEvent;

    fn loopback_network() -> NetworkConfig {
        NetworkConfig {
            bind: "127.0.0.1".parse().unwrap(),
            port: 0,
            connect_timeout_secs: 5,
            ..Default::default()
        }
    }

    async fn wait_connected(events: &mut TransportEvents) {
        while let Some(event) = events.recv().await {
            if let TransportEvent::StateChanged(state) = event {
                assert!(!state.is_terminal(), "connection ended: {:?}", state);
                if state == ConnectionState::Connected {
                    return;
                }
            }
        }
        panic!("transport events ended");
    }

    #[test]
    fn test_answer_requires_offer() {
        let (transport, _events) = QuicTransport::new(loopback_network(), 1024);
        let answer = AnswerDescription::new([1u8; 16]).encode().unwrap();
        assert!(matches!(
            transport.accept_answer(&answer),
            Err(SignalingError::WrongState(_))
        ));
    }

    #[test]
    fn test_max_message_size_capped_by_frame() {
        let (transport, _events) = QuicTransport::new(loopback_network(), usize::MAX);
        assert!(transport.max_message_size() < MAX_FRAME_SIZE);
    }

    #[tokio::test]
    async fn test_offer_answer_over_loopback() {
        let (offerer, mut offerer_events) = QuicTransport::new(loopback_network(), 64 * 1024);
        let (answerer, mut answerer_events) = QuicTransport::new(loopback_network(), 64 * 1024);

        let offer = offerer.create_offer().unwrap();
        assert!(offerer.create_offer().is_err());
        let answer = answerer.accept_offer(&offer).unwrap();
        offerer.accept_answer(&answer).unwrap();

        wait_connected(&mut answerer_events).await;
        wait_connected(&mut offerer_events).await;

        let mut control = offerer.control_channel().take_events().unwrap();
        answerer.control_channel().send_text("hello").unwrap();
        assert_eq!(control.recv().await, Some(ChannelEvent::Open));
        assert_eq!(
            control.recv().await,
            Some(ChannelEvent::Message(ChannelMessage::Text("hello".into())))
        );

        let channel = answerer.open_channel("file").unwrap();
        assert_eq!(channel.id() % 2, 0);
        let mut channel_events = channel.take_events().unwrap();
        assert_eq!(channel_events.recv().await, Some(ChannelEvent::Open));
        channel.send_binary(vec![5u8; 100]).unwrap();

        let offered = loop {
            match offerer_events.recv().await {
                Some(TransportEvent::ChannelOffered(channel)) => break channel,
                Some(_) => continue,
                None => panic!("transport events ended"),
            }
        };
        assert_eq!(offered.id(), channel.id());
        assert_eq!(offered.label(), "file");

        let mut offered_events = offered.take_events().unwrap();
        assert_eq!(offered_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(
            offered_events.recv().await,
            Some(ChannelEvent::Message(ChannelMessage::Binary(vec![5u8; 100].into())))
        );

        offerer.close();
        assert_eq!(offerer.connection_state(), ConnectionState::Closed);
    }
}
