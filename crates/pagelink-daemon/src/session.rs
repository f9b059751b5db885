//! Peer session
//!
//! A `Session` wraps one transport for the lifetime of a connection. It
//! owns the open-channel table and the pending transfer slots, runs the
//! event loop that routes control messages to the role's `CommandHandler`,
//! and tears everything down when the connection ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use pagelink_core::{
    ChannelId, Command, Config, ConnectionState, ControlMessage, ProtocolError, Role,
    TransferRequest,
};

use crate::content::ContentError;
use crate::correlator::{self, PendingTable};
use crate::transfer::TransferError;
use crate::transport::{
    ChannelEvent, ChannelMessage, DataChannel, Transport, TransportError, TransportEvent,
    TransportEvents,
};

/// Session errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error("control channel unavailable")]
    ControlUnavailable,

    #[error("channel {0} did not appear")]
    UnknownChannel(ChannelId),

    #[error("unexpected {0} command for this role")]
    UnexpectedCommand(&'static str),
}

/// Role-specific behavior, chosen once when the session is built
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Runs once when the connection first reaches `Connected`
    async fn on_connected(&self, session: &Arc<Session>) -> Result<(), SessionError>;

    /// The remote peer opened a data channel
    async fn on_channel_offered(&self, session: &Arc<Session>, channel: Arc<DataChannel>);

    /// A command addressed to this peer arrived on the control channel
    async fn on_command(&self, session: &Arc<Session>, command: Command)
        -> Result<(), SessionError>;
}

/// Open transfer channels by id
#[derive(Default)]
pub struct ChannelTable {
    channels: DashMap<ChannelId, Arc<DataChannel>>,
    registered: Notify,
}

impl ChannelTable {
    pub fn insert(&self, channel: Arc<DataChannel>) {
        trace!(id = channel.id(), label = channel.label(), "Registering channel");
        self.channels.insert(channel.id(), channel);
        self.registered.notify_waiters();
    }

    pub fn remove(&self, id: ChannelId) -> Option<Arc<DataChannel>> {
        self.channels.remove(&id).map(|(_, channel)| channel)
    }

    /// Remove `channel` unless its id has already been reused
    pub fn remove_channel(&self, channel: &Arc<DataChannel>) {
        self.channels
            .remove_if(&channel.id(), |_, current| Arc::ptr_eq(current, channel));
    }

    pub fn get(&self, id: ChannelId) -> Option<Arc<DataChannel>> {
        self.channels.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Wait for channel `id` to be registered, up to `timeout`
    ///
    /// A command can overtake the offer of the channel it names, since the
    /// two travel on different streams.
    pub async fn wait_for(&self, id: ChannelId, timeout: Duration) -> Option<Arc<DataChannel>> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.registered.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(channel) = self.get(id) {
                    return channel;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    fn drain(&self) -> Vec<Arc<DataChannel>> {
        let channels: Vec<Arc<DataChannel>> =
            self.channels.iter().map(|e| e.value().clone()).collect();
        self.channels.clear();
        channels
    }
}

/// Decode a control message and keep it only if addressed to `role`
pub fn decode_for_role(role: Role, raw: &str) -> Result<Option<Command>, ProtocolError> {
    let message = ControlMessage::from_json(raw)?;
    if !role.accepts(message.target) {
        return Ok(None);
    }
    Command::decode(&message).map(Some)
}

/// One connection between a host and a client
pub struct Session {
    role: Role,
    transport: Arc<dyn Transport>,
    channels: ChannelTable,
    transfers: PendingTable<ChannelId, Bytes>,
    config: Config,
    connected_once: AtomicBool,
    closed: AtomicBool,
}

impl Session {
    pub fn new(role: Role, transport: Arc<dyn Transport>, config: Config) -> Arc<Self> {
        Arc::new(Self {
            role,
            transport,
            channels: ChannelTable::default(),
            transfers: PendingTable::new(),
            config,
            connected_once: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn transfers(&self) -> &PendingTable<ChannelId, Bytes> {
        &self.transfers
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.connection_state()
    }

    /// Connected, with the control channel open
    pub fn is_connected(&self) -> bool {
        self.transport.connection_state() == ConnectionState::Connected
            && self.transport.control_channel().is_open()
    }

    /// Chunk size for outgoing payloads
    pub fn max_message_size(&self) -> usize {
        self.transport.max_message_size()
    }

    /// Send a control message; dropped when the control channel is not open
    ///
    /// Returns whether the message was handed to the channel.
    pub fn send_control(&self, message: &ControlMessage) -> bool {
        let control = self.transport.control_channel();
        if !control.is_open() {
            debug!(cmd = %message.cmd, "Control channel not open, dropping message");
            return false;
        }
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(cmd = %message.cmd, "Failed to encode control message: {}", e);
                return false;
            }
        };
        match control.send_text(text) {
            Ok(()) => true,
            Err(e) => {
                debug!(cmd = %message.cmd, "Control send failed: {}", e);
                false
            }
        }
    }

    /// Encode and send a command addressed to `target`
    pub fn send_command(&self, command: &Command, target: Role) -> bool {
        match command.to_message(target) {
            Ok(message) => self.send_control(&message),
            Err(e) => {
                warn!(cmd = command.name(), "Failed to encode command: {}", e);
                false
            }
        }
    }

    pub fn open_channel(&self, label: &str) -> Result<Arc<DataChannel>, TransportError> {
        self.transport.open_channel(label)
    }

    /// Register a channel opened by the peer until it closes
    ///
    /// Used for transfer channels that a later command will name by id.
    pub fn track_channel(self: &Arc<Self>, channel: Arc<DataChannel>) {
        let Some(mut events) = channel.take_events() else {
            warn!(id = channel.id(), "Channel events already taken");
            return;
        };
        self.channels.insert(channel.clone());

        let session = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Close => break,
                    ChannelEvent::Message(message) => {
                        trace!(id = channel.id(), len = message.len(), "Ignoring inbound data")
                    }
                    ChannelEvent::Open => {}
                }
            }
            session.channels.remove_channel(&channel);
        });
    }

    /// Request a payload from the peer; see [`correlator::request`]
    pub async fn request(
        self: &Arc<Self>,
        label: &str,
        command: &str,
        args: TransferRequest,
    ) -> Result<Bytes, TransferError> {
        correlator::request(self, label, command, args).await
    }

    /// Run the session until the connection ends
    pub async fn run(
        self: Arc<Self>,
        mut events: TransportEvents,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), SessionError> {
        let control = self.transport.control_channel();
        let mut control_events = control
            .take_events()
            .ok_or(SessionError::ControlUnavailable)?;

        // A transport may already be connected before the loop starts
        if self.connection_state() == ConnectionState::Connected {
            self.on_connected(&handler);
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::StateChanged(state)) => {
                        info!(role = %self.role, ?state, "Connection state changed");
                        if state == ConnectionState::Connected {
                            self.on_connected(&handler);
                        } else if state.is_terminal() {
                            break;
                        }
                    }
                    Some(TransportEvent::ChannelOffered(channel)) => {
                        debug!(id = channel.id(), label = channel.label(), "Channel offered");
                        handler.on_channel_offered(&self, channel).await;
                    }
                    None => break,
                },
                event = control_events.recv() => match event {
                    Some(ChannelEvent::Message(ChannelMessage::Text(raw))) => {
                        self.dispatch(&raw, &handler);
                    }
                    Some(ChannelEvent::Message(ChannelMessage::Binary(data))) => {
                        warn!(len = data.len(), "Ignoring binary message on control channel");
                    }
                    Some(ChannelEvent::Open) => debug!("Control channel open"),
                    Some(ChannelEvent::Close) | None => {
                        info!("Control channel closed");
                        self.transport.close();
                        break;
                    }
                },
            }
        }

        self.teardown();
        Ok(())
    }

    fn on_connected(self: &Arc<Self>, handler: &Arc<dyn CommandHandler>) {
        if self.connected_once.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.on_connected(&session).await {
                warn!(role = %session.role, "Post-connect step failed: {}", e);
            }
        });
    }

    fn dispatch(self: &Arc<Self>, raw: &str, handler: &Arc<dyn CommandHandler>) {
        let command = match decode_for_role(self.role, raw) {
            Ok(Some(command)) => command,
            Ok(None) => {
                trace!("Ignoring control message addressed to the other role");
                return;
            }
            Err(e) => {
                warn!("Discarding control message: {}", e);
                return;
            }
        };

        debug!(role = %self.role, cmd = command.name(), "Dispatching command");
        let session = self.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let name = command.name();
            if let Err(e) = handler.on_command(&session, command).await {
                warn!(cmd = name, "Command failed: {}", e);
            }
        });
    }

    /// Close the connection and release everything the session holds
    pub fn close(&self) {
        self.transport.close();
        self.teardown();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(role = %self.role, "Session ended");
        self.transfers.cancel_all();
        for channel in self.channels.drain() {
            channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mem::{loopback_pair, unconnected_pair, MemConfig};
    use pagelink_core::{CMD_ABSTRACT, CMD_EPISODE, CMD_FETCH, CMD_META};

    #[test]
    fn test_role_filter_per_command() {
        for cmd in [CMD_ABSTRACT, CMD_FETCH, CMD_META, CMD_EPISODE] {
            let args = match cmd {
                CMD_FETCH => r#"{"scope":0,"index":1,"channel":3}"#,
                CMD_EPISODE => r#"{"index":0}"#,
                _ => r#"{"scope":0,"channel":3}"#,
            };
            let to_host = format!(r#"{{"cmd":"{}","target":0,"args":{}}}"#, cmd, args);
            assert!(decode_for_role(Role::Client, &to_host).unwrap().is_none());
            assert!(decode_for_role(Role::Host, &to_host).unwrap().is_some());

            let anyone = format!(r#"{{"cmd":"{}","target":2,"args":{}}}"#, cmd, args);
            assert!(decode_for_role(Role::Host, &anyone).unwrap().is_some());
        }
    }

    #[test]
    fn test_episode_reply_reaches_client_only() {
        let raw = r#"{"cmd":"episode","target":1,"args":{"name":"Ch1","length":20}}"#;
        assert!(decode_for_role(Role::Host, raw).unwrap().is_none());
        assert!(matches!(
            decode_for_role(Role::Client, raw).unwrap(),
            Some(Command::EpisodeReply(_))
        ));
    }

    #[test]
    fn test_malformed_is_error() {
        assert!(decode_for_role(Role::Host, "not json").is_err());
        assert!(decode_for_role(Role::Host, r#"{"cmd":"rotate","target":0}"#).is_err());
    }

    #[tokio::test]
    async fn test_is_connected_tracks_transport() {
        let (a, _b) = unconnected_pair(MemConfig::default());
        let session = Session::new(Role::Host, a.transport.clone(), Config::default());
        assert!(!session.is_connected());

        let message = Command::Meta.to_message(Role::Client).unwrap();
        assert!(!session.send_control(&message));

        let (c, _d) = loopback_pair(MemConfig::default());
        let session = Session::new(Role::Host, c.transport.clone(), Config::default());
        assert!(session.is_connected());
        assert!(session.send_control(&message));

        c.transport.close();
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_wait_for_channel() {
        let table = Arc::new(ChannelTable::default());
        assert!(table.wait_for(3, Duration::from_millis(10)).await.is_none());

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait_for(3, Duration::from_secs(2)).await })
        };
        tokio::task::yield_now().await;
        let (channel, _queue) = DataChannel::new(3, "file");
        table.insert(channel);

        let found = waiter.await.unwrap().unwrap();
        assert_eq!(found.id(), 3);
    }

    #[tokio::test]
    async fn test_teardown_cancels_pending() {
        let (a, _b) = loopback_pair(MemConfig::default());
        let session = Session::new(Role::Client, a.transport.clone(), Config::default());
        let slot = session.transfers().register(5);
        session.close();
        assert!(session.is_closed());
        assert_eq!(
            correlator::await_slot(slot, Duration::from_secs(1)).await,
            Err(TransferError::Cancelled)
        );
    }
}
