//! Request/response correlation
//!
//! A request opens a fresh data channel, names that channel's id in the
//! command it sends over the control channel, and then waits on a
//! single-shot slot keyed by the id. The slot resolves when the channel
//! closes after the declared payload has arrived, when the remote reports
//! an error, or when the session tears down.
//!
//! Channel ids are recycled once a channel closes, so each waiter also
//! carries a ticket. A reader task only ever resolves its own ticket and a
//! late task cannot complete a newer request that reuses the id.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use pagelink_core::{ControlMessage, TransferRequest};

use crate::session::Session;
use crate::transfer::{PayloadAssembler, Progress, TransferError};
use crate::transport::{ChannelEvent, ChannelEvents, DataChannel};

type Slot<V> = oneshot::Sender<Result<V, TransferError>>;

struct Waiter<V> {
    ticket: u64,
    tx: Slot<V>,
}

/// Pending rendezvous slots keyed by request id
///
/// Every waiter is resolved at most once: resolving removes it.
pub struct PendingTable<K, V> {
    slots: DashMap<K, Vec<Waiter<V>>>,
    next_ticket: AtomicU64,
}

impl<K, V> PendingTable<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Add a waiter for `key`
    pub fn register(&self, key: K) -> oneshot::Receiver<Result<V, TransferError>> {
        self.register_ticket(key).1
    }

    /// Add a waiter for `key` that can later be resolved on its own
    pub fn register_ticket(&self, key: K) -> (u64, oneshot::Receiver<Result<V, TransferError>>) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.slots.entry(key).or_default().push(Waiter { ticket, tx });
        (ticket, rx)
    }

    /// Resolve every waiter for `key`; returns whether any was pending
    pub fn resolve(&self, key: K, result: Result<V, TransferError>) -> bool {
        match self.slots.remove(&key) {
            Some((_, waiters)) => {
                for waiter in waiters {
                    let _ = waiter.tx.send(result.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Resolve only the waiter holding `ticket`
    ///
    /// Returns false when that waiter was already resolved or forgotten.
    pub fn resolve_ticket(&self, key: K, ticket: u64, result: Result<V, TransferError>) -> bool {
        match self.take_ticket(key, ticket) {
            Some(waiter) => {
                let _ = waiter.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop the waiters for `key` without resolving them
    pub fn forget(&self, key: K) {
        self.slots.remove(&key);
    }

    /// Drop the waiter holding `ticket` without resolving it
    pub fn forget_ticket(&self, key: K, ticket: u64) {
        self.take_ticket(key, ticket);
    }

    fn take_ticket(&self, key: K, ticket: u64) -> Option<Waiter<V>> {
        let waiter = {
            let mut waiters = self.slots.get_mut(&key)?;
            let position = waiters.iter().position(|w| w.ticket == ticket)?;
            waiters.swap_remove(position)
        };
        self.slots.remove_if(&key, |_, waiters| waiters.is_empty());
        Some(waiter)
    }

    pub fn is_pending(&self, key: K) -> bool {
        self.slots.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Fail every pending waiter with `Cancelled`
    pub fn cancel_all(&self) {
        let keys: Vec<K> = self.slots.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            debug!(?key, "Cancelling pending request");
            self.resolve(key, Err(TransferError::Cancelled));
        }
    }
}

impl<K, V> Default for PendingTable<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Wait on a slot, bounded by `timeout`
pub async fn await_slot<V>(
    slot: oneshot::Receiver<Result<V, TransferError>>,
    timeout: Duration,
) -> Result<V, TransferError> {
    match tokio::time::timeout(timeout, slot).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(TransferError::Cancelled),
        Err(_) => Err(TransferError::Timeout(timeout)),
    }
}

/// Request a payload from the peer over a new channel labelled `label`
///
/// `args.channel` is overwritten with the id of the new channel.
pub async fn request(
    session: &Arc<Session>,
    label: &str,
    command: &str,
    mut args: TransferRequest,
) -> Result<Bytes, TransferError> {
    let channel = session.open_channel(label)?;
    let id = channel.id();
    args.channel = id;

    let payload = serde_json::to_value(args).map_err(pagelink_core::ProtocolError::from)?;
    let message = ControlMessage::new(command, session.role().peer(), payload);
    let events = channel
        .take_events()
        .ok_or(TransferError::ChannelNotReady(id))?;

    let (ticket, slot) = session.transfers().register_ticket(id);
    debug!(id, ticket, label, command, scope = args.scope, "Request started");
    tokio::spawn(receive_reply(
        session.clone(),
        channel.clone(),
        events,
        message,
        ticket,
    ));

    let timeout = session.config().session.request_timeout();
    match await_slot(slot, timeout).await {
        Err(TransferError::Timeout(elapsed)) => {
            warn!(id, command, "Request timed out after {:?}", elapsed);
            session.transfers().forget_ticket(id, ticket);
            session.channels().remove_channel(&channel);
            channel.close();
            Err(TransferError::Timeout(elapsed))
        }
        result => result,
    }
}

/// Drive one request channel from open to close
async fn receive_reply(
    session: Arc<Session>,
    channel: Arc<DataChannel>,
    mut events: ChannelEvents,
    message: ControlMessage,
    ticket: u64,
) {
    let id = channel.id();
    let mut assembler = PayloadAssembler::new();
    let mut opened = false;

    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Open => {
                opened = true;
                session.channels().insert(channel.clone());
                if !session.send_control(&message) {
                    session.transfers().resolve_ticket(
                        id,
                        ticket,
                        Err(TransferError::ChannelNotReady(id)),
                    );
                    channel.close();
                }
            }
            ChannelEvent::Message(msg) => match assembler.accept(msg) {
                Ok(Progress::Complete) => {
                    debug!(id, bytes = assembler.received(), "Payload complete");
                    channel.close();
                }
                Ok(Progress::Pending) => {}
                Err(e) => {
                    warn!(id, "Transfer failed: {}", e);
                    session.transfers().resolve_ticket(id, ticket, Err(e));
                    channel.close();
                }
            },
            ChannelEvent::Close => break,
        }
    }

    session.channels().remove_channel(&channel);
    let result = if opened {
        assembler.finish()
    } else {
        Err(TransferError::ChannelNotReady(id))
    };
    // No-op when an error already resolved the slot
    session.transfers().resolve_ticket(id, ticket, result);
}
