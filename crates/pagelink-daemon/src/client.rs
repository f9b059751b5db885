//! PageLink client - mirrors the host's library and fetches on demand
//!
//! `ClientPeer` is the client's command handler. Once connected it exposes a
//! `RemoteLibrary`, whose episodes and files implement the same content
//! traits as local directories, backed by requests to the host.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use pagelink_core::{
    Command, EpisodeMeta, EpisodeRequest, RemoteError, Role, Scope, SessionSummary,
    TransferRequest, CMD_ABSTRACT, CMD_FETCH, CONTROL_CHANNEL_ID, LABEL_FILE,
    LABEL_FILE_ABSTRACT, LABEL_META,
};

use crate::content::{ContentDir, ContentEntry, ContentError, ContentFile};
use crate::correlator::{await_slot, PendingTable};
use crate::session::{CommandHandler, Session, SessionError};
use crate::transfer::TransferError;
use crate::transport::{ChannelEvent, ChannelMessage, DataChannel};

/// Client-side view of what the host has announced
struct Mirror {
    summary: watch::Sender<Option<SessionSummary>>,
    episodes: RwLock<BTreeMap<Scope, EpisodeMeta>>,
    scope: AtomicU32,
    /// Scope of the latest episode request; replies without an index land here
    requested: AtomicU32,
    episode_waiters: PendingTable<Scope, EpisodeMeta>,
    preview_size: usize,
}

impl Mirror {
    fn store_episode(&self, meta: EpisodeMeta) -> Scope {
        let scope = meta
            .index
            .unwrap_or_else(|| self.requested.load(Ordering::SeqCst));
        let meta = EpisodeMeta {
            index: Some(scope),
            ..meta
        };
        self.episodes.write().insert(scope, meta.clone());
        self.episode_waiters.resolve(scope, Ok(meta));
        scope
    }

    fn ingest_summary(&self, text: &str) {
        match serde_json::from_str::<SessionSummary>(text) {
            Ok(summary) => {
                info!(
                    kind = ?summary.kind,
                    scopes = summary.scope_count(),
                    "Received session summary"
                );
                self.summary.send_replace(Some(summary));
            }
            Err(e) => warn!("Malformed session summary: {}", e),
        }
    }
}

/// Client side of a session
pub struct ClientPeer {
    mirror: Arc<Mirror>,
    library: watch::Sender<Option<RemoteLibrary>>,
}

impl ClientPeer {
    pub fn new(preview_size: usize) -> Self {
        let (summary, _) = watch::channel(None);
        let (library, _) = watch::channel(None);
        Self {
            mirror: Arc::new(Mirror {
                summary,
                episodes: RwLock::new(BTreeMap::new()),
                scope: AtomicU32::new(0),
                requested: AtomicU32::new(0),
                episode_waiters: PendingTable::new(),
                preview_size,
            }),
            library,
        }
    }

    /// The remote library, once the session has connected
    pub fn library(&self) -> Option<RemoteLibrary> {
        self.library.borrow().clone()
    }

    /// Wait for the session to connect and expose the remote library
    pub async fn wait_library(&self) -> RemoteLibrary {
        let mut rx = self.library.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(library) = current {
                return library;
            }
            // The sender lives in `self`, so this only fails if it was dropped
            let _ = rx.changed().await;
        }
    }

    fn fail_request(&self, session: &Session, error: RemoteError) {
        let mut matched = false;
        if let Some(id) = error.channel {
            matched |= session
                .transfers()
                .resolve(id, Err(TransferError::Remote(error.message.clone())));
            if let Some(channel) = session.channels().get(id) {
                channel.close();
            }
        }
        if let Some(scope) = error.scope {
            matched |= self
                .mirror
                .episode_waiters
                .resolve(scope, Err(TransferError::Remote(error.message.clone())));
        }
        if !matched {
            warn!("Host reported an error: {}", error.message);
        }
    }
}

#[async_trait]
impl CommandHandler for ClientPeer {
    async fn on_connected(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        debug!("Constructing remote library");
        self.library.send_replace(Some(RemoteLibrary {
            session: session.clone(),
            mirror: self.mirror.clone(),
        }));
        Ok(())
    }

    async fn on_channel_offered(&self, session: &Arc<Session>, channel: Arc<DataChannel>) {
        match channel.label() {
            LABEL_META => {
                let Some(mut events) = channel.take_events() else {
                    return;
                };
                let mirror = self.mirror.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        match event {
                            ChannelEvent::Message(ChannelMessage::Text(text)) => {
                                mirror.ingest_summary(&text);
                                channel.close();
                            }
                            ChannelEvent::Message(ChannelMessage::Binary(_)) => {
                                warn!("Ignoring binary data on meta channel");
                            }
                            ChannelEvent::Open => {}
                            ChannelEvent::Close => break,
                        }
                    }
                });
            }
            LABEL_FILE | LABEL_FILE_ABSTRACT => session.track_channel(channel),
            other => {
                warn!(id = channel.id(), "Unexpected channel label {:?}", other);
                channel.close();
            }
        }
    }

    async fn on_command(&self, session: &Arc<Session>, command: Command) -> Result<(), SessionError> {
        match command {
            Command::EpisodeReply(meta) => {
                let scope = self.mirror.store_episode(meta);
                debug!(scope, "Episode metadata stored");
                Ok(())
            }
            Command::Error(error) => {
                self.fail_request(session, error);
                Ok(())
            }
            other => Err(SessionError::UnexpectedCommand(other.name())),
        }
    }
}

/// Handle to the host's library
#[derive(Clone)]
pub struct RemoteLibrary {
    session: Arc<Session>,
    mirror: Arc<Mirror>,
}

impl RemoteLibrary {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Last summary pushed by the host
    pub fn summary(&self) -> Option<SessionSummary> {
        self.mirror.summary.borrow().clone()
    }

    /// Wait for the host's summary, bounded by the request timeout
    pub async fn wait_summary(&self) -> Result<SessionSummary, TransferError> {
        let timeout = self.session.config().session.request_timeout();
        let mut rx = self.mirror.summary.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(summary) = current {
                    return Ok(summary);
                }
                if rx.changed().await.is_err() {
                    return Err(TransferError::Cancelled);
                }
            }
        })
        .await
        .map_err(|_| TransferError::Timeout(timeout))?
    }

    /// Ask the host to push its summary again
    pub fn resync(&self) -> bool {
        self.session.send_command(&Command::Meta, Role::Host)
    }

    pub fn current_scope(&self) -> Scope {
        self.mirror.scope.load(Ordering::SeqCst)
    }

    pub fn set_scope(&self, scope: Scope) {
        self.mirror.scope.store(scope, Ordering::SeqCst);
    }

    /// Fetch metadata for episode `index` and make it the current scope
    pub async fn request_episode(&self, index: Scope) -> Result<EpisodeMeta, TransferError> {
        let slot = self.mirror.episode_waiters.register(index);
        self.mirror.requested.store(index, Ordering::SeqCst);
        let command = Command::EpisodeRequest(EpisodeRequest { index });
        if !self.session.send_command(&command, Role::Host) {
            self.mirror.episode_waiters.forget(index);
            return Err(TransferError::ChannelNotReady(CONTROL_CHANNEL_ID));
        }

        let timeout = self.session.config().session.request_timeout();
        let meta = match await_slot(slot, timeout).await {
            Err(TransferError::Timeout(elapsed)) => {
                self.mirror.episode_waiters.forget(index);
                return Err(TransferError::Timeout(elapsed));
            }
            result => result?,
        };
        self.set_scope(index);
        Ok(meta)
    }

    /// Episodes described so far, ordered by scope; fetches nothing
    pub fn list_episodes(&self) -> Vec<EpisodeMeta> {
        self.mirror.episodes.read().values().cloned().collect()
    }

    pub fn episode(&self, scope: Scope) -> Option<EpisodeMeta> {
        self.mirror.episodes.read().get(&scope).cloned()
    }

    /// Directory-like handle for a described episode
    pub fn episode_dir(&self, scope: Scope) -> Option<RemoteEpisode> {
        self.episode(scope).map(|meta| RemoteEpisode {
            library: self.clone(),
            scope,
            meta,
        })
    }

    /// File handles of a described episode
    pub fn files(&self, scope: Scope) -> Vec<RemoteFile> {
        let length = self.episode(scope).map(|meta| meta.length).unwrap_or(0);
        (0..length)
            .map(|index| RemoteFile {
                library: self.clone(),
                scope,
                index,
                name: index.to_string(),
            })
            .collect()
    }

    /// Full bytes of file `index` in the current scope
    pub async fn get_file(&self, index: u32) -> Result<Bytes, TransferError> {
        self.fetch(self.current_scope(), index).await
    }

    pub async fn fetch(&self, scope: Scope, index: u32) -> Result<Bytes, TransferError> {
        self.session
            .request(LABEL_FILE, CMD_FETCH, TransferRequest::fetch(scope, index))
            .await
    }

    /// Preview segments for every file in the current scope
    pub async fn get_abstract_sequence(&self) -> Result<Vec<Bytes>, TransferError> {
        let scope = self.current_scope();
        let count = match self.episode(scope) {
            Some(meta) => meta.length,
            None => self.request_episode(scope).await?.length,
        };

        let data = self
            .session
            .request(LABEL_FILE_ABSTRACT, CMD_ABSTRACT, TransferRequest::preview(scope))
            .await?;
        Ok(split_previews(&data, count as usize, self.mirror.preview_size))
    }
}

/// Cut a preview concatenation into one segment per file
///
/// Segments sit at fixed `preview_size` boundaries; when files shorter than
/// the preview size precede others, later segments straddle file edges.
pub fn split_previews(data: &Bytes, count: usize, preview_size: usize) -> Vec<Bytes> {
    (0..count)
        .map(|i| {
            let start = (i * preview_size).min(data.len());
            let end = (start + preview_size).min(data.len());
            data.slice(start..end)
        })
        .collect()
}

/// Remote episode
pub struct RemoteEpisode {
    library: RemoteLibrary,
    scope: Scope,
    meta: EpisodeMeta,
}

impl RemoteEpisode {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn len(&self) -> u32 {
        self.meta.length
    }

    pub fn is_empty(&self) -> bool {
        self.meta.length == 0
    }
}

#[async_trait]
impl ContentDir for RemoteEpisode {
    fn name(&self) -> &str {
        &self.meta.name
    }

    async fn entries(&self) -> Result<Vec<ContentEntry>, ContentError> {
        Ok(self
            .library
            .files(self.scope)
            .into_iter()
            .map(|file| ContentEntry::File(Arc::new(file)))
            .collect())
    }
}

/// Remote file, fetched on each read
#[derive(Clone)]
pub struct RemoteFile {
    library: RemoteLibrary,
    scope: Scope,
    index: u32,
    name: String,
}

impl RemoteFile {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

#[async_trait]
impl ContentFile for RemoteFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bytes(&self) -> Result<Bytes, ContentError> {
        self.library
            .fetch(self.scope, self.index)
            .await
            .map_err(|e| ContentError::Unavailable(e.to_string()))
    }
}
