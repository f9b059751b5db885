//! PageLink host - serves a local library to the connected client

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::future::try_join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use pagelink_core::{
    Command, ContentKind, EpisodeMeta, EpisodeName, ProtocolError, RemoteError, Role, Scope,
    SessionSummary, TransferRequest, LABEL_FILE, LABEL_FILE_ABSTRACT, LABEL_META,
};

use crate::content::{sorted_dirs, sorted_files, ContentDir, ContentEntry, ContentError, ContentFile, MemFile};
use crate::session::{CommandHandler, Session, SessionError};
use crate::transfer::send_payload;
use crate::transport::{ChannelEvent, DataChannel};

type Files = Arc<Vec<Arc<dyn ContentFile>>>;
type Episodes = Arc<Vec<Arc<dyn ContentDir>>>;

/// What the host shares
#[derive(Clone)]
pub enum Library {
    /// One directory of pages
    Episode(Arc<dyn ContentDir>),
    /// Pages already extracted from an e-book
    Book {
        title: String,
        pages: Vec<Arc<dyn ContentFile>>,
    },
    /// A directory of episode directories
    Manga(Arc<dyn ContentDir>),
}

impl Library {
    pub fn kind(&self) -> ContentKind {
        match self {
            Library::Episode(_) => ContentKind::Episode,
            Library::Book { .. } => ContentKind::Book,
            Library::Manga(_) => ContentKind::Manga,
        }
    }

    /// Build a book from extracted pages, kept in the given order
    pub fn book(title: impl Into<String>, pages: Vec<(String, Bytes)>) -> Self {
        Library::Book {
            title: title.into(),
            pages: pages
                .into_iter()
                .map(|(name, data)| Arc::new(MemFile::new(name, data)) as Arc<dyn ContentFile>)
                .collect(),
        }
    }

    /// A directory holding only sub-directories is a manga; anything else
    /// is a single episode
    pub async fn detect(root: Arc<dyn ContentDir>) -> Result<Self, ContentError> {
        let entries = root.entries().await?;
        let has_files = entries.iter().any(|e| matches!(e, ContentEntry::File(_)));
        let has_dirs = entries.iter().any(|e| matches!(e, ContentEntry::Directory(_)));

        if has_dirs && !has_files {
            Ok(Library::Manga(root))
        } else {
            Ok(Library::Episode(root))
        }
    }
}

/// Host side of a session
pub struct HostPeer {
    library: Library,
    preview_size: usize,
    episodes: RwLock<Option<Episodes>>,
    scopes: DashMap<Scope, Files>,
}

impl HostPeer {
    pub fn new(library: Library, preview_size: usize) -> Self {
        Self {
            library,
            preview_size,
            episodes: RwLock::new(None),
            scopes: DashMap::new(),
        }
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    async fn episodes(&self, root: &dyn ContentDir) -> Result<Episodes, ContentError> {
        let cached = self.episodes.read().clone();
        if let Some(episodes) = cached {
            return Ok(episodes);
        }
        let episodes = Arc::new(sorted_dirs(root).await?);
        *self.episodes.write() = Some(episodes.clone());
        Ok(episodes)
    }

    async fn episode_dir(
        &self,
        root: &dyn ContentDir,
        scope: Scope,
    ) -> Result<Arc<dyn ContentDir>, ContentError> {
        let episodes = self.episodes(root).await?;
        episodes
            .get(scope as usize)
            .cloned()
            .ok_or(ContentError::ScopeOutOfRange {
                scope,
                count: episodes.len(),
            })
    }

    /// Files of one scope in natural order, cached until `invalidate`
    pub async fn files(&self, scope: Scope) -> Result<Files, ContentError> {
        let cached = self.scopes.get(&scope).map(|files| files.clone());
        if let Some(files) = cached {
            return Ok(files);
        }

        let files = match &self.library {
            Library::Episode(dir) => {
                single_scope(scope)?;
                sorted_files(dir.as_ref()).await?
            }
            Library::Book { pages, .. } => {
                single_scope(scope)?;
                pages.clone()
            }
            Library::Manga(root) => {
                let dir = self.episode_dir(root.as_ref(), scope).await?;
                sorted_files(dir.as_ref()).await?
            }
        };

        let files = Arc::new(files);
        self.scopes.insert(scope, files.clone());
        Ok(files)
    }

    /// Display name and file count of one scope
    pub async fn episode_meta(&self, scope: Scope) -> Result<EpisodeMeta, ContentError> {
        let name = match &self.library {
            Library::Episode(dir) => {
                single_scope(scope)?;
                dir.name().to_string()
            }
            Library::Book { title, .. } => {
                single_scope(scope)?;
                title.clone()
            }
            Library::Manga(root) => self.episode_dir(root.as_ref(), scope).await?.name().to_string(),
        };
        let files = self.files(scope).await?;
        Ok(EpisodeMeta::new(name, files.len() as u32, scope))
    }

    /// Library description pushed on connect
    pub async fn summary(&self) -> Result<SessionSummary, ContentError> {
        let summary = match &self.library {
            Library::Episode(dir) => SessionSummary {
                kind: ContentKind::Episode,
                title: String::new(),
                episode: dir.name().to_string(),
                episodes: None,
            },
            Library::Book { title, .. } => SessionSummary {
                kind: ContentKind::Book,
                title: String::new(),
                episode: title.clone(),
                episodes: None,
            },
            Library::Manga(root) => {
                let episodes = self.episodes(root.as_ref()).await?;
                SessionSummary {
                    kind: ContentKind::Manga,
                    title: root.name().to_string(),
                    episode: String::new(),
                    episodes: Some(
                        episodes
                            .iter()
                            .map(|dir| EpisodeName {
                                name: dir.name().to_string(),
                            })
                            .collect(),
                    ),
                }
            }
        };
        Ok(summary)
    }

    /// Full bytes of one file
    pub async fn file_bytes(&self, scope: Scope, index: u32) -> Result<Bytes, ContentError> {
        let files = self.files(scope).await?;
        let file = files
            .get(index as usize)
            .ok_or(ContentError::IndexOutOfRange {
                index,
                count: files.len(),
            })?;
        file.bytes().await
    }

    /// Leading `preview_size` bytes of every file in the scope, concatenated
    pub async fn preview_bytes(&self, scope: Scope) -> Result<Bytes, ContentError> {
        let files = self.files(scope).await?;
        let heads = try_join_all(files.iter().map(|file| file.head(self.preview_size))).await?;

        let mut buf = BytesMut::with_capacity(heads.iter().map(Bytes::len).sum());
        for head in heads {
            buf.extend_from_slice(&head);
        }
        Ok(buf.freeze())
    }

    /// Drop cached listings
    pub fn invalidate(&self) {
        *self.episodes.write() = None;
        self.scopes.clear();
    }

    /// Push the session summary over a fresh `meta` channel
    pub async fn push_summary(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        let summary = self.summary().await?;
        let text = serde_json::to_string(&summary).map_err(ProtocolError::from)?;

        let channel = session.open_channel(LABEL_META)?;
        let mut events = channel
            .take_events()
            .ok_or(SessionError::ControlUnavailable)?;

        info!(kind = ?summary.kind, scopes = summary.scope_count(), "Pushing session summary");
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Open => {
                        if let Err(e) = channel.send_text(text.clone()) {
                            warn!("Failed to send summary: {}", e);
                            channel.close();
                        }
                    }
                    ChannelEvent::Close => break,
                    ChannelEvent::Message(_) => {}
                }
            }
        });
        Ok(())
    }

    /// Re-read the library and push a fresh summary
    pub async fn refresh(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        self.invalidate();
        self.push_summary(session).await
    }

    async fn handle_episode(&self, session: &Arc<Session>, scope: Scope) -> Result<(), SessionError> {
        match self.episode_meta(scope).await {
            Ok(meta) => {
                debug!(scope, name = %meta.name, length = meta.length, "Episode requested");
                session.send_command(&Command::EpisodeReply(meta), Role::Client);
                Ok(())
            }
            Err(e) => {
                report_error(session, &e.to_string(), None, Some(scope));
                Err(e.into())
            }
        }
    }

    async fn handle_transfer(
        &self,
        session: &Arc<Session>,
        req: TransferRequest,
        payload: Result<Bytes, ContentError>,
    ) -> Result<(), SessionError> {
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                report_error(session, &e.to_string(), Some(req.channel), None);
                return Err(e.into());
            }
        };

        let wait = session.config().session.channel_wait();
        let channel = match session.channels().wait_for(req.channel, wait).await {
            Some(channel) => channel,
            None => {
                report_error(session, "transfer channel not found", Some(req.channel), None);
                return Err(SessionError::UnknownChannel(req.channel));
            }
        };

        let report = send_payload(
            &channel,
            payload,
            session.max_message_size(),
            &session.config().transfer,
        )
        .await?;
        debug!(
            channel = req.channel,
            scope = req.scope,
            bytes = report.bytes,
            pauses = report.pauses,
            "Transfer queued"
        );
        Ok(())
    }
}

fn single_scope(scope: Scope) -> Result<(), ContentError> {
    if scope != 0 {
        return Err(ContentError::ScopeOutOfRange { scope, count: 1 });
    }
    Ok(())
}

fn report_error(
    session: &Session,
    message: &str,
    channel: Option<pagelink_core::ChannelId>,
    scope: Option<Scope>,
) {
    warn!(?channel, ?scope, "Cannot serve request: {}", message);
    let error = RemoteError {
        message: message.to_string(),
        channel,
        scope,
    };
    session.send_command(&Command::Error(error), Role::Client);
}

#[async_trait]
impl CommandHandler for HostPeer {
    async fn on_connected(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        self.push_summary(session).await
    }

    async fn on_channel_offered(&self, session: &Arc<Session>, channel: Arc<DataChannel>) {
        match channel.label() {
            LABEL_FILE | LABEL_FILE_ABSTRACT => session.track_channel(channel),
            other => {
                warn!(id = channel.id(), "Unexpected channel label {:?}", other);
                channel.close();
            }
        }
    }

    async fn on_command(&self, session: &Arc<Session>, command: Command) -> Result<(), SessionError> {
        match command {
            Command::EpisodeRequest(req) => self.handle_episode(session, req.index).await,
            Command::Abstract(req) => {
                let payload = self.preview_bytes(req.scope).await;
                self.handle_transfer(session, req, payload).await
            }
            Command::Fetch(req) => {
                let payload = match req.index {
                    Some(index) => self.file_bytes(req.scope, index).await,
                    None => {
                        return Err(ProtocolError::InvalidArguments {
                            command: "fetch".into(),
                            reason: "missing file index".into(),
                        }
                        .into())
                    }
                };
                self.handle_transfer(session, req, payload).await
            }
            Command::Meta => self.refresh(session).await,
            other => Err(SessionError::UnexpectedCommand(other.name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemDir;

    fn manga() -> Library {
        let root = MemDir::new("Series")
            .with_dir(
                MemDir::new("Episode 10")
                    .with_file("1.png", vec![1u8; 10])
                    .with_file("2.png", vec![2u8; 10]),
            )
            .with_dir(MemDir::new("Episode 2").with_file("1.png", vec![3u8; 4000]));
        Library::Manga(Arc::new(root))
    }

    #[tokio::test]
    async fn test_manga_summary_in_natural_order() {
        let host = HostPeer::new(manga(), 2048);
        let summary = host.summary().await.unwrap();
        assert_eq!(summary.kind, ContentKind::Manga);
        assert_eq!(summary.title, "Series");
        let names: Vec<String> = summary
            .episodes
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["Episode 2", "Episode 10"]);
    }

    #[tokio::test]
    async fn test_episode_meta_per_scope() {
        let host = HostPeer::new(manga(), 2048);
        assert_eq!(
            host.episode_meta(1).await.unwrap(),
            EpisodeMeta::new("Episode 10", 2, 1)
        );
        assert_eq!(
            host.episode_meta(5).await,
            Err(ContentError::ScopeOutOfRange { scope: 5, count: 2 })
        );
    }

    #[tokio::test]
    async fn test_preview_truncates_each_file() {
        let host = HostPeer::new(manga(), 2048);
        assert_eq!(host.preview_bytes(0).await.unwrap().len(), 2048);
        assert_eq!(host.preview_bytes(1).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_file_bytes_out_of_range() {
        let host = HostPeer::new(manga(), 2048);
        assert_eq!(host.file_bytes(1, 1).await.unwrap(), Bytes::from(vec![2u8; 10]));
        assert_eq!(
            host.file_bytes(1, 2).await,
            Err(ContentError::IndexOutOfRange { index: 2, count: 2 })
        );
    }

    #[tokio::test]
    async fn test_book_single_scope() {
        let library = Library::book(
            "Novel",
            vec![
                ("cover".into(), Bytes::from_static(b"c")),
                ("page".into(), Bytes::from_static(b"p")),
            ],
        );
        let host = HostPeer::new(library, 2048);
        assert_eq!(host.episode_meta(0).await.unwrap().length, 2);
        assert_eq!(host.summary().await.unwrap().episode, "Novel");
        assert!(host.files(1).await.is_err());
    }

    #[tokio::test]
    async fn test_detect_library_kind() {
        let episode = Arc::new(MemDir::new("ep").with_file("1.png", vec![0u8]));
        assert_eq!(Library::detect(episode).await.unwrap().kind(), ContentKind::Episode);

        let series = Arc::new(MemDir::new("s").with_dir(MemDir::new("1")));
        assert_eq!(Library::detect(series).await.unwrap().kind(), ContentKind::Manga);
    }

    #[tokio::test]
    async fn test_invalidate_rereads() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("1.png"), b"a").unwrap();
        let host = HostPeer::new(
            Library::Episode(Arc::new(crate::content::FsDir::new(temp.path()))),
            2048,
        );
        assert_eq!(host.files(0).await.unwrap().len(), 1);

        std::fs::write(temp.path().join("2.png"), b"b").unwrap();
        assert_eq!(host.files(0).await.unwrap().len(), 1);
        host.invalidate();
        assert_eq!(host.files(0).await.unwrap().len(), 2);
    }
}
