//! Core type definitions for PageLink
//!
//! These types describe the session roles, the channel bookkeeping, and the
//! structured arguments carried by control messages.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Peer-assigned data channel identifier, unique while the channel is open
pub type ChannelId = u16;

/// Episode index a file-level request concerns
pub type Scope = u32;

/// Channel label for a full file transfer
pub const LABEL_FILE: &str = "file";

/// Channel label for a batched preview transfer
pub const LABEL_FILE_ABSTRACT: &str = "file_abstract";

/// Channel label for the session summary push
pub const LABEL_META: &str = "meta";

/// Which side of the session a peer plays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Role {
    Host = 0,
    Client = 1,
    Unspecified = 2,
}

impl Role {
    /// The role on the other end of the link
    pub fn peer(self) -> Role {
        match self {
            Role::Host => Role::Client,
            Role::Client => Role::Host,
            Role::Unspecified => Role::Unspecified,
        }
    }

    /// Whether a message targeted at `target` should be processed by this role
    pub fn accepts(self, target: Role) -> bool {
        target == self || target == Role::Unspecified
    }
}

impl TryFrom<u8> for Role {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Role::Host),
            1 => Ok(Role::Client),
            2 => Ok(Role::Unspecified),
            other => Err(ProtocolError::InvalidTarget(other)),
        }
    }
}

impl From<Role> for u8 {
    fn from(role: Role) -> Self {
        role as u8
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Client => write!(f, "client"),
            Role::Unspecified => write!(f, "unspecified"),
        }
    }
}

/// Connection lifecycle as observed from the underlying transport
///
/// Progresses one way: new -> connecting -> connected -> one of the
/// terminal states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Whether the connection can no longer carry traffic
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// Lifecycle of a single data channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Kind of library the host is sharing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// A single directory of page images
    Episode,
    /// Pages extracted from an e-book
    Book,
    /// A directory of episode directories
    Manga,
}

impl ContentKind {
    /// Whether the library has more than one scope
    pub fn is_multi_episode(self) -> bool {
        matches!(self, ContentKind::Manga)
    }
}

/// Display name and file count of one episode
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeMeta {
    pub name: String,
    pub length: u32,
    /// Scope this reply describes; older peers omit it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<Scope>,
}

impl EpisodeMeta {
    pub fn new(name: impl Into<String>, length: u32, index: Scope) -> Self {
        Self {
            name: name.into(),
            length,
            index: Some(index),
        }
    }
}

/// Episode entry in the session summary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeName {
    pub name: String,
}

/// Library description pushed by the host on the `meta` channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub kind: ContentKind,
    /// Series title (manga) or empty
    #[serde(default)]
    pub title: String,
    /// Title of the single episode or book, empty for manga
    #[serde(default)]
    pub episode: String,
    /// Episode names for multi-episode libraries
    #[serde(default)]
    pub episodes: Option<Vec<EpisodeName>>,
}

impl SessionSummary {
    /// Number of scopes the client can navigate
    pub fn scope_count(&self) -> usize {
        match &self.episodes {
            Some(episodes) => episodes.len(),
            None => 1,
        }
    }
}

/// Arguments of an `episode` request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeRequest {
    pub index: Scope,
}

/// Arguments of `abstract` and `fetch` requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub scope: Scope,
    /// File index within the scope (fetch only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Correlation token: the id of the channel the reply must use
    #[serde(default)]
    pub channel: ChannelId,
}

impl TransferRequest {
    pub fn fetch(scope: Scope, index: u32) -> Self {
        Self {
            scope,
            index: Some(index),
            channel: 0,
        }
    }

    pub fn preview(scope: Scope) -> Self {
        Self {
            scope,
            index: None,
            channel: 0,
        }
    }
}

/// Arguments of an `error` notification sent host -> client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    /// Transfer channel of the failed request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelId>,
    /// Scope of a failed episode request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_values() {
        assert_eq!(serde_json::to_string(&Role::Host).unwrap(), "0");
        assert_eq!(serde_json::to_string(&Role::Client).unwrap(), "1");
        assert_eq!(serde_json::from_str::<Role>("2").unwrap(), Role::Unspecified);
        assert!(serde_json::from_str::<Role>("7").is_err());
    }

    #[test]
    fn test_role_accepts() {
        assert!(Role::Client.accepts(Role::Client));
        assert!(Role::Client.accepts(Role::Unspecified));
        assert!(!Role::Client.accepts(Role::Host));
        assert!(!Role::Host.accepts(Role::Client));
        assert_eq!(Role::Host.peer(), Role::Client);
    }

    #[test]
    fn test_episode_meta_without_index() {
        let meta: EpisodeMeta = serde_json::from_str(r#"{"name":"Ch1","length":20}"#).unwrap();
        assert_eq!(meta.name, "Ch1");
        assert_eq!(meta.length, 20);
        assert_eq!(meta.index, None);
    }

    #[test]
    fn test_transfer_request_shape() {
        let mut req = TransferRequest::preview(3);
        req.channel = 5;
        let json = serde_json::to_value(req).unwrap();
        assert_eq!(json, serde_json::json!({"scope": 3, "channel": 5}));

        let fetch = TransferRequest::fetch(1, 4);
        let json = serde_json::to_value(fetch).unwrap();
        assert_eq!(json["index"], 4);
    }

    #[test]
    fn test_summary_scope_count() {
        let single = SessionSummary {
            kind: ContentKind::Episode,
            title: String::new(),
            episode: "Ch1".into(),
            episodes: None,
        };
        assert_eq!(single.scope_count(), 1);

        let manga = SessionSummary {
            kind: ContentKind::Manga,
            title: "Series".into(),
            episode: String::new(),
            episodes: Some(vec![
                EpisodeName { name: "1".into() },
                EpisodeName { name: "2".into() },
            ]),
        };
        assert_eq!(manga.scope_count(), 2);
        assert!(manga.kind.is_multi_episode());
    }

    #[test]
    fn test_connection_state_terminal() {
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
    }
}
