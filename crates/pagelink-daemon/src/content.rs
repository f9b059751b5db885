//! Content abstraction
//!
//! The host serves, and the client mirrors, a tree of directories and files
//! with two capabilities: enumerate entries, and read bytes lazily. Local
//! directories, in-memory page lists and the client's remote proxies all
//! implement the same traits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::trace;

use pagelink_core::path::{display_name, sort_natural};
use pagelink_core::Scope;

/// Content errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("episode {scope} out of range ({count} available)")]
    ScopeOutOfRange { scope: Scope, count: usize },

    #[error("file {index} out of range ({count} available)")]
    IndexOutOfRange { index: u32, count: usize },

    #[error("content unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for ContentError {
    fn from(e: std::io::Error) -> Self {
        ContentError::Io(e.to_string())
    }
}

/// A readable file
#[async_trait]
pub trait ContentFile: Send + Sync {
    fn name(&self) -> &str;

    /// Full contents
    async fn bytes(&self) -> Result<Bytes, ContentError>;

    /// At most `len` leading bytes
    async fn head(&self, len: usize) -> Result<Bytes, ContentError> {
        let data = self.bytes().await?;
        Ok(data.slice(..len.min(data.len())))
    }
}

/// An enumerable directory
#[async_trait]
pub trait ContentDir: Send + Sync {
    fn name(&self) -> &str;

    async fn entries(&self) -> Result<Vec<ContentEntry>, ContentError>;
}

/// Directory entry
#[derive(Clone)]
pub enum ContentEntry {
    File(Arc<dyn ContentFile>),
    Directory(Arc<dyn ContentDir>),
}

impl ContentEntry {
    pub fn name(&self) -> &str {
        match self {
            ContentEntry::File(file) => file.name(),
            ContentEntry::Directory(dir) => dir.name(),
        }
    }
}

impl std::fmt::Debug for ContentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentEntry::File(file) => write!(f, "File({})", file.name()),
            ContentEntry::Directory(dir) => write!(f, "Directory({})", dir.name()),
        }
    }
}

/// Files of a directory in natural order
pub async fn sorted_files(dir: &dyn ContentDir) -> Result<Vec<Arc<dyn ContentFile>>, ContentError> {
    let mut files: Vec<Arc<dyn ContentFile>> = dir
        .entries()
        .await?
        .into_iter()
        .filter_map(|entry| match entry {
            ContentEntry::File(file) => Some(file),
            ContentEntry::Directory(_) => None,
        })
        .collect();
    sort_natural(&mut files, |f| f.name());
    Ok(files)
}

/// Sub-directories of a directory in natural order
pub async fn sorted_dirs(dir: &dyn ContentDir) -> Result<Vec<Arc<dyn ContentDir>>, ContentError> {
    let mut dirs: Vec<Arc<dyn ContentDir>> = dir
        .entries()
        .await?
        .into_iter()
        .filter_map(|entry| match entry {
            ContentEntry::Directory(dir) => Some(dir),
            ContentEntry::File(_) => None,
        })
        .collect();
    sort_natural(&mut dirs, |d| d.name());
    Ok(dirs)
}

/// Directory on the local filesystem
pub struct FsDir {
    path: PathBuf,
    name: String,
}

impl FsDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = display_name(&path);
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ContentDir for FsDir {
    fn name(&self) -> &str {
        &self.name
    }

    async fn entries(&self) -> Result<Vec<ContentEntry>, ContentError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.path).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            // Follow symlinks
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    trace!("Skipping {:?}: {}", path, e);
                    continue;
                }
            };
            if metadata.is_dir() {
                entries.push(ContentEntry::Directory(Arc::new(FsDir::new(path))));
            } else if metadata.is_file() {
                entries.push(ContentEntry::File(Arc::new(FsFile::new(path))));
            }
        }

        Ok(entries)
    }
}

/// File on the local filesystem
pub struct FsFile {
    path: PathBuf,
    name: String,
}

impl FsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = display_name(&path);
        Self { path, name }
    }
}

#[async_trait]
impl ContentFile for FsFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bytes(&self) -> Result<Bytes, ContentError> {
        Ok(tokio::fs::read(&self.path).await?.into())
    }

    async fn head(&self, len: usize) -> Result<Bytes, ContentError> {
        let file = tokio::fs::File::open(&self.path).await?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf.into())
    }
}

/// In-memory file, e.g. a page already extracted from an e-book
pub struct MemFile {
    name: String,
    data: Bytes,
}

impl MemFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl ContentFile for MemFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bytes(&self) -> Result<Bytes, ContentError> {
        Ok(self.data.clone())
    }
}

/// In-memory directory
pub struct MemDir {
    name: String,
    entries: Vec<ContentEntry>,
}

impl MemDir {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.entries
            .push(ContentEntry::File(Arc::new(MemFile::new(name, data))));
        self
    }

    pub fn with_dir(mut self, dir: MemDir) -> Self {
        self.entries.push(ContentEntry::Directory(Arc::new(dir)));
        self
    }
}

#[async_trait]
impl ContentDir for MemDir {
    fn name(&self) -> &str {
        &self.name
    }

    async fn entries(&self) -> Result<Vec<ContentEntry>, ContentError> {
        Ok(self.entries.clone())
    }
}
