use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;

use crate::backend::FileEntry;
use crate::download::Download;
use crate::error::StorageError;
use crate::lock::LockAcquireResult;

/// Result of a save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaveOutcome {
    /// Content stored under `name`, which may differ from the requested name.
    Saved { name: String },
    /// Another caller holds the path; nothing was written.
    InUse { holder: Option<String> },
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved { .. })
    }

    /// Stored name, if the save went through.
    pub fn name(&self) -> Option<&str> {
        match self {
            SaveOutcome::Saved { name } => Some(name),
            SaveOutcome::InUse { .. } => None,
        }
    }
}

/// Result of a collection creation. Unexpected failures are reported in
/// `error` instead of being raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MkColResult {
    pub created: bool,
    pub error: Option<String>,
}

impl MkColResult {
    pub fn created() -> Self {
        Self {
            created: true,
            error: None,
        }
    }

    pub fn not_created() -> Self {
        Self {
            created: false,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            created: false,
            error: Some(error.into()),
        }
    }
}

/// Properties of a stored entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropFind {
    pub name: String,
    pub valid_name: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub entry: FileEntry,
}

/// Bytes returned by a chunked read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadChunk {
    pub data: Vec<u8>,
    pub bytes_read: usize,
}

impl ReadChunk {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// One step of a download: the bytes, their count and the offset after them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadChunk {
    pub data: Vec<u8>,
    pub bytes_read: usize,
    pub offset: u64,
}

/// Resumable WebDAV-style operations over one storage backend.
///
/// Names are logical, relative to the configured location. Mutations are
/// serialized per path through the shared lock table and report contention
/// as data (`false`, `InUse`) rather than as errors.
#[async_trait]
pub trait ResumableDav: Send + Sync {
    /// Identifier of the backing store.
    fn backend_name(&self) -> &'static str;

    /// Absolute backend path of `name`.
    fn path(&self, name: &str) -> Result<PathBuf, StorageError>;

    /// URL of `name`: public when a base URL is configured, internal for
    /// backends without public access.
    fn url(&self, name: &str) -> Result<String, StorageError>;

    async fn exists(&self, name: &str) -> Result<bool, StorageError>;

    async fn size(&self, name: &str) -> Result<u64, StorageError>;

    async fn accessed_time(&self, name: &str) -> Result<DateTime<Utc>, StorageError>;

    async fn modified_time(&self, name: &str) -> Result<DateTime<Utc>, StorageError>;

    async fn created_time(&self, name: &str) -> Result<DateTime<Utc>, StorageError>;

    /// `(directories, files)` directly under `name`; both empty when `name`
    /// is not a directory.
    async fn list_dir(&self, name: &str) -> Result<(Vec<String>, Vec<String>), StorageError>;

    async fn is_locked(&self, name: &str) -> Result<bool, StorageError>;

    async fn lock(&self, name: &str, owner: &str) -> Result<LockAcquireResult, StorageError>;

    async fn unlock(&self, name: &str, owner: &str) -> Result<Option<String>, StorageError>;

    /// Store a single buffer under `name` or a free alternative.
    async fn save(&self, name: &str, data: &[u8]) -> Result<SaveOutcome, StorageError> {
        let content =
            stream::iter(std::iter::once(Ok::<_, StorageError>(Bytes::copy_from_slice(data)))).boxed();
        self.save_stream(name, content).await
    }

    /// Store a chunked source under `name` or a free alternative.
    async fn save_stream(
        &self,
        name: &str,
        content: BoxStream<'_, Result<Bytes, StorageError>>,
    ) -> Result<SaveOutcome, StorageError>;

    /// Append to `name`, creating it if needed. `false` when another
    /// identity holds the path.
    async fn append(&self, name: &str, content: &[u8], identity: &str) -> Result<bool, StorageError>;

    /// Remove `name`. `true` only if something was removed.
    async fn delete(&self, name: &str, identity: &str) -> Result<bool, StorageError>;

    /// Move `name` to `new_name`. Requires `identity` to hold the lock on
    /// `name`; the lock is released afterwards.
    async fn move_to(&self, name: &str, new_name: &str, identity: &str) -> Result<bool, StorageError>;

    async fn mk_collection(&self, name: &str, identity: &str) -> Result<MkColResult, StorageError>;

    async fn propfind(&self, name: &str) -> Result<PropFind, StorageError>;

    /// Whole content of `name`, `None` if it does not exist.
    async fn safe_read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Up to `length` bytes of `name` from `offset`. Offsets past the end
    /// yield an empty chunk.
    async fn safe_read_chunk(
        &self,
        name: &str,
        offset: u64,
        length: usize,
    ) -> Result<ReadChunk, StorageError>;

    /// Pull-based download of `name` in chunks of at most `max_chunk` bytes.
    async fn download<'a>(
        &'a self,
        name: &str,
        max_chunk: usize,
    ) -> Result<Download<'a>, StorageError>;
}
