use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Open flags understood by every backend.
///
/// Mirrors the POSIX `O_*` bits the operations need. `exclusive` only has a
/// meaning together with `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
}

impl OpenFlags {
    /// `O_RDONLY`
    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            exclusive: false,
            truncate: false,
        }
    }

    /// `O_WRONLY | O_CREAT | O_EXCL`: fails if the target exists.
    pub const fn exclusive_create() -> Self {
        Self {
            read: false,
            write: true,
            append: false,
            create: true,
            exclusive: true,
            truncate: false,
        }
    }

    /// `O_WRONLY | O_CREAT | O_APPEND`
    pub const fn append() -> Self {
        Self {
            read: false,
            write: true,
            append: true,
            create: true,
            exclusive: false,
            truncate: false,
        }
    }

    /// `O_WRONLY | O_CREAT | O_TRUNC`
    pub const fn write_truncate() -> Self {
        Self {
            read: false,
            write: true,
            append: false,
            create: true,
            exclusive: false,
            truncate: true,
        }
    }
}

/// Stream-style open modes (`r`, `w`, `a`, `a+`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FopenMode {
    Read,
    Write,
    Append,
    ReadAppend,
}

impl FopenMode {
    pub fn flags(self) -> OpenFlags {
        match self {
            FopenMode::Read => OpenFlags::read_only(),
            FopenMode::Write => OpenFlags::write_truncate(),
            FopenMode::Append => OpenFlags::append(),
            FopenMode::ReadAppend => OpenFlags {
                read: true,
                ..OpenFlags::append()
            },
        }
    }
}

/// Kind of a storage entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Collection,
}

/// Metadata of a file or collection as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub accessed_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Inode change time on POSIX backends.
    pub changed_at: DateTime<Utc>,
    /// Permission bits (`st_mode & 0o7777`).
    pub mode: u32,
}

/// An open file on a backend.
#[async_trait]
pub trait FileHandle: Send {
    /// Write the whole buffer at the current position.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Read up to `len` bytes starting at `offset`. Short only at end of file.
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError>;

    /// Read from the start to end of file.
    async fn read_to_end(&mut self) -> Result<Vec<u8>, StorageError>;

    async fn fstat(&mut self) -> Result<FileEntry, StorageError>;

    /// Flush pending writes. The handle is released on drop.
    async fn close(&mut self) -> Result<(), StorageError>;
}

/// Storage backend abstraction over a POSIX-like namespace.
///
/// Paths are absolute, already resolved against the configured location.
/// Backends give no concurrency guarantees of their own; mutual exclusion is
/// the job of the lock table.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Returns the backend identifier (e.g., "local", "gluster").
    fn backend_name(&self) -> &'static str;

    /// Make the backend ready for I/O. Idempotent.
    async fn mount(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool, StorageError>;

    async fn is_file(&self, path: &Path) -> Result<bool, StorageError>;

    async fn is_dir(&self, path: &Path) -> Result<bool, StorageError>;

    /// Entry names of a directory, without `.` and `..`.
    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, StorageError>;

    /// Open `path` with POSIX-style flags. `mode` applies when creating.
    async fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Box<dyn FileHandle>, StorageError>;

    /// Stream-style open with the default creation mode.
    async fn fopen(&self, path: &Path, mode: FopenMode) -> Result<Box<dyn FileHandle>, StorageError> {
        self.open(path, mode.flags(), 0o666).await
    }

    async fn stat(&self, path: &Path) -> Result<FileEntry, StorageError>;

    async fn size(&self, path: &Path) -> Result<u64, StorageError> {
        Ok(self.stat(path).await?.size)
    }

    async fn accessed_time(&self, path: &Path) -> Result<DateTime<Utc>, StorageError> {
        Ok(self.stat(path).await?.accessed_at)
    }

    async fn modified_time(&self, path: &Path) -> Result<DateTime<Utc>, StorageError> {
        Ok(self.stat(path).await?.modified_at)
    }

    async fn changed_time(&self, path: &Path) -> Result<DateTime<Utc>, StorageError> {
        Ok(self.stat(path).await?.changed_at)
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), StorageError>;

    /// Create `path` and any missing ancestors.
    async fn make_dirs(&self, path: &Path, mode: Option<u32>) -> Result<(), StorageError>;

    async fn remove(&self, path: &Path) -> Result<(), StorageError>;

    /// Copy file contents and permission bits from `src` to `dst`.
    async fn copy(&self, src: &Path, dst: &Path) -> Result<(), StorageError>;

    /// Backend-internal location of a path, for backends whose files have no
    /// public URL.
    fn internal_url(&self, _path: &Path) -> Option<String> {
        None
    }
}
