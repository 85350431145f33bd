//! Core traits and types for dav-storage backends.
//!
//! This crate defines the pieces shared between the local and networked stores:
//! - `StorageBackend`: Filesystem primitives a backing store provides
//! - `LockTable`: Shared TTL key/value table used as a distributed mutex
//! - `LockManager`: Ownership records and reader/writer gates on top of a table
//! - `DavStorage`: Resumable save, append, read, download, move and delete

mod backend;
mod config;
mod dav;
mod download;
mod error;
mod lock;
mod path;
mod storage;

pub use backend::{EntryKind, FileEntry, FileHandle, FopenMode, OpenFlags, StorageBackend};
pub use config::{RetryPolicy, StorageConfig, DEFAULT_MAX_LOCK_SECONDS, DEFAULT_MAX_NAME_ATTEMPTS};
pub use dav::{DownloadChunk, MkColResult, PropFind, ReadChunk, ResumableDav, SaveOutcome};
pub use download::Download;
pub use error::StorageError;
pub use lock::{
    Gate, GateEntry, GateMode, LockAcquireResult, LockManager, LockTable, MemoryLockTable,
};
pub use path::PathResolver;
pub use storage::{DavStorage, SAVE_RESERVATION};
