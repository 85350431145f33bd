//! Local filesystem backend for dav-storage.
//!
//! - `LocalBackend`: `StorageBackend` on `tokio::fs`
//! - `FileLockTable`: `LockTable` kept as JSON files in a shared directory

mod lock;
mod storage;

pub use lock::FileLockTable;
pub use storage::{LocalBackend, LocalFile};
