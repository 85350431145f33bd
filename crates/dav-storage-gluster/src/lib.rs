//! Networked volume backend for dav-storage.
//!
//! - `GlusterBackend`: `StorageBackend` over a blocking `Volume` driver
//! - `KvLockTable`: `LockTable` on Cloudflare KV, shared across hosts
//!
//! The volume driver itself (libgfapi or another binding) is supplied by the
//! caller through the `Volume` trait.

mod kv;
mod lock;
mod storage;
mod volume;

pub use kv::KvClient;
pub use lock::KvLockTable;
pub use storage::{GlusterBackend, GlusterFile};
pub use volume::{Volume, VolumeConfig, VolumeFd, VolumeStat};
