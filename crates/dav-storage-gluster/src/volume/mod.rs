//! Contract of the native distributed-filesystem driver.
//!
//! The driver is a blocking client of one volume (libgfapi or an equivalent
//! binding). Errors carry the errno of the failed call as `std::io::Error`.

use std::io;
use std::path::{Path, PathBuf};

use dav_storage_core::OpenFlags;
use serde::{Deserialize, Serialize};

#[cfg(test)]
pub(crate) mod memory;

/// `S_IFMT` bits of `st_mode`.
const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

/// Connection settings of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub volume: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: u8,
}

fn default_port() -> u16 {
    24007
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/dev/null")
}

fn default_log_level() -> u8 {
    7
}

impl VolumeConfig {
    pub fn new(host: impl Into<String>, volume: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            volume: volume.into(),
            transport: default_transport(),
            log_file: default_log_file(),
            log_level: default_log_level(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = transport.into();
        self
    }

    pub fn with_log(mut self, log_file: impl Into<PathBuf>, log_level: u8) -> Self {
        self.log_file = log_file.into();
        self.log_level = log_level;
        self
    }
}

/// `stat` result of a volume entry. Times are Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStat {
    pub size: u64,
    /// Full `st_mode`, file type bits included.
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl VolumeStat {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// A mounted (or mountable) volume.
pub trait Volume: Send + Sync {
    fn mounted(&self) -> bool;

    fn mount(&self) -> io::Result<()>;

    fn exists(&self, path: &Path) -> io::Result<bool>;

    fn is_file(&self, path: &Path) -> io::Result<bool>;

    fn is_dir(&self, path: &Path) -> io::Result<bool>;

    fn listdir(&self, path: &Path) -> io::Result<Vec<String>>;

    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> io::Result<Box<dyn VolumeFd>>;

    fn stat(&self, path: &Path) -> io::Result<VolumeStat>;

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Create `path` and missing ancestors. Fails with `AlreadyExists` if
    /// `path` itself exists.
    fn makedirs(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Unlink a file or remove an empty directory.
    fn remove(&self, path: &Path) -> io::Result<()>;

    fn copy(&self, src: &Path, dst: &Path) -> io::Result<()>;
}

/// An open file descriptor on a volume.
pub trait VolumeFd: Send {
    /// Write at the current position (the end, for append descriptors).
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Read up to `len` bytes at `offset` without moving the position.
    fn pread(&mut self, len: usize, offset: u64) -> io::Result<Vec<u8>>;

    fn fstat(&mut self) -> io::Result<VolumeStat>;

    fn close(&mut self) -> io::Result<()>;
}
