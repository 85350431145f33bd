use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::OpenFlags;

/// Default lock time-to-live in seconds.
pub const DEFAULT_MAX_LOCK_SECONDS: u64 = 30;

/// Default bound on name-collision retries during save.
pub const DEFAULT_MAX_NAME_ATTEMPTS: u32 = 1000;

/// Storage configuration shared by every component of a `DavStorage`.
///
/// The value is immutable once built. Components hold it behind an `Arc`; a
/// configuration change means building a new `StorageConfig` and a new storage
/// around it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base location every logical name is resolved against.
    pub location: PathBuf,
    /// Public base URL. `None` disables URL generation.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Mode applied to newly saved files (`None` leaves the umask result).
    #[serde(default)]
    pub file_permissions_mode: Option<u32>,
    /// Mode used when creating missing directories.
    #[serde(default)]
    pub directory_permissions_mode: Option<u32>,
    /// Maximum lock hold time before a lock is treated as released.
    #[serde(default = "default_max_lock_seconds")]
    pub max_lock_seconds: u64,
    /// Flags used for the exclusive create in save.
    #[serde(default = "OpenFlags::exclusive_create")]
    pub create_flags: OpenFlags,
    /// Upper bound on alternative names tried when a save collides.
    #[serde(default = "default_max_name_attempts")]
    pub max_name_attempts: u32,
    /// How read operations wait for a busy reader gate.
    #[serde(default)]
    pub read_retry: RetryPolicy,
}

fn default_max_lock_seconds() -> u64 {
    DEFAULT_MAX_LOCK_SECONDS
}

fn default_max_name_attempts() -> u32 {
    DEFAULT_MAX_NAME_ATTEMPTS
}

impl StorageConfig {
    /// Create a configuration rooted at `location` with defaults elsewhere.
    pub fn new(location: impl AsRef<Path>) -> Self {
        Self {
            location: location.as_ref().to_path_buf(),
            base_url: None,
            file_permissions_mode: None,
            directory_permissions_mode: None,
            max_lock_seconds: DEFAULT_MAX_LOCK_SECONDS,
            create_flags: OpenFlags::exclusive_create(),
            max_name_attempts: DEFAULT_MAX_NAME_ATTEMPTS,
            read_retry: RetryPolicy::default(),
        }
    }

    /// Set the public base URL. A trailing `/` is added when missing.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut url = base_url.into();
        if !url.ends_with('/') {
            url.push('/');
        }
        self.base_url = Some(url);
        self
    }

    pub fn with_file_permissions_mode(mut self, mode: u32) -> Self {
        self.file_permissions_mode = Some(mode);
        self
    }

    pub fn with_directory_permissions_mode(mut self, mode: u32) -> Self {
        self.directory_permissions_mode = Some(mode);
        self
    }

    pub fn with_max_lock_seconds(mut self, seconds: u64) -> Self {
        self.max_lock_seconds = seconds;
        self
    }

    pub fn with_max_name_attempts(mut self, attempts: u32) -> Self {
        self.max_name_attempts = attempts;
        self
    }

    pub fn with_read_retry(mut self, retry: RetryPolicy) -> Self {
        self.read_retry = retry;
        self
    }

    /// Lock TTL as a `Duration`.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.max_lock_seconds)
    }
}

/// Linear backoff used when a read finds its gate busy.
///
/// Attempt `n` (0-based) waits `base_delay + n * step` before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub step_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 50,
            base_delay_ms: 10,
            step_ms: 5,
        }
    }
}

impl RetryPolicy {
    /// Fail immediately on contention.
    pub fn immediate() -> Self {
        Self {
            attempts: 1,
            base_delay_ms: 0,
            step_ms: 0,
        }
    }

    /// Delay before attempt `attempt` (the first attempt never waits).
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return None;
        }
        Some(Duration::from_millis(
            self.base_delay_ms + self.step_ms * u64::from(attempt),
        ))
    }
}
