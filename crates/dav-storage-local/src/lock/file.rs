use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use dav_storage_core::{LockAcquireResult, LockTable, StorageError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

/// Lock table kept as JSON files in a directory shared by every process
/// (and, over a network mount, every host) serving the same store.
///
/// Lock files are stored at `{dir}/{sha256(key)}.lock`. `add` relies on
/// exclusive creation, so two processes cannot both create the same record.
/// Expired records are removed by the next `add` for the key; two adders
/// taking over the same expired record at the same instant can both succeed.
#[derive(Debug, Clone)]
pub struct FileLockTable {
    dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    key: String,
    value: String,
    /// Expiry as Unix milliseconds.
    expires_at: i64,
}

impl LockRecord {
    fn new(key: &str, value: &str, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            key: key.to_string(),
            value: value.to_string(),
            expires_at: chrono::Utc::now().timestamp_millis().saturating_add(ttl_ms),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at <= chrono::Utc::now().timestamp_millis()
    }
}

/// What was found at a record path.
enum Slot {
    Free,
    Live(LockRecord),
    /// Created by `add` but not written yet.
    Pending,
    Stale,
}

impl FileLockTable {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.lock", hex::encode(digest)))
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to create lock dir {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    async fn read_slot(&self, path: &Path) -> Result<Slot, StorageError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Slot::Free),
            Err(e) => {
                return Err(StorageError::Lock(format!(
                    "Failed to read lock file {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        match serde_json::from_str::<LockRecord>(&content) {
            Ok(record) if record.is_expired() => Ok(Slot::Stale),
            Ok(record) => Ok(Slot::Live(record)),
            Err(e) => {
                if content.is_empty() {
                    return Ok(Slot::Pending);
                }
                warn!("Corrupted lock file {}: {}", path.display(), e);
                Ok(Slot::Stale)
            }
        }
    }

    /// Time since a pending record was created, `None` if it is gone.
    async fn pending_age(path: &Path) -> Result<Option<Duration>, StorageError> {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::Lock(format!(
                    "Failed to stat lock file {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let modified = metadata.modified().map_err(|e| {
            StorageError::Lock(format!("No mtime for lock file {}: {}", path.display(), e))
        })?;
        Ok(Some(modified.elapsed().unwrap_or_default()))
    }

    async fn remove_record(path: &Path) -> Result<bool, StorageError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Lock(format!(
                "Failed to delete lock file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Create the record file, failing with `AlreadyExists` if present.
    async fn create_record(path: &Path, record: &LockRecord) -> Result<(), StorageError> {
        let content = serde_json::to_vec(record)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| StorageError::from_io(format!("Failed to create lock file {}", path.display()), e))?;

        let written = async {
            file.write_all(&content).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            if let Err(remove_err) = fs::remove_file(path).await {
                warn!(
                    "Failed to remove unwritten lock file {}: {}",
                    path.display(),
                    remove_err
                );
            }
            return Err(StorageError::Lock(format!(
                "Failed to write lock file {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LockTable for FileLockTable {
    fn table_type(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.read_slot(&self.record_path(key)).await? {
            Slot::Live(record) => Ok(Some(record.value)),
            Slot::Free | Slot::Pending | Slot::Stale => Ok(None),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.ensure_dir().await?;
        let path = self.record_path(key);
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));

        let content = serde_json::to_vec(&LockRecord::new(key, value, ttl))?;
        fs::write(&temp_path, &content).await.map_err(|e| {
            StorageError::Lock(format!("Failed to write lock file: {}", e))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            StorageError::Lock(format!("Failed to rename lock file: {}", e))
        })?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn add(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StorageError> {
        self.ensure_dir().await?;
        let path = self.record_path(key);
        let record = LockRecord::new(key, value, ttl);

        // One takeover of a stale record, then report whoever holds it
        for _ in 0..2 {
            match Self::create_record(&path, &record).await {
                Ok(()) => {
                    debug!("Acquired {} for {} (expires at {})", key, value, record.expires_at);
                    return Ok(LockAcquireResult::acquired(value));
                }
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }

            match self.read_slot(&path).await? {
                Slot::Live(existing) => {
                    debug!("{} held by {} (requested by {})", key, existing.value, value);
                    return Ok(LockAcquireResult::not_acquired(Some(existing.value)));
                }
                // An empty record left by a crashed creator expires like a written one
                Slot::Pending => match Self::pending_age(&path).await? {
                    Some(age) if age >= ttl => {
                        warn!("Removing abandoned lock file for {} ({:?} old)", key, age);
                        Self::remove_record(&path).await?;
                    }
                    Some(_) => {
                        debug!("{} is being acquired (requested by {})", key, value);
                        return Ok(LockAcquireResult::not_acquired(None));
                    }
                    None => {}
                },
                Slot::Stale => {
                    debug!("Removing expired lock file for {}", key);
                    Self::remove_record(&path).await?;
                }
                Slot::Free => {}
            }
        }

        let holder = self.get(key).await?;
        Ok(LockAcquireResult::not_acquired(holder))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.record_path(key);
        let live = matches!(self.read_slot(&path).await?, Slot::Live(_));
        let removed = Self::remove_record(&path).await?;
        Ok(live && removed)
    }
}
