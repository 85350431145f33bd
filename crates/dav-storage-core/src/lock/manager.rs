use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::traits::{LockAcquireResult, LockTable};
use crate::config::RetryPolicy;
use crate::error::StorageError;

/// Which gate keys a critical section takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Reader key only.
    Read,
    /// Reader key, then writer key.
    ReadWrite,
}

/// Outcome of trying to enter a gate.
#[derive(Debug)]
pub enum GateEntry {
    Entered(Gate),
    Busy { holder: Option<String> },
}

/// Per-path locks on top of a shared [`LockTable`].
///
/// Each resolved path has three keys in the table:
/// - `{path}`: the ownership record behind `lock`/`unlock`
/// - `{path}_reader` and `{path}_writer`: the gate every operation enters
///   before touching the backend
///
/// All keys share the same TTL, which is the only recovery from a holder that
/// died without releasing.
#[derive(Clone)]
pub struct LockManager {
    table: Arc<dyn LockTable>,
    ttl: Duration,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("table", &self.table.table_type())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl LockManager {
    pub fn new(table: Arc<dyn LockTable>, ttl: Duration) -> Self {
        Self { table, ttl }
    }

    pub fn table_type(&self) -> &'static str {
        self.table.table_type()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn record_key(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    fn reader_key(path: &Path) -> String {
        format!("{}_reader", path.display())
    }

    fn writer_key(path: &Path) -> String {
        format!("{}_writer", path.display())
    }

    /// Value stored in the gate keys of one gate: the owner plus a per-gate id,
    /// so a gate that outlived its TTL cannot release a newer gate's keys.
    fn gate_token(owner: &str) -> String {
        format!("{}@{}", owner, Uuid::new_v4())
    }

    /// Owner part of a gate key value.
    fn gate_holder(value: String) -> String {
        match value.rsplit_once('@') {
            Some((owner, id)) if Uuid::parse_str(id).is_ok() => owner.to_string(),
            _ => value,
        }
    }

    pub async fn is_locked(&self, path: &Path) -> Result<bool, StorageError> {
        self.table.is_locked(&Self::record_key(path)).await
    }

    /// Current owner of `path`, without touching it.
    pub async fn owner(&self, path: &Path) -> Result<Option<String>, StorageError> {
        self.table.get(&Self::record_key(path)).await
    }

    /// Record `owner` against `path` if nobody holds it.
    ///
    /// Not re-entrant: a second call by the same owner fails and reports the
    /// owner itself.
    #[instrument(skip(self), level = "debug")]
    pub async fn lock(&self, path: &Path, owner: &str) -> Result<LockAcquireResult, StorageError> {
        let result = self
            .table
            .add(&Self::record_key(path), owner, self.ttl)
            .await?;
        if result.acquired {
            debug!("Locked {} for {} (ttl {:?})", path.display(), owner, self.ttl);
        } else {
            debug!(
                "Lock on {} held by {:?} (requested by {})",
                path.display(),
                result.current_holder,
                owner
            );
        }
        Ok(result)
    }

    /// Clear the record if `owner` holds it. Returns the owner stored before
    /// the call.
    #[instrument(skip(self), level = "debug")]
    pub async fn unlock(&self, path: &Path, owner: &str) -> Result<Option<String>, StorageError> {
        let previous = self.table.delete_if(&Self::record_key(path), owner).await?;
        match previous.as_deref() {
            Some(holder) if holder == owner => debug!("Unlocked {} by {}", path.display(), owner),
            Some(holder) => debug!(
                "Cannot unlock {}: held by {} not {}",
                path.display(),
                holder,
                owner
            ),
            None => debug!("Lock on {} not found for unlock by {}", path.display(), owner),
        }
        Ok(previous)
    }

    /// Try once to enter the gate of `path`.
    ///
    /// Keys are taken reader first, then writer. If the writer key is busy
    /// the reader key is given back before returning.
    #[instrument(skip(self), level = "debug")]
    pub async fn enter(
        &self,
        path: &Path,
        owner: &str,
        mode: GateMode,
    ) -> Result<GateEntry, StorageError> {
        let token = Self::gate_token(owner);
        let reader_key = Self::reader_key(path);
        let reader = self.table.add(&reader_key, &token, self.ttl).await?;
        if !reader.acquired {
            debug!("Reader gate on {} busy ({:?})", path.display(), reader.current_holder);
            return Ok(GateEntry::Busy {
                holder: reader.current_holder.map(Self::gate_holder),
            });
        }

        let mut gate = Gate {
            table: Arc::clone(&self.table),
            keys: vec![(reader_key, token.clone())],
            owner: owner.to_string(),
            released: false,
        };

        if mode == GateMode::ReadWrite {
            let writer_key = Self::writer_key(path);
            let writer = self.table.add(&writer_key, &token, self.ttl).await?;
            if !writer.acquired {
                debug!("Writer gate on {} busy ({:?})", path.display(), writer.current_holder);
                gate.release().await?;
                return Ok(GateEntry::Busy {
                    holder: writer.current_holder.map(Self::gate_holder),
                });
            }
            gate.keys.push((writer_key, token));
        }

        Ok(GateEntry::Entered(gate))
    }

    /// Take the ownership record of `path` for the gate's owner.
    ///
    /// On success the record joins the gate and is released with it, before
    /// the gate keys.
    pub async fn claim(&self, gate: &mut Gate, path: &Path) -> Result<LockAcquireResult, StorageError> {
        let result = self.lock(path, &gate.owner).await?;
        if result.acquired {
            gate.keys.push((Self::record_key(path), gate.owner.clone()));
        }
        Ok(result)
    }

    /// Enter the gate, retrying with `retry` while it is busy.
    pub async fn enter_with_retry(
        &self,
        path: &Path,
        owner: &str,
        mode: GateMode,
        retry: &RetryPolicy,
    ) -> Result<Gate, StorageError> {
        let mut holder = None;
        for attempt in 0..retry.attempts.max(1) {
            if let Some(delay) = retry.delay(attempt) {
                tokio::time::sleep(delay).await;
            }
            match self.enter(path, owner, mode).await? {
                GateEntry::Entered(gate) => return Ok(gate),
                GateEntry::Busy { holder: current } => holder = current,
            }
        }
        Err(StorageError::Lock(format!(
            "{} is busy (held by {})",
            path.display(),
            holder.as_deref().unwrap_or("unknown")
        )))
    }
}

/// A held critical section on one path.
///
/// Call [`Gate::release`] on every path out of the section. A gate dropped
/// without release (panic, cancelled task) schedules the release on the
/// current tokio runtime; without a runtime the keys fall back to TTL expiry.
#[must_use = "a gate must be released"]
pub struct Gate {
    table: Arc<dyn LockTable>,
    /// Keys held, each with the value this gate stored in it.
    keys: Vec<(String, String)>,
    owner: String,
    released: bool,
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("keys", &self.keys)
            .field("owner", &self.owner)
            .field("released", &self.released)
            .finish()
    }
}

impl Gate {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Give the gate keys back, writer first.
    pub async fn release(mut self) -> Result<(), StorageError> {
        self.released = true;
        let keys = std::mem::take(&mut self.keys);
        release_keys(self.table.as_ref(), &keys).await
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        if self.released || self.keys.is_empty() {
            return;
        }
        let keys = std::mem::take(&mut self.keys);
        let table = Arc::clone(&self.table);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Gate {:?} dropped without release, releasing in background", keys);
                handle.spawn(async move {
                    if let Err(e) = release_keys(table.as_ref(), &keys).await {
                        warn!("Background gate release failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("Gate {:?} dropped outside a runtime, left to expire", keys),
        }
    }
}

async fn release_keys(table: &dyn LockTable, keys: &[(String, String)]) -> Result<(), StorageError> {
    let mut first_error = None;
    for (key, value) in keys.iter().rev() {
        if let Err(e) = table.delete_if(key, value).await {
            warn!("Failed to release {}: {}", key, e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
