use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument};

use super::traits::{LockAcquireResult, LockTable};
use crate::error::StorageError;

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Instant,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process lock table.
///
/// Serializes callers within one process only. Useful for tests and for
/// single-host deployments where every request goes through one server.
#[derive(Debug, Default)]
pub struct MemoryLockTable {
    slots: DashMap<String, Slot>,
}

impl MemoryLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(value: &str, ttl: Duration) -> Slot {
        Slot {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }
}

#[async_trait]
impl LockTable for MemoryLockTable {
    fn table_type(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        if let Some(slot) = self.slots.get(key) {
            if slot.is_live(now) {
                return Ok(Some(slot.value.clone()));
            }
        }
        self.slots.remove_if(key, |_, slot| !slot.is_live(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.slots.insert(key.to_string(), Self::slot(value, ttl));
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn add(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StorageError> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    let holder = entry.get().value.clone();
                    debug!("{} held by {} (requested by {})", key, holder, value);
                    return Ok(LockAcquireResult::not_acquired(Some(holder)));
                }
                debug!("{} expired (was held by {}), taking it", key, entry.get().value);
                entry.insert(Self::slot(value, ttl));
            }
            Entry::Vacant(entry) => {
                entry.insert(Self::slot(value, ttl));
            }
        }
        Ok(LockAcquireResult::acquired(value))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.slots.remove(key).is_some())
    }

    async fn delete_if(&self, key: &str, value: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        let current = match self.slots.get(key) {
            Some(slot) if slot.is_live(now) => Some(slot.value.clone()),
            _ => None,
        };
        if current.as_deref() == Some(value) {
            self.slots.remove_if(key, |_, slot| slot.value == value);
        }
        Ok(current)
    }
}
