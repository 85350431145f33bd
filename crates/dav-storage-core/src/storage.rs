use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{FileHandle, OpenFlags, StorageBackend};
use crate::config::StorageConfig;
use crate::dav::{MkColResult, PropFind, ReadChunk, ResumableDav, SaveOutcome};
use crate::download::Download;
use crate::error::StorageError;
use crate::lock::{Gate, GateEntry, GateMode, LockAcquireResult, LockManager, LockTable};
use crate::path::PathResolver;

/// Owner recorded against a path while a save is in progress.
pub const SAVE_RESERVATION: &str = "storage";

/// Mode requested for new files, before the umask.
const NEW_FILE_MODE: u32 = 0o666;

/// Outcome of asking for exclusive access to a path.
enum Admission {
    Granted(Gate),
    Denied { holder: Option<String> },
}

/// Release a gate after the section body ran, reporting the body's error
/// ahead of a release error.
async fn finish<T>(gate: Gate, result: Result<T, StorageError>) -> Result<T, StorageError> {
    let released = gate.release().await;
    let value = result?;
    released?;
    Ok(value)
}

/// Resumable operations over any [`StorageBackend`].
///
/// The backend is chosen at construction; the same algorithms run against
/// the local filesystem and the networked volume.
pub struct DavStorage {
    backend: Arc<dyn StorageBackend>,
    locks: LockManager,
    resolver: PathResolver,
    config: Arc<StorageConfig>,
}

impl std::fmt::Debug for DavStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DavStorage")
            .field("backend", &self.backend.backend_name())
            .field("locks", &self.locks)
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl DavStorage {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        lock_table: Arc<dyn LockTable>,
        config: Arc<StorageConfig>,
    ) -> Self {
        let locks = LockManager::new(lock_table, config.lock_ttl());
        let resolver = PathResolver::new(&config);
        Self {
            backend,
            locks,
            resolver,
            config,
        }
    }

    /// Mount the backend and build the storage on top of it.
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        lock_table: Arc<dyn LockTable>,
        config: Arc<StorageConfig>,
    ) -> Result<Self, StorageError> {
        backend.mount().await?;
        info!(
            "Opened {} storage at {} (lock table: {}, ttl {}s)",
            backend.backend_name(),
            config.location.display(),
            lock_table.table_type(),
            config.max_lock_seconds
        );
        Ok(Self::new(backend, lock_table, config))
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    fn reader_token() -> String {
        format!("reader-{}", Uuid::new_v4())
    }

    /// Gate a mutation on `path` for `identity`.
    ///
    /// Denied when the ownership record belongs to someone else or the gate
    /// is busy. When granted, the record is claimed for `identity` unless the
    /// caller already held it from an explicit `lock`.
    async fn admit(&self, path: &Path, identity: &str) -> Result<Admission, StorageError> {
        if let Some(owner) = self.locks.owner(path).await? {
            if owner != identity {
                debug!("{} is locked by {} (requested by {})", path.display(), owner, identity);
                return Ok(Admission::Denied {
                    holder: Some(owner),
                });
            }
        }

        let mut gate = match self.locks.enter(path, identity, GateMode::ReadWrite).await? {
            GateEntry::Entered(gate) => gate,
            GateEntry::Busy { holder } => return Ok(Admission::Denied { holder }),
        };

        let claim = match self.locks.claim(&mut gate, path).await {
            Ok(claim) => claim,
            Err(e) => return finish(gate, Err(e)).await,
        };
        if !claim.acquired && claim.current_holder.as_deref() != Some(identity) {
            gate.release().await?;
            return Ok(Admission::Denied {
                holder: claim.current_holder,
            });
        }
        Ok(Admission::Granted(gate))
    }

    /// Make sure the parent directory of `path` exists and is a directory.
    async fn ensure_parent(&self, path: &Path) -> Result<(), StorageError> {
        let Some(directory) = path.parent() else {
            return Ok(());
        };

        if !self.backend.exists(directory).await? {
            match self
                .backend
                .make_dirs(directory, self.config.directory_permissions_mode)
                .await
            {
                Ok(()) => debug!("Created directory {}", directory.display()),
                Err(e) if e.is_not_found() || e.is_already_exists() => {
                    debug!("{} created concurrently: {}", directory.display(), e)
                }
                Err(e) => return Err(e),
            }
        }

        if !self.backend.is_dir(directory).await? {
            return Err(StorageError::NotADirectory(directory.display().to_string()));
        }
        Ok(())
    }

    async fn write_stream(
        handle: &mut dyn FileHandle,
        content: &mut BoxStream<'_, Result<Bytes, StorageError>>,
    ) -> Result<u64, StorageError> {
        let mut written = 0u64;
        while let Some(chunk) = content.next().await {
            let chunk = chunk?;
            handle.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        handle.close().await?;
        Ok(written)
    }

    /// Body of a save, run inside the gate of the requested name.
    async fn save_locked(
        &self,
        requested: &str,
        mut content: BoxStream<'_, Result<Bytes, StorageError>>,
    ) -> Result<String, StorageError> {
        let mut name = requested.to_string();
        let mut path = self.resolver.resolve(&name)?;
        self.ensure_parent(&path).await?;

        let mut collisions = 0u32;
        let mut handle = loop {
            match self
                .backend
                .open(&path, self.config.create_flags, NEW_FILE_MODE)
                .await
            {
                Ok(handle) => break handle,
                Err(e) if e.is_already_exists() => {
                    collisions += 1;
                    if collisions > self.config.max_name_attempts {
                        return Err(StorageError::TooManyCollisions(format!(
                            "gave up saving {} after {} collisions",
                            requested, collisions
                        )));
                    }
                    name = self
                        .resolver
                        .available_name(self.backend.as_ref(), requested, self.config.max_name_attempts)
                        .await?;
                    debug!("{} exists, retrying as {}", path.display(), name);
                    path = self.resolver.resolve(&name)?;
                }
                Err(e) => return Err(e),
            }
        };

        match Self::write_stream(handle.as_mut(), &mut content).await {
            Ok(written) => debug!("Wrote {} bytes to {}", written, path.display()),
            Err(e) => {
                if let Err(close_err) = handle.close().await {
                    warn!("Failed to close partial file {}: {}", path.display(), close_err);
                }
                if let Err(cleanup) = self.backend.remove(&path).await {
                    warn!("Failed to remove partial file {}: {}", path.display(), cleanup);
                }
                return Err(e);
            }
        }

        if let Some(mode) = self.config.file_permissions_mode {
            self.backend.chmod(&path, mode).await?;
        }
        Ok(name)
    }

    async fn append_locked(&self, path: &Path, content: &[u8]) -> Result<(), StorageError> {
        self.ensure_parent(path).await?;
        let mut handle = self.backend.open(path, OpenFlags::append(), NEW_FILE_MODE).await?;
        handle.write_all(content).await?;
        handle.close().await
    }

    async fn delete_locked(&self, path: &Path) -> Result<bool, StorageError> {
        if !self.backend.exists(path).await? {
            return Ok(false);
        }
        match self.backend.remove(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn move_locked(&self, src: &Path, dst: &Path) -> Result<(), StorageError> {
        if !self.backend.exists(src).await? {
            return Err(StorageError::NotFound(src.display().to_string()));
        }
        self.ensure_parent(dst).await?;
        self.backend.copy(src, dst).await?;
        self.backend.remove(src).await
    }

    async fn create_marker(&self, path: &Path) -> Result<(), StorageError> {
        self.ensure_parent(path).await?;
        let mut handle = self
            .backend
            .open(path, OpenFlags::exclusive_create(), NEW_FILE_MODE)
            .await?;
        handle.close().await?;
        if let Some(mode) = self.config.file_permissions_mode {
            self.backend.chmod(path, mode).await?;
        }
        Ok(())
    }

    async fn read_chunk_locked(
        &self,
        path: &Path,
        offset: u64,
        length: usize,
    ) -> Result<ReadChunk, StorageError> {
        let mut handle = self.backend.open(path, OpenFlags::read_only(), 0).await?;
        let size = handle.fstat().await?.size;
        if offset >= size {
            return Ok(ReadChunk::empty());
        }
        let available = size - offset;
        let length = usize::try_from(available).map_or(length, |a| a.min(length));
        let data = handle.read_at(offset, length).await?;
        Ok(ReadChunk {
            bytes_read: data.len(),
            data,
        })
    }
}

#[async_trait]
impl ResumableDav for DavStorage {
    fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    fn path(&self, name: &str) -> Result<PathBuf, StorageError> {
        self.resolver.resolve(name)
    }

    fn url(&self, name: &str) -> Result<String, StorageError> {
        let path = self.resolver.resolve(name)?;
        match self.backend.internal_url(&path) {
            Some(url) => Ok(url),
            None => self.resolver.to_url(name),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        self.backend.exists(&self.resolver.resolve(name)?).await
    }

    async fn size(&self, name: &str) -> Result<u64, StorageError> {
        self.backend.size(&self.resolver.resolve(name)?).await
    }

    async fn accessed_time(&self, name: &str) -> Result<DateTime<Utc>, StorageError> {
        self.backend.accessed_time(&self.resolver.resolve(name)?).await
    }

    async fn modified_time(&self, name: &str) -> Result<DateTime<Utc>, StorageError> {
        self.backend.modified_time(&self.resolver.resolve(name)?).await
    }

    async fn created_time(&self, name: &str) -> Result<DateTime<Utc>, StorageError> {
        self.backend.changed_time(&self.resolver.resolve(name)?).await
    }

    async fn list_dir(&self, name: &str) -> Result<(Vec<String>, Vec<String>), StorageError> {
        let path = self.resolver.resolve(name)?;
        if !self.backend.is_dir(&path).await? {
            return Ok((vec![], vec![]));
        }

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in self.backend.list_dir(&path).await? {
            let entry_path = path.join(&entry);
            if self.backend.is_file(&entry_path).await? {
                files.push(entry);
            } else if self.backend.is_dir(&entry_path).await? {
                dirs.push(entry);
            }
        }
        dirs.sort();
        files.sort();
        Ok((dirs, files))
    }

    async fn is_locked(&self, name: &str) -> Result<bool, StorageError> {
        self.locks.is_locked(&self.resolver.resolve(name)?).await
    }

    async fn lock(&self, name: &str, owner: &str) -> Result<LockAcquireResult, StorageError> {
        self.locks.lock(&self.resolver.resolve(name)?, owner).await
    }

    async fn unlock(&self, name: &str, owner: &str) -> Result<Option<String>, StorageError> {
        self.locks.unlock(&self.resolver.resolve(name)?, owner).await
    }

    #[instrument(skip(self, content), level = "debug")]
    async fn save_stream(
        &self,
        name: &str,
        content: BoxStream<'_, Result<Bytes, StorageError>>,
    ) -> Result<SaveOutcome, StorageError> {
        let path = self.resolver.resolve(name)?;

        let gate = match self.admit(&path, SAVE_RESERVATION).await? {
            Admission::Granted(gate) => gate,
            Admission::Denied { holder } => {
                debug!("Save of {} refused, in use by {:?}", name, holder);
                return Ok(SaveOutcome::InUse { holder });
            }
        };

        let result = self.save_locked(name, content).await;
        let stored = finish(gate, result).await?;
        info!("Saved {} as {}", name, stored);
        Ok(SaveOutcome::Saved {
            name: stored.replace('\\', "/"),
        })
    }

    #[instrument(skip(self, content), level = "debug", fields(content_len = content.len()))]
    async fn append(&self, name: &str, content: &[u8], identity: &str) -> Result<bool, StorageError> {
        let path = self.resolver.resolve(name)?;
        let gate = match self.admit(&path, identity).await? {
            Admission::Granted(gate) => gate,
            Admission::Denied { holder } => {
                debug!("Append to {} refused, held by {:?}", name, holder);
                return Ok(false);
            }
        };

        let result = self.append_locked(&path, content).await;
        finish(gate, result).await?;
        debug!("Appended {} bytes to {}", content.len(), name);
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, name: &str, identity: &str) -> Result<bool, StorageError> {
        let path = self.resolver.resolve(name)?;
        let gate = match self.admit(&path, identity).await? {
            Admission::Granted(gate) => gate,
            Admission::Denied { holder } => {
                debug!("Delete of {} refused, held by {:?}", name, holder);
                return Ok(false);
            }
        };

        let result = self.delete_locked(&path).await;
        let removed = finish(gate, result).await?;
        debug!("Deleted {} (existed: {})", name, removed);
        Ok(removed)
    }

    #[instrument(skip(self), level = "debug")]
    async fn move_to(&self, name: &str, new_name: &str, identity: &str) -> Result<bool, StorageError> {
        let src = self.resolver.resolve(name)?;
        let dst = self.resolver.resolve(new_name)?;

        let owner = self.locks.owner(&src).await?;
        if owner.as_deref() != Some(identity) {
            debug!("Move of {} refused: lock held by {:?}, not {}", name, owner, identity);
            return Ok(false);
        }

        if let Some(dst_owner) = self.locks.owner(&dst).await? {
            if dst_owner != identity {
                debug!("Move of {} refused: {} is locked by {}", name, new_name, dst_owner);
                return Ok(false);
            }
        }

        let src_gate = match self.locks.enter(&src, identity, GateMode::ReadWrite).await? {
            GateEntry::Entered(gate) => gate,
            GateEntry::Busy { holder } => {
                debug!("Move of {} refused, source busy ({:?})", name, holder);
                return Ok(false);
            }
        };
        let dst_gate = match self.locks.enter(&dst, identity, GateMode::ReadWrite).await {
            Ok(GateEntry::Entered(gate)) => gate,
            Ok(GateEntry::Busy { holder }) => {
                debug!("Move of {} refused, destination busy ({:?})", name, holder);
                src_gate.release().await?;
                return Ok(false);
            }
            Err(e) => return finish(src_gate, Err(e)).await,
        };

        let result = self.move_locked(&src, &dst).await;
        let unlocked = self.locks.unlock(&src, identity).await;
        let result = finish(dst_gate, result).await;
        finish(src_gate, result).await?;
        unlocked?;
        info!("Moved {} to {}", name, new_name);
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn mk_collection(&self, name: &str, identity: &str) -> Result<MkColResult, StorageError> {
        let path = self.resolver.resolve(name)?;
        if self.backend.exists(&path).await? {
            debug!("Collection {} already exists", name);
            return Ok(MkColResult::not_created());
        }

        let gate = match self.admit(&path, identity).await {
            Ok(Admission::Granted(gate)) => gate,
            Ok(Admission::Denied { holder }) => {
                debug!("Collection {} refused, held by {:?}", name, holder);
                return Ok(MkColResult::not_created());
            }
            Err(e) => {
                warn!("Failed to lock {} for collection: {}", name, e);
                return Ok(MkColResult::failed(e.to_string()));
            }
        };

        let result = self.create_marker(&path).await;
        match finish(gate, result).await {
            Ok(()) => {
                debug!("Created collection {}", name);
                Ok(MkColResult::created())
            }
            Err(e) if e.is_already_exists() => Ok(MkColResult::not_created()),
            Err(e) => {
                warn!("Failed to create collection {}: {}", name, e);
                Ok(MkColResult::failed(e.to_string()))
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn propfind(&self, name: &str) -> Result<PropFind, StorageError> {
        let path = self.resolver.resolve(name)?;
        let gate = self
            .locks
            .enter_with_retry(&path, &Self::reader_token(), GateMode::Read, &self.config.read_retry)
            .await?;

        let result = self.backend.stat(&path).await;
        let entry = finish(gate, result).await?;
        Ok(PropFind {
            name: name.to_string(),
            valid_name: PathResolver::valid_name(name),
            path,
            entry,
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn safe_read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.resolver.resolve(name)?;
        if !self.backend.exists(&path).await? {
            return Ok(None);
        }

        let gate = self
            .locks
            .enter_with_retry(&path, &Self::reader_token(), GateMode::Read, &self.config.read_retry)
            .await?;
        let result = async {
            let mut handle = self.backend.open(&path, OpenFlags::read_only(), 0).await?;
            handle.read_to_end().await
        }
        .await;

        match finish(gate, result).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn safe_read_chunk(
        &self,
        name: &str,
        offset: u64,
        length: usize,
    ) -> Result<ReadChunk, StorageError> {
        let path = self.resolver.resolve(name)?;
        if !self.backend.exists(&path).await? {
            return Ok(ReadChunk::empty());
        }

        let gate = self
            .locks
            .enter_with_retry(&path, &Self::reader_token(), GateMode::Read, &self.config.read_retry)
            .await?;
        let result = self.read_chunk_locked(&path, offset, length).await;

        match finish(gate, result).await {
            Ok(chunk) => Ok(chunk),
            Err(e) if e.is_not_found() => Ok(ReadChunk::empty()),
            Err(e) => Err(e),
        }
    }

    async fn download<'a>(
        &'a self,
        name: &str,
        max_chunk: usize,
    ) -> Result<Download<'a>, StorageError> {
        Download::start(self, name, max_chunk).await
    }
}
