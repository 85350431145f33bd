use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dav_storage_core::{EntryKind, FileEntry, FileHandle, OpenFlags, StorageBackend, StorageError};
use tracing::{debug, info, instrument, warn};

use crate::volume::{Volume, VolumeConfig, VolumeFd, VolumeStat};

/// Mode for directories created without an explicit mode.
const DEFAULT_DIR_MODE: u32 = 0o777;

/// Block size when reading a whole file.
const READ_BLOCK: usize = 64 * 1024;

fn io_error(action: &str, path: &Path, err: io::Error) -> StorageError {
    StorageError::from_io(format!("Failed to {} {}", action, path.display()), err)
}

fn join_error(err: tokio::task::JoinError) -> StorageError {
    StorageError::Internal(format!("Volume task failed: {}", err))
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn entry_from_stat(path: &Path, stat: &VolumeStat) -> FileEntry {
    FileEntry {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        kind: if stat.is_dir() {
            EntryKind::Collection
        } else {
            EntryKind::File
        },
        size: stat.size,
        accessed_at: timestamp(stat.atime),
        modified_at: timestamp(stat.mtime),
        changed_at: timestamp(stat.ctime),
        mode: stat.permissions(),
    }
}

/// Backend over a networked distributed-filesystem volume.
///
/// The volume driver is blocking; every call runs on the blocking pool.
#[derive(Clone)]
pub struct GlusterBackend {
    volume: Arc<dyn Volume>,
    config: VolumeConfig,
}

impl std::fmt::Debug for GlusterBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlusterBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GlusterBackend {
    pub fn new(volume: Arc<dyn Volume>, config: VolumeConfig) -> Self {
        Self { volume, config }
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Run a driver call on the blocking pool.
    async fn run<T, F>(&self, action: &str, path: &Path, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&dyn Volume) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let volume = Arc::clone(&self.volume);
        tokio::task::spawn_blocking(move || f(volume.as_ref()))
            .await
            .map_err(join_error)?
            .map_err(|e| io_error(action, path, e))
    }
}

/// An open file descriptor on a volume.
pub struct GlusterFile {
    path: PathBuf,
    fd: Option<Box<dyn VolumeFd>>,
}

impl std::fmt::Debug for GlusterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlusterFile")
            .field("path", &self.path)
            .field("open", &self.fd.is_some())
            .finish()
    }
}

impl GlusterFile {
    /// Move the descriptor onto the blocking pool for one call and back.
    async fn with_fd<T, F>(&mut self, action: &str, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut dyn VolumeFd) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut fd = self
            .fd
            .take()
            .ok_or_else(|| StorageError::Io(format!("{} is closed", self.path.display())))?;

        let (fd, result) = tokio::task::spawn_blocking(move || {
            let result = f(fd.as_mut());
            (fd, result)
        })
        .await
        .map_err(join_error)?;

        self.fd = Some(fd);
        result.map_err(|e| io_error(action, &self.path, e))
    }
}

impl Drop for GlusterFile {
    fn drop(&mut self) {
        let Some(mut fd) = self.fd.take() else {
            return;
        };
        let path = std::mem::take(&mut self.path);
        let mut close = move || {
            if let Err(e) = fd.close() {
                warn!("Failed to close dropped descriptor {}: {}", path.display(), e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(close);
            }
            Err(_) => close(),
        }
    }
}

fn read_fully(fd: &mut dyn VolumeFd, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(len.min(READ_BLOCK));
    while data.len() < len {
        let block = fd.pread(len - data.len(), offset + data.len() as u64)?;
        if block.is_empty() {
            break;
        }
        data.extend_from_slice(&block);
    }
    Ok(data)
}

#[async_trait]
impl FileHandle for GlusterFile {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let data = data.to_vec();
        self.with_fd("write", move |fd| {
            let mut written = 0;
            while written < data.len() {
                match fd.write(&data[written..])? {
                    0 => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                    n => written += n,
                }
            }
            Ok(())
        })
        .await
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        self.with_fd("read", move |fd| read_fully(fd, offset, len)).await
    }

    async fn read_to_end(&mut self) -> Result<Vec<u8>, StorageError> {
        self.with_fd("read", |fd| {
            let mut data = Vec::new();
            loop {
                let block = fd.pread(READ_BLOCK, data.len() as u64)?;
                if block.is_empty() {
                    return Ok(data);
                }
                data.extend_from_slice(&block);
            }
        })
        .await
    }

    async fn fstat(&mut self) -> Result<FileEntry, StorageError> {
        let stat = self.with_fd("stat", |fd| fd.fstat()).await?;
        Ok(entry_from_stat(&self.path, &stat))
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        let Some(mut fd) = self.fd.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || fd.close())
            .await
            .map_err(join_error)?
            .map_err(|e| io_error("close", &self.path, e))
    }
}

#[async_trait]
impl StorageBackend for GlusterBackend {
    fn backend_name(&self) -> &'static str {
        "gluster"
    }

    async fn mount(&self) -> Result<(), StorageError> {
        let volume = Arc::clone(&self.volume);
        let mounted = tokio::task::spawn_blocking(move || {
            if volume.mounted() {
                return Ok(false);
            }
            volume.mount().map(|()| true)
        })
        .await
        .map_err(join_error)?
        .map_err(|e| {
            StorageError::Io(format!(
                "Failed to mount volume {} on {}:{}: {}",
                self.config.volume, self.config.host, self.config.port, e
            ))
        })?;

        if mounted {
            info!(
                "Mounted volume {} from {}:{} over {}",
                self.config.volume, self.config.host, self.config.port, self.config.transport
            );
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        let target = path.to_path_buf();
        self.run("stat", path, move |v| v.exists(&target)).await
    }

    async fn is_file(&self, path: &Path) -> Result<bool, StorageError> {
        let target = path.to_path_buf();
        self.run("stat", path, move |v| v.is_file(&target)).await
    }

    async fn is_dir(&self, path: &Path) -> Result<bool, StorageError> {
        let target = path.to_path_buf();
        self.run("stat", path, move |v| v.is_dir(&target)).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, StorageError> {
        let target = path.to_path_buf();
        let names = self
            .run("read dir", path, move |v| v.listdir(&target))
            .await?
            .into_iter()
            .filter(|n| n != "." && n != "..")
            .collect::<Vec<_>>();
        debug!("Listed {} entries in {}", names.len(), path.display());
        Ok(names)
    }

    #[instrument(skip(self), level = "debug")]
    async fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Box<dyn FileHandle>, StorageError> {
        let target = path.to_path_buf();
        let fd = self
            .run("open", path, move |v| v.open(&target, flags, mode))
            .await?;
        Ok(Box::new(GlusterFile {
            path: path.to_path_buf(),
            fd: Some(fd),
        }))
    }

    async fn stat(&self, path: &Path) -> Result<FileEntry, StorageError> {
        let target = path.to_path_buf();
        let stat = self.run("stat", path, move |v| v.stat(&target)).await?;
        Ok(entry_from_stat(path, &stat))
    }

    #[instrument(skip(self), level = "debug")]
    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), StorageError> {
        let target = path.to_path_buf();
        self.run("chmod", path, move |v| v.chmod(&target, mode)).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn make_dirs(&self, path: &Path, mode: Option<u32>) -> Result<(), StorageError> {
        let target = path.to_path_buf();
        let mode = mode.unwrap_or(DEFAULT_DIR_MODE);
        self.run("create directory", path, move |v| v.makedirs(&target, mode))
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove(&self, path: &Path) -> Result<(), StorageError> {
        let target = path.to_path_buf();
        self.run("remove", path, move |v| v.remove(&target)).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn copy(&self, src: &Path, dst: &Path) -> Result<(), StorageError> {
        let (from, to) = (src.to_path_buf(), dst.to_path_buf());
        self.run("copy", src, move |v| v.copy(&from, &to)).await?;
        debug!("Copied {} to {}", src.display(), dst.display());
        Ok(())
    }

    /// Files on a volume have no public URL; the volume path stands in.
    fn internal_url(&self, path: &Path) -> Option<String> {
        Some(path.display().to_string())
    }
}
