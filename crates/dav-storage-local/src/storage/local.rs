use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dav_storage_core::{EntryKind, FileEntry, FileHandle, OpenFlags, StorageBackend, StorageError};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};

/// Local filesystem backend on `tokio::fs`.
///
/// Paths arrive already resolved against the storage location. On Unix the
/// creation modes and `chmod` map straight onto the POSIX calls; elsewhere
/// they are ignored.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

/// An open local file.
#[derive(Debug)]
pub struct LocalFile {
    path: PathBuf,
    file: fs::File,
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> StorageError {
    StorageError::from_io(format!("Failed to {} {}", action, path.display()), err)
}

#[cfg(unix)]
fn timestamp(secs: i64, nsecs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, u32::try_from(nsecs).unwrap_or(0)).unwrap_or_default()
}

#[cfg(unix)]
fn times(metadata: &Metadata) -> (DateTime<Utc>, DateTime<Utc>, DateTime<Utc>) {
    use std::os::unix::fs::MetadataExt;
    (
        timestamp(metadata.atime(), metadata.atime_nsec()),
        timestamp(metadata.mtime(), metadata.mtime_nsec()),
        timestamp(metadata.ctime(), metadata.ctime_nsec()),
    )
}

#[cfg(not(unix))]
fn times(metadata: &Metadata) -> (DateTime<Utc>, DateTime<Utc>, DateTime<Utc>) {
    let modified = metadata.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
    let accessed = metadata.accessed().map(DateTime::from).unwrap_or(modified);
    let created = metadata.created().map(DateTime::from).unwrap_or(modified);
    (accessed, modified, created)
}

#[cfg(unix)]
fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}

#[cfg(unix)]
fn creation_mode(options: &mut fs::OpenOptions, mode: u32) {
    options.mode(mode);
}

#[cfg(not(unix))]
fn creation_mode(_options: &mut fs::OpenOptions, _mode: u32) {}

#[cfg(unix)]
fn directory_mode(builder: &mut fs::DirBuilder, mode: u32) {
    builder.mode(mode);
}

#[cfg(not(unix))]
fn directory_mode(_builder: &mut fs::DirBuilder, _mode: u32) {}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| io_error("chmod", path, e))
}

#[cfg(not(unix))]
async fn set_mode(path: &Path, mode: u32) -> Result<(), StorageError> {
    debug!("Ignoring mode {:o} for {} on this platform", mode, path.display());
    Ok(())
}

/// Metadata of `path`, `None` when nothing can exist there.
async fn metadata_if_exists(path: &Path) -> Result<Option<Metadata>, StorageError> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
            ) =>
        {
            Ok(None)
        }
        Err(e) => Err(io_error("stat", path, e)),
    }
}

fn entry_from_metadata(path: &Path, metadata: &Metadata) -> FileEntry {
    let (accessed_at, modified_at, changed_at) = times(metadata);
    FileEntry {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        kind: if metadata.is_dir() {
            EntryKind::Collection
        } else {
            EntryKind::File
        },
        size: metadata.len(),
        accessed_at,
        modified_at,
        changed_at,
        mode: permission_bits(metadata),
    }
}

#[async_trait]
impl FileHandle for LocalFile {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| io_error("write", &self.path, e))
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_error("seek", &self.path, e))?;

        let mut data = Vec::with_capacity(len);
        (&mut self.file)
            .take(len as u64)
            .read_to_end(&mut data)
            .await
            .map_err(|e| io_error("read", &self.path, e))?;
        Ok(data)
    }

    async fn read_to_end(&mut self) -> Result<Vec<u8>, StorageError> {
        self.file
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|e| io_error("seek", &self.path, e))?;

        let mut data = Vec::new();
        self.file
            .read_to_end(&mut data)
            .await
            .map_err(|e| io_error("read", &self.path, e))?;
        Ok(data)
    }

    async fn fstat(&mut self) -> Result<FileEntry, StorageError> {
        let metadata = self
            .file
            .metadata()
            .await
            .map_err(|e| io_error("stat", &self.path, e))?;
        Ok(entry_from_metadata(&self.path, &metadata))
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.file
            .flush()
            .await
            .map_err(|e| io_error("flush", &self.path, e))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        Ok(metadata_if_exists(path).await?.is_some())
    }

    async fn is_file(&self, path: &Path) -> Result<bool, StorageError> {
        Ok(metadata_if_exists(path).await?.is_some_and(|m| m.is_file()))
    }

    async fn is_dir(&self, path: &Path) -> Result<bool, StorageError> {
        Ok(metadata_if_exists(path).await?.is_some_and(|m| m.is_dir()))
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, StorageError> {
        let mut entries = fs::read_dir(path)
            .await
            .map_err(|e| io_error("read dir", path, e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("read dir entry in", path, e))?
        {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
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
        let mut options = fs::OpenOptions::new();
        options
            .read(flags.read)
            .write(flags.write)
            .append(flags.append)
            .truncate(flags.truncate);
        if flags.create && flags.exclusive {
            options.create_new(true);
        } else {
            options.create(flags.create);
        }
        if flags.create {
            creation_mode(&mut options, mode);
        }

        let file = options
            .open(path)
            .await
            .map_err(|e| io_error("open", path, e))?;
        Ok(Box::new(LocalFile {
            path: path.to_path_buf(),
            file,
        }))
    }

    async fn stat(&self, path: &Path) -> Result<FileEntry, StorageError> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| io_error("stat", path, e))?;
        Ok(entry_from_metadata(path, &metadata))
    }

    #[instrument(skip(self), level = "debug")]
    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), StorageError> {
        set_mode(path, mode).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn make_dirs(&self, path: &Path, mode: Option<u32>) -> Result<(), StorageError> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        if let Some(mode) = mode {
            directory_mode(&mut builder, mode);
        }

        builder
            .create(path)
            .await
            .map_err(|e| io_error("create directory", path, e))
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove(&self, path: &Path) -> Result<(), StorageError> {
        let metadata = fs::symlink_metadata(path)
            .await
            .map_err(|e| io_error("stat", path, e))?;
        let removed = if metadata.is_dir() {
            fs::remove_dir(path).await
        } else {
            fs::remove_file(path).await
        };
        removed.map_err(|e| io_error("remove", path, e))
    }

    #[instrument(skip(self), level = "debug")]
    async fn copy(&self, src: &Path, dst: &Path) -> Result<(), StorageError> {
        let copied = fs::copy(src, dst)
            .await
            .map_err(|e| io_error("copy", src, e))?;
        debug!("Copied {} bytes from {} to {}", copied, src.display(), dst.display());
        Ok(())
    }
}
