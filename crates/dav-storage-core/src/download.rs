use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, warn};

use crate::dav::{DownloadChunk, ResumableDav};
use crate::error::StorageError;

/// Lazy chunked read of one file.
///
/// The file size is taken once when the download starts; later growth is
/// not followed. To restart, start a new download (offset 0).
pub struct Download<'a> {
    storage: &'a dyn ResumableDav,
    name: String,
    size: u64,
    offset: u64,
    max_chunk: usize,
    exhausted: bool,
}

impl std::fmt::Debug for Download<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("max_chunk", &self.max_chunk)
            .finish_non_exhaustive()
    }
}

impl<'a> Download<'a> {
    pub async fn start(
        storage: &'a dyn ResumableDav,
        name: &str,
        max_chunk: usize,
    ) -> Result<Self, StorageError> {
        if max_chunk == 0 {
            return Err(StorageError::InvalidArgument(
                "download chunk length must be positive".to_string(),
            ));
        }
        let size = storage.size(name).await?;
        debug!("Starting download of {} ({} bytes, chunks of {})", name, size, max_chunk);
        Ok(Self {
            storage,
            name: name.to_string(),
            size,
            offset: 0,
            max_chunk,
            exhausted: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size snapshot taken at start.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn has_next(&self) -> bool {
        !self.exhausted && self.offset < self.size
    }

    /// Read the next chunk, `None` once the snapshot is consumed.
    pub async fn next_chunk(&mut self) -> Result<Option<DownloadChunk>, StorageError> {
        if !self.has_next() {
            return Ok(None);
        }
        let remaining = self.size - self.offset;
        let length = usize::try_from(remaining).map_or(self.max_chunk, |r| r.min(self.max_chunk));
        let chunk = self
            .storage
            .safe_read_chunk(&self.name, self.offset, length)
            .await?;

        if chunk.bytes_read == 0 {
            warn!(
                "{} shrank below {} bytes during download, stopping at {}",
                self.name, self.size, self.offset
            );
            self.exhausted = true;
            return Ok(None);
        }

        self.offset += chunk.bytes_read as u64;
        Ok(Some(DownloadChunk {
            data: chunk.data,
            bytes_read: chunk.bytes_read,
            offset: self.offset,
        }))
    }

    pub fn into_stream(self) -> BoxStream<'a, Result<DownloadChunk, StorageError>> {
        stream::try_unfold(self, |mut download| async move {
            Ok(download
                .next_chunk()
                .await?
                .map(|chunk| (chunk, download)))
        })
        .boxed()
    }
}
