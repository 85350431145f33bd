use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dav_storage_core::{StorageConfig, DEFAULT_MAX_LOCK_SECONDS};

/// Default chunk length for `download`.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Configuration for the dav-storage-local CLI.
#[derive(Parser, Debug, Clone)]
#[command(name = "dav-storage-local")]
#[command(about = "Resumable WebDAV-style storage on the local filesystem")]
pub struct Config {
    /// Base directory every name is resolved against
    #[arg(long, global = true, env = "DAV_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Public base URL of the storage directory
    #[arg(long, global = true, env = "DAV_BASE_URL")]
    pub base_url: Option<String>,

    /// Directory holding lock files. Must be shared by every process using
    /// the same storage directory.
    #[arg(long, global = true, env = "DAV_LOCK_DIR")]
    pub lock_dir: Option<PathBuf>,

    /// Seconds after which a lock is treated as released
    #[arg(long, global = true, env = "DAV_LOCK_SECONDS", default_value_t = DEFAULT_MAX_LOCK_SECONDS)]
    pub lock_seconds: u64,

    /// Octal mode applied to saved files (e.g. 640)
    #[arg(long, global = true, env = "DAV_FILE_MODE", value_parser = parse_mode)]
    pub file_mode: Option<u32>,

    /// Octal mode for directories created on demand (e.g. 750)
    #[arg(long, global = true, env = "DAV_DIR_MODE", value_parser = parse_mode)]
    pub dir_mode: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store content under a name, or a free alternative if it is taken
    Save {
        name: String,
        /// Read content from this file instead of stdin
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Append content to a file, creating it if needed
    Append {
        name: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Print the whole content of a file
    Read { name: String },
    /// Print a byte range of a file
    Chunk {
        name: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: usize,
    },
    /// Copy a file out in chunks
    Download {
        name: String,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        /// Write to this file instead of stdout
        #[arg(long)]
        to: Option<PathBuf>,
    },
    /// Show the properties of a file or collection
    Propfind { name: String },
    /// Create an empty collection marker
    Mkcol {
        name: String,
        #[arg(long)]
        user: String,
    },
    Delete {
        name: String,
        #[arg(long)]
        user: String,
    },
    /// Move a file; the user must hold its lock
    Move {
        from: String,
        to: String,
        #[arg(long)]
        user: String,
    },
    Lock {
        name: String,
        #[arg(long)]
        user: String,
    },
    Unlock {
        name: String,
        #[arg(long)]
        user: String,
    },
    /// List directories and files under a name
    Ls { name: Option<String> },
    /// Print the public URL of a name
    Url { name: String },
}

impl Config {
    fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dav-storage")
    }

    /// Get the effective storage directory.
    pub fn effective_storage_dir(&self) -> PathBuf {
        self.storage_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("files"))
    }

    /// Get the effective lock directory.
    pub fn effective_lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("locks"))
    }

    pub fn storage_config(&self) -> StorageConfig {
        let mut config = StorageConfig::new(self.effective_storage_dir())
            .with_max_lock_seconds(self.lock_seconds);
        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url.clone());
        }
        if let Some(mode) = self.file_mode {
            config = config.with_file_permissions_mode(mode);
        }
        if let Some(mode) = self.dir_mode {
            config = config.with_directory_permissions_mode(mode);
        }
        config
    }
}

/// Parse an octal permission mode such as `640`, `0640` or `0o640`.
pub fn parse_mode(value: &str) -> Result<u32, String> {
    let digits = value.trim_start_matches("0o");
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|e| format!("invalid octal mode {:?}: {}", value, e))?;
    if mode > 0o7777 {
        return Err(format!("mode {:o} is out of range", mode));
    }
    Ok(mode)
}
