use std::io;

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("{0} exists and is not a directory")]
    NotADirectory(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not publicly accessible: {0}")]
    NotPubliclyAccessible(String),

    #[error("Too many name collisions: {0}")]
    TooManyCollisions(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Classify an I/O error, keeping the kinds the operations react to.
    pub fn from_io(context: impl std::fmt::Display, err: io::Error) -> Self {
        let msg = format!("{}: {}", context, err);
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(msg),
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(msg),
            io::ErrorKind::NotADirectory => StorageError::NotADirectory(msg),
            _ => StorageError::Io(msg),
        }
    }

    /// True for the "not found" class of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// True when an exclusive create hit an existing entry.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_classification() {
        let err = StorageError::from_io("open /x", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.is_not_found());

        let err = StorageError::from_io("open /x", io::Error::from(io::ErrorKind::AlreadyExists));
        assert!(err.is_already_exists());

        let err = StorageError::from_io("open /x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, StorageError::Io(msg) if msg.starts_with("open /x")));
    }
}
