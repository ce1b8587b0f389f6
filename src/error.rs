//! Error types for the storage engine.

use std::io;
use std::path::PathBuf;

/// Errors surfaced when constructing a storage instance.
///
/// Everything after construction is asynchronous, and scheduler-level
/// failures (unreadable or corrupt entries, failed writes) never surface as
/// errors; they are reported through operation completion handlers so that a
/// damaged cache degrades to misses instead of failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The versioned cache directory could not be created.
    #[error("failed to create cache directory {path}: {source}")]
    DirectoryCreation {
        /// The directory that could not be created.
        path: PathBuf,
        /// The underlying filesystem error.
        source: io::Error,
    },

    /// The sequencer thread could not be spawned.
    #[error("failed to spawn sequencer thread: {0}")]
    ThreadSpawn(#[source] io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::DirectoryCreation {
            path: PathBuf::from("/no/such/dir"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        let message = format!("{}", err);
        assert!(message.contains("/no/such/dir"));
        assert!(message.contains("denied"));
    }

    #[test]
    fn test_error_is_error() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<StorageError>();
    }
}
