//! Error types for the Glaive library.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`GlaiveError`] enum. Configuration and storage failures carry the
//! offending field or shard identity so that a failed distributed run can be
//! diagnosed from the message alone.
//!
//! # Examples
//!
//! ```
//! use glaive::error::{GlaiveError, Result};
//!
//! fn check_count(count: i64) -> Result<usize> {
//!     if count <= 0 {
//!         return Err(GlaiveError::config(
//!             "retrieval_item_count",
//!             count.to_string(),
//!             "must be a positive integer",
//!         ));
//!     }
//!     Ok(count as usize)
//! }
//!
//! assert!(check_count(0).is_err());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Glaive operations.
#[derive(Error, Debug)]
pub enum GlaiveError {
    /// I/O errors (file operations, child processes, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A recognized configuration option has the wrong type or range.
    #[error("Configuration error: {field} = {value}: {reason}")]
    Config {
        field: String,
        value: String,
        reason: String,
    },

    /// Storage-related errors (unreadable object, failed copy, ...)
    #[error("Storage error: {0}")]
    Storage(String),

    /// One or more shards declared by the manifest do not exist.
    #[error("Missing shards for worker_count {worker_count}: ranks {ranks:?}")]
    ShardMissing { worker_count: usize, ranks: Vec<usize> },

    /// A shard exists but cannot be decoded.
    #[error("Corrupt shard part_{worker_count}_{rank}: {reason}")]
    ShardCorrupt {
        worker_count: usize,
        rank: usize,
        reason: String,
    },

    /// Encoder or model collaborator failure.
    #[error("Model error: {0}")]
    Model(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary snapshot encoding errors
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Errors raised by external collaborators
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with GlaiveError.
pub type Result<T> = std::result::Result<T, GlaiveError>;

impl GlaiveError {
    /// Create a new configuration error for `field`.
    pub fn config<F, V, R>(field: F, value: V, reason: R) -> Self
    where
        F: Into<String>,
        V: Into<String>,
        R: Into<String>,
    {
        GlaiveError::Config {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        GlaiveError::Storage(msg.into())
    }

    /// Create a new corrupt shard error.
    pub fn shard_corrupt<S: Into<String>>(worker_count: usize, rank: usize, reason: S) -> Self {
        GlaiveError::ShardCorrupt {
            worker_count,
            rank,
            reason: reason.into(),
        }
    }

    /// Create a new model error.
    pub fn model<S: Into<String>>(msg: S) -> Self {
        GlaiveError::Model(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        GlaiveError::InvalidOperation(format!("Invalid argument: {}", msg.into()))
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        GlaiveError::Other(msg.into())
    }

    /// Create a new not found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        GlaiveError::Storage(format!("Not found: {}", msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = GlaiveError::storage("bucket unreachable");
        assert_eq!(error.to_string(), "Storage error: bucket unreachable");

        let error = GlaiveError::config("item_ids_field_delimiter", "\"ab\"", "must be length 1");
        assert_eq!(
            error.to_string(),
            "Configuration error: item_ids_field_delimiter = \"ab\": must be length 1"
        );

        let error = GlaiveError::shard_corrupt(4, 2, "bad magic");
        assert_eq!(error.to_string(), "Corrupt shard part_4_2: bad magic");
    }

    #[test]
    fn test_missing_shards_message_lists_ranks() {
        let error = GlaiveError::ShardMissing {
            worker_count: 3,
            ranks: vec![1, 2],
        };
        assert_eq!(
            error.to_string(),
            "Missing shards for worker_count 3: ranks [1, 2]"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let glaive_error = GlaiveError::from(io_error);

        match glaive_error {
            GlaiveError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
    }
}
