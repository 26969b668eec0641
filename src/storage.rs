//! Storage abstraction layer for Glaive.
//!
//! Shards, id files and checkpoints are addressed by slash-separated names
//! relative to a storage root (for example `faiss/item_index/part_4_0.dat`).
//! Build workers, the assembler and the reconstruction phase only share data
//! through these names, so any backend that implements [`Storage`] can sit
//! under a pipeline.
//!
//! # Storage Types
//!
//! ## FileStorage
//! - Disk-based persistent storage rooted at a local directory
//! - Parent directories are created on demand when writing nested names
//!
//! ## MemoryStorage
//! - In-memory storage for testing and single-process pipelines
//!
//! Object-store URLs (`s3://`, `s3a://`) are parsed by [`url`]; copying a
//! finished tree to an export location is handled by [`export`].
//!
//! # Example
//!
//! ```
//! use glaive::storage::memory::MemoryStorage;
//! use glaive::storage::Storage;
//! use std::io::{Read, Write};
//!
//! # fn main() -> glaive::error::Result<()> {
//! let storage = MemoryStorage::new_default();
//!
//! let mut output = storage.create_output("faiss/item_ids/part_1_0.dat")?;
//! output.write_all(b"7\x02red\n")?;
//! output.close()?;
//!
//! let mut input = storage.open_input("faiss/item_ids/part_1_0.dat")?;
//! let mut buffer = String::new();
//! input.read_to_string(&mut buffer)?;
//! assert_eq!(buffer, "7\u{2}red\n");
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::error::{GlaiveError, Result};

pub mod export;
pub mod file;
pub mod memory;
pub mod url;

/// A trait for storage backends that can store and retrieve data.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open a file for reading.
    ///
    /// The file must exist, otherwise a storage error naming the file is
    /// returned.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing.
    ///
    /// Creates a new file or truncates an existing one. Writes may be visible
    /// before the output is closed; they are durable only after
    /// [`StorageOutput::close`].
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files whose name starts with `prefix`, sorted.
    fn list_files(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Sync all pending writes to storage.
    fn sync(&self) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Read the whole stream from the beginning.
    fn read_all(&mut self) -> Result<Vec<u8>> {
        self.rewind()?;
        let mut buffer = Vec::with_capacity(self.size()? as usize);
        self.read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the number of bytes written so far.
    fn position(&self) -> Result<u64>;

    /// Close the output stream, making its contents durable.
    fn close(&mut self) -> Result<()>;
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// I/O error.
    IoError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for GlaiveError {
    fn from(err: StorageError) -> Self {
        GlaiveError::storage(err.to_string())
    }
}

/// Shared handle to a storage backend.
pub type SharedStorage = Arc<dyn Storage>;

/// Read a whole file into memory.
pub fn read_file(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut input = storage.open_input(name)?;
    input.read_all()
}

/// Write `data` to `name`, replacing any previous content.
pub fn write_file(storage: &dyn Storage, name: &str, data: &[u8]) -> Result<()> {
    let mut output = storage.create_output(name)?;
    output.write_all(data)?;
    output.close()
}
