//! In-memory storage implementation for testing and single-process pipelines.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::{Storage, StorageError, StorageInput, StorageOutput};

type FileMap = Arc<Mutex<BTreeMap<String, Arc<[u8]>>>>;

/// An in-memory storage implementation.
///
/// Cloning a `MemoryStorage` yields a second handle onto the same files, which
/// is how tests hand one "bucket" to several workers.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: FileMap,
}

impl MemoryStorage {
    /// Create a new, empty memory storage.
    pub fn new_default() -> Self {
        Self::default()
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }

    /// Overwrite raw bytes of an existing file. Used to simulate corruption.
    pub fn put(&self, name: &str, data: Vec<u8>) {
        self.files.lock().insert(name.to_string(), data.into());
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let files = self.files.lock();
        Ok(files
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(data.len() as u64)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
    size: u64,
}

impl MemoryInput {
    fn new(data: Arc<[u8]>) -> Self {
        let size = data.len() as u64;
        MemoryInput {
            cursor: Cursor::new(data),
            size,
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

/// A memory-based output implementation.
///
/// The buffer is published into the file map on `close` (or drop).
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileMap,
    closed: bool,
}

impl MemoryOutput {
    fn new(name: String, files: FileMap) -> Self {
        MemoryOutput {
            name,
            buffer: Vec::new(),
            files,
            closed: false,
        }
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.buffer.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let data: Arc<[u8]> = std::mem::take(&mut self.buffer).into();
            self.files.lock().insert(self.name.clone(), data);
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_visible_after_close() {
        let storage = MemoryStorage::new_default();
        let mut output = storage.create_output("faiss/item_index/part_1_0.dat").unwrap();
        output.write_all(b"abc").unwrap();
        assert!(!storage.file_exists("faiss/item_index/part_1_0.dat"));

        output.close().unwrap();
        assert!(storage.file_exists("faiss/item_index/part_1_0.dat"));
        assert_eq!(storage.file_size("faiss/item_index/part_1_0.dat").unwrap(), 3);
    }

    #[test]
    fn test_create_output_truncates() {
        let storage = MemoryStorage::new_default();
        crate::storage::write_file(&storage, "x", b"long content").unwrap();
        crate::storage::write_file(&storage, "x", b"short").unwrap();
        assert_eq!(crate::storage::read_file(&storage, "x").unwrap(), b"short");
    }

    #[test]
    fn test_list_files_by_prefix() {
        let storage = MemoryStorage::new_default();
        crate::storage::write_file(&storage, "faiss/item_ids/part_2_1.dat", b"").unwrap();
        crate::storage::write_file(&storage, "faiss/item_ids/part_2_0.dat", b"").unwrap();
        crate::storage::write_file(&storage, "faiss/item_index/part_2_0.dat", b"").unwrap();

        let files = storage.list_files("faiss/item_ids/").unwrap();
        assert_eq!(
            files,
            vec![
                "faiss/item_ids/part_2_0.dat".to_string(),
                "faiss/item_ids/part_2_1.dat".to_string()
            ]
        );
    }

    #[test]
    fn test_clones_share_files() {
        let storage = MemoryStorage::new_default();
        let other = storage.clone();
        crate::storage::write_file(&storage, "shared", b"1").unwrap();
        assert!(other.file_exists("shared"));
        assert_eq!(other.file_count(), 1);
        assert_eq!(other.total_size(), 1);
    }

    #[test]
    fn test_open_missing_file() {
        let storage = MemoryStorage::new_default();
        let err = storage.open_input("nope").unwrap_err();
        assert!(err.to_string().contains("File not found: nope"));
    }
}
