//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{GlaiveError, Result};
use crate::storage::{Storage, StorageError, StorageInput, StorageOutput};

/// Configuration for [`FileStorage`].
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    /// Root directory of the storage.
    pub path: PathBuf,

    /// Buffer size for I/O operations.
    pub buffer_size: usize,

    /// Whether to fsync on close.
    pub sync_writes: bool,
}

impl FileStorageConfig {
    /// Create a configuration rooted at `path` with default buffering.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStorageConfig {
            path: path.as_ref().to_path_buf(),
            buffer_size: 65536,
            sync_writes: true,
        }
    }
}

/// A file-based storage implementation.
#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
    config: FileStorageConfig,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        let directory = config.path.clone();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| GlaiveError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(GlaiveError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage { directory, config })
    }

    /// Create a file storage with default configuration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(FileStorageConfig::new(path))
    }

    /// Root directory of this storage.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> PathBuf {
        name.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.directory.clone(), |path, part| path.join(part))
    }

    fn collect_files(&self, dir: &Path, files: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir).map_err(|e| StorageError::IoError(e.to_string()))? {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            let path = entry.path();

            if path.is_dir() {
                self.collect_files(&path, files)?;
            } else if let Ok(relative) = path.strip_prefix(&self.directory) {
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push(name);
            }
        }
        Ok(())
    }
}

fn map_open_error(name: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::FileNotFound(name.to_string())
    } else {
        StorageError::IoError(format!("{name}: {e}"))
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.file_path(name);
        let file = File::open(&path).map_err(|e| map_open_error(name, e))?;

        Ok(Box::new(FileInput::new(file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.file_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::IoError(format!("{}: {e}", parent.display())))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StorageError::IoError(format!("{name}: {e}")))?;

        Ok(Box::new(FileOutput::new(
            file,
            self.config.buffer_size,
            self.config.sync_writes,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).is_file()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| StorageError::IoError(format!("Failed to delete file: {e}")))?;
        }

        Ok(())
    }

    fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let mut files = Vec::new();
        self.collect_files(&self.directory, &mut files)?;
        files.retain(|name| name.starts_with(prefix));
        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| map_open_error(name, e))?;

        Ok(metadata.len())
    }

    fn sync(&self) -> Result<()> {
        // Outputs sync themselves on close.
        Ok(())
    }
}

/// A file input implementation.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let metadata = file
            .metadata()
            .map_err(|e| GlaiveError::storage(format!("Failed to get file metadata: {e}")))?;

        let size = metadata.len();
        let reader = BufReader::with_capacity(buffer_size, file);

        Ok(FileInput { reader, size })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

/// A file output implementation.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    sync_writes: bool,
    position: u64,
    closed: bool,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize, sync_writes: bool) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            sync_writes,
            position: 0,
            closed: false,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.position += bytes_written as u64;
        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| GlaiveError::storage(format!("Failed to flush: {e}")))?;

        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| GlaiveError::storage(format!("Failed to sync: {e}")))?;

        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.sync_writes {
            self.flush_and_sync()?;
        } else {
            self.writer.flush()?;
        }
        self.closed = true;
        Ok(())
    }
}
