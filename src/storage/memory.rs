//! In-memory storage implementation.
//!
//! Used by tests and short-lived indexes. Files become visible atomically
//! when their output is closed.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::error::{KontosError, Result};
use crate::storage::traits::{Storage, StorageConfig, StorageInput, StorageOutput};

type FileMap = Arc<RwLock<AHashMap<String, Arc<Vec<u8>>>>>;

/// A memory-backed storage implementation.
#[derive(Debug)]
pub struct MemoryStorage {
    /// Stored files by name.
    files: FileMap,

    /// Storage configuration.
    #[allow(dead_code)]
    config: StorageConfig,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: StorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(RwLock::new(AHashMap::new())),
            config,
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(StorageConfig::default())
    }

    /// Get the number of stored files.
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    /// Get the total size of all stored files.
    pub fn total_size(&self) -> u64 {
        self.files.read().values().map(|f| f.len() as u64).sum()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.read();
        let data = files
            .get(name)
            .cloned()
            .ok_or_else(|| KontosError::storage(format!("File not found: {name}")))?;
        Ok(Box::new(MemoryInput { data, position: 0 }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            files: Arc::clone(&self.files),
            closed: false,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KontosError::storage(format!("File not found: {name}")))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.read();
        files
            .get(name)
            .map(|f| f.len() as u64)
            .ok_or_else(|| KontosError::storage(format!("File not found: {name}")))
    }

    fn sync(&self) -> Result<()> {
        // Memory storage is never durable; sync is a no-op.
        Ok(())
    }
}

/// Read handle over an immutable in-memory file.
#[derive(Debug)]
pub struct MemoryInput {
    data: Arc<Vec<u8>>,
    position: u64,
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let pos = self.position as usize;
        if pos >= self.data.len() {
            return Ok(0);
        }
        let n = (self.data.len() - pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[pos..pos + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self.data.len() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => len + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if target < 0 {
            return Err(std::io::Error::other("seek before start of file"));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }
}

/// Write handle that installs its buffer into the file map on close.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileMap,
    closed: bool,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let data = Arc::new(std::mem::take(&mut self.buffer));
            self.files.write().insert(self.name.clone(), data);
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        let _ = StorageOutput::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_read_back() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("test.bin").unwrap();
        output.write_all(b"hello").unwrap();
        output.close().unwrap();

        assert!(storage.file_exists("test.bin"));
        assert_eq!(storage.file_size("test.bin").unwrap(), 5);

        let mut input = storage.open_input("test.bin").unwrap();
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn test_file_not_visible_until_close() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("pending.bin").unwrap();
        output.write_all(b"data").unwrap();
        assert!(!storage.file_exists("pending.bin"));

        output.close().unwrap();
        assert!(storage.file_exists("pending.bin"));
    }

    #[test]
    fn test_delete_and_list() {
        let storage = MemoryStorage::new_default();

        for name in ["b.bin", "a.bin"] {
            let mut output = storage.create_output(name).unwrap();
            output.write_all(b"x").unwrap();
            output.close().unwrap();
        }

        assert_eq!(storage.list_files().unwrap(), vec!["a.bin", "b.bin"]);

        storage.delete_file("a.bin").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["b.bin"]);
        assert!(storage.delete_file("a.bin").is_err());
    }
}
