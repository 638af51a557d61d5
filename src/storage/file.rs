//! File-based storage implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{KontosError, Result};
use crate::storage::traits::{Storage, StorageConfig, StorageInput, StorageOutput};

/// A file-system-backed storage implementation rooted at one directory.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,

    /// Storage configuration.
    config: StorageConfig,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P, config: StorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            fs::create_dir_all(&directory)
                .map_err(|e| KontosError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(KontosError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage { directory, config })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.path_for(name);
        let file = File::open(&path)
            .map_err(|e| KontosError::storage(format!("Failed to open {name}: {e}")))?;
        let size = file
            .metadata()
            .map_err(|e| KontosError::storage(format!("Failed to stat {name}: {e}")))?
            .len();
        Ok(Box::new(FileInput {
            reader: BufReader::with_capacity(self.config.buffer_size, file),
            size,
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.path_for(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| KontosError::storage(format!("Failed to create {name}: {e}")))?;
        Ok(Box::new(FileOutput {
            writer: Some(BufWriter::with_capacity(self.config.buffer_size, file)),
            sync_on_close: self.config.sync_on_close,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        fs::remove_file(self.path_for(name))
            .map_err(|e| KontosError::storage(format!("Failed to delete {name}: {e}")))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.directory)
            .map_err(|e| KontosError::storage(format!("Failed to list directory: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(KontosError::Io)?;
            if entry.path().is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let metadata = fs::metadata(self.path_for(name))
            .map_err(|e| KontosError::storage(format!("Failed to stat {name}: {e}")))?;
        Ok(metadata.len())
    }

    fn sync(&self) -> Result<()> {
        // Flush directory metadata so renames and creations are durable.
        let dir = File::open(&self.directory)
            .map_err(|e| KontosError::storage(format!("Failed to open directory: {e}")))?;
        dir.sync_all()
            .map_err(|e| KontosError::storage(format!("Failed to sync directory: {e}")))?;
        Ok(())
    }
}

/// Buffered read handle over a storage file.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
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

/// Buffered write handle, optionally fsynced on close.
#[derive(Debug)]
pub struct FileOutput {
    writer: Option<BufWriter<File>>,
    sync_on_close: bool,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(std::io::Error::other("output is closed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl StorageOutput for FileOutput {
    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| KontosError::storage(format!("Failed to flush output: {e}")))?;
            let file = writer
                .into_inner()
                .map_err(|e| KontosError::storage(format!("Failed to finish output: {e}")))?;
            if self.sync_on_close {
                file.sync_all()
                    .map_err(|e| KontosError::storage(format!("Failed to sync output: {e}")))?;
            }
        }
        Ok(())
    }
}

impl Drop for FileOutput {
    fn drop(&mut self) {
        let _ = StorageOutput::close(self);
    }
}
