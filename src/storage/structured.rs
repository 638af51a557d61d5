//! Structured binary I/O for index files.
//!
//! Little-endian primitives, varints, and length-prefixed strings with a
//! running CRC32 checksum. Every on-disk structure in the write path starts
//! with a magic number and version and ends with the writer's checksum.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{KontosError, Result};
use crate::storage::traits::{StorageInput, StorageOutput};

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: Hasher,
    position: u64,
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: Hasher::new(),
            position: 0,
        }
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.hasher.update(&[value]);
        self.position += 1;
        Ok(())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 4;
        Ok(())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 8;
        Ok(())
    }

    /// Write a variable-length encoded u64.
    pub fn write_varint(&mut self, mut value: u64) -> Result<()> {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.write_u8(byte)?;
            if value == 0 {
                return Ok(());
            }
        }
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value.as_bytes())
    }

    /// Write a length-prefixed byte slice.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value)
    }

    /// Write raw bytes without a length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(value)?;
        self.hasher.update(value);
        self.position += value.len() as u64;
        Ok(())
    }

    /// Get the current position in the output.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Write the checksum footer and close the underlying output.
    pub fn close(mut self) -> Result<()> {
        let checksum = self.hasher.clone().finalize();
        self.writer.write_u32::<LittleEndian>(checksum)?;
        self.writer.close()
    }
}

/// A structured file reader for binary data.
pub struct StructReader<R: StorageInput> {
    reader: R,
    hasher: Hasher,
    position: u64,
    size: u64,
}

impl<R: StorageInput> StructReader<R> {
    /// Create a new structured file reader.
    pub fn new(reader: R) -> Result<Self> {
        let size = reader.size()?;
        Ok(StructReader {
            reader,
            hasher: Hasher::new(),
            position: 0,
            size,
        })
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.reader.read_u8()?;
        self.hasher.update(&[value]);
        self.position += 1;
        Ok(value)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.reader.read_u32::<LittleEndian>()?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 4;
        Ok(value)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.reader.read_u64::<LittleEndian>()?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 8;
        Ok(value)
    }

    /// Read a variable-length encoded u64.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                return Err(KontosError::storage("Varint is too long"));
            }
        }
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| KontosError::storage(format!("Invalid UTF-8: {e}")))
    }

    /// Read a length-prefixed byte vector.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_varint()? as usize;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        self.hasher.update(&buf);
        self.position += len as u64;
        Ok(buf)
    }

    /// Get the current position in the input.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether all payload bytes before the checksum footer were consumed.
    pub fn at_footer(&self) -> bool {
        self.position + 4 >= self.size
    }

    /// Read the checksum footer and compare it against the bytes read so far.
    pub fn verify_checksum(&mut self) -> Result<()> {
        let expected = self.hasher.clone().finalize();
        let stored = self.reader.read_u32::<LittleEndian>()?;
        if stored != expected {
            return Err(KontosError::storage(format!(
                "Checksum mismatch: stored {stored:#010x}, computed {expected:#010x}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::traits::{Storage, StorageConfig};

    fn storage() -> MemoryStorage {
        MemoryStorage::new(StorageConfig::default())
    }

    #[test]
    fn test_primitives_round_trip() {
        let storage = storage();

        let output = storage.create_output("t.bin").unwrap();
        let mut writer = StructWriter::new(output);
        writer.write_u8(7).unwrap();
        writer.write_u32(0x53454753).unwrap();
        writer.write_u64(u64::MAX).unwrap();
        writer.write_varint(300).unwrap();
        writer.write_string("segment_000001").unwrap();
        writer.write_bytes(&[1, 2, 3]).unwrap();
        writer.close().unwrap();

        let input = storage.open_input("t.bin").unwrap();
        let mut reader = StructReader::new(input).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u32().unwrap(), 0x53454753);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX);
        assert_eq!(reader.read_varint().unwrap(), 300);
        assert_eq!(reader.read_string().unwrap(), "segment_000001");
        assert_eq!(reader.read_bytes().unwrap(), vec![1, 2, 3]);
        assert!(reader.at_footer());
        reader.verify_checksum().unwrap();
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let storage = storage();

        let output = storage.create_output("t.bin").unwrap();
        let mut writer = StructWriter::new(output);
        writer.write_u64(42).unwrap();
        writer.close().unwrap();

        let input = storage.open_input("t.bin").unwrap();
        let mut reader = StructReader::new(input).unwrap();
        // Read a different width than was written; the running checksum
        // no longer matches the footer.
        reader.read_u32().unwrap();
        reader.read_u32().unwrap();
        assert!(reader.verify_checksum().is_err());
    }

    #[test]
    fn test_varint_boundaries() {
        let storage = storage();

        let output = storage.create_output("v.bin").unwrap();
        let mut writer = StructWriter::new(output);
        for value in [0u64, 127, 128, 16383, 16384, u64::MAX] {
            writer.write_varint(value).unwrap();
        }
        writer.close().unwrap();

        let input = storage.open_input("v.bin").unwrap();
        let mut reader = StructReader::new(input).unwrap();
        for value in [0u64, 127, 128, 16383, 16384, u64::MAX] {
            assert_eq!(reader.read_varint().unwrap(), value);
        }
    }
}
