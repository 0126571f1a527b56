//! WAL segment files with CRC32-framed entries
//!
//! Layout: 16-byte header `[magic: u32][version: u32][entries: u64]` followed by frames
//! `[length: u32][crc: u32][data: bytes]`. The header count is refreshed on every sync; readers
//! do not depend on it and stop at the first torn frame instead.

use anyhow::{Result, anyhow};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{trace, warn};

/// Size of segment header in bytes
pub const SEGMENT_HEADER_SIZE: u64 = 16;

/// Size of a frame header in bytes
const FRAME_HEADER_SIZE: u64 = 8;

/// Magic number for segment files
const SEGMENT_MAGIC: u32 = 0x5053_5742; // "PSWB"

/// Version of segment format
const SEGMENT_VERSION: u32 = 1;

/// A single WAL segment open for appending
pub struct Segment {
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
    max_size: u64,
    entries: u64,
}

impl Segment {
    /// Create a new segment file, truncating any existing one
    pub fn create(path: &Path, max_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        writer.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
        writer.write_u32::<LittleEndian>(SEGMENT_VERSION)?;
        writer.write_u64::<LittleEndian>(0)?;
        writer.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            file: writer,
            size: SEGMENT_HEADER_SIZE,
            max_size,
            entries: 0,
        })
    }

    /// Open an existing segment file for reading
    pub fn open(path: &Path) -> Result<SegmentReader> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::with_capacity(64 * 1024, file);

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != SEGMENT_MAGIC {
            return Err(anyhow!("Invalid segment magic: {:#x}", magic));
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if version != SEGMENT_VERSION {
            return Err(anyhow!("Unsupported segment version: {}", version));
        }

        let header_entries = reader.read_u64::<LittleEndian>()?;

        Ok(SegmentReader {
            path: path.to_path_buf(),
            reader,
            file_len,
            position: SEGMENT_HEADER_SIZE,
            header_entries,
            read: 0,
        })
    }

    /// Append an entry to the segment
    #[inline]
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.is_full(data.len()) {
            return Err(anyhow!("Segment is full"));
        }
        let data_len = u32::try_from(data.len())
            .map_err(|_| anyhow!("Entry of {} bytes exceeds frame limit", data.len()))?;

        let mut hasher = Hasher::new();
        hasher.update(data);
        let crc = hasher.finalize();

        self.file.write_u32::<LittleEndian>(data_len)?;
        self.file.write_u32::<LittleEndian>(crc)?;
        self.file.write_all(data)?;
        // hand the frame to the OS so a process crash cannot lose it
        self.file.flush()?;

        self.size += FRAME_HEADER_SIZE + u64::from(data_len);
        self.entries += 1;

        trace!(
            "Appended entry {} ({} bytes) to {}",
            self.entries,
            data.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Check if segment has room for another entry
    #[must_use]
    pub const fn is_full(&self, next_entry_size: usize) -> bool {
        self.size
            .saturating_add(FRAME_HEADER_SIZE)
            .saturating_add(next_entry_size as u64)
            > self.max_size
    }

    /// Refresh the header entry count and fsync
    pub fn sync(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_u64::<LittleEndian>(self.entries)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.flush()?;
        self.file.get_mut().sync_all()?;
        Ok(())
    }

    /// Close the segment, updating the header with the final entry count
    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        tracing::debug!(
            "Closed segment {} with {} entries",
            self.path.display(),
            self.entries
        );
        Ok(())
    }

    /// Path of the segment file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the number of entries in the segment
    #[must_use]
    pub const fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Get the current size of the segment
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

/// Sequential reader for a WAL segment
pub struct SegmentReader {
    path: PathBuf,
    reader: BufReader<File>,
    file_len: u64,
    position: u64,
    header_entries: u64,
    read: u64,
}

impl SegmentReader {
    /// Read the next entry
    ///
    /// Returns `None` at the end of the file or at a torn final frame. A complete frame whose
    /// checksum does not match is an error.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.position + FRAME_HEADER_SIZE > self.file_len {
            if self.position != self.file_len {
                warn!("Torn frame header at end of {}", self.path.display());
            }
            return Ok(None);
        }

        let length = self.reader.read_u32::<LittleEndian>()?;
        let expected_crc = self.reader.read_u32::<LittleEndian>()?;

        if self.position + FRAME_HEADER_SIZE + u64::from(length) > self.file_len {
            warn!(
                "Torn frame of {} bytes at offset {} in {}",
                length,
                self.position,
                self.path.display()
            );
            return Ok(None);
        }

        let mut data = vec![0u8; length as usize];
        match self.reader.read_exact(&mut data) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let mut hasher = Hasher::new();
        hasher.update(&data);
        let actual_crc = hasher.finalize();

        if actual_crc != expected_crc {
            return Err(anyhow!(
                "CRC mismatch in {} at offset {}: expected {:#x}, got {:#x}",
                self.path.display(),
                self.position,
                expected_crc,
                actual_crc
            ));
        }

        self.position += FRAME_HEADER_SIZE + u64::from(length);
        self.read += 1;
        Ok(Some(data))
    }

    /// Entry count recorded in the header at the last sync
    #[must_use]
    pub const fn header_entry_count(&self) -> u64 {
        self.header_entries
    }

    /// Number of entries read so far
    #[must_use]
    pub const fn entries_read(&self) -> u64 {
        self.read
    }
}
