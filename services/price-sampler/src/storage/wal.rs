//! Segmented write-ahead log
//!
//! Entries are bincode-encoded into CRC32 frames (see [`super::segment`]). Each process appends
//! to a fresh segment so a torn tail left by a crash is never written past.

use anyhow::{Result, anyhow};
use common::Ts;
use serde::{Serialize, de::DeserializeOwned};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::segment::{Segment, SegmentReader};

/// Default segment size (64 MB)
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Entry persisted in the WAL
pub trait WalEntry: Serialize + DeserializeOwned + Send + Sync {
    /// Timestamp carried by the entry
    fn timestamp(&self) -> Ts;
}

/// Write-ahead log over a directory of numbered segments
pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    current_segment: Option<Segment>,
    segment_counter: u64,
}

impl Wal {
    /// Open or create a WAL in `dir`
    pub fn new(dir: &Path, segment_size: Option<u64>) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }

        let segment_size = segment_size.unwrap_or(DEFAULT_SEGMENT_SIZE);
        let segment_counter = Self::find_latest_segment(dir)?;

        info!(
            "Initialized WAL at {} with segment size {} KB",
            dir.display(),
            segment_size / 1024
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            segment_size,
            current_segment: None,
            segment_counter,
        })
    }

    /// Directory holding the segments
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append an entry, rotating to a new segment when the current one is full
    #[inline]
    pub fn append<T: WalEntry>(&mut self, entry: &T) -> Result<()> {
        let data = bincode::serialize(entry)?;

        if self
            .current_segment
            .as_ref()
            .is_none_or(|s| s.is_full(data.len()))
        {
            self.rotate_segment()?;
        }

        match &mut self.current_segment {
            Some(segment) => segment.append(&data),
            None => Err(anyhow!("Failed to create segment")),
        }
    }

    /// Fsync the active segment
    pub fn flush(&mut self) -> Result<()> {
        if let Some(segment) = &mut self.current_segment {
            segment.sync()?;
        }
        Ok(())
    }

    /// Stream every entry in log order
    pub fn stream<T: WalEntry>(&self) -> Result<WalIterator<T>> {
        WalIterator::new(&self.dir)
    }

    /// Read every entry in log order
    pub fn read_all<T: WalEntry>(&self) -> Result<Vec<T>> {
        let mut iter = self.stream::<T>()?;
        let mut entries = Vec::new();
        while let Some(entry) = iter.read_next_entry()? {
            entries.push(entry);
        }
        debug!("Read {} entries from {}", entries.len(), self.dir.display());
        Ok(entries)
    }

    /// Remove the longest prefix of closed segments whose entries are all dead
    ///
    /// The active segment is never removed. Stops at the first segment holding a live entry so
    /// later segments keep their ordering relative to what remains.
    pub fn compact<T, F>(&mut self, is_dead: F) -> Result<u64>
    where
        T: WalEntry,
        F: Fn(&T) -> bool,
    {
        let active = self
            .current_segment
            .as_ref()
            .map(|s| s.path().to_path_buf());
        let mut removed = 0;

        for segment_path in Self::list_segments(&self.dir)? {
            if active.as_ref() == Some(&segment_path) {
                break;
            }
            if !Self::all_dead(&segment_path, &is_dead)? {
                break;
            }
            fs::remove_file(&segment_path)?;
            removed += 1;
            debug!("Removed segment: {}", segment_path.display());
        }

        if removed > 0 {
            info!("Compacted {} segments in {}", removed, self.dir.display());
        }
        Ok(removed)
    }

    /// Get statistics about the WAL
    pub fn stats(&self) -> Result<WalStats> {
        let segments = Self::list_segments(&self.dir)?;
        let segment_count = segments.len() as u64;

        let mut total_size = 0;
        let mut total_entries = 0;

        for segment_path in segments {
            total_size += fs::metadata(&segment_path)?.len();

            let mut reader = Segment::open(&segment_path)?;
            while reader.read_next()?.is_some() {}
            total_entries += reader.entries_read();
        }

        Ok(WalStats {
            segment_count,
            total_size,
            total_entries,
            current_segment_size: self.current_segment.as_ref().map(Segment::size),
        })
    }

    fn rotate_segment(&mut self) -> Result<()> {
        if let Some(segment) = self.current_segment.take() {
            segment.close()?;
        }

        self.segment_counter += 1;
        let segment_path = self.segment_path(self.segment_counter);
        self.current_segment = Some(Segment::create(&segment_path, self.segment_size)?);

        debug!("Rotated to new segment: {}", segment_path.display());
        Ok(())
    }

    fn segment_path(&self, counter: u64) -> PathBuf {
        self.dir.join(format!("{counter:010}.wal"))
    }

    fn find_latest_segment(dir: &Path) -> Result<u64> {
        let segments = Self::list_segments(dir)?;

        Ok(segments
            .iter()
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
            })
            .max()
            .unwrap_or(0))
    }

    fn list_segments(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut segments: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("wal"))
            .map(|entry| entry.path())
            .collect();

        segments.sort();
        Ok(segments)
    }

    fn all_dead<T, F>(segment_path: &Path, is_dead: &F) -> Result<bool>
    where
        T: WalEntry,
        F: Fn(&T) -> bool,
    {
        let mut reader = Segment::open(segment_path)?;
        while let Some(data) = reader.read_next()? {
            let entry: T = bincode::deserialize(&data)?;
            if !is_dead(&entry) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Some(segment) = self.current_segment.take() {
            if let Err(e) = segment.close() {
                warn!("Failed to close segment on WAL drop: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .field(
                "current_segment",
                &self.current_segment.as_ref().map(|s| s.path().to_path_buf()),
            )
            .field("segment_counter", &self.segment_counter)
            .finish()
    }
}

/// Statistics about the WAL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalStats {
    /// Number of segments
    pub segment_count: u64,
    /// Total size in bytes
    pub total_size: u64,
    /// Total number of readable entries
    pub total_entries: u64,
    /// Size of the segment being appended to
    pub current_segment_size: Option<u64>,
}

/// Iterator over WAL entries in log order
pub struct WalIterator<T: WalEntry> {
    segments: Vec<PathBuf>,
    current_reader: Option<SegmentReader>,
    current_index: usize,
    _phantom: PhantomData<T>,
}

impl<T: WalEntry> WalIterator<T> {
    fn new(dir: &Path) -> Result<Self> {
        Ok(Self {
            segments: Wal::list_segments(dir)?,
            current_reader: None,
            current_index: 0,
            _phantom: PhantomData,
        })
    }

    /// Read the next entry, moving across segments as each one ends
    pub fn read_next_entry(&mut self) -> Result<Option<T>> {
        loop {
            if self.current_reader.is_none() {
                let Some(path) = self.segments.get(self.current_index) else {
                    return Ok(None);
                };
                self.current_reader = Some(Segment::open(path)?);
                self.current_index += 1;
            }

            if let Some(reader) = &mut self.current_reader {
                match reader.read_next()? {
                    Some(data) => return Ok(Some(bincode::deserialize(&data)?)),
                    None => self.current_reader = None,
                }
            }
        }
    }
}

impl<T: WalEntry> std::fmt::Debug for WalIterator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalIterator")
            .field("segments", &self.segments)
            .field("current_index", &self.current_index)
            .finish()
    }
}
