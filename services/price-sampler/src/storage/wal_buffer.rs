//! Transient buffer persisted through the WAL
//!
//! Every append and clear is logged before the in-memory mirror changes, so reopening the
//! directory after a crash rebuilds exactly the records that were not cleared.

use super::events::BufferEntry;
use super::wal::{Wal, WalStats};
use super::{TransientIter, TransientStore};
use crate::TransientRecord;
use crate::error::{PipelineError, PipelineResult};
use anyhow::Result;
use async_trait::async_trait;
use common::{Symbol, Ts};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct BufferState {
    wal: Wal,
    mirror: FxHashMap<Symbol, VecDeque<(u64, TransientRecord)>>,
    next_seq: u64,
}

impl BufferState {
    /// Lowest sequence number still referenced by a buffered record
    fn min_live_seq(&self) -> u64 {
        self.mirror
            .values()
            .filter_map(|q| q.front().map(|(seq, _)| *seq))
            .min()
            .unwrap_or(self.next_seq)
    }

    fn compact(&mut self) -> Result<u64> {
        let min_live = self.min_live_seq();
        self.wal.compact::<BufferEntry, _>(|entry| match entry {
            BufferEntry::Append { seq, .. } => *seq < min_live,
            BufferEntry::Clear { .. } => true,
        })
    }
}

/// WAL-backed [`TransientStore`]
pub struct WalTransientStore {
    dir: PathBuf,
    state: Mutex<BufferState>,
    max_records_per_symbol: usize,
}

impl WalTransientStore {
    /// Open the buffer in `dir`, replaying whatever is already on disk
    pub fn open(
        dir: &Path,
        segment_size: Option<u64>,
        max_records_per_symbol: usize,
    ) -> Result<Self> {
        let wal = Wal::new(dir, segment_size)?;

        let mut mirror: FxHashMap<Symbol, VecDeque<(u64, TransientRecord)>> =
            FxHashMap::default();
        let mut next_seq = 0;
        let mut appends = 0usize;
        let mut clears = 0usize;

        let mut iter = wal.stream::<BufferEntry>()?;
        while let Some(entry) = iter.read_next_entry()? {
            match entry {
                BufferEntry::Append { seq, record } => {
                    next_seq = next_seq.max(seq + 1);
                    mirror
                        .entry(record.symbol.clone())
                        .or_default()
                        .push_back((seq, record));
                    appends += 1;
                }
                BufferEntry::Clear { symbol, before } => {
                    if let Some(queue) = mirror.get_mut(&symbol) {
                        queue.retain(|(_, r)| r.observed_at >= before);
                    }
                    clears += 1;
                }
            }
        }
        mirror.retain(|_, q| !q.is_empty());

        let live: usize = mirror.values().map(VecDeque::len).sum();
        info!(
            "Replayed transient buffer at {}: {} appends, {} clears, {} live records",
            dir.display(),
            appends,
            clears,
            live
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(BufferState {
                wal,
                mirror,
                next_seq,
            }),
            max_records_per_symbol,
        })
    }

    /// Directory holding the log
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Delete closed segments that no longer hold live records
    pub async fn compact(&self) -> Result<u64> {
        self.state.lock().await.compact()
    }

    /// Statistics of the underlying log
    pub async fn stats(&self) -> Result<WalStats> {
        self.state.lock().await.wal.stats()
    }
}

#[async_trait]
impl TransientStore for WalTransientStore {
    async fn append(&self, record: TransientRecord) -> PipelineResult<()> {
        let mut state = self.state.lock().await;

        let len = state.mirror.get(&record.symbol).map_or(0, VecDeque::len);
        if len >= self.max_records_per_symbol {
            return Err(PipelineError::BufferFull {
                symbol: record.symbol,
                capacity: self.max_records_per_symbol,
            });
        }

        let seq = state.next_seq;
        let entry = BufferEntry::Append {
            seq,
            record: record.clone(),
        };
        state
            .wal
            .append(&entry)
            .map_err(|e| PipelineError::BufferWriteFailed {
                symbol: record.symbol.clone(),
                reason: e.to_string(),
            })?;

        state.next_seq += 1;
        state
            .mirror
            .entry(record.symbol.clone())
            .or_default()
            .push_back((seq, record));
        Ok(())
    }

    async fn clear(&self, symbol: &Symbol, before: Ts) -> Result<usize> {
        let mut state = self.state.lock().await;

        let matching = state
            .mirror
            .get(symbol)
            .map_or(0, |q| q.iter().filter(|(_, r)| r.observed_at < before).count());
        if matching == 0 {
            return Ok(0);
        }

        state.wal.append(&BufferEntry::Clear {
            symbol: symbol.clone(),
            before,
        })?;

        if let Some(queue) = state.mirror.get_mut(symbol) {
            queue.retain(|(_, r)| r.observed_at >= before);
            if queue.is_empty() {
                state.mirror.remove(symbol);
            }
        }
        debug!("Cleared {} buffered records of {} before {}", matching, symbol, before);

        // the tombstone is already logged, a failed compaction only delays reclaiming space
        if let Err(e) = state.compact() {
            warn!("Buffer compaction failed in {}: {}", self.dir.display(), e);
        }
        Ok(matching)
    }

    async fn all(&self, symbol: &Symbol) -> Result<TransientIter> {
        let state = self.state.lock().await;
        Ok(TransientIter::new(
            state
                .mirror
                .get(symbol)
                .map(|q| q.iter().map(|(_, r)| r.clone()).collect())
                .unwrap_or_default(),
        ))
    }

    async fn len(&self, symbol: &Symbol) -> Result<usize> {
        Ok(self
            .state
            .lock()
            .await
            .mirror
            .get(symbol)
            .map_or(0, VecDeque::len))
    }

    async fn symbols(&self) -> Result<Vec<Symbol>> {
        let mut symbols: Vec<Symbol> = self.state.lock().await.mirror.keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }

    async fn flush(&self) -> Result<()> {
        self.state.lock().await.wal.flush()
    }
}

impl std::fmt::Debug for WalTransientStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalTransientStore")
            .field("dir", &self.dir)
            .field("max_records_per_symbol", &self.max_records_per_symbol)
            .finish()
    }
}
