//! Entries persisted by the WAL-backed transient buffer

use crate::TransientRecord;
use common::{Symbol, Ts};
use serde::{Deserialize, Serialize};

use super::wal::WalEntry;

/// One log entry of the transient buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferEntry {
    /// Raw observation appended to the buffer
    Append {
        /// Monotonic sequence within the buffer
        seq: u64,
        /// Buffered record
        record: TransientRecord,
    },
    /// Tombstone removing every record of `symbol` observed before `before`
    Clear {
        /// Symbol being cleared
        symbol: Symbol,
        /// Exclusive upper bound
        before: Ts,
    },
}

impl BufferEntry {
    /// Symbol the entry applies to
    #[must_use]
    pub fn symbol(&self) -> &Symbol {
        match self {
            Self::Append { record, .. } => &record.symbol,
            Self::Clear { symbol, .. } => symbol,
        }
    }
}

impl WalEntry for BufferEntry {
    fn timestamp(&self) -> Ts {
        match self {
            Self::Append { record, .. } => record.observed_at,
            Self::Clear { before, .. } => *before,
        }
    }
}
