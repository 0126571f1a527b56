//! Constants shared across the workspace
//!
//! Single source of truth for fixed-point scales and time units

/// Fixed-point arithmetic constants
pub mod fixed_point {
    /// Number of fractional digits carried by [`crate::Px`]
    pub const PRICE_DECIMALS: u32 = 8;
    /// Ticks per whole price unit (10^8)
    pub const PRICE_SCALE: i64 = 100_000_000;
}

/// Time unit constants
pub mod time {
    pub const NANOS_PER_MICRO: u64 = 1_000;
    pub const NANOS_PER_MILLI: u64 = 1_000_000;
    pub const NANOS_PER_SEC: u64 = 1_000_000_000;
}
