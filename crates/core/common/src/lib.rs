//! Shared value types for the price sampler workspace

pub mod constants;
pub mod types;

pub use types::{ParsePxError, Px, Symbol, Ts};
