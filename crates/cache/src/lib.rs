#![warn(clippy::unwrap_used)]

pub mod coalescer;
pub mod hash;

pub use coalescer::{CacheError, ResponseCoalescer};
pub use hash::{request_hash, CALLED_MANUALLY};
