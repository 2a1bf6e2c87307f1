//! Connection registry module
//!
//! Tracks admitted connections and reclaims their slots on eviction.

mod pool;

pub use pool::*;
