//! Async locking primitives shared by the cache crates.
//!
//! The only thing living here for now is [`KeyedLock`]: a registry of
//! per-key mutexes sitting underneath one global reader/writer lock, so that
//! unrelated cache entries can be worked on concurrently while whole-cache
//! operations (clear, rescan) still get exclusive access.

mod keyed;

pub use crate::keyed::{GlobalGuard, KeyedLock, LocalGuard};
