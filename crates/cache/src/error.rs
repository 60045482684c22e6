//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! Most cache operations never return these: failures are logged, the entry
//! involved is cleaned up, and the caller sees a miss. They show up when
//! opening a cache, and inside the crate on the way to that boundary.

use derive_more::{Display, Error};

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The file system refused an operation.
    #[display("cache storage error")]
    Storage,
    /// What is on disk for an entry doesn't add up. Delete it.
    #[display("corrupt cache entry: {_0}")]
    Corrupt(#[error(not(source))] &'static str),
    /// The configuration doesn't describe a usable cache.
    #[display("invalid cache configuration")]
    Config,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage)
    }
}
