//! Size-bounded disk cache for downloaded media.
//!
//! The cache hands out file paths, never bytes: a downloader asks for a path
//! for a URL, writes the body into it, and reports back once the file is
//! complete. Whether a file is complete is recorded durably next to it, so a
//! crash mid-download never leaves a truncated file that looks finished.
//!
//! # Architecture
//! - [`Cache`]: one [`InnerCache`] per configured category (images, videos,
//!   and so on), each with its own slice of the total disk budget.
//! - [`InnerCache`]: the entries of one category, stored as
//!   `<key>.cache` + `<key>.cache_meta` pairs, plus partial range downloads
//!   in a separate chunk directory. Going over budget schedules a trim that
//!   evicts the oldest entries first.
//!
//! The files on disk are the source of truth. Everything kept in memory is
//! a hint that is repaired from disk whenever it turns out to be wrong, and
//! entries whose files don't add up are deleted rather than reported.

pub mod error;
mod facade;
mod inner;

pub use crate::facade::{BudgetPolicy, Cache, CategoryStats, ShareOfTotal};
pub use crate::inner::{InnerCache, TrimMode, TrimReport};
pub use mediacache_config::{Config, TrimSettings};
pub use mediacache_storage::EntryKey;
