//! On-disk building blocks of the media cache.
//!
//! - [`EntryKey`]: the file system safe identity of a cached URL.
//! - [`EntryMeta`]: the small record stored next to each data file saying
//!   when the entry was created and whether it is completely downloaded.
//! - [`Directory`]: a flat directory of cache files with async access.
//!
//! Nothing in here knows about locking, budgets or eviction; that is the
//! job of the `mediacache` crate.

mod dir;
pub mod error;
mod key;
mod meta;
mod models;
mod path;

pub use crate::dir::{Directory, FileInfoStream};
pub use crate::key::{CHUNK_EXTENSION, DATA_EXTENSION, EntryKey, FileKind, META_EXTENSION};
pub use crate::meta::{EntryMeta, MAX_META_FILE_LEN, META_VERSION, now_millis};
pub use crate::models::FileInfo;
pub use crate::path::validate_name;
