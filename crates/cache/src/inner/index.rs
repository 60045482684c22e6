//! In-memory mirror of what is on disk.
//!
//! Never the source of truth: everything here can be thrown away and rebuilt
//! from the directory, and is allowed to be briefly out of date.

use mediacache_storage::EntryKey;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

#[derive(Default)]
pub(crate) struct Index {
    /// Keys known to have a data file.
    on_disk: Mutex<HashSet<EntryKey>>,
    /// Keys known to be completely downloaded. Always a subset of `on_disk`.
    downloaded: Mutex<HashSet<EntryKey>>,
}

impl Index {
    pub(crate) fn is_downloaded(&self, key: &EntryKey) -> bool {
        self.downloaded.lock().unwrap_or_else(PoisonError::into_inner).contains(key)
    }

    pub(crate) fn insert_on_disk(&self, key: &EntryKey) {
        self.on_disk.lock().unwrap_or_else(PoisonError::into_inner).insert(key.clone());
    }

    pub(crate) fn insert_downloaded(&self, key: &EntryKey) {
        self.insert_on_disk(key);
        self.downloaded.lock().unwrap_or_else(PoisonError::into_inner).insert(key.clone());
    }

    /// The data file is being replaced: still on disk, no longer complete.
    pub(crate) fn reset(&self, key: &EntryKey) {
        self.downloaded.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        self.insert_on_disk(key);
    }

    pub(crate) fn remove(&self, key: &EntryKey) {
        self.downloaded.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        self.on_disk.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    pub(crate) fn clear(&self) {
        self.downloaded.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.on_disk.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// `(on disk, downloaded)` counts.
    pub(crate) fn len(&self) -> (usize, usize) {
        let on_disk = self.on_disk.lock().unwrap_or_else(PoisonError::into_inner).len();
        let downloaded = self.downloaded.lock().unwrap_or_else(PoisonError::into_inner).len();
        (on_disk, downloaded)
    }
}
