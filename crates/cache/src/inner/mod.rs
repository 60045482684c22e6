//! The cache of a single category.

mod index;
mod trim;

pub use self::trim::{TrimMode, TrimReport};

use self::index::Index;
use self::trim::TrimState;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use mediacache_asyncutils::KeyedLock;
use mediacache_config::TrimSettings;
use mediacache_storage::{Directory, EntryKey, EntryMeta, FileKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::instrument;

const FILES_DIR: &str = "files";
const CHUNKS_DIR: &str = "chunks";

/// What the files on disk say about an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inspection {
    Absent,
    InProgress(EntryMeta),
    Downloaded(EntryMeta),
}

/// Disk cache for one category of media.
///
/// Owns two directories below its root: `files/`, holding entries as
/// `<key>.cache` + `<key>.cache_meta` pairs, and `chunks/`, holding partial
/// range downloads. Nothing else is supposed to write there.
///
/// Every operation locks only the entry it works on, and converts every
/// failure into a miss (`None` / `false`) after cleaning up whatever state
/// it could no longer trust. Operations that change files run to completion
/// in their own task, even if the future awaiting them is dropped.
///
/// Cloning is cheap and gives another handle to the same cache.
#[derive(Clone)]
pub struct InnerCache {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    name: String,
    files: Directory,
    chunks: Directory,
    settings: TrimSettings,
    locks: KeyedLock<EntryKey>,
    index: Index,
    /// Approximate bytes of data files. Adjusted without locks, corrected
    /// by full scans.
    size: AtomicU64,
    trim: TrimState,
}

impl InnerCache {
    /// Open the category cache rooted at `root`, creating its directories.
    ///
    /// The initial size is computed from disk before this returns. The chunk
    /// directory is wiped in the background; chunk operations wait for the
    /// wipe to finish.
    #[instrument(skip(root, settings), fields(root = %root.as_ref().display()))]
    pub async fn open(name: &str, root: impl AsRef<Path>, settings: TrimSettings) -> Result<Self> {
        let root = root.as_ref();
        let files = Directory::new(root.join(FILES_DIR)).or_raise(|| ErrorKind::Storage)?;
        let chunks = Directory::new(root.join(CHUNKS_DIR)).or_raise(|| ErrorKind::Storage)?;
        let shared = Arc::new(Shared {
            name: name.to_string(),
            files,
            chunks,
            settings,
            locks: KeyedLock::new(),
            index: Index::default(),
            size: AtomicU64::new(0),
            trim: TrimState::default(),
        });
        let size = shared.recompute_size().await;
        tracing::info!(cache = %shared.name, size, budget = settings.budget, "Opened cache");

        // Take the global lock before anyone else can, so no chunk created
        // after `open` returns is caught by the wipe.
        let global = shared.locks.lock_global().await;
        let wiper = shared.clone();
        tokio::spawn(async move {
            let _global = global;
            match wiper.chunks.wipe().await {
                Ok(0) => {},
                Ok(removed) => tracing::info!(cache = %wiper.name, removed, "Removed chunks left over from a previous run"),
                Err(err) => tracing::warn!(cache = %wiper.name, error = %err, "Failed to wipe chunk directory"),
            }
        });

        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn files_dir(&self) -> &Path {
        self.shared.files.root()
    }

    pub fn chunks_dir(&self) -> &Path {
        self.shared.chunks.root()
    }

    pub fn settings(&self) -> &TrimSettings {
        &self.shared.settings
    }

    /// Approximate size of the data files, in bytes.
    pub fn size(&self) -> u64 {
        self.shared.size.load(Ordering::SeqCst)
    }

    /// The budget this cache trims down to.
    pub fn max_size(&self) -> u64 {
        self.shared.settings.budget
    }

    /// How many entries memory knows of: `(on disk, downloaded)`.
    pub fn known_entries(&self) -> (usize, usize) {
        self.shared.index.len()
    }

    /// Whether a trim pass is running right now.
    pub fn is_trimming(&self) -> bool {
        self.shared.trim.is_running()
    }

    /// Run `op` in its own task, so that dropping the caller's future can't
    /// interrupt it halfway through a file change.
    async fn shielded<F, Fut, T>(&self, op: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(Arc<Shared>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match tokio::spawn(f(self.shared.clone())).await {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::error!(cache = %self.shared.name, op, error = %err, "Cache operation task failed");
                None
            },
        }
    }

    /// Path of the data file for `url`, if it is completely downloaded.
    pub async fn get_or_null(&self, url: &str) -> Option<PathBuf> {
        let key = EntryKey::from_url(url);
        self.shielded("get_or_null", move |shared| async move {
            let _guard = shared.locks.lock_local(key.clone()).await;
            match shared.exists_locked(&key).await {
                true => shared.files.path(&key.data_file_name()).ok(),
                false => None,
            }
        })
        .await
        .flatten()
    }

    /// Create an empty data file for `url`, ready for a download.
    ///
    /// Any previous data file is replaced. An existing metadata record is
    /// kept if the entry was never completely downloaded (a retry), and
    /// replaced with a fresh one otherwise.
    pub async fn get_or_create(&self, url: &str) -> Option<PathBuf> {
        let key = EntryKey::from_url(url);
        self.shielded("get_or_create", move |shared| async move {
            let _guard = shared.locks.lock_local(key.clone()).await;
            shared.create_locked(&key).await
        })
        .await
        .flatten()
    }

    /// Path of an existing chunk file for the byte range `start..=end`.
    pub async fn get_chunk(&self, start: u64, end: u64, url: &str) -> Option<PathBuf> {
        let key = EntryKey::from_url(url);
        let _guard = self.shared.locks.lock_local(key.clone()).await;
        let name = key.chunk_file_name(start, end);
        match self.shared.chunks.exists(&name).await {
            Ok(true) => self.shared.chunks.path(&name).ok(),
            Ok(false) => None,
            Err(err) => {
                tracing::warn!(cache = %self.shared.name, key = %key, error = %err, "Failed to look up chunk");
                None
            },
        }
    }

    /// Create an empty chunk file for the byte range `start..=end` of `url`.
    ///
    /// Chunks are never resumed: an existing chunk for the same range is
    /// deleted and recreated. If that fails the whole entry is deleted too.
    pub async fn get_or_create_chunk(&self, start: u64, end: u64, url: &str) -> Option<PathBuf> {
        if start > end {
            tracing::warn!(cache = %self.shared.name, start, end, "Refusing to create chunk for an empty range");
            return None;
        }
        let key = EntryKey::from_url(url);
        self.shielded("get_or_create_chunk", move |shared| async move {
            let _guard = shared.locks.lock_local(key.clone()).await;
            shared.create_chunk_locked(&key, start, end).await
        })
        .await
        .flatten()
    }

    /// Whether `url` is known to be downloaded, without touching the disk.
    pub fn exists_in_memory(&self, url: &str) -> bool {
        self.shared.index.is_downloaded(&EntryKey::from_url(url))
    }

    /// Whether `url` is completely downloaded, checking (and repairing) the
    /// files on disk when memory doesn't know.
    pub async fn exists_on_disk(&self, url: &str) -> bool {
        self.exists_key(EntryKey::from_url(url)).await
    }

    pub async fn exists_key(&self, key: EntryKey) -> bool {
        self.shielded("exists_on_disk", move |shared| async move {
            let _guard = shared.locks.lock_local(key.clone()).await;
            shared.exists_locked(&key).await
        })
        .await
        .unwrap_or(false)
    }

    /// Record that the data file at `path` has been completely written.
    ///
    /// Returns the number of bytes that should now be accounted for: the
    /// data file's length, or `0` if it was already marked before. Returns
    /// `None` if `path` isn't a data file of this cache, or if the entry
    /// turned out to be broken (in which case it is deleted).
    pub async fn mark_downloaded(&self, path: impl AsRef<Path>) -> Option<u64> {
        let key = self.key_of(path.as_ref(), FileKind::Data).await?;
        self.shielded("mark_downloaded", move |shared| async move {
            let _guard = shared.locks.lock_local(key.clone()).await;
            shared.mark_locked(&key).await
        })
        .await
        .flatten()
    }

    /// Delete the entry for `key`.
    ///
    /// Returns `true` if both files are gone afterwards (including if they
    /// never existed), `false` if either could not be removed.
    pub async fn delete(&self, key: &EntryKey) -> bool {
        let key = key.clone();
        self.shielded("delete", move |shared| async move {
            let _guard = shared.locks.lock_local(key.clone()).await;
            shared.delete_locked(&key).await
        })
        .await
        .unwrap_or(false)
    }

    pub async fn delete_url(&self, url: &str) -> bool {
        self.delete(&EntryKey::from_url(url)).await
    }

    /// Delete the entry whose data (or meta) file is at `path`.
    pub async fn delete_path(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if !self.shared.files.contains(path) {
            tracing::warn!(cache = %self.shared.name, path = %path.display(), "Refusing to delete file outside of cache");
            return false;
        }
        match EntryKey::from_path(path) {
            Ok(key) => self.delete(&key).await,
            Err(err) => {
                tracing::warn!(cache = %self.shared.name, path = %path.display(), error = %err, "Not a cache file");
                false
            },
        }
    }

    /// Delete every entry and chunk of this cache.
    pub async fn clear_all(&self) {
        self.shielded("clear_all", |shared| async move { shared.clear().await }).await;
    }

    /// Account for `size` new bytes and start an automatic trim if that
    /// takes the cache over budget. Returns the new approximate size.
    pub fn file_was_added(&self, size: u64) -> u64 {
        let total = self.shared.add_size(size);
        if total > self.shared.settings.budget && !self.shared.trim.is_running() {
            tracing::debug!(cache = %self.shared.name, total, budget = self.shared.settings.budget, "Over budget");
            self.shared.schedule_trim();
        }
        total
    }

    /// Trim now and wait for it, with no time limit. Cancels any automatic
    /// trim that is waiting or running.
    pub async fn manual_trim(&self) -> TrimReport {
        self.shared.trim.cancel_scheduled();
        self.shielded("manual_trim", |shared| async move { shared.trim(TrimMode::Manual).await })
            .await
            .unwrap_or_default()
    }

    /// Replace the approximate size with the exact size of the data files.
    pub async fn recompute_size(&self) -> u64 {
        self.shared.recompute_size().await
    }

    /// Derive the key from the name of a file that should live in `files/`.
    ///
    /// A file of ours with the wrong extension means the caller's idea of
    /// the entry is broken; the entry is deleted.
    async fn key_of(&self, path: &Path, expected: FileKind) -> Option<EntryKey> {
        if !self.shared.files.contains(path) {
            tracing::warn!(cache = %self.shared.name, path = %path.display(), "File does not belong to this cache");
            return None;
        }
        let key = match EntryKey::from_path(path) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(cache = %self.shared.name, path = %path.display(), error = %err, "Not a cache file");
                return None;
            },
        };
        let kind = path.file_name().and_then(|n| n.to_str()).map_or(FileKind::Unknown, FileKind::of);
        if kind != expected {
            tracing::warn!(cache = %self.shared.name, path = %path.display(), ?kind, "Unexpected cache file type; deleting entry");
            self.delete(&key).await;
            return None;
        }
        Some(key)
    }
}

impl Shared {
    fn add_size(&self, bytes: u64) -> u64 {
        self.size.fetch_add(bytes, Ordering::SeqCst).saturating_add(bytes)
    }

    fn sub_size(&self, bytes: u64) {
        // Never fails: the closure always returns `Some`.
        _ = self.size.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| Some(size.saturating_sub(bytes)));
    }

    pub(crate) async fn recompute_size(&self) -> u64 {
        match self.files.total_size(|file| file.kind() == FileKind::Data).await {
            Ok(size) => {
                self.size.store(size, Ordering::SeqCst);
                size
            },
            Err(err) => {
                tracing::warn!(cache = %self.name, error = %err, "Failed to compute cache size; keeping estimate");
                self.size.load(Ordering::SeqCst)
            },
        }
    }

    /// Look at the files of an entry. Errors mean the entry is corrupt (or
    /// unreadable, which amounts to the same thing).
    pub(crate) async fn inspect(&self, key: &EntryKey) -> Result<Inspection> {
        let meta = match self.files.read_meta(&key.meta_file_name()).await {
            Ok(meta) => Some(meta),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err).or_raise(|| ErrorKind::Corrupt("unreadable metadata")),
        };
        let data = self.files.exists(&key.data_file_name()).await.or_raise(|| ErrorKind::Storage)?;
        match (meta, data) {
            (None, false) => Ok(Inspection::Absent),
            (None, true) => exn::bail!(ErrorKind::Corrupt("data file without metadata")),
            (Some(_), false) => exn::bail!(ErrorKind::Corrupt("metadata without data file")),
            (Some(meta), true) if meta.downloaded => Ok(Inspection::Downloaded(meta)),
            (Some(meta), true) => Ok(Inspection::InProgress(meta)),
        }
    }

    pub(crate) async fn exists_locked(&self, key: &EntryKey) -> bool {
        if self.index.is_downloaded(key) {
            return true;
        }
        match self.inspect(key).await {
            Ok(Inspection::Downloaded(meta)) => {
                tracing::trace!(cache = %self.name, key = %key, created_on = meta.created_on, "Found downloaded entry on disk");
                self.index.insert_downloaded(key);
                true
            },
            Ok(Inspection::InProgress(meta)) => {
                tracing::trace!(cache = %self.name, key = %key, created_on = meta.created_on, "Download in progress");
                self.index.reset(key);
                false
            },
            Ok(Inspection::Absent) => {
                self.index.remove(key);
                false
            },
            Err(err) => {
                tracing::info!(cache = %self.name, key = %key, error = %err, "Deleting corrupt cache entry");
                self.delete_locked(key).await;
                false
            },
        }
    }

    async fn create_locked(&self, key: &EntryKey) -> Option<PathBuf> {
        match self.try_create(key).await {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!(cache = %self.name, key = %key, error = %err, "Failed to create cache entry");
                self.delete_locked(key).await;
                None
            },
        }
    }

    async fn try_create(&self, key: &EntryKey) -> Result<PathBuf> {
        let data_name = key.data_file_name();
        let meta_name = key.meta_file_name();
        // Anything unreadable is simply overwritten below.
        let existing = self.files.read_meta(&meta_name).await.ok();
        if let Some(stale) = self.files.len(&data_name).await.or_raise(|| ErrorKind::Storage)? {
            self.files.remove(&data_name).await.or_raise(|| ErrorKind::Storage)?;
            if existing.is_some_and(|meta| meta.downloaded) {
                self.sub_size(stale);
            }
        }
        self.index.reset(key);
        let path = self.files.create_empty(&data_name).await.or_raise(|| ErrorKind::Storage)?;
        match existing {
            Some(meta) if !meta.downloaded => {
                tracing::debug!(cache = %self.name, key = %key, created_on = meta.created_on, "Restarting download");
            },
            _ => self.files.write_meta(&meta_name, &EntryMeta::fresh()).await.or_raise(|| ErrorKind::Storage)?,
        }
        tracing::trace!(cache = %self.name, key = %key, "Created cache entry");
        Ok(path)
    }

    async fn create_chunk_locked(&self, key: &EntryKey, start: u64, end: u64) -> Option<PathBuf> {
        let name = key.chunk_file_name(start, end);
        let created = match self.chunks.remove(&name).await {
            Ok(_) => self.chunks.create_empty(&name).await,
            Err(err) => Err(err),
        };
        match created {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!(cache = %self.name, key = %key, start, end, error = %err, "Failed to create chunk; deleting entry");
                if let Err(err) = self.chunks.remove(&name).await {
                    tracing::debug!(cache = %self.name, chunk = %name, error = %err, "Failed to remove broken chunk");
                }
                self.delete_locked(key).await;
                None
            },
        }
    }

    async fn mark_locked(&self, key: &EntryKey) -> Option<u64> {
        match self.try_mark(key).await {
            Ok(added) => Some(added),
            Err(err) => {
                tracing::warn!(cache = %self.name, key = %key, error = %err, "Failed to mark entry as downloaded; deleting it");
                self.delete_locked(key).await;
                None
            },
        }
    }

    async fn try_mark(&self, key: &EntryKey) -> Result<u64> {
        let meta_name = key.meta_file_name();
        let Some(length) = self.files.len(&key.data_file_name()).await.or_raise(|| ErrorKind::Storage)? else {
            exn::bail!(ErrorKind::Corrupt("data file vanished before download finished"));
        };
        let meta = self.files.read_meta(&meta_name).await.or_raise(|| ErrorKind::Corrupt("unreadable metadata"))?;
        if meta.downloaded {
            self.index.insert_downloaded(key);
            return Ok(0);
        }
        self.files.write_meta(&meta_name, &meta.into_downloaded()).await.or_raise(|| ErrorKind::Storage)?;
        self.index.insert_downloaded(key);
        tracing::debug!(cache = %self.name, key = %key, bytes = length, "Entry downloaded");
        Ok(length)
    }

    /// Remove both files of an entry and forget it.
    ///
    /// Only completely downloaded entries were ever added to the size
    /// counter, so only those are taken off it again.
    pub(crate) async fn delete_locked(&self, key: &EntryKey) -> bool {
        let data_name = key.data_file_name();
        let accounted = self.files.read_meta(&key.meta_file_name()).await.is_ok_and(|meta| meta.downloaded);
        let length = match self.files.len(&data_name).await {
            Ok(length) => length,
            Err(err) => {
                tracing::debug!(cache = %self.name, key = %key, error = %err, "Failed to stat data file");
                None
            },
        };
        let data_removed = match self.files.remove(&data_name).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(cache = %self.name, key = %key, error = %err, "Failed to delete data file");
                false
            },
        };
        let meta_removed = match self.files.remove(&key.meta_file_name()).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(cache = %self.name, key = %key, error = %err, "Failed to delete metadata file");
                false
            },
        };
        // Forget the entry even on failure; the next lookup will go to disk.
        self.index.remove(key);
        if data_removed && accounted && let Some(length) = length {
            self.sub_size(length);
        }
        data_removed && meta_removed
    }

    #[instrument(skip(self), fields(cache = %self.name))]
    async fn clear(&self) {
        let _global = self.locks.lock_global().await;
        self.trim.cancel_scheduled();
        for dir in [&self.files, &self.chunks] {
            match dir.wipe().await {
                Ok(removed) => tracing::debug!(dir = %dir.root().display(), removed, "Wiped directory"),
                Err(err) => tracing::warn!(dir = %dir.root().display(), error = %err, "Failed to wipe directory"),
            }
        }
        self.index.clear();
        let size = self.recompute_size().await;
        tracing::info!(size, "Cleared cache");
    }
}
