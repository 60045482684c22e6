//! A flat directory of cache files.
//!
//! Every cache category owns two of these (entries and chunks). All file
//! access goes through `tokio::fs`; the only blocking call is the directory
//! creation in [`Directory::new`].

use crate::error::{ErrorKind, Result};
use crate::meta::{EntryMeta, MAX_META_FILE_LEN};
use crate::path::validate_name;
use crate::FileInfo;
use async_stream::stream;
use futures::{Stream, TryStreamExt};
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs::{self, DirEntry};
use tokio::io::AsyncReadExt;

pub type FileInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<FileInfo>> + Send + 'a>>;

const TEMP_SUFFIX: &str = "tmp";

/// A directory on the local filesystem holding cache files, addressed by
/// file name.
///
/// Names are validated to be a single path component, so nothing handed to
/// a `Directory` can reach outside of it.
///
/// # Examples
///
/// ```no_run
/// use mediacache_storage::Directory;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let files = Directory::new("/var/cache/mediacache/images/files")?;
/// let path = files.create_empty("abc.cache").await?;
/// assert!(files.remove("abc.cache").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Directory {
    root: PathBuf,
}
impl Directory {
    /// Open (creating if needed) the directory at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, exists but is not a
    /// directory, or cannot be created.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Use non-async here; it'll only happen once when a cache is
            // opened and it's not worth making the constructor async.
            sync_create_dir(&root).map_err(|e| ErrorKind::from_io(e, &root))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the file called `name` inside this directory.
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_name(name)?))
    }

    /// Whether `path` names a file directly inside this directory.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref().parent() == Some(self.root.as_path())
    }

    fn metadata(path: PathBuf, name: String, metadata: Metadata) -> Result<FileInfo> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?.into();
        Ok(FileInfo::new(path, name, metadata.len(), modified))
    }

    async fn process_entry(entry: DirEntry) -> Result<Option<FileInfo>> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| ErrorKind::from_io(e, &path))?;
        if !metadata.is_file() {
            // Cache directories are flat; anything else isn't ours to touch.
            return Ok(None);
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            tracing::debug!(path = %path.display(), "Skipping file with non UTF-8 name");
            return Ok(None);
        };
        Self::metadata(path, name, metadata).map(Some)
    }

    /// Stream the regular files in this directory.
    ///
    /// A directory that doesn't exist (yet, or anymore) is reported as empty.
    /// Files that vanish between listing and `stat` are skipped.
    pub fn list_stream(&self) -> FileInfoStream<'_> {
        Box::pin(stream! {
            let mut entries = match fs::read_dir(&self.root).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
                Err(err) => {
                    yield Err(exn::Exn::from(ErrorKind::from_io(err, &self.root)));
                    return;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(exn::Exn::from(ErrorKind::from_io(err, &self.root)));
                        break;
                    }
                };
                match Self::process_entry(entry).await {
                    Ok(Some(info)) => yield Ok(info),
                    Ok(None) => {},
                    Err(err) if err.is_not_found() => {},
                    Err(err) => yield Err(err),
                }
            }
        })
    }

    /// Collect [`list_stream()`](Self::list_stream) into a [`Vec`].
    pub async fn list(&self) -> Result<Vec<FileInfo>> {
        self.list_stream().try_collect().await
    }

    /// Sum of the sizes of all files for which `include` returns `true`.
    pub async fn total_size(&self, include: impl Fn(&FileInfo) -> bool) -> Result<u64> {
        self.list_stream()
            .try_fold(0u64, |total, info| {
                let size = if include(&info) { info.size } else { 0 };
                async move { Ok(total.saturating_add(size)) }
            })
            .await
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path(name)?;
        Ok(fs::try_exists(&path).await.map_err(ErrorKind::Io)?)
    }

    /// Size of the file, or `None` if it doesn't exist.
    pub async fn len(&self, name: &str) -> Result<Option<u64>> {
        let path = self.path(name)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => exn::bail!(ErrorKind::from_io(err, path)),
        }
    }

    /// Create (or truncate) an empty file, recreating the directory itself
    /// if something removed it.
    pub async fn create_empty(&self, name: &str) -> Result<PathBuf> {
        let path = self.path(name)?;
        fs::create_dir_all(&self.root).await.map_err(|e| ErrorKind::from_io(e, &self.root))?;
        fs::File::create(&path).await.map_err(|e| ErrorKind::from_io(e, &path))?;
        Ok(path)
    }

    /// Remove a file. Returns `false` if it was already gone.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        self.remove_path(&self.path(name)?).await
    }

    async fn remove_path(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => exn::bail!(ErrorKind::from_io(err, path)),
        }
    }

    /// Remove every file in the directory. Returns how many were removed.
    ///
    /// Keeps going after individual failures and reports the first one at
    /// the end.
    pub async fn wipe(&self) -> Result<usize> {
        let files = self.list().await?;
        let mut removed = 0;
        let mut first_error = None;
        for file in files {
            match self.remove_path(&file.path).await {
                Ok(true) => removed += 1,
                Ok(false) => {},
                Err(err) => {
                    tracing::warn!(path = %file.path.display(), error = %err, "Failed to remove cache file");
                    first_error.get_or_insert(err);
                },
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }

    /// Read and decode a metadata record.
    ///
    /// Returns [`NotFound`](ErrorKind::NotFound) if there is no such file and
    /// [`InvalidMeta`](ErrorKind::InvalidMeta) if its contents can't be
    /// trusted (including an empty or oversized file).
    pub async fn read_meta(&self, name: &str) -> Result<EntryMeta> {
        let path = self.path(name)?;
        let file = fs::File::open(&path).await.map_err(|e| ErrorKind::from_io(e, &path))?;
        // Read one byte past the limit so oversized files are noticed
        // without reading them whole.
        let mut buffer = Vec::new();
        file.take(MAX_META_FILE_LEN + 1).read_to_end(&mut buffer).await.map_err(|e| ErrorKind::from_io(e, &path))?;
        EntryMeta::decode(&buffer)
    }

    /// Write a metadata record.
    ///
    /// The record is written to a temporary sibling first and renamed over
    /// the target, so readers see either the old record or the new one.
    pub async fn write_meta(&self, name: &str, meta: &EntryMeta) -> Result<()> {
        let path = self.path(name)?;
        let temp = self.path(&format!("{name}.{TEMP_SUFFIX}"))?;
        fs::create_dir_all(&self.root).await.map_err(|e| ErrorKind::from_io(e, &self.root))?;
        if let Err(err) = fs::write(&temp, meta.encode()).await {
            _ = fs::remove_file(&temp).await;
            exn::bail!(ErrorKind::from_io(err, temp));
        }
        if let Err(err) = fs::rename(&temp, &path).await {
            _ = fs::remove_file(&temp).await;
            exn::bail!(ErrorKind::from_io(err, path));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> (tempfile::TempDir, Directory) {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = Directory::new(temp_dir.path().join("files")).unwrap();
        (temp_dir, dir)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(Directory::new(temp_dir.path()).is_ok());
        assert!(Directory::new("relative/path").is_err());
        assert!(Directory::new("./relative").is_err());
    }

    #[test]
    fn test_new_creates_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("a/b/files");
        Directory::new(&root).unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn test_new_rejects_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = temp_dir.path().join("file");
        std::fs::write(&file, b"data").unwrap();
        assert!(Directory::new(&file).is_err());
    }

    #[test]
    fn test_path_and_contains() {
        let (_temp, dir) = directory();
        let path = dir.path("abc.cache").unwrap();
        assert_eq!(path, dir.root().join("abc.cache"));
        assert!(dir.contains(&path));
        assert!(!dir.contains(dir.root()));
        assert!(!dir.contains(dir.root().join("nested/abc.cache")));
        assert!(dir.path("../escape").is_err());
        assert!(dir.path("nested/abc.cache").is_err());
    }

    #[tokio::test]
    async fn test_create_empty_truncates() {
        let (_temp, dir) = directory();
        let path = dir.create_empty("abc.cache").await.unwrap();
        std::fs::write(&path, b"some bytes").unwrap();
        assert_eq!(dir.len("abc.cache").await.unwrap(), Some(10));
        dir.create_empty("abc.cache").await.unwrap();
        assert_eq!(dir.len("abc.cache").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_create_empty_recreates_directory() {
        let (_temp, dir) = directory();
        std::fs::remove_dir(dir.root()).unwrap();
        dir.create_empty("abc.cache").await.unwrap();
        assert!(dir.exists("abc.cache").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove() {
        let (_temp, dir) = directory();
        dir.create_empty("abc.cache").await.unwrap();
        assert!(dir.remove("abc.cache").await.unwrap());
        assert!(!dir.exists("abc.cache").await.unwrap());
        // Already gone is not an error.
        assert!(!dir.remove("abc.cache").await.unwrap());
        assert_eq!(dir.len("abc.cache").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_and_size() {
        let (_temp, dir) = directory();
        std::fs::write(dir.path("a.cache").unwrap(), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path("a.cache_meta").unwrap(), b"00201,1700000000000,true").unwrap();
        std::fs::create_dir(dir.root().join("nested")).unwrap();
        let mut names: Vec<_> = dir.list().await.unwrap().into_iter().map(|f| f.name).collect();
        names.sort();
        assert_eq!(names, vec!["a.cache", "a.cache_meta"]);
        assert_eq!(dir.total_size(|_| true).await.unwrap(), 124);
        assert_eq!(dir.total_size(|f| f.name.ends_with(".cache")).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_list_missing_directory() {
        let (_temp, dir) = directory();
        std::fs::remove_dir(dir.root()).unwrap();
        assert!(dir.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wipe() {
        let (_temp, dir) = directory();
        for name in ["a_0_1.chunk", "a_2_3.chunk", "b_0_9.chunk"] {
            dir.create_empty(name).await.unwrap();
        }
        assert_eq!(dir.wipe().await.unwrap(), 3);
        assert!(dir.list().await.unwrap().is_empty());
        assert_eq!(dir.wipe().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_meta_write_and_read() {
        let (_temp, dir) = directory();
        let meta = EntryMeta::created_at(1_234);
        dir.write_meta("a.cache_meta", &meta).await.unwrap();
        assert_eq!(dir.read_meta("a.cache_meta").await.unwrap(), meta);
        let downloaded = meta.into_downloaded();
        dir.write_meta("a.cache_meta", &downloaded).await.unwrap();
        assert_eq!(dir.read_meta("a.cache_meta").await.unwrap(), downloaded);
        // No temporary file left behind.
        assert_eq!(dir.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_meta_failures() {
        let (_temp, dir) = directory();
        let missing = dir.read_meta("missing.cache_meta").await.unwrap_err();
        assert!(missing.is_not_found());

        dir.create_empty("empty.cache_meta").await.unwrap();
        let empty = dir.read_meta("empty.cache_meta").await.unwrap_err();
        assert!(matches!(&*empty, ErrorKind::InvalidMeta(_)));

        std::fs::write(dir.path("huge.cache_meta").unwrap(), vec![b'1'; 20_000]).unwrap();
        let huge = dir.read_meta("huge.cache_meta").await.unwrap_err();
        assert!(matches!(&*huge, ErrorKind::InvalidMeta(_)));
    }
}
