//! Entry keys and the file names derived from them.

use crate::error::{ErrorKind, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Extension of the file holding the downloaded bytes.
pub const DATA_EXTENSION: &str = "cache";
/// Extension of the file holding the [`EntryMeta`](crate::EntryMeta) record.
pub const META_EXTENSION: &str = "cache_meta";
/// Extension of partial (byte range) download files.
pub const CHUNK_EXTENSION: &str = "chunk";

/// Stable, file system safe identifier of a cache entry.
///
/// The key is the lowercase hexadecimal SHA-256 digest of the URL the entry
/// was downloaded from. It only ever contains `[0-9a-f]`, so it can be used
/// verbatim as a file name on every platform.
///
/// # Examples
///
/// ```
/// use mediacache_storage::EntryKey;
///
/// let key = EntryKey::from_url("http://x/a.png");
/// assert_eq!(key.as_str().len(), 64);
/// let same = EntryKey::from_file_name(&key.data_file_name()).unwrap();
/// assert_eq!(key, same);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey(String);

impl EntryKey {
    pub fn from_url(url: impl AsRef<str>) -> Self {
        Self(hex::encode(Sha256::digest(url.as_ref().as_bytes())))
    }

    /// Recover the key from a file name produced by this crate.
    ///
    /// Chunk files (`<key>_<start>_<end>.chunk`) are cut at the first `_`,
    /// everything else at the first `.`. Returns
    /// [`InvalidKey`](ErrorKind::InvalidKey) if what is left is empty or not
    /// hexadecimal.
    pub fn from_file_name(name: &str) -> Result<Self> {
        let stem = match (name.find('_'), name.find('.')) {
            (Some(underscore), _) => &name[..underscore],
            (None, Some(dot)) => &name[..dot],
            (None, None) => name,
        };
        Self::validate(stem)
    }

    /// Same as [`from_file_name`](Self::from_file_name) over the final
    /// component of `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => Self::from_file_name(name),
            None => exn::bail!(ErrorKind::InvalidKey(path.display().to_string())),
        }
    }

    fn validate(text: &str) -> Result<Self> {
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            exn::bail!(ErrorKind::InvalidKey(text.to_string()));
        }
        Ok(Self(text.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn data_file_name(&self) -> String {
        format!("{}.{DATA_EXTENSION}", self.0)
    }

    pub fn meta_file_name(&self) -> String {
        format!("{}.{META_EXTENSION}", self.0)
    }

    pub fn chunk_file_name(&self, start: u64, end: u64) -> String {
        format!("{}_{start}_{end}.{CHUNK_EXTENSION}", self.0)
    }
}

impl FromStr for EntryKey {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::validate(s)
    }
}

impl AsRef<str> for EntryKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a file in a cache directory is, judging by its name alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Data,
    Meta,
    Chunk,
    Unknown,
}
impl FileKind {
    pub fn of(name: &str) -> Self {
        match name.rsplit_once('.').map(|(_, ext)| ext) {
            Some(DATA_EXTENSION) => Self::Data,
            Some(META_EXTENSION) => Self::Meta,
            Some(CHUNK_EXTENSION) => Self::Chunk,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const A_PNG: &str = "http://x/a.png";

    #[test]
    fn test_from_url_is_deterministic() {
        let key = EntryKey::from_url(A_PNG);
        assert_eq!(key, EntryKey::from_url(A_PNG));
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
    }

    #[test]
    fn test_known_digest() {
        // sha256("abc")
        assert_eq!(
            EntryKey::from_url("abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_no_collisions_in_corpus() {
        let urls: Vec<String> = (0..500).map(|i| format!("https://cdn.example.org/media/{i}.jpg")).collect();
        let keys: std::collections::HashSet<_> = urls.iter().map(EntryKey::from_url).collect();
        assert_eq!(keys.len(), urls.len());
    }

    #[test]
    fn test_file_names_round_trip() {
        let key = EntryKey::from_url(A_PNG);
        assert_eq!(EntryKey::from_file_name(&key.data_file_name()).unwrap(), key);
        assert_eq!(EntryKey::from_file_name(&key.meta_file_name()).unwrap(), key);
        assert_eq!(EntryKey::from_file_name(&key.chunk_file_name(0, 999)).unwrap(), key);
        assert_eq!(EntryKey::from_path(Path::new("/tmp/files").join(key.data_file_name())).unwrap(), key);
    }

    #[rstest]
    #[case("abc123.cache", "abc123")]
    #[case("ABC123.cache_meta", "abc123")]
    #[case("abc123_0_999.chunk", "abc123")]
    #[case("abc123_7.cache", "abc123")]
    #[case("deadbeef", "deadbeef")]
    fn test_from_file_name(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(EntryKey::from_file_name(name).unwrap().as_str(), expected);
    }

    #[rstest]
    #[case("")]
    #[case(".cache")]
    #[case("_0_1.chunk")]
    #[case("not-hex.cache")]
    #[case("abcxyz")]
    #[case("../abc.cache")]
    fn test_from_file_name_invalid(#[case] name: &str) {
        let err = EntryKey::from_file_name(name).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidKey(_)));
    }

    #[rstest]
    #[case("abc.cache", FileKind::Data)]
    #[case("abc.cache_meta", FileKind::Meta)]
    #[case("abc_1_2.chunk", FileKind::Chunk)]
    #[case("abc.cache.tmp", FileKind::Unknown)]
    #[case("abc", FileKind::Unknown)]
    fn test_file_kind(#[case] name: &str, #[case] expected: FileKind) {
        assert_eq!(FileKind::of(name), expected);
    }
}
