//! Storage models.

use crate::key::FileKind;
use std::path::PathBuf;
use time::OffsetDateTime;

/// Metadata of one file found in a cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Absolute path of the file
    pub path: PathBuf,
    /// File name (last path component)
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
}
impl FileInfo {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, size: u64, modified: OffsetDateTime) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            size,
            modified,
        }
    }

    pub fn kind(&self) -> FileKind {
        FileKind::of(&self.name)
    }

    /// Text before the first `.`: the part a data file and its meta file
    /// have in common.
    pub fn base_name(&self) -> &str {
        self.name.split_once('.').map_or(self.name.as_str(), |(base, _)| base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name_and_kind() {
        let info = FileInfo::new("/c/abc.cache_meta", "abc.cache_meta", 21, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(info.base_name(), "abc");
        assert_eq!(info.kind(), FileKind::Meta);
        let bare = FileInfo::new("/c/abc", "abc", 0, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(bare.base_name(), "abc");
        assert_eq!(bare.kind(), FileKind::Unknown);
    }
}
