//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// File does not exist
    #[display("file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Access denied
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Path contains invalid characters, escapes its root, or is not the
    /// kind of file system object expected.
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Text that cannot be an entry key (not hexadecimal, or empty).
    #[display("invalid entry key: {_0:?}")]
    InvalidKey(#[error(not(source))] String),
    /// A metadata record that cannot be trusted. Don't retry, delete.
    #[display("invalid metadata record: {_0}")]
    InvalidMeta(#[error(not(source))] &'static str),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Returns `true` if the error means the file simply isn't there.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub(crate) fn from_io(err: IoError, path: impl Into<PathBuf>) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.into()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.into()),
            _ => Self::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::InvalidKey("xyz".to_string()).to_string(), "invalid entry key: \"xyz\"");
        assert_eq!(ErrorKind::InvalidMeta("bad version").to_string(), "invalid metadata record: bad version");
        assert_eq!(ErrorKind::NotFound(PathBuf::from("a/b.cache")).to_string(), "file not found: a/b.cache");
    }

    #[test]
    fn error_kind_from_io() {
        let missing = IoError::new(std::io::ErrorKind::NotFound, "gone");
        assert!(ErrorKind::from_io(missing, Path::new("x")).is_not_found());
        let denied = IoError::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(ErrorKind::from_io(denied, Path::new("x")), ErrorKind::PermissionDenied(_)));
        let other = IoError::other("disk on fire");
        let kind = ErrorKind::from_io(other, Path::new("x"));
        assert!(kind.is_retryable());
    }
}
