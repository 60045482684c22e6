//! Path validation and security utilities.
//!
//! Cache file names are generated by this crate, but category names come
//! from configuration and must not be able to walk out of the cache root.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a single file or directory name: exactly one normal path
/// component, so joining it onto a directory can't leave that directory.
///
/// ```
/// use mediacache_storage::validate_name;
/// assert!(validate_name("images").is_ok());
/// assert!(validate_name("images/files").is_err());
/// assert!(validate_name("..").is_err());
/// ```
pub fn validate_name(name: &str) -> Result<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(s)), None) if s == name && !name.contains('\0') => Ok(name),
        _ => exn::bail!(ErrorKind::InvalidPath(PathBuf::from(name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("images", true)]
    #[case("video-thumbs_2", true)]
    #[case("abc.cache", true)]
    #[case("", false)]
    #[case(".", false)]
    #[case("..", false)]
    #[case("a/b", false)]
    #[case("/abs", false)]
    #[case("trailing/", false)]
    #[case("nul\0", false)]
    fn test_validate_name(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(validate_name(name).is_ok(), valid);
    }
}
