//! The metadata record stored beside every data file.
//!
//! On disk a record is a 4 character ASCII decimal length header followed by
//! exactly that many characters of payload:
//!
//! ```text
//! 0021 1,1700000000000,false
//! ^^^^ ^^^^^^^^^^^^^^^^^^^^^
//! len  version,created_on,downloaded      (no space in the real thing)
//! ```

use crate::error::{ErrorKind, Result};
use time::OffsetDateTime;

/// The only record version understood by this crate.
pub const META_VERSION: u32 = 1;
const HEADER_LEN: usize = 4;
const MAX_PAYLOAD_LEN: usize = 9999;
/// Anything bigger than this on disk cannot be a valid record.
pub const MAX_META_FILE_LEN: u64 = (HEADER_LEN + MAX_PAYLOAD_LEN) as u64;

/// Milliseconds since the Unix epoch, right now.
pub fn now_millis() -> i64 {
    // Nanoseconds since 1970 only overflow an i64 of milliseconds in a few
    // hundred thousand years.
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Persistent facts about one cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryMeta {
    pub version: u32,
    /// Creation time in milliseconds since the Unix epoch. Always positive.
    pub created_on: i64,
    /// Whether the data file has been completely written. Only ever goes from
    /// `false` to `true`.
    pub downloaded: bool,
}

impl EntryMeta {
    /// A record for an entry created right now, not yet downloaded.
    pub fn fresh() -> Self {
        Self::created_at(now_millis())
    }

    pub fn created_at(created_on: i64) -> Self {
        Self { version: META_VERSION, created_on, downloaded: false }
    }

    /// Same entry, marked as completely downloaded.
    pub fn into_downloaded(self) -> Self {
        Self { downloaded: true, ..self }
    }

    /// How long ago the entry was created, in milliseconds (never negative).
    pub fn age_millis(&self, now: i64) -> i64 {
        now.saturating_sub(self.created_on).max(0)
    }

    pub fn encode(&self) -> String {
        let payload = format!("{},{},{}", self.version, self.created_on, self.downloaded);
        format!("{:0width$}{payload}", payload.len(), width = HEADER_LEN)
    }

    /// Parse a record, rejecting anything that doesn't match the format
    /// exactly.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            exn::bail!(ErrorKind::InvalidMeta("record shorter than its header"));
        }
        if bytes.len() as u64 > MAX_META_FILE_LEN {
            exn::bail!(ErrorKind::InvalidMeta("record too large"));
        }
        if !bytes.is_ascii() {
            exn::bail!(ErrorKind::InvalidMeta("record is not ASCII"));
        }
        let text = std::str::from_utf8(bytes).map_err(|_| ErrorKind::InvalidMeta("record is not ASCII"))?;
        let (header, payload) = text.split_at(HEADER_LEN);
        let length: usize = header.trim().parse().map_err(|_| ErrorKind::InvalidMeta("length header is not a number"))?;
        if payload.len() != length {
            exn::bail!(ErrorKind::InvalidMeta("payload length does not match header"));
        }
        let mut fields = payload.split(',');
        let (Some(version), Some(created_on), Some(downloaded), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            exn::bail!(ErrorKind::InvalidMeta("expected exactly three fields"));
        };
        let version: u32 = version.parse().map_err(|_| ErrorKind::InvalidMeta("version is not a number"))?;
        if version != META_VERSION {
            exn::bail!(ErrorKind::InvalidMeta("unsupported version"));
        }
        let created_on: i64 = created_on.parse().map_err(|_| ErrorKind::InvalidMeta("creation time is not a number"))?;
        if created_on <= 0 {
            exn::bail!(ErrorKind::InvalidMeta("creation time must be positive"));
        }
        let downloaded = match downloaded {
            "true" => true,
            "false" => false,
            _ => exn::bail!(ErrorKind::InvalidMeta("downloaded flag is not a boolean")),
        };
        Ok(Self { version, created_on, downloaded })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_encode() {
        let meta = EntryMeta::created_at(1_700_000_000_000);
        assert_eq!(meta.encode(), "00211,1700000000000,false");
        assert_eq!(meta.into_downloaded().encode(), "00201,1700000000000,true");
    }

    #[test]
    fn test_decode_preserves_fields() {
        let meta = EntryMeta::created_at(42).into_downloaded();
        let decoded = EntryMeta::decode(meta.encode().as_bytes()).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.created_on, 42);
        assert!(decoded.downloaded);
    }

    #[test]
    fn test_fresh() {
        let before = now_millis();
        let meta = EntryMeta::fresh();
        assert!(meta.created_on >= before);
        assert!(!meta.downloaded);
        assert_eq!(meta.version, META_VERSION);
    }

    #[test]
    fn test_age_never_negative() {
        let meta = EntryMeta::created_at(1_000);
        assert_eq!(meta.age_millis(1_500), 500);
        assert_eq!(meta.age_millis(500), 0);
    }

    #[rstest]
    #[case::empty("")]
    #[case::header_only("0017")]
    #[case::short_header("17")]
    #[case::not_a_number("abcd1,1,true")]
    #[case::length_mismatch("00101,1,true")]
    #[case::truncated("00211,1700000000000,fal")]
    #[case::wrong_version("00212,1700000000000,false")]
    #[case::zero_created("00081,0,true")]
    #[case::negative_created("00091,-5,true")]
    #[case::not_boolean("00071,5,yes")]
    #[case::extra_field("00091,5,true,")]
    #[case::missing_field("00031,5")]
    #[case::empty_flag("00041,5,")]
    #[case::not_ascii("0003é1")]
    fn test_decode_invalid(#[case] raw: &str) {
        let err = EntryMeta::decode(raw.as_bytes()).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidMeta(_)));
    }

    #[test]
    fn test_decode_rejects_oversized() {
        let raw = vec![b'0'; MAX_META_FILE_LEN as usize + 1];
        assert!(EntryMeta::decode(&raw).is_err());
    }
}
