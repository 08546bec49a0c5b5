//! Shared types and helpers for the stream gateway.
//!
//! This crate holds everything both the HTTP side and the bot side need to
//! agree on:
//! - **File descriptor**: the canonical view of a document stored in the
//!   backing channel (location, size, mime type, name)
//! - **Fingerprint**: the 6-character URL-safe access token derived from the
//!   descriptor; every stream URL carries one and it must match exactly
//! - **Id normalization**: channel ids arrive in several wire shapes
//!   (`-100`-prefixed, bare, or absent) and are folded into one `i64`
//! - **Readable sizes**: human formatting for bot replies and the player page

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of base64url characters kept from the descriptor digest.
///
/// Six characters span a 36-bit space, which is enough to stop casual URL
/// enumeration given that the underlying RPC also demands the document's
/// `access_hash`.
pub const HASH_LEN: usize = 6;

/// Telegram channel ids are 10 digits on the wire, prefixed with `-100`.
const CHANNEL_ID_DIGITS: usize = 10;

// ============================================================================
// File descriptor
// ============================================================================

/// Opaque location of a document at the RPC layer.
///
/// `id` and `access_hash` address the file; `file_reference` is a short-lived
/// proof that we recently saw the owning message and must accompany every
/// fetch. It does not participate in the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
}

/// Canonical descriptor of a file stored as a channel message.
///
/// Immutable per remote message: two fetches of the same message yield the
/// same descriptor, so the fingerprint is stable.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub location: FileLocation,
    /// Total byte length, non-negative.
    pub size: i64,
    /// May be empty; the HTTP layer substitutes `application/octet-stream`.
    pub mime_type: String,
    /// First filename attribute of the document, else its type tag.
    pub file_name: String,
}

/// Compute the 6-character access token for a descriptor.
///
/// Deterministic in exactly four fields: file name, mime type, size and
/// location id. Anything else (access hash, file reference) may change
/// between sessions without invalidating existing URLs.
pub fn make_hash(file: &FileInfo) -> String {
    let key = format!(
        "{}-{}-{}-{}",
        file.file_name, file.mime_type, file.size, file.location.id
    );
    let digest = Sha256::digest(key.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(HASH_LEN);
    encoded
}

/// True iff `claimed` equals the recomputed fingerprint byte for byte.
pub fn verify_hash(file: &FileInfo, claimed: &str) -> bool {
    make_hash(file) == claimed
}

// ============================================================================
// Path id normalization
// ============================================================================

/// Failure to turn path segments into usable message/channel ids.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid message id: {0}")]
    MessageId(String),
    #[error("invalid channel id: {0}")]
    ChannelId(String),
}

/// Parse a message id path segment.
pub fn parse_message_id(raw: &str) -> Result<i32, IdParseError> {
    raw.parse::<i32>()
        .map_err(|_| IdParseError::MessageId(raw.to_string()))
}

/// Normalize a channel id path segment into its bare 10-digit `i64` form.
///
/// The chat platform prefixes channel ids with `-100` on the wire, so inputs
/// longer than 10 characters are truncated to their last 10 digits. Inputs
/// shorter than 10 characters fall back to the configured default channel
/// when one is set. Exactly 10 digits are used as-is.
pub fn parse_channel_id(raw: &str, fallback: Option<i64>) -> Result<i64, IdParseError> {
    if raw.len() < CHANNEL_ID_DIGITS {
        return fallback.ok_or_else(|| IdParseError::ChannelId(raw.to_string()));
    }
    let digits = if raw.len() > CHANNEL_ID_DIGITS {
        &raw[raw.len() - CHANNEL_ID_DIGITS..]
    } else {
        raw
    };
    match digits.parse::<i64>() {
        Ok(id) => Ok(id),
        Err(_) => fallback.ok_or_else(|| IdParseError::ChannelId(raw.to_string())),
    }
}

// ============================================================================
// Formatting helpers
// ============================================================================

/// Format a byte count for humans, 1024-based with one decimal.
///
/// `1536` becomes `"1.5 kB"`; values under one kibibyte stay exact (`"512 B"`).
pub fn readable_size(size: i64) -> String {
    const UNIT: i64 = 1024;
    if size < UNIT {
        return format!("{} B", size);
    }
    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = size / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let prefixes = ['k', 'M', 'G', 'T', 'P', 'E'];
    format!("{:.1} {}B", size as f64 / div as f64, prefixes[exp])
}

/// Current Unix timestamp in seconds; 0 if the clock is before the epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Wire types shared between handlers
// ============================================================================

/// Payload of the `/hash` endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HashInfo {
    pub hash: String,
    #[serde(rename = "messageId")]
    pub message_id: i32,
    #[serde(rename = "channelId")]
    pub channel_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> FileInfo {
        FileInfo {
            location: FileLocation {
                id: 42,
                access_hash: 7,
                file_reference: vec![1, 2, 3],
            },
            size: 3_000_000,
            mime_type: "video/mp4".to_string(),
            file_name: "a.mp4".to_string(),
        }
    }

    #[test]
    fn test_make_hash_shape() {
        let hash = make_hash(&sample_file());
        assert_eq!(hash.len(), HASH_LEN);
        assert!(
            hash.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn test_make_hash_is_pure() {
        assert_eq!(make_hash(&sample_file()), make_hash(&sample_file()));
    }

    #[test]
    fn test_hash_ignores_access_hash_and_reference() {
        let mut file = sample_file();
        let hash = make_hash(&file);
        file.location.access_hash = 999;
        file.location.file_reference = vec![9, 9];
        assert_eq!(make_hash(&file), hash);
    }

    #[test]
    fn test_hash_changes_with_each_input_field() {
        let base = make_hash(&sample_file());

        let mut file = sample_file();
        file.file_name = "b.mp4".to_string();
        assert_ne!(make_hash(&file), base);

        let mut file = sample_file();
        file.mime_type = "video/webm".to_string();
        assert_ne!(make_hash(&file), base);

        let mut file = sample_file();
        file.size += 1;
        assert_ne!(make_hash(&file), base);

        let mut file = sample_file();
        file.location.id += 1;
        assert_ne!(make_hash(&file), base);
    }

    #[test]
    fn test_verify_hash() {
        let file = sample_file();
        let hash = make_hash(&file);
        assert!(verify_hash(&file, &hash));

        let mut mutated = hash.clone();
        mutated.replace_range(5..6, if &hash[5..6] == "X" { "Y" } else { "X" });
        assert!(!verify_hash(&file, &mutated));
    }

    #[test]
    fn test_parse_message_id() {
        assert_eq!(parse_message_id("123"), Ok(123));
        assert!(parse_message_id("abc").is_err());
    }

    #[test]
    fn test_parse_channel_id_exact_ten_digits() {
        assert_eq!(parse_channel_id("1234567890", None), Ok(1234567890));
    }

    #[test]
    fn test_parse_channel_id_strips_wire_prefix() {
        // -1001234567890 is the wire form of channel 1234567890
        assert_eq!(parse_channel_id("-1001234567890", None), Ok(1234567890));
        assert_eq!(
            parse_channel_id("-1001234567890", None),
            parse_channel_id("1234567890", None)
        );
    }

    #[test]
    fn test_parse_channel_id_short_falls_back() {
        assert_eq!(parse_channel_id("77", Some(1234567890)), Ok(1234567890));
        assert!(parse_channel_id("77", None).is_err());
    }

    #[test]
    fn test_parse_channel_id_garbage_falls_back() {
        assert_eq!(
            parse_channel_id("abcdefghijk", Some(1234567890)),
            Ok(1234567890)
        );
        assert!(parse_channel_id("abcdefghijk", None).is_err());
    }

    #[test]
    fn test_readable_size() {
        assert_eq!(readable_size(512), "512 B");
        assert_eq!(readable_size(1536), "1.5 kB");
        assert_eq!(readable_size(1024 * 1024), "1.0 MB");
        assert_eq!(readable_size(3_000_000), "2.9 MB");
    }
}
