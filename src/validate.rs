//! Input validation gates.
//!
//! Validation always runs before any I/O: a malformed key, TTL, or lock ID
//! never reaches the substrate. Key validation returns the NFC-normalised
//! form, which is what every downstream digest and storage-key derivation
//! consumes.

use unicode_normalization::UnicodeNormalization;

use crate::constants::{LOCK_ID_LENGTH, MAX_KEY_LENGTH_BYTES};
use crate::error::{LockError, Result};

/// Validates a user-supplied key and returns its NFC-normalised form.
///
/// # Errors
///
/// [`LockError::InvalidArgument`] when the key is empty or its normalised
/// UTF-8 encoding exceeds [`MAX_KEY_LENGTH_BYTES`].
pub fn normalize_key(key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(LockError::invalid_argument("lock key must not be empty"));
    }
    let normalized: String = key.nfc().collect();
    if normalized.len() > MAX_KEY_LENGTH_BYTES {
        return Err(LockError::invalid_argument(format!(
            "lock key is {} bytes after normalisation; the limit is {MAX_KEY_LENGTH_BYTES}",
            normalized.len()
        )));
    }
    Ok(normalized)
}

/// Validates a lock TTL in milliseconds.
///
/// # Errors
///
/// [`LockError::InvalidArgument`] when the TTL is zero or negative.
pub fn validate_ttl_ms(ttl_ms: i64) -> Result<()> {
    if ttl_ms <= 0 {
        return Err(LockError::invalid_argument(format!(
            "ttl_ms must be positive, got {ttl_ms}"
        )));
    }
    Ok(())
}

/// Validates the shape of a lock ID: exactly 22 characters from the
/// base64url alphabet `[A-Za-z0-9_-]`.
///
/// # Errors
///
/// [`LockError::InvalidArgument`] on any other input.
pub fn validate_lock_id(lock_id: &str) -> Result<()> {
    let well_formed = lock_id.len() == LOCK_ID_LENGTH
        && lock_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !well_formed {
        return Err(LockError::invalid_argument(
            "lock ID must be 22 base64url characters",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::keys::generate_lock_id;

    // ---- key tests ----

    #[test]
    fn empty_key_is_rejected() {
        let err = normalize_key("").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn plain_key_is_returned_unchanged() {
        assert_eq!(normalize_key("payment:1").unwrap(), "payment:1");
    }

    #[test]
    fn decomposed_key_is_composed() {
        // e + combining acute accent composes to U+00E9.
        assert_eq!(normalize_key("cafe\u{301}").unwrap(), "caf\u{e9}");
    }

    #[test]
    fn key_at_byte_limit_is_accepted() {
        let key = "a".repeat(512);
        assert!(normalize_key(&key).is_ok());
    }

    #[test]
    fn key_over_byte_limit_is_rejected() {
        let key = "a".repeat(513);
        let err = normalize_key(&key).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn multibyte_key_is_measured_in_bytes() {
        // 200 three-byte characters: 600 bytes, over the limit.
        let key = "\u{20AC}".repeat(200);
        assert!(normalize_key(&key).is_err());
        // 170 of them: 510 bytes, under the limit.
        let key = "\u{20AC}".repeat(170);
        assert!(normalize_key(&key).is_ok());
    }

    // ---- TTL tests ----

    #[test]
    fn positive_ttl_is_accepted() {
        assert!(validate_ttl_ms(1).is_ok());
        assert!(validate_ttl_ms(30_000).is_ok());
    }

    #[test]
    fn zero_and_negative_ttl_are_rejected() {
        assert!(validate_ttl_ms(0).is_err());
        assert!(validate_ttl_ms(-5).is_err());
    }

    // ---- lock ID tests ----

    #[test]
    fn generated_ids_validate() {
        for _ in 0..32 {
            assert!(validate_lock_id(&generate_lock_id()).is_ok());
        }
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(validate_lock_id("short").is_err());
        assert!(validate_lock_id(&"A".repeat(21)).is_err());
        assert!(validate_lock_id(&"A".repeat(23)).is_err());
    }

    #[test]
    fn invalid_characters_are_rejected() {
        assert!(validate_lock_id("AAAAAAAAAAAAAAAAAAAAA+").is_err());
        assert!(validate_lock_id("AAAAAAAAAAAAAAAAAAAAA=").is_err());
        assert!(validate_lock_id("AAAAAAAAAAAAAAAAAAAA\u{e9}").is_err());
    }

    #[test]
    fn valid_shape_is_accepted() {
        assert!(validate_lock_id("abcDEF123-_abcDEF12345").is_ok());
    }
}
