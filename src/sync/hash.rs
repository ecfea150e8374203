//! Content hashing for change detection.
//!
//! Document equality is decided by a SHA256 digest of normalized content,
//! never by counts. Normalization folds CRLF/CR line endings to LF and trims
//! surrounding whitespace so cosmetic differences between stores do not
//! register as edits.

use sha2::{Digest, Sha256};

/// Normalize content before hashing.
#[must_use]
pub fn normalize_content(content: &str) -> String {
    content.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

/// Compute the SHA256 hex digest of normalized content.
///
/// # Example
///
/// ```ignore
/// let hash = content_hash("Original 1");
/// // hash is something like "a1b2c3d4..."
/// ```
#[must_use]
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_content(content).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Check if content has changed relative to a stored hash.
///
/// Returns `true` if there is no stored hash or the hashes differ.
#[must_use]
pub fn has_changed(current_hash: &str, stored_hash: Option<&str>) -> bool {
    stored_hash.is_none_or(|h| h != current_hash)
}
