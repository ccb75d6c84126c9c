//! Title preprocessing for embedding generation.
//!
//! Prepares a bookmark title (or a query) for the model:
//! 1. Trim and collapse runs of whitespace
//! 2. Truncate to max length with ellipsis
//!
//! Empty titles stay empty; the model maps them to its fixed default vector.

use sha2::{Digest, Sha256};

/// Maximum text length for embedding input (characters, not tokens)
const MAX_TEXT_LENGTH: usize = 512;

/// Ellipsis suffix when text is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Normalize a title or query before it is embedded.
pub fn preprocess_title(title: &str) -> String {
    let collapsed = title.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_text(&collapsed)
}

/// Truncate text to MAX_TEXT_LENGTH characters, adding ellipsis if truncated.
fn truncate_text(text: &str) -> String {
    if text.chars().count() <= MAX_TEXT_LENGTH {
        return text.to_string();
    }

    let max_chars = MAX_TEXT_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = text.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}

/// Stable hash of the embedded text, used to detect renamed bookmarks.
///
/// Persisted alongside each vector, so it must not depend on the
/// toolchain; the first 8 bytes of a SHA-256 digest are used.
pub fn content_hash(title: &str) -> u64 {
    let digest = Sha256::digest(preprocess_title(title).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_title_stays_empty() {
        assert_eq!(preprocess_title(""), "");
        assert_eq!(preprocess_title("  \n\t "), "");
    }

    #[test]
    fn test_collapses_whitespace() {
        assert_eq!(preprocess_title("  Learn   Rust\n\tfast "), "Learn Rust fast");
    }

    #[test]
    fn test_truncation() {
        let long_title = "x".repeat(600);
        let result = preprocess_title(&long_title);

        assert_eq!(result.chars().count(), MAX_TEXT_LENGTH);
        assert!(result.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long_title = "日本語".repeat(300);
        let result = preprocess_title(&long_title);

        assert_eq!(result.chars().count(), MAX_TEXT_LENGTH);
        assert!(result.starts_with("日本語"));
    }

    #[test]
    fn test_no_truncation_for_short_title() {
        assert_eq!(preprocess_title("Short title"), "Short title");
    }

    #[test]
    fn test_content_hash_consistency() {
        assert_eq!(content_hash("Title"), content_hash("Title"));
        assert_ne!(content_hash("Title A"), content_hash("Title B"));
    }

    #[test]
    fn test_content_hash_ignores_whitespace_noise() {
        assert_eq!(content_hash("  Learn  Rust "), content_hash("Learn Rust"));
    }
}
