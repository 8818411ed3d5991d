//! Text normalization and hashing helpers

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
}

/// Separator between hashed parts so ("ab", "c") and ("a", "bc") differ
const HASH_PART_SEPARATOR: &[u8] = &[0x1f];

pub struct TextUtils;

impl TextUtils {
    /// Normalization applied to any text before it is hashed or embedded.
    ///
    /// Steps, in order: trim both ends, collapse every run of Unicode
    /// whitespace into one ASCII space, lowercase (Unicode-aware).
    pub fn normalize_for_embedding(text: &str) -> String {
        Self::normalize_whitespace(text.trim()).to_lowercase()
    }

    /// Normalize whitespace efficiently
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.is_match(text) {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// blake3 hex digest over the given parts
    pub fn content_hash(parts: &[&str]) -> String {
        let mut hasher = blake3::Hasher::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                hasher.update(HASH_PART_SEPARATOR);
            }
            hasher.update(part.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Length in characters; every budget in this crate is counted this way
    pub fn char_len(text: &str) -> usize {
        text.chars().count()
    }

    /// Truncate text to max characters with ellipsis if needed
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if Self::char_len(text) <= max_chars {
            Cow::Borrowed(text)
        } else if max_chars <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut result: String = text.chars().take(max_chars - 3).collect();
            result.push_str("...");
            Cow::Owned(result)
        }
    }

    /// First sentence of a text, or the whole text if it has no terminator
    pub fn first_sentence(text: &str) -> &str {
        let trimmed = text.trim();
        for (idx, c) in trimmed.char_indices() {
            if matches!(c, '.' | '!' | '?') {
                let end = idx + c.len_utf8();
                let rest = &trimmed[end..];
                if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                    return &trimmed[..end];
                }
            }
        }
        trimmed
    }
}
