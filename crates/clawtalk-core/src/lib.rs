//! Foundational low-level utilities shared across ClawTalk crates.
//!
//! Provides atomic file-write helpers, time utilities, tolerant JSONL access,
//! and the intent lexicon used by routing gates and job execution.

pub mod atomic_io;
pub mod intent;
pub mod jsonl;
pub mod time_utils;

pub use atomic_io::{commit_json_pretty, commit_text};
pub use intent::{classify_intent, Intent};
pub use jsonl::{read_jsonl_tail, read_jsonl_tolerant, JsonlLog};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};

/// Short stable hex digest used for generated ids and change markers.
pub fn short_hash(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(bytes);
    digest[..6]
        .iter()
        .map(|value| format!("{:02x}", value))
        .collect::<String>()
}

/// Replaces path-hostile characters so external ids are safe as file names.
pub fn sanitize_for_path(raw: &str) -> String {
    let sanitized = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    let trimmed = sanitized.trim_matches('_');
    if trimmed.is_empty() {
        "item".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_utils_round_trip_bounds() {
        let now_s = current_unix_timestamp();
        let now_ms = current_unix_timestamp_ms();
        let now_ms_s = now_ms / 1_000;
        assert!(now_ms_s >= now_s);
        assert!(now_ms_s <= now_s.saturating_add(1));
    }

    #[test]
    fn short_hash_is_stable_and_hex() {
        let digest = short_hash(b"talk-1:4");
        assert_eq!(digest.len(), 12);
        assert!(digest.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(digest, short_hash(b"talk-1:4"));
    }

    #[test]
    fn sanitize_for_path_strips_hostile_characters() {
        assert_eq!(sanitize_for_path("slack:C123/../x"), "slack_C123_.._x");
        assert_eq!(sanitize_for_path("///"), "item");
    }
}
