use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Canonical form used for content fingerprints: NFC-normalized,
/// whitespace-collapsed, lower-cased.
pub fn normalize_content(content: &str) -> String {
    let normalized: String = content.nfc().collect();
    normalized
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable 256-bit digest of the normalized content, hex-encoded.
/// Combined with the tenant triple this is the write idempotency key.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_content(content).as_bytes());
    hex_encode(&hasher.finalize())
}

/// Digest of an arbitrary set of key parts, used for deterministic graph
/// record ids so redelivered writes converge onto the same rows.
pub fn key_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex_encode(&hasher.finalize())
}

/// One-way hash for user identifiers persisted on interactions.
pub fn user_hash(user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"interaction-user:");
    hasher.update(user_id.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_whitespace_and_case() {
        assert_eq!(
            normalize_content("  The  Quick\n\tBrown FOX "),
            "the quick brown fox"
        );
    }

    #[test]
    fn content_hash_is_stable_across_formatting() {
        assert_eq!(
            content_hash("The quick brown fox"),
            content_hash("  the   QUICK brown\nfox ")
        );
    }

    #[test]
    fn content_hash_distinguishes_different_content() {
        assert_ne!(content_hash("alpha"), content_hash("beta"));
    }

    #[test]
    fn key_digest_separates_parts() {
        // ("ab", "c") and ("a", "bc") must not collide
        assert_ne!(key_digest(&["ab", "c"]), key_digest(&["a", "bc"]));
    }

    #[test]
    fn user_hash_does_not_leak_the_id() {
        let hashed = user_hash("alice@example.com");
        assert_eq!(hashed.len(), 64);
        assert!(!hashed.contains("alice"));
    }
}
