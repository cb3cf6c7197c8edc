//! Hashing Utilities

use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of content and return as hex string
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash of whitespace-collapsed, lowercased text, for duplicate detection
pub fn normalized_hash(text: &str) -> String {
    let normalized = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    content_hash(&normalized)
}

/// First 64 bits of the SHA-256 digest
pub fn hash64(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_hex_sha256() {
        let hash = content_hash("asked for a window seat");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash, content_hash("asked for an aisle seat"));
    }

    #[test]
    fn test_normalized_hash_ignores_case_and_spacing() {
        assert_eq!(normalized_hash("Missed  the\ttrain"), normalized_hash("missed the train"));
        assert_ne!(normalized_hash("missed the train"), normalized_hash("caught the train"));
    }

    #[test]
    fn test_hash64_is_stable() {
        assert_eq!(hash64("w:warsaw"), hash64("w:warsaw"));
        assert_ne!(hash64("w:warsaw"), hash64("w:poland"));
    }
}
