//! Document hashing: SHA-256 hex digest used as the index key.

use sha2::{Digest, Sha256};

/// Length in bytes of a hex-encoded SHA-256 digest.
pub const HASH_LEN: usize = 64;

/// Compute the lowercase hex SHA-256 digest of a document's UTF-8 bytes.
pub fn hash_document(document: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(HASH_LEN);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_has_fixed_length() {
        assert_eq!(hash_document("").len(), HASH_LEN);
        assert_eq!(hash_document("hello").len(), HASH_LEN);
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_document("hello"), hash_document("hello"));
        assert_ne!(hash_document("hello"), hash_document("world"));
    }

    #[test]
    fn matches_known_vector() {
        assert_eq!(
            hash_document("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
