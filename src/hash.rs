use hex::encode;
use sha2::{Digest, Sha256};

pub struct Hash;

impl Hash {
    /// Cache key for a piece of source text: lowercase hex SHA-256 of its
    /// UTF-8 bytes. Identical text always yields the identical key.
    pub fn content_hash(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        encode(hasher.finalize())
    }

    pub fn short_hash(hash: &str) -> &str {
        &hash[..hash.len().min(7)]
    }

    /// True if `candidate` looks like a key produced by `content_hash`.
    pub fn is_content_hash(candidate: &str) -> bool {
        candidate.len() == 64 && candidate.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}
