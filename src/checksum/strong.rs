//! Strong per-block hash (MD4, truncated) and the whole-file SHA-1 digest

use md4::{Digest, Md4};
use sha1::Sha1;

/// Full length of an untruncated strong block sum
pub const STRONG_SUM_LEN: usize = 16;

/// MD4 over a block; callers compare a stored prefix against this
pub fn strong_sum(block: &[u8]) -> [u8; STRONG_SUM_LEN] {
    let mut hasher = Md4::new();
    hasher.update(block);
    hasher.finalize().into()
}

/// Compare a freshly computed digest against its stored truncation
pub fn strong_matches(digest: &[u8; STRONG_SUM_LEN], stored: &[u8]) -> bool {
    stored.len() <= STRONG_SUM_LEN && &digest[..stored.len()] == stored
}

/// Streaming SHA-1 of the whole target file
pub struct FileDigest {
    hasher: Sha1,
}

impl FileDigest {
    pub fn new() -> Self {
        Self { hasher: Sha1::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finish and render the digest as lowercase hex
    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for FileDigest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strong_sum_is_stable() {
        let digest = strong_sum(b"block contents");
        assert_eq!(digest, strong_sum(b"block contents"));
        assert_ne!(digest, strong_sum(b"other contents"));
    }

    #[test]
    fn test_truncated_match() {
        let digest = strong_sum(b"abcd");
        assert!(strong_matches(&digest, &digest[..3]));
        assert!(strong_matches(&digest, &digest[..16]));

        let mut wrong = digest;
        wrong[0] ^= 0xff;
        assert!(!strong_matches(&digest, &wrong[..3]));
    }

    #[test]
    fn test_file_digest_known_value() {
        // SHA-1 of the empty input
        let digest = FileDigest::new();
        assert_eq!(digest.finalize_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");

        let mut digest = FileDigest::new();
        digest.update(b"abc");
        assert_eq!(digest.finalize_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
