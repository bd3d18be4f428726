//! Content Integrity Checks
//!
//! MD5 digests as reported by the module: one per chunk, and one running
//! digest over the whole bundle. These are integrity checks against link
//! corruption, not authenticity checks.

use md5::{Digest, Md5};

/// Lowercase hex MD5 of a byte slice.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Compare two hex digests, ignoring case.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

/// Accumulates the whole-file digest chunk by chunk.
#[derive(Clone, Default)]
pub struct RunningHash {
    hasher: Md5,
}

impl RunningHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Digest of everything fed so far; the accumulator keeps running.
    pub fn hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    pub fn reset(&mut self) {
        self.hasher = Md5::new();
    }

    /// Verify against an expected digest. No expectation means no match.
    pub fn matches(&self, expected: Option<&str>) -> bool {
        match expected {
            Some(expected) => digests_match(expected, &self.hex()),
            None => false,
        }
    }
}

impl std::fmt::Debug for RunningHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningHash").field("hex", &self.hex()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_value() {
        assert_eq!(md5_hex(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_running_hash_equals_hash_of_concatenation() {
        let mut running = RunningHash::new();
        running.update(b"hello ");
        running.update(b"world");
        assert_eq!(running.hex(), md5_hex(b"hello world"));
    }

    #[test]
    fn test_matches_is_case_insensitive() {
        let mut running = RunningHash::new();
        running.update(b"hello world");
        assert!(running.matches(Some("5EB63BBBE01EEED093CB22BB8F5ACDC3")));
        assert!(!running.matches(Some("wrongchecksum")));
    }

    #[test]
    fn test_missing_expectation_never_matches() {
        let running = RunningHash::new();
        assert!(!running.matches(None));
    }

    #[test]
    fn test_reset_restarts_digest() {
        let mut running = RunningHash::new();
        running.update(b"abc");
        running.reset();
        assert_eq!(running.hex(), md5_hex(b""));
    }
}
