//! Snapshot hashing.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of a snapshot. Empty text hashes to the empty string so the
/// status FSM can treat "no content" as its own state.
pub fn snapshot_hash(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}
