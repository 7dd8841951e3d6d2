//! Integrity: whole-message hash for fragmented packets, content digest for lobby files.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use xxhash_rust::xxh32::xxh32;

/// 32-bit hash stamped into the first fragment of a split message.
pub fn message_hash(payload: &[u8]) -> u32 {
    xxh32(payload, 0)
}

/// Verify a reassembled payload against the hash carried by its first fragment.
pub fn verify_message(payload: &[u8], expected: u32) -> bool {
    message_hash(payload) == expected
}

/// SHA-256 digest of a lobby file's contents. Doubles as the file's transfer identity.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FileHash(pub [u8; 32]);

impl FileHash {
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        FileHash(hasher.finalize().into())
    }

    pub fn matches(&self, content: &[u8]) -> bool {
        Self::of(content) == *self
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}
