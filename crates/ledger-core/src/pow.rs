//! Proof-of-work hash engine: canonical block hashing, the hex difficulty
//! rule, and the brute-force nonce search.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tracing::info;

/// RFC 3339 with microsecond precision and a `Z` suffix. This exact string
/// is what enters the hash input, so it must never vary per serialization.
pub fn canonical_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Hash over the canonical block input: height, timestamp, content,
/// previous hash, and nonce, joined by `|`. Difficulty is not part of the
/// input; it only constrains the output.
pub fn block_hash(
    height: u64,
    timestamp_iso: &str,
    content: &str,
    previous_hash: &str,
    nonce: u64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(height.to_be_bytes());
    hasher.update(b"|");
    hasher.update(timestamp_iso.as_bytes());
    hasher.update(b"|");
    hasher.update(content.as_bytes());
    hasher.update(b"|");
    hasher.update(previous_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(nonce.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// True when the first `difficulty` hex chars of the digest are `'0'`.
pub fn meets_difficulty(hash_hex: &str, difficulty: u32) -> bool {
    let needed = difficulty as usize;
    hash_hex.len() >= needed && hash_hex.bytes().take(needed).all(|b| b == b'0')
}

/// Search nonces from zero until the digest meets `difficulty`. Unbounded;
/// expected work is `16^difficulty` attempts.
pub fn mine(
    height: u64,
    timestamp_iso: &str,
    content: &str,
    previous_hash: &str,
    difficulty: u32,
) -> (String, u64) {
    let mut nonce: u64 = 0;
    loop {
        let hash = block_hash(height, timestamp_iso, content, previous_hash, nonce);
        if meets_difficulty(&hash, difficulty) {
            info!(height, nonce, %hash, "mined block");
            return (hash, nonce);
        }
        nonce = nonce.wrapping_add(1);
    }
}
