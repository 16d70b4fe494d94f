//! BLAKE3-based hash utilities
//!
//! - Domain-separated key derivation (vault key, record keys, chain seeds)
//! - Event hashes for the per-log hash chain
//! - Keyed hashes where a key context differentiates domains

use crate::Key32;

/// Context strings for `blake3::derive_key`. Never reuse one for two purposes.
pub mod domain {
    pub const VAULT_KEY: &str = "nkc 2024 vault key v1";
    pub const VAULT_KEY_ID: &str = "nkc 2024 vault key id v1";
    pub const RECORD_KEY: &str = "nkc 2024 record key v1";
    pub const SYMMETRIC_CHAIN: &str = "nkc 2024 symmetric chain v1";
    pub const DH_ROOT: &str = "nkc 2024 dh root v1";
    pub const EVENT_HASH: &str = "nkc 2024 event hash v1";
}

pub fn hash(data: &[u8]) -> Key32 {
    blake3::hash(data).into()
}

/// Keyed hash - used for MACs where a key context differentiates domains.
pub fn keyed_hash(key: &Key32, data: &[u8]) -> Key32 {
    blake3::keyed_hash(key, data).into()
}

/// Derive 32 bytes from `parts` under a fixed context string.
///
/// Parts are length-prefixed so `("ab","c")` and `("a","bc")` never collide.
pub fn derive(context: &str, parts: &[&[u8]]) -> Key32 {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Event hash: H(prev_hash || canonical signed bytes), hex-encoded.
///
/// `prev_hash` is the hex hash of the previous event in the same log, or the
/// empty string for the first event.
pub fn event_hash(prev_hash: &str, signed_bytes: &[u8]) -> String {
    hex::encode(derive(
        domain::EVENT_HASH,
        &[prev_hash.as_bytes(), signed_bytes],
    ))
}
