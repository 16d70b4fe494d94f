//! nkc_crypto - NKC cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Every signature and hash input goes through [`canonical`] first.
//!
//! # Module layout
//! - `canonical` - deterministic JSON byte encoding (sorted keys)
//! - `hash`      - BLAKE3 hashing, domain-separated key derivation, event hashes
//! - `aead`      - XChaCha20-Poly1305 seal/open helpers
//! - `kdf`       - Argon2id recovery-secret stretching + ratchet KDFs
//! - `identity`  - Ed25519 identity keys, X25519 DH keys, device approvals
//! - `record`    - at-rest record envelopes bound to `{schema, type, id}`
//! - `ratchet`   - per-conversation DH / symmetric / legacy key schedule
//! - `error`     - unified error type

pub mod aead;
pub mod canonical;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod ratchet;
pub mod record;

pub use error::CryptoError;

/// 32-byte symmetric key material.
pub type Key32 = [u8; 32];
