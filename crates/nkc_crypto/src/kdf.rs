//! Key derivation functions
//!
//! Vault pipeline:
//!   recovery secret --Argon2id(salt, opslimit, memlimit)--> master key material
//!   master key material --derive(VAULT_KEY)--> vault key
//!   vault key || record id || record type --derive(RECORD_KEY)--> record key
//!
//! Ratchet KDFs:
//!   `chain_step`   - HMAC-SHA256 one-way step, chain key -> (next chain key, message key)
//!   `ratchet_keys` - HKDF-SHA256, (root key, DH output) -> (root', chain key)

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::hash::{self, domain};
use crate::Key32;

pub const SALT_LEN: usize = 16;

// ── Argon2id parameters ──────────────────────────────────────────────────────

/// Argon2id cost parameters, stored in the vault header.
///
/// `memlimit` is in bytes (converted to KiB for the argon2 crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub opslimit: u32,
    pub memlimit: u32,
}

impl KdfParams {
    /// Desktop unlock: 64 MiB, 2 passes.
    pub fn interactive() -> Self {
        Self { opslimit: 2, memlimit: 64 * 1024 * 1024 }
    }

    /// Stronger preset for new vaults on capable hardware: 256 MiB, 3 passes.
    pub fn moderate() -> Self {
        Self { opslimit: 3, memlimit: 256 * 1024 * 1024 }
    }

    /// Minimum legal cost. Only for tests.
    pub fn testing() -> Self {
        Self { opslimit: 1, memlimit: 8 * 1024 }
    }

    fn to_argon2(self) -> Result<Params, CryptoError> {
        Params::new(self.memlimit / 1024, self.opslimit, 1, Some(32))
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

// ── Vault key ────────────────────────────────────────────────────────────────

/// 32-byte vault key derived from the recovery secret. Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct VaultKey([u8; 32]);

impl VaultKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Non-secret identifier stored in metadata so a wrong secret is detected
    /// before any record is touched.
    pub fn key_id(&self) -> String {
        hex::encode(&hash::derive(domain::VAULT_KEY_ID, &[&self.0[..]])[..16])
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

/// Stretch a (normalized) recovery secret into master key material.
pub fn stretch_recovery_secret(
    secret: &[u8],
    salt: &[u8; SALT_LEN],
    params: KdfParams,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);
    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(secret, salt, &mut output[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(output)
}

/// Full pipeline: recovery secret -> vault key.
pub fn vault_key_from_secret(
    secret: &[u8],
    salt: &[u8; SALT_LEN],
    params: KdfParams,
) -> Result<VaultKey, CryptoError> {
    let master = stretch_recovery_secret(secret, salt, params)?;
    Ok(VaultKey(hash::derive(domain::VAULT_KEY, &[&master[..]])))
}

/// Per-record key. Knowing one record key reveals nothing about another.
pub fn record_key(vk: &VaultKey, record_id: &str, record_type: &str) -> Zeroizing<Key32> {
    Zeroizing::new(hash::derive(
        domain::RECORD_KEY,
        &[&vk.as_bytes()[..], record_id.as_bytes(), record_type.as_bytes()],
    ))
}

/// Generate a fresh random salt (call once per vault header; not secret).
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// ── Ratchet KDFs ─────────────────────────────────────────────────────────────

/// Symmetric ratchet step: chain key -> (next chain key, message key).
/// One-way: the previous chain key cannot be recovered from either output.
pub fn chain_step(ck: &Key32) -> Result<(Key32, Key32), CryptoError> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac_ck =
        HmacSha256::new_from_slice(ck).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x01]);
    let next_ck: Key32 = mac_ck.finalize().into_bytes().into();

    let mut mac_mk =
        HmacSha256::new_from_slice(ck).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x02]);
    let mk: Key32 = mac_mk.finalize().into_bytes().into();

    Ok((next_ck, mk))
}

/// DH ratchet step: (root key, DH output) -> (new root key, new chain key).
///
/// The chain carries messages authored under the fresh DH public key that
/// triggered the step; the side that generated the key sends on it, the
/// other side receives on it.
pub fn ratchet_keys(root_key: &Key32, dh_output: &[u8]) -> Result<(Key32, Key32), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut new_root = [0u8; 32];
    let mut chain = [0u8; 32];
    hk.expand(b"nkc-root-key", &mut new_root)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"nkc-chain-key", &mut chain)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_root, chain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_secret_same_key() {
        let salt = [3u8; SALT_LEN];
        let a = vault_key_from_secret(b"river stone", &salt, KdfParams::testing()).unwrap();
        let b = vault_key_from_secret(b"river stone", &salt, KdfParams::testing()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.key_id(), b.key_id());
    }

    #[test]
    fn salt_changes_key() {
        let a = vault_key_from_secret(b"river stone", &[1u8; SALT_LEN], KdfParams::testing()).unwrap();
        let b = vault_key_from_secret(b"river stone", &[2u8; SALT_LEN], KdfParams::testing()).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn record_keys_are_independent() {
        let vk = VaultKey::from_bytes([9u8; 32]);
        let k1 = record_key(&vk, "conv-1", "conversation");
        let k2 = record_key(&vk, "conv-2", "conversation");
        let k3 = record_key(&vk, "conv-1", "message");
        assert_ne!(*k1, *k2);
        assert_ne!(*k1, *k3);
    }

    #[test]
    fn chain_step_is_one_way_and_distinct() {
        let ck = [5u8; 32];
        let (next, mk) = chain_step(&ck).unwrap();
        assert_ne!(next, mk);
        assert_ne!(next, ck);
        let (next2, mk2) = chain_step(&next).unwrap();
        assert_ne!(mk, mk2);
        assert_ne!(next, next2);
    }

    #[test]
    fn ratchet_keys_outputs_differ() {
        let (rk, ck) = ratchet_keys(&[1u8; 32], &[2u8; 32]).unwrap();
        assert_ne!(rk, ck);
        let (rk2, _) = ratchet_keys(&[1u8; 32], &[3u8; 32]).unwrap();
        assert_ne!(rk, rk2);
    }
}
