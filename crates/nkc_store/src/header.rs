//! Vault header and recovery secret.
//!
//! The header is the only vault state stored in clear: format version, the
//! Argon2id salt and cost parameters, and the creation time. It is written
//! once on bootstrap and replaced only by key rotation.

use chrono::{DateTime, Utc};
use nkc_crypto::kdf::{self, KdfParams, VaultKey, SALT_LEN};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::StoreError;

pub const VAULT_HEADER_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultHeader {
    pub version: u32,
    /// Hex-encoded 16-byte salt.
    pub salt: String,
    pub opslimit: u32,
    pub memlimit: u32,
    pub created_at: DateTime<Utc>,
}

impl VaultHeader {
    /// Fresh header with a random salt.
    pub fn new(params: KdfParams) -> Self {
        Self {
            version: VAULT_HEADER_VERSION,
            salt: hex::encode(kdf::generate_salt()),
            opslimit: params.opslimit,
            memlimit: params.memlimit,
            created_at: Utc::now(),
        }
    }

    pub fn params(&self) -> KdfParams {
        KdfParams {
            opslimit: self.opslimit,
            memlimit: self.memlimit,
        }
    }

    fn salt_bytes(&self) -> Result<[u8; SALT_LEN], StoreError> {
        hex::decode(&self.salt)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| StoreError::CorruptMeta("vault header salt".into()))
    }

    /// Run the Argon2id pipeline. Deliberately slow; call off the UI path.
    pub fn derive_key(&self, secret: &RecoverySecret) -> Result<VaultKey, StoreError> {
        if self.version != VAULT_HEADER_VERSION {
            return Err(nkc_crypto::CryptoError::UnsupportedVersion(self.version).into());
        }
        let salt = self.salt_bytes()?;
        Ok(kdf::vault_key_from_secret(
            secret.as_bytes(),
            &salt,
            self.params(),
        )?)
    }
}

/// Normalized recovery secret. Never persisted; zeroized on drop.
///
/// Normalization: trim, collapse internal whitespace runs to one space,
/// lowercase. So "  River   Stone " and "river stone" unlock the same vault.
#[derive(Clone)]
pub struct RecoverySecret(Zeroizing<String>);

impl RecoverySecret {
    pub fn parse(input: &str) -> Result<Self, StoreError> {
        let normalized = Zeroizing::new(
            input
                .split_whitespace()
                .map(str::to_lowercase)
                .collect::<Vec<_>>()
                .join(" "),
        );
        if normalized.is_empty() {
            return Err(StoreError::InvalidSecret("recovery secret is empty"));
        }
        Ok(Self(normalized))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for RecoverySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecoverySecret(..)")
    }
}
