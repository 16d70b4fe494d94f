//! Vault key rotation.
//!
//! Derives a fresh header and vault key from a new recovery secret and
//! re-encrypts every stored record under the new key. All rewritten rows and
//! the new header are committed in one backend batch; the in-memory key is
//! swapped only after that commit. Any record that fails to decrypt aborts
//! the rotation before anything is written, so the old key stays
//! authoritative.
//!
//! Callers must not write records concurrently with a rotation.

use nkc_crypto::kdf::KdfParams;
use nkc_crypto::record::{decrypt_record, encrypt_record};
use tracing::{info, warn};

use crate::backend::{RecordFamily, StoredRow};
use crate::error::StoreError;
use crate::header::{RecoverySecret, VaultHeader};
use crate::repo::{derive_off_thread, EncryptedStore, META_VAULT_HEADER, META_VAULT_KEY_ID};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub records: usize,
    pub old_key_id: String,
    pub new_key_id: String,
}

/// Rotate to a key derived from `new_secret`. `progress` receives values in
/// `0.0..=1.0` as records are re-encrypted.
pub async fn rotate_vault_keys<F>(
    store: &EncryptedStore,
    new_secret: &RecoverySecret,
    params: KdfParams,
    mut progress: F,
) -> Result<RotationReport, StoreError>
where
    F: FnMut(f32) + Send,
{
    let old_key_id = store
        .vault()
        .key_id()
        .await
        .ok_or(StoreError::VaultLocked)?;

    let header = VaultHeader::new(params);
    let new_key = derive_off_thread(header.clone(), new_secret.clone()).await?;
    let new_key_id = new_key.key_id();
    progress(0.0);

    let backend = store.backend();
    let mut rows = Vec::new();
    for family in RecordFamily::ALL {
        for row in backend.list(family, None, None).await? {
            rows.push((family, row));
        }
    }

    let total = rows.len();
    let mut rewritten = Vec::with_capacity(total);
    for (done, (family, row)) in rows.into_iter().enumerate() {
        let plain = store
            .vault()
            .with_key(|vk| {
                decrypt_record(vk, &row.id, family.as_str(), &row.data).map_err(|source| {
                    StoreError::RotationAborted {
                        family: family.as_str(),
                        id: row.id.clone(),
                        source,
                    }
                })
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "vault key rotation aborted");
                e
            })?;
        let data = encrypt_record(&new_key, &row.id, family.as_str(), &plain)?;
        rewritten.push((family, StoredRow { data, ..row }));
        progress((done + 1) as f32 / total.max(1) as f32);
    }

    backend
        .commit_batch(
            rewritten,
            vec![
                (META_VAULT_HEADER.to_string(), serde_json::to_string(&header)?),
                (META_VAULT_KEY_ID.to_string(), new_key_id.clone()),
            ],
        )
        .await?;
    store.vault().unlock_with_key(new_key).await;
    progress(1.0);

    info!(records = total, old_key_id = %old_key_id, new_key_id = %new_key_id, "vault key rotated");
    Ok(RotationReport {
        records: total,
        old_key_id,
        new_key_id,
    })
}
