//! Typed, vault-encrypted repository.
//!
//! `EncryptedStore` is what the rest of the workspace talks to. It seals every
//! value into a record envelope under the session's vault key before handing
//! it to the backend, and opens envelopes on the way back.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use nkc_crypto::identity::DeviceApproval;
use nkc_crypto::kdf::KdfParams;
use nkc_crypto::ratchet::ConversationRatchet;
use nkc_crypto::record::{decrypt_record, encrypt_record};
use nkc_crypto::CryptoError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{RecordFamily, StorageBackend, StoredRow};
use crate::error::StoreError;
use crate::header::{RecoverySecret, VaultHeader};
use crate::models::{
    Contact, Conversation, EventRecord, MediaChunk, MessageRecord, OutboxRecord, Profile,
    StoredMessage,
};
use crate::vault::VaultSession;

pub const META_VAULT_HEADER: &str = "vault.header";
pub const META_VAULT_KEY_ID: &str = "vault.key_id";
pub const META_SCHEMA_VERSION: &str = "schema.version";
const META_LAMPORT_PREFIX: &str = "lamport:";
const META_HEAD_PREFIX: &str = "head:";

pub const SCHEMA_VERSION: u32 = 2;
const MESSAGE_SHAPE_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// No header existed; a new vault was bootstrapped.
    Created,
    Unlocked,
}

#[derive(Clone)]
pub struct EncryptedStore {
    backend: Arc<dyn StorageBackend>,
    vault: VaultSession,
}

impl EncryptedStore {
    pub fn new(backend: Arc<dyn StorageBackend>, vault: VaultSession) -> Self {
        Self { backend, vault }
    }

    pub fn vault(&self) -> &VaultSession {
        &self.vault
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    // ── Vault lifecycle ──────────────────────────────────────────────────

    pub async fn header(&self) -> Result<Option<VaultHeader>, StoreError> {
        match self.backend.get_meta(META_VAULT_HEADER).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|_| StoreError::CorruptMeta(META_VAULT_HEADER.into())),
            None => Ok(None),
        }
    }

    /// Unlock with `secret`, bootstrapping a vault with `new_vault_params`
    /// when none exists yet. A wrong secret is detected through the stored
    /// key id before any record is touched.
    pub async fn unlock(
        &self,
        secret: &RecoverySecret,
        new_vault_params: KdfParams,
    ) -> Result<UnlockOutcome, StoreError> {
        let existing = self.header().await?;
        let (header, outcome) = match existing {
            Some(h) => (h, UnlockOutcome::Unlocked),
            None => (VaultHeader::new(new_vault_params), UnlockOutcome::Created),
        };
        let key = derive_off_thread(header.clone(), secret.clone()).await?;

        match outcome {
            UnlockOutcome::Unlocked => {
                let stored_id = self.backend.get_meta(META_VAULT_KEY_ID).await?;
                if stored_id.as_deref() != Some(key.key_id().as_str()) {
                    warn!("vault unlock rejected: key id mismatch");
                    return Err(StoreError::WrongSecret);
                }
            }
            UnlockOutcome::Created => {
                self.backend
                    .commit_batch(
                        Vec::new(),
                        vec![
                            (META_VAULT_HEADER.into(), serde_json::to_string(&header)?),
                            (META_VAULT_KEY_ID.into(), key.key_id()),
                            (META_SCHEMA_VERSION.into(), SCHEMA_VERSION.to_string()),
                        ],
                    )
                    .await?;
                info!(opslimit = header.opslimit, memlimit = header.memlimit, "vault bootstrapped");
            }
        }
        self.vault.unlock_with_key(key).await;
        Ok(outcome)
    }

    pub async fn lock(&self) {
        self.vault.lock().await;
    }

    // ── Generic sealed records ───────────────────────────────────────────

    pub async fn put<T: Serialize>(
        &self,
        family: RecordFamily,
        id: &str,
        scope: Option<&str>,
        seq: i64,
        value: &T,
    ) -> Result<(), StoreError> {
        let row = self.seal_row(family, id, scope, seq, value).await?;
        self.backend.save(family, row).await
    }

    async fn seal_row<T: Serialize>(
        &self,
        family: RecordFamily,
        id: &str,
        scope: Option<&str>,
        seq: i64,
        value: &T,
    ) -> Result<StoredRow, StoreError> {
        let plain = zeroize::Zeroizing::new(serde_json::to_vec(value)?);
        let data = self
            .vault
            .with_key(|vk| Ok(encrypt_record(vk, id, family.as_str(), &plain)?))
            .await?;
        Ok(StoredRow {
            id: id.to_string(),
            scope: scope.map(str::to_string),
            seq,
            data,
        })
    }

    async fn open_row<T: DeserializeOwned>(
        &self,
        family: RecordFamily,
        row: &StoredRow,
    ) -> Result<T, StoreError> {
        let plain = self
            .vault
            .with_key(|vk| Ok(decrypt_record(vk, &row.id, family.as_str(), &row.data)?))
            .await?;
        serde_json::from_slice(&plain)
            .map_err(|_| StoreError::Crypto(CryptoError::Format("record body structure")))
    }

    pub async fn fetch<T: DeserializeOwned>(
        &self,
        family: RecordFamily,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.backend.get(family, id).await? {
            Some(row) => Ok(Some(self.open_row(family, &row).await?)),
            None => Ok(None),
        }
    }

    /// Decrypt every row of a family. An undecryptable row is logged and
    /// skipped; a locked vault fails the whole call.
    pub async fn fetch_all<T: DeserializeOwned>(
        &self,
        family: RecordFamily,
        scope: Option<&str>,
        after_seq: Option<i64>,
    ) -> Result<Vec<T>, StoreError> {
        let rows = self.backend.list(family, scope, after_seq).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.open_row(family, row).await {
                Ok(v) => out.push(v),
                Err(StoreError::Crypto(e)) => {
                    warn!(family = family.as_str(), id = %row.id, error = %e, "skipping undecryptable record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub async fn remove(&self, family: RecordFamily, id: &str) -> Result<bool, StoreError> {
        self.backend.delete(family, id).await
    }

    // ── Profiles & conversations ─────────────────────────────────────────

    pub async fn save_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        self.put(RecordFamily::Profile, &profile.id, None, 0, profile).await
    }

    pub async fn load_profile(&self, id: &str) -> Result<Option<Profile>, StoreError> {
        self.fetch(RecordFamily::Profile, id).await
    }

    pub async fn save_conversation(&self, conv: &Conversation) -> Result<(), StoreError> {
        self.put(RecordFamily::Conversation, &conv.id, None, 0, conv).await
    }

    pub async fn load_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        self.fetch(RecordFamily::Conversation, id).await
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        self.fetch_all(RecordFamily::Conversation, None, None).await
    }

    // ── Messages ─────────────────────────────────────────────────────────

    pub async fn save_message(&self, msg: &MessageRecord) -> Result<(), StoreError> {
        let stored = StoredMessage::Wrapped {
            v: MESSAGE_SHAPE_VERSION,
            message: msg.clone(),
        };
        self.put(RecordFamily::Message, &msg.id, Some(&msg.conv_id), msg.ts, &stored)
            .await
    }

    /// Messages of a conversation in timestamp order, whichever shape they
    /// were written in.
    pub async fn list_messages(&self, conv_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let stored: Vec<StoredMessage> = self
            .fetch_all(RecordFamily::Message, Some(conv_id), None)
            .await?;
        Ok(stored.into_iter().map(MessageRecord::from).collect())
    }

    // ── Event log ────────────────────────────────────────────────────────

    /// Persist an applied event in one transaction: the event row (keyed by
    /// event id, ordered by `(log id, lamport)`), the
    /// author's watermark, the log head and, when given, the conversation
    /// ratchet that produced or consumed its message key. A failed write
    /// leaves all of them at their previous values.
    pub async fn commit_event(
        &self,
        event: &EventRecord,
        ratchet: Option<(&str, &ConversationRatchet)>,
    ) -> Result<(), StoreError> {
        let mut rows = vec![(
            RecordFamily::Event,
            self.seal_row(
                RecordFamily::Event,
                &event.event_id,
                Some(&event.log_id),
                event.lamport as i64,
                event,
            )
            .await?,
        )];
        if let Some((key, ratchet)) = ratchet {
            rows.push((
                RecordFamily::Ratchet,
                self.seal_row(RecordFamily::Ratchet, key, None, 0, ratchet).await?,
            ));
        }
        let mut marks = self.watermarks(&event.log_id).await?;
        let entry = marks.entry(event.author_device_id.clone()).or_insert(0);
        *entry = (*entry).max(event.lamport);
        let meta = vec![
            (
                format!("{META_LAMPORT_PREFIX}{}", event.log_id),
                serde_json::to_string(&marks)?,
            ),
            (format!("{META_HEAD_PREFIX}{}", event.log_id), event.event_hash.clone()),
        ];
        self.backend.commit_batch(rows, meta).await
    }

    pub async fn has_event(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.backend.get(RecordFamily::Event, event_id).await?.is_some())
    }

    pub async fn list_events(
        &self,
        log_id: &str,
        after_lamport: Option<u64>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.fetch_all(RecordFamily::Event, Some(log_id), after_lamport.map(|l| l as i64))
            .await
    }

    /// Per-author Lamport watermarks of a log.
    pub async fn watermarks(&self, log_id: &str) -> Result<BTreeMap<String, u64>, StoreError> {
        let key = format!("{META_LAMPORT_PREFIX}{log_id}");
        match self.backend.get_meta(&key).await? {
            Some(json) => serde_json::from_str(&json).map_err(|_| StoreError::CorruptMeta(key)),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Hash of the newest event appended to a log.
    pub async fn log_head(&self, log_id: &str) -> Result<Option<String>, StoreError> {
        self.backend.get_meta(&format!("{META_HEAD_PREFIX}{log_id}")).await
    }

    // ── Contacts & approvals ─────────────────────────────────────────────

    pub async fn save_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        self.put(RecordFamily::Contact, &contact.friend_id, None, 0, contact).await
    }

    pub async fn load_contact(&self, friend_id: &str) -> Result<Option<Contact>, StoreError> {
        self.fetch(RecordFamily::Contact, friend_id).await
    }

    pub async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        self.fetch_all(RecordFamily::Contact, None, None).await
    }

    pub async fn save_approval(&self, approval: &DeviceApproval) -> Result<(), StoreError> {
        let id = format!("{}:{}", approval.approver_device_id, approval.subject_device_id);
        self.put(RecordFamily::Approval, &id, None, 0, approval).await
    }

    pub async fn list_approvals(&self) -> Result<Vec<DeviceApproval>, StoreError> {
        self.fetch_all(RecordFamily::Approval, None, None).await
    }

    // ── Outbox ───────────────────────────────────────────────────────────

    pub async fn save_outbox(&self, record: &OutboxRecord) -> Result<(), StoreError> {
        self.put(
            RecordFamily::Outbox,
            &record.id,
            Some(&record.conv_id),
            record.created_at.timestamp_millis(),
            record,
        )
        .await
    }

    pub async fn load_outbox(&self, id: &str) -> Result<Option<OutboxRecord>, StoreError> {
        self.fetch(RecordFamily::Outbox, id).await
    }

    pub async fn list_outbox(&self) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut records: Vec<OutboxRecord> = self.fetch_all(RecordFamily::Outbox, None, None).await?;
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    pub async fn delete_outbox(&self, id: &str) -> Result<bool, StoreError> {
        self.remove(RecordFamily::Outbox, id).await
    }

    // ── Ratchet state ────────────────────────────────────────────────────

    pub async fn load_ratchet(&self, key: &str) -> Result<Option<ConversationRatchet>, StoreError> {
        self.fetch(RecordFamily::Ratchet, key).await
    }

    // ── Media chunks ─────────────────────────────────────────────────────

    /// Store one chunk, keyed `owner:index`.
    pub async fn save_media_chunk(&self, owner: &str, index: u32, bytes: &[u8]) -> Result<(), StoreError> {
        let chunk = MediaChunk {
            owner: owner.to_string(),
            index,
            data: STANDARD.encode(bytes),
        };
        let id = format!("{owner}:{index}");
        self.put(RecordFamily::MediaChunk, &id, Some(owner), index as i64, &chunk)
            .await
    }

    /// Reassemble all chunks of `owner` in index order. `None` when the owner
    /// has no chunks or a chunk is missing.
    pub async fn load_media(&self, owner: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let chunks: Vec<MediaChunk> = self
            .fetch_all(RecordFamily::MediaChunk, Some(owner), None)
            .await?;
        if chunks.is_empty() {
            return Ok(None);
        }
        let mut out = Vec::new();
        for (expected, chunk) in chunks.iter().enumerate() {
            if chunk.index as usize != expected {
                warn!(owner, missing = expected, "media chunk gap");
                return Ok(None);
            }
            let bytes = STANDARD
                .decode(&chunk.data)
                .map_err(|_| StoreError::Crypto(CryptoError::Format("media chunk encoding")))?;
            out.extend_from_slice(&bytes);
        }
        Ok(Some(out))
    }
}

/// Argon2id is intentionally slow; keep it off the async workers.
pub(crate) async fn derive_off_thread(
    header: VaultHeader,
    secret: RecoverySecret,
) -> Result<nkc_crypto::kdf::VaultKey, StoreError> {
    tokio::task::spawn_blocking(move || header.derive_key(&secret))
        .await
        .map_err(|e| StoreError::Crypto(CryptoError::KeyDerivation(e.to_string())))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::models::ConversationKind;

    async fn unlocked() -> EncryptedStore {
        let store = EncryptedStore::new(Arc::new(MemoryBackend::new()), VaultSession::with_auto_lock(None));
        let secret = RecoverySecret::parse("river stone").unwrap();
        assert_eq!(
            store.unlock(&secret, KdfParams::testing()).await.unwrap(),
            UnlockOutcome::Created
        );
        store
    }

    #[tokio::test]
    async fn bootstrap_then_reunlock_and_wrong_secret() {
        let store = unlocked().await;
        store.lock().await;
        let good = RecoverySecret::parse("River  Stone").unwrap();
        assert_eq!(
            store.unlock(&good, KdfParams::testing()).await.unwrap(),
            UnlockOutcome::Unlocked
        );
        store.lock().await;
        let bad = RecoverySecret::parse("other").unwrap();
        assert!(matches!(
            store.unlock(&bad, KdfParams::testing()).await,
            Err(StoreError::WrongSecret)
        ));
        assert!(store.vault().is_locked().await);
    }

    #[tokio::test]
    async fn locked_store_fails_explicitly() {
        let store = unlocked().await;
        store.lock().await;
        assert!(matches!(
            store.list_conversations().await,
            Err(StoreError::VaultLocked)
        ));
    }

    #[tokio::test]
    async fn backend_never_sees_plaintext() {
        let store = unlocked().await;
        let conv = Conversation::direct("c1", vec!["alice-secret-name".into()]);
        store.save_conversation(&conv).await.unwrap();
        let row = store.backend().get(RecordFamily::Conversation, "c1").await.unwrap().unwrap();
        assert!(!row.data.contains("alice-secret-name"));
        let back = store.load_conversation("c1").await.unwrap().unwrap();
        assert_eq!(back.kind, ConversationKind::Direct);
    }

    #[tokio::test]
    async fn copied_row_fails_under_other_id() {
        let store = unlocked().await;
        store
            .save_conversation(&Conversation::direct("c1", vec![]))
            .await
            .unwrap();
        let mut row = store.backend().get(RecordFamily::Conversation, "c1").await.unwrap().unwrap();
        row.id = "c2".into();
        store.backend().save(RecordFamily::Conversation, row).await.unwrap();
        assert!(store.load_conversation("c2").await.is_err());
        // Listing skips the bad row instead of failing.
        assert_eq!(store.list_conversations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn legacy_message_rows_decode() {
        let store = unlocked().await;
        let legacy = serde_json::json!({"id":"m0","convId":"c1","sender":"dev-a","text":"old","ts":1});
        store
            .put(RecordFamily::Message, "m0", Some("c1"), 1, &legacy)
            .await
            .unwrap();
        store
            .save_message(&MessageRecord {
                id: "m1".into(),
                conv_id: "c1".into(),
                author_device_id: "dev-b".into(),
                text: "new".into(),
                ts: 2,
                event_id: Some("e1".into()),
            })
            .await
            .unwrap();
        let msgs = store.list_messages("c1").await.unwrap();
        assert_eq!(msgs.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(), ["old", "new"]);
    }

    #[tokio::test]
    async fn media_chunks_reassemble_in_order() {
        let store = unlocked().await;
        store.save_media_chunk("avatar", 1, b"world").await.unwrap();
        store.save_media_chunk("avatar", 0, b"hello ").await.unwrap();
        assert_eq!(store.load_media("avatar").await.unwrap().unwrap(), b"hello world");
        store.save_media_chunk("gap", 1, b"x").await.unwrap();
        assert!(store.load_media("gap").await.unwrap().is_none());
        assert!(store.load_media("none").await.unwrap().is_none());
    }

    fn event(id: &str, author: &str, lamport: u64) -> EventRecord {
        EventRecord {
            event_id: id.into(),
            conv_id: "c1".into(),
            log_id: "dm:c1".into(),
            author_device_id: author.into(),
            lamport,
            ts: lamport as i64,
            envelope: "{}".into(),
            prev_hash: None,
            event_hash: format!("hash-{id}"),
            conflict: false,
        }
    }

    #[tokio::test]
    async fn watermarks_never_decrease() {
        let store = unlocked().await;
        assert!(store.watermarks("dm:c1").await.unwrap().is_empty());
        store.commit_event(&event("e1", "dev-a", 7), None).await.unwrap();
        store.commit_event(&event("e2", "dev-a", 3), None).await.unwrap();
        store.commit_event(&event("e3", "dev-b", 1), None).await.unwrap();
        let marks = store.watermarks("dm:c1").await.unwrap();
        assert_eq!(marks.get("dev-a"), Some(&7));
        assert_eq!(marks.get("dev-b"), Some(&1));
        assert!(store.watermarks("dm:c2").await.unwrap().is_empty());
        assert_eq!(store.log_head("dm:c1").await.unwrap().as_deref(), Some("hash-e3"));
    }

    #[tokio::test]
    async fn committed_event_carries_its_ratchet() {
        let store = unlocked().await;
        let ratchet = ConversationRatchet::new("dev-a", "dev-b", &[9u8; 32]);
        store
            .commit_event(&event("e1", "dev-a", 1), Some(("c1", &ratchet)))
            .await
            .unwrap();
        assert!(store.has_event("e1").await.unwrap());
        assert!(store.load_ratchet("c1").await.unwrap().is_some());

        store.lock().await;
        assert!(store
            .commit_event(&event("e2", "dev-a", 2), Some(("c1", &ratchet)))
            .await
            .is_err());
        store
            .unlock(&RecoverySecret::parse("river stone").unwrap(), KdfParams::testing())
            .await
            .unwrap();
        assert!(!store.has_event("e2").await.unwrap());
        assert_eq!(store.watermarks("dm:c1").await.unwrap().get("dev-a"), Some(&1));
    }
}
