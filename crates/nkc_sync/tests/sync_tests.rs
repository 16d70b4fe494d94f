use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use nkc_crypto::identity::{DeviceApproval, DhKeyPair, IdentityKeyPair, PublicKeyBytes};
use nkc_crypto::kdf::KdfParams;
use nkc_proto::body::{ChatMessage, ContactRecord, ConversationMetaPatch};
use nkc_proto::{EventBody, LogScope, SyncFrame, WireEnvelope};
use nkc_store::models::{RoutingHints, TrustState};
use nkc_store::{
    EncryptedStore, MemoryBackend, RecordFamily, RecoverySecret, StorageBackend, StoreError, StoredRow, VaultSession,
};
use nkc_sync::{
    verify_log_chain, ChainError, LocalDevice, MemoryRoleBook, PeerContext, PeerKind, SyncEngine, SyncError,
    MAX_DEFERRED_PER_LOG,
};

const CONV: &str = "c1";

/// Key material for one test device, rebuildable into any number of engines.
struct Device {
    id: &'static str,
    identity: [u8; 32],
    dh: [u8; 32],
}

impl Device {
    fn generate(id: &'static str) -> Self {
        Self {
            id,
            identity: *IdentityKeyPair::generate().secret_bytes(),
            dh: *DhKeyPair::generate().secret_bytes(),
        }
    }

    fn identity_pub(&self) -> PublicKeyBytes {
        IdentityKeyPair::from_bytes(&self.identity).unwrap().public.clone()
    }

    fn dh_pub(&self) -> PublicKeyBytes {
        DhKeyPair::from_bytes(&self.dh).unwrap().public.clone()
    }

    fn local(&self) -> LocalDevice {
        LocalDevice::new(
            self.id,
            IdentityKeyPair::from_bytes(&self.identity).unwrap(),
            DhKeyPair::from_bytes(&self.dh).unwrap(),
        )
    }
}

async fn unlocked_store() -> EncryptedStore {
    unlocked_store_on(Arc::new(MemoryBackend::new())).await
}

async fn unlocked_store_on(backend: Arc<dyn StorageBackend>) -> EncryptedStore {
    let store = EncryptedStore::new(backend, VaultSession::with_auto_lock(None));
    store
        .unlock(&RecoverySecret::parse("correct horse").unwrap(), KdfParams::testing())
        .await
        .unwrap();
    store
}

/// Memory backend whose next event commit fails once when armed.
#[derive(Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    fail_next_event: AtomicBool,
}

impl FlakyBackend {
    fn arm(&self) {
        self.fail_next_event.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn save(&self, family: RecordFamily, row: StoredRow) -> Result<(), StoreError> {
        self.inner.save(family, row).await
    }

    async fn get(&self, family: RecordFamily, id: &str) -> Result<Option<StoredRow>, StoreError> {
        self.inner.get(family, id).await
    }

    async fn list(
        &self,
        family: RecordFamily,
        scope: Option<&str>,
        after_seq: Option<i64>,
    ) -> Result<Vec<StoredRow>, StoreError> {
        self.inner.list(family, scope, after_seq).await
    }

    async fn delete(&self, family: RecordFamily, id: &str) -> Result<bool, StoreError> {
        self.inner.delete(family, id).await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get_meta(key).await
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set_meta(key, value).await
    }

    async fn commit_batch(
        &self,
        rows: Vec<(RecordFamily, StoredRow)>,
        meta: Vec<(String, String)>,
    ) -> Result<(), StoreError> {
        let has_event = rows.iter().any(|(family, _)| *family == RecordFamily::Event);
        if has_event && self.fail_next_event.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.commit_batch(rows, meta).await
    }
}

fn binding(remote: &Device, kind: PeerKind, dh: bool) -> PeerContext {
    PeerContext {
        conv_id: CONV.into(),
        kind,
        remote_device_id: remote.id.into(),
        identity_pub: remote.identity_pub(),
        dh_pub: dh.then(|| remote.dh_pub()),
        friend_key_id: None,
        routing: RoutingHints::default(),
        base_key: [7u8; 32],
        legacy_key: None,
    }
}

async fn engine(local: &Device, remote: &Device, kind: PeerKind, dh: bool) -> SyncEngine {
    let engine = SyncEngine::new(unlocked_store().await, local.local(), Arc::new(MemoryRoleBook::new()));
    engine.bind_peer(binding(remote, kind, dh));
    engine
}

fn message(id: &str, text: &str) -> EventBody {
    EventBody::Message(ChatMessage {
        id: id.into(),
        text: text.into(),
        reply_to: None,
    })
}

async fn author_messages(engine: &SyncEngine, n: usize) -> Vec<WireEnvelope> {
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        out.push(
            engine
                .author_event(CONV, message(&format!("m{i:03}"), &format!("hello {i}")))
                .await
                .unwrap(),
        );
    }
    out
}

/// Drive one full pull from `from` into `to` over frames.
async fn pull(to: &SyncEngine, from: &SyncEngine) {
    let frames = to.connect(CONV).await.unwrap().expect("sync allowed");
    for frame in frames {
        if let Some(reply) = from.handle_frame(CONV, frame).await.unwrap() {
            assert!(to.handle_frame(CONV, reply).await.unwrap().is_none());
        }
    }
}

#[tokio::test]
async fn frames_replicate_messages_both_ways() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, true).await;
    let eb = engine(&b, &a, PeerKind::Friend, true).await;

    author_messages(&ea, 3).await;
    pull(&eb, &ea).await;
    let texts: Vec<_> = eb
        .store()
        .list_messages(CONV)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, vec!["hello 0", "hello 1", "hello 2"]);

    eb.author_event(CONV, message("reply", "hi back")).await.unwrap();
    pull(&ea, &eb).await;
    let msgs = ea.store().list_messages(CONV).await.unwrap();
    assert_eq!(msgs.len(), 4);
    assert!(msgs.iter().any(|m| m.text == "hi back" && m.author_device_id == "dev-b"));

    // Nothing new on a second pull.
    pull(&eb, &ea).await;
    assert_eq!(eb.store().list_messages(CONV).await.unwrap().len(), 4);
}

#[tokio::test]
async fn sync_res_only_carries_events_above_watermark() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;

    author_messages(&ea, 4).await;
    let mut since = nkc_proto::Watermarks::new();
    since.insert("dev-a".into(), 2);
    let reply = ea
        .handle_frame(
            CONV,
            SyncFrame::SyncReq {
                scope: LogScope::Messages,
                conv_id: Some(CONV.into()),
                since,
            },
        )
        .await
        .unwrap()
        .unwrap();
    match reply {
        SyncFrame::SyncRes { events, next, .. } => {
            let lamports: Vec<_> = events.iter().map(|e| e.header.lamport).collect();
            assert_eq!(lamports, vec![3, 4]);
            assert_eq!(next.get("dev-a"), Some(&4));
        }
        other => panic!("unexpected frame {}", other.kind()),
    }
}

#[tokio::test]
async fn replayed_lamport_is_rejected_even_with_new_event_id() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;
    let eb = engine(&b, &a, PeerKind::Friend, false).await;

    let events = author_messages(&ea, 2).await;
    let report = eb
        .apply_events(CONV, LogScope::Messages, vec![events[1].clone()])
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 1);

    let report = eb
        .apply_events(CONV, LogScope::Messages, vec![events[0].clone()])
        .await
        .unwrap();
    assert_eq!(report.replays, 1);
    assert!(report.applied.is_empty());
    assert_eq!(eb.store().list_messages(CONV).await.unwrap().len(), 1);
}

#[tokio::test]
async fn duplicates_are_ignored_without_counting_as_replays() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;
    let eb = engine(&b, &a, PeerKind::Friend, false).await;

    let events = author_messages(&ea, 2).await;
    let mut batch = events.clone();
    batch.push(events[0].clone());
    let report = eb.apply_events(CONV, LogScope::Messages, batch).await.unwrap();
    assert_eq!(report.applied.len(), 2);
    assert_eq!(report.duplicates, 1);

    let report = eb.apply_events(CONV, LogScope::Messages, events).await.unwrap();
    assert_eq!(report.duplicates, 2);
    assert_eq!(report.replays, 0);
}

#[tokio::test]
async fn arrival_order_does_not_change_final_state() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, true).await;
    let in_order = engine(&b, &a, PeerKind::Friend, true).await;
    let shuffled = engine(&b, &a, PeerKind::Friend, true).await;

    let events = author_messages(&ea, 5).await;
    let mut reversed = events.clone();
    reversed.reverse();
    reversed.swap(1, 3);

    let r1 = in_order.apply_events(CONV, LogScope::Messages, events).await.unwrap();
    let r2 = shuffled.apply_events(CONV, LogScope::Messages, reversed).await.unwrap();
    assert_eq!(r1.applied, r2.applied);
    assert_eq!(r1.applied.len(), 5);

    let log = LogScope::Messages.log_id(Some(CONV));
    let h1: Vec<_> = in_order.store().list_events(&log, None).await.unwrap();
    let h2: Vec<_> = shuffled.store().list_events(&log, None).await.unwrap();
    assert_eq!(
        h1.iter().map(|e| &e.event_hash).collect::<Vec<_>>(),
        h2.iter().map(|e| &e.event_hash).collect::<Vec<_>>()
    );
    assert_eq!(
        in_order.store().log_head(&log).await.unwrap(),
        shuffled.store().log_head(&log).await.unwrap()
    );
    let c1 = in_order.store().load_conversation(CONV).await.unwrap().unwrap();
    let c2 = shuffled.store().load_conversation(CONV).await.unwrap().unwrap();
    assert_eq!(c1.last_message, c2.last_message);
    assert_eq!(c1.last_message.as_deref(), Some("hello 4"));
}

#[tokio::test]
async fn tampered_envelope_is_rejected_and_batch_continues() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;
    let eb = engine(&b, &a, PeerKind::Friend, false).await;

    let mut events = author_messages(&ea, 2).await;
    events[0].header.ts += 1;
    let report = eb.apply_events(CONV, LogScope::Messages, events).await.unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.applied.len(), 1);
}

#[tokio::test]
async fn changed_contact_key_blocks_and_keeps_pinned_key() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;
    let eb = engine(&b, &a, PeerKind::Friend, false).await;

    let first = IdentityKeyPair::generate().public.clone();
    let second = IdentityKeyPair::generate().public.clone();
    let contact = |identity_pub: &PublicKeyBytes| {
        EventBody::Contact(ContactRecord {
            friend_id: "friend-1".into(),
            display_name: Some("Friend".into()),
            identity_pub: identity_pub.clone(),
            dh_pub: None,
            friend_key_id: None,
        })
    };
    let e1 = ea.author_event(CONV, contact(&first)).await.unwrap();
    let e2 = ea.author_event(CONV, contact(&second)).await.unwrap();

    eb.apply_events(CONV, LogScope::Contacts, vec![e1]).await.unwrap();
    let pinned = eb.store().load_contact("friend-1").await.unwrap().unwrap();
    assert_eq!(pinned.trust, TrustState::Pinned);

    eb.apply_events(CONV, LogScope::Contacts, vec![e2]).await.unwrap();
    let blocked = eb.store().load_contact("friend-1").await.unwrap().unwrap();
    assert_eq!(blocked.trust, TrustState::Blocked);
    assert_eq!(blocked.identity_pub, first);
}

#[tokio::test]
async fn meta_patches_merge_fieldwise() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;
    let eb = engine(&b, &a, PeerKind::Friend, false).await;

    let e1 = ea
        .author_event(
            CONV,
            EventBody::ConversationMeta(ConversationMetaPatch {
                title: Some("Plans".into()),
                muted: Some(true),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    let e2 = ea
        .author_event(
            CONV,
            EventBody::ConversationMeta(ConversationMetaPatch {
                pinned: Some(true),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    eb.apply_events(CONV, LogScope::ConversationMeta, vec![e1, e2])
        .await
        .unwrap();
    let conv = eb.store().load_conversation(CONV).await.unwrap().unwrap();
    assert_eq!(conv.title.as_deref(), Some("Plans"));
    assert!(conv.flags.muted);
    assert!(conv.flags.pinned);
}

#[tokio::test]
async fn unapproved_device_sync_is_skipped_silently() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Device, false).await;
    let eb = engine(&b, &a, PeerKind::Device, false).await;

    author_messages(&ea, 1).await;
    assert!(eb.connect(CONV).await.unwrap().is_none());
    let req = eb.sync_request(CONV, LogScope::Messages).await.unwrap();
    assert!(ea.handle_frame(CONV, req).await.unwrap().is_none());

    // A approves B; each side holds the approval in its own vault.
    let approval = DeviceApproval::issue(
        &IdentityKeyPair::from_bytes(&a.identity).unwrap(),
        a.id,
        b.id,
        &b.identity_pub(),
        Duration::days(1),
    )
    .unwrap();
    ea.store().save_approval(&approval).await.unwrap();
    eb.store().save_approval(&approval).await.unwrap();

    pull(&eb, &ea).await;
    assert_eq!(eb.store().list_messages(CONV).await.unwrap().len(), 1);
}

#[tokio::test]
async fn hello_with_unpinned_identity_is_refused() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;

    let impostor = SyncFrame::Hello {
        device_id: "dev-b".into(),
        identity_pub: IdentityKeyPair::generate().public.clone(),
    };
    assert!(matches!(
        ea.handle_frame(CONV, impostor).await,
        Err(SyncError::IdentityMismatch { .. })
    ));

    let genuine = SyncFrame::Hello {
        device_id: "dev-b".into(),
        identity_pub: b.identity_pub(),
    };
    assert!(ea.handle_frame(CONV, genuine).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_heads_are_flagged_as_conflicts() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, true).await;
    let eb = engine(&b, &a, PeerKind::Friend, true).await;

    let from_a = author_messages(&ea, 1).await;
    eb.author_event(CONV, message("b0", "concurrent")).await.unwrap();

    let report = eb.apply_events(CONV, LogScope::Messages, from_a).await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.conflicts, 1);

    let conflicts = eb.conflicts(CONV, LogScope::Messages).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].author_device_id, "dev-a");

    let audit = eb.audit(CONV, LogScope::Messages).await.unwrap().unwrap();
    assert_eq!(audit.events, 2);
    assert_eq!(audit.conflicts, 1);
}

#[tokio::test]
async fn events_beyond_skip_window_wait_for_the_gap() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;
    let eb = engine(&b, &a, PeerKind::Friend, false).await;

    let mut events = author_messages(&ea, 61).await;
    let last = events.pop().unwrap();
    let report = eb.apply_events(CONV, LogScope::Messages, vec![last]).await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(eb.deferred_count(CONV, LogScope::Messages), 1);

    let report = eb.apply_events(CONV, LogScope::Messages, events).await.unwrap();
    assert_eq!(report.applied.len(), 61);
    assert_eq!(eb.deferred_count(CONV, LogScope::Messages), 0);
}

#[tokio::test]
async fn audit_detects_tampered_hash() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;
    author_messages(&ea, 3).await;

    let log = LogScope::Messages.log_id(Some(CONV));
    let mut events = ea.store().list_events(&log, None).await.unwrap();
    assert_eq!(verify_log_chain(&events).unwrap().events, 3);

    events[1].event_hash = "00".repeat(32);
    assert!(matches!(
        verify_log_chain(&events),
        Err(ChainError::HashMismatch { index: 1, .. })
    ));
}

#[tokio::test]
async fn locked_vault_aborts_apply() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;
    let eb = engine(&b, &a, PeerKind::Friend, false).await;

    let events = author_messages(&ea, 1).await;
    eb.store().lock().await;
    assert!(matches!(
        eb.apply_events(CONV, LogScope::Messages, events).await,
        Err(SyncError::Store(_))
    ));
}

#[tokio::test]
async fn failed_event_write_is_applied_on_redelivery() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;

    let backend = Arc::new(FlakyBackend::default());
    let store = unlocked_store_on(backend.clone()).await;
    let eb = SyncEngine::new(store.clone(), b.local(), Arc::new(MemoryRoleBook::new()));
    eb.bind_peer(binding(&a, PeerKind::Friend, false));

    let events = author_messages(&ea, 2).await;
    backend.arm();
    assert!(matches!(
        eb.apply_events(CONV, LogScope::Messages, vec![events[0].clone()]).await,
        Err(SyncError::Store(_))
    ));
    assert!(!store.has_event(&events[0].header.event_id).await.unwrap());
    assert!(store.list_messages(CONV).await.unwrap().is_empty());

    let report = eb
        .apply_events(CONV, LogScope::Messages, vec![events[0].clone()])
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 1);

    // The persisted ratchet matches the committed event: an engine rebuilt
    // from the vault picks up at the next message.
    let rebuilt = SyncEngine::new(store.clone(), b.local(), Arc::new(MemoryRoleBook::new()));
    rebuilt.bind_peer(binding(&a, PeerKind::Friend, false));
    let report = rebuilt
        .apply_events(CONV, LogScope::Messages, vec![events[1].clone()])
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(store.list_messages(CONV).await.unwrap().len(), 2);
}

#[tokio::test]
async fn store_failure_keeps_parked_events_and_skipped_keys() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;
    let eb = engine(&b, &a, PeerKind::Friend, false).await;

    // One conversation ratchet serves every log: the meta event takes key 0,
    // the messages take keys 1..=60.
    let meta = ea
        .author_event(
            CONV,
            EventBody::ConversationMeta(ConversationMetaPatch {
                title: Some("Trip".into()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    let messages = author_messages(&ea, 60).await;

    let report = eb
        .apply_events(CONV, LogScope::Messages, vec![messages[59].clone()])
        .await
        .unwrap();
    assert_eq!(report.deferred, 1);

    // Skips key 0, which only the engine's live ratchet holds.
    let report = eb
        .apply_events(CONV, LogScope::Messages, messages[..3].to_vec())
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 3);
    assert_eq!(eb.deferred_count(CONV, LogScope::Messages), 1);

    eb.store().lock().await;
    assert!(matches!(
        eb.apply_events(CONV, LogScope::Messages, vec![messages[3].clone()]).await,
        Err(SyncError::Store(_))
    ));
    assert_eq!(eb.deferred_count(CONV, LogScope::Messages), 1);

    eb.store()
        .unlock(&RecoverySecret::parse("correct horse").unwrap(), KdfParams::testing())
        .await
        .unwrap();
    let report = eb
        .apply_events(CONV, LogScope::ConversationMeta, vec![meta])
        .await
        .unwrap();
    assert_eq!((report.applied.len(), report.rejected), (1, 0));

    let report = eb
        .apply_events(CONV, LogScope::Messages, messages[3..59].to_vec())
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 57);
    assert_eq!(eb.deferred_count(CONV, LogScope::Messages), 0);
    assert_eq!(eb.store().list_messages(CONV).await.unwrap().len(), 60);
}

#[tokio::test]
async fn deferred_queue_is_capped_per_log() {
    let a = Device::generate("dev-a");
    let b = Device::generate("dev-b");
    let ea = engine(&a, &b, PeerKind::Friend, false).await;
    let eb = engine(&b, &a, PeerKind::Friend, false).await;

    let events = author_messages(&ea, 61 + MAX_DEFERRED_PER_LOG).await;
    let beyond = events[60..].to_vec();
    let report = eb.apply_events(CONV, LogScope::Messages, beyond).await.unwrap();
    assert_eq!(report.deferred, MAX_DEFERRED_PER_LOG + 1);
    assert_eq!(eb.deferred_count(CONV, LogScope::Messages), MAX_DEFERRED_PER_LOG);

    let report = eb
        .apply_events(CONV, LogScope::Messages, events[..60].to_vec())
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 60 + MAX_DEFERRED_PER_LOG);

    // The newest event fell off the queue; the sender's retry delivers it.
    let last = events.last().unwrap().clone();
    let report = eb.apply_events(CONV, LogScope::Messages, vec![last]).await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(eb.deferred_count(CONV, LogScope::Messages), 0);
}
