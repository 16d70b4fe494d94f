//! The sync engine: authoring, serving and applying events.
//!
//! Apply pipeline, per event in deterministic `(ts, author, lamport)` order:
//!
//!   1. duplicate  - already persisted event ids are skipped silently
//!   2. replay     - `lamport <= watermark(log, author)` is dropped
//!   3. signature  - Ed25519 over the canonical envelope, author's pinned key
//!   4. key        - ratchet tier from `rk`; `Deferred` parks the event
//!   5. decrypt    - AEAD with the header as AAD
//!   6. hash chain - `prev` compared to the local log head; mismatch = conflict
//!   7. persist    - event record, watermark, log head and ratchet, atomically
//!   8. dispatch   - semantic handler for the body
//!
//! Untrusted-input failures (1-6) drop the one event and the batch goes on.
//! Store failures (locked vault, database) abort the call.
//!
//! All ratchet and watermark mutation for a conversation happens under that
//! conversation's async mutex; different conversations proceed in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use nkc_crypto::identity::PublicKeyBytes;
use nkc_crypto::ratchet::{ConversationRatchet, ReceiveOutcome};
use nkc_proto::{EnvelopeHeader, EventBody, LogScope, PaddingMode, SyncFrame, WireEnvelope};
use nkc_store::models::EventRecord;
use nkc_store::EncryptedStore;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::approval::{mutually_resolvable, DeviceKey};
use crate::audit::{verify_log_chain, ChainError, ChainReport};
use crate::error::SyncError;
use crate::handlers::{self, RoleBook};
use crate::peer::{LocalDevice, PeerContext, PeerKind};

/// Upper bound on events parked per log while waiting for ratchet keys.
pub const MAX_DEFERRED_PER_LOG: usize = 256;

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { conflict: bool },
    Replay,
    Duplicate,
    /// The ratchet cannot derive the key yet. The event is kept and retried
    /// with the next batch for the same log.
    Deferred,
    Rejected(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Event ids in the order they were applied.
    pub applied: Vec<String>,
    pub conflicts: usize,
    pub replays: usize,
    pub duplicates: usize,
    pub deferred: usize,
    pub rejected: usize,
}

pub struct SyncEngine {
    store: EncryptedStore,
    local: LocalDevice,
    roles: Arc<dyn RoleBook>,
    padding: PaddingMode,
    peers: RwLock<HashMap<String, PeerContext>>,
    conv_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    deferred: Mutex<HashMap<(String, LogScope), Vec<WireEnvelope>>>,
    /// Live ratchets keep their skipped-key cache, which is never persisted.
    ratchets: Mutex<HashMap<String, ConversationRatchet>>,
}

impl SyncEngine {
    pub fn new(store: EncryptedStore, local: LocalDevice, roles: Arc<dyn RoleBook>) -> Self {
        Self {
            store,
            local,
            roles,
            padding: PaddingMode::default(),
            peers: RwLock::new(HashMap::new()),
            conv_locks: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
            ratchets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_padding(mut self, padding: PaddingMode) -> Self {
        self.padding = padding;
        self
    }

    pub fn local(&self) -> &LocalDevice {
        &self.local
    }

    pub fn store(&self) -> &EncryptedStore {
        &self.store
    }

    // ── Peer bindings ────────────────────────────────────────────────────

    pub fn bind_peer(&self, peer: PeerContext) {
        debug!(conv_id = %peer.conv_id, peer = %peer.remote_device_id, kind = ?peer.kind, "peer bound");
        self.peers.write().insert(peer.conv_id.clone(), peer);
    }

    pub fn unbind_peer(&self, conv_id: &str) -> Option<PeerContext> {
        self.ratchets.lock().remove(conv_id);
        self.peers.write().remove(conv_id)
    }

    pub fn peer(&self, conv_id: &str) -> Result<PeerContext, SyncError> {
        self.peers
            .read()
            .get(conv_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownPeer(conv_id.to_string()))
    }

    fn conv_lock(&self, conv_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.conv_locks
            .lock()
            .entry(conv_id.to_string())
            .or_default()
            .clone()
    }

    /// Device peers need an approval in either direction; friends do not.
    async fn sync_allowed(&self, peer: &PeerContext) -> Result<bool, SyncError> {
        if peer.kind == PeerKind::Friend {
            return Ok(true);
        }
        let approvals = self.store.list_approvals().await?;
        Ok(mutually_resolvable(
            &approvals,
            &DeviceKey {
                device_id: &self.local.device_id,
                identity_pub: self.local.identity_pub(),
            },
            &DeviceKey {
                device_id: &peer.remote_device_id,
                identity_pub: &peer.identity_pub,
            },
            Utc::now(),
        ))
    }

    // ── Frames ───────────────────────────────────────────────────────────

    pub fn hello(&self) -> SyncFrame {
        SyncFrame::Hello {
            device_id: self.local.device_id.clone(),
            identity_pub: self.local.identity_pub().clone(),
        }
    }

    /// Opening frames for a connection: HELLO plus one SYNC_REQ per scope.
    /// `None` when device sync is not approved.
    pub async fn connect(&self, conv_id: &str) -> Result<Option<Vec<SyncFrame>>, SyncError> {
        let peer = self.peer(conv_id)?;
        if !self.sync_allowed(&peer).await? {
            debug!(conv_id, "connect skipped: device not approved");
            return Ok(None);
        }
        let mut frames = vec![self.hello()];
        for scope in LogScope::ALL {
            frames.push(self.sync_request(conv_id, scope).await?);
        }
        Ok(Some(frames))
    }

    pub async fn sync_request(&self, conv_id: &str, scope: LogScope) -> Result<SyncFrame, SyncError> {
        let since = self.store.watermarks(&scope.log_id(Some(conv_id))).await?;
        Ok(SyncFrame::SyncReq {
            scope,
            conv_id: Some(conv_id.to_string()),
            since,
        })
    }

    /// Process one incoming frame. Returns the reply frame, if any.
    pub async fn handle_frame(&self, conv_id: &str, frame: SyncFrame) -> Result<Option<SyncFrame>, SyncError> {
        let peer = self.peer(conv_id)?;
        if !self.sync_allowed(&peer).await? {
            debug!(conv_id, frame = frame.kind(), "frame skipped: device not approved");
            return Ok(None);
        }
        match frame {
            SyncFrame::Hello { device_id, identity_pub } => {
                if device_id != peer.remote_device_id || identity_pub != peer.identity_pub {
                    warn!(conv_id, device_id = %device_id, "hello does not match bound peer");
                    return Err(SyncError::IdentityMismatch { device_id });
                }
                Ok(None)
            }
            SyncFrame::SyncReq { scope, conv_id: req_conv, since } => {
                if req_conv.as_deref().is_some_and(|c| c != conv_id) {
                    return Err(SyncError::Rejected("sync request for another conversation"));
                }
                let log_id = scope.log_id(Some(conv_id));
                let events = self.events_since(&log_id, &since).await?;
                let next = self.store.watermarks(&log_id).await?;
                debug!(conv_id, ?scope, count = events.len(), "serving sync request");
                Ok(Some(SyncFrame::SyncRes {
                    scope,
                    conv_id: Some(conv_id.to_string()),
                    events,
                    next,
                }))
            }
            SyncFrame::SyncRes { scope, events, .. } => {
                self.apply_events(conv_id, scope, events).await?;
                Ok(None)
            }
        }
    }

    async fn events_since(
        &self,
        log_id: &str,
        since: &nkc_proto::Watermarks,
    ) -> Result<Vec<WireEnvelope>, SyncError> {
        let records = self.store.list_events(log_id, None).await?;
        Ok(records
            .iter()
            .filter(|r| r.lamport > since.get(&r.author_device_id).copied().unwrap_or(0))
            .filter_map(|r| WireEnvelope::from_json(&r.envelope).ok())
            .collect())
    }

    // ── Ratchet ──────────────────────────────────────────────────────────

    /// The conversation's live ratchet, or its persisted state on a cold
    /// cache. The cache entry stays in place until a commit replaces it, so
    /// a failed call never loses the skipped-key cache.
    async fn load_ratchet(&self, peer: &PeerContext) -> Result<ConversationRatchet, SyncError> {
        let cached = self.ratchets.lock().get(&peer.conv_id).cloned();
        let stored = match cached {
            Some(r) => Some(r),
            None => self.store.load_ratchet(&peer.conv_id).await?,
        };
        let mut ratchet = match stored {
            Some(r) => r,
            None => {
                let r = ConversationRatchet::new(&self.local.device_id, &peer.remote_device_id, &peer.base_key);
                match peer.legacy_key {
                    Some(k) => r.with_legacy_key(k),
                    None => r,
                }
            }
        };
        if let Some(dh_pub) = &peer.dh_pub {
            ratchet.enable_dh(&self.local.dh, dh_pub)?;
        }
        Ok(ratchet)
    }

    // ── Authoring ────────────────────────────────────────────────────────

    /// Seal, persist and locally apply a new event. The returned envelope is
    /// what goes to the outbox.
    pub async fn author_event(&self, conv_id: &str, body: EventBody) -> Result<WireEnvelope, SyncError> {
        let peer = self.peer(conv_id)?;
        let log_id = body.scope().log_id(Some(conv_id));
        let lock = self.conv_lock(conv_id);
        let _guard = lock.lock().await;

        let mut ratchet = self.load_ratchet(&peer).await?;
        let marks = self.store.watermarks(&log_id).await?;
        let lamport = marks.values().copied().max().unwrap_or(0) + 1;
        let prev = self.store.log_head(&log_id).await?;

        let (rk, message_key) = ratchet.next_send_key()?;
        let header = EnvelopeHeader::new(conv_id, &self.local.device_id, lamport)
            .with_ratchet(rk)
            .with_prev(prev);
        let envelope = WireEnvelope::seal(header, &body, &message_key, &self.local.identity, self.padding)?;
        // The advanced chain lands with the event, before the envelope can leave.
        self.commit_event(&log_id, &envelope, false, &ratchet).await?;
        self.ratchets.lock().insert(conv_id.to_string(), ratchet);

        handlers::dispatch(&self.store, self.roles.as_ref(), &self.local.device_id, &envelope.header, &body)
            .await?;
        info!(conv_id, event_id = %envelope.header.event_id, lamport, "event authored");
        Ok(envelope)
    }

    async fn commit_event(
        &self,
        log_id: &str,
        envelope: &WireEnvelope,
        conflict: bool,
        ratchet: &ConversationRatchet,
    ) -> Result<String, SyncError> {
        let h = &envelope.header;
        let event_hash = envelope.event_hash()?;
        let record = EventRecord {
            event_id: h.event_id.clone(),
            conv_id: h.conv_id.clone(),
            log_id: log_id.to_string(),
            author_device_id: h.author_device_id.clone(),
            lamport: h.lamport,
            ts: h.ts,
            envelope: envelope.to_json()?,
            prev_hash: h.prev.clone(),
            event_hash: event_hash.clone(),
            conflict,
        };
        self.store.commit_event(&record, Some((&h.conv_id, ratchet))).await?;
        Ok(event_hash)
    }

    // ── Applying ─────────────────────────────────────────────────────────

    /// Apply a batch of events received for one log of a conversation.
    /// Events parked as deferred by earlier calls are retried with it.
    ///
    /// A store failure aborts the batch. Events applied before it stay
    /// applied, the live ratchet keeps the last committed state and every
    /// parked event stays parked.
    pub async fn apply_events(
        &self,
        conv_id: &str,
        scope: LogScope,
        events: Vec<WireEnvelope>,
    ) -> Result<ApplyReport, SyncError> {
        let peer = self.peer(conv_id)?;
        let log_id = scope.log_id(Some(conv_id));
        let key = (conv_id.to_string(), scope);
        let lock = self.conv_lock(conv_id);
        let _guard = lock.lock().await;

        let mut report = ApplyReport::default();
        let mut ratchet = self.load_ratchet(&peer).await?;
        let previously_parked = self.deferred.lock().remove(&key).unwrap_or_default();
        let prior: HashSet<String> = previously_parked.iter().map(|e| e.header.event_id.clone()).collect();

        let mut batch = previously_parked;
        batch.extend(events);
        let mut seen = HashSet::new();
        batch.retain(|e| {
            let fresh = seen.insert(e.header.event_id.clone());
            if !fresh {
                report.duplicates += 1;
            }
            fresh
        });
        batch.sort_by(|a, b| {
            (a.header.ts, a.header.author_device_id.as_str(), a.header.lamport).cmp(&(
                b.header.ts,
                b.header.author_device_id.as_str(),
                b.header.lamport,
            ))
        });

        let mut parked = Vec::new();
        let mut failure = None;
        let mut remaining = batch.into_iter();
        while let Some(envelope) = remaining.next() {
            let result = self.apply_one(&peer, scope, &log_id, &mut ratchet, &envelope).await;
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Keep what was parked before this call; the caller owns
                    // the rest of its batch and retries it with the error.
                    parked.extend(
                        std::iter::once(envelope)
                            .chain(remaining.by_ref())
                            .filter(|e| prior.contains(&e.header.event_id)),
                    );
                    failure = Some(e);
                    break;
                }
            };
            let event_id = &envelope.header.event_id;
            match outcome {
                ApplyOutcome::Applied { conflict } => {
                    report.applied.push(event_id.clone());
                    if conflict {
                        report.conflicts += 1;
                    }
                }
                ApplyOutcome::Replay => {
                    warn!(conv_id, event_id = %event_id, author = %envelope.header.author_device_id,
                        lamport = envelope.header.lamport, "replayed event dropped");
                    report.replays += 1;
                }
                ApplyOutcome::Duplicate => report.duplicates += 1,
                ApplyOutcome::Deferred => {
                    debug!(conv_id, event_id = %event_id, "event deferred");
                    report.deferred += 1;
                    parked.push(envelope);
                }
                ApplyOutcome::Rejected(reason) => {
                    warn!(conv_id, event_id = %event_id, reason, "event rejected");
                    report.rejected += 1;
                }
            }
        }

        self.ratchets.lock().insert(conv_id.to_string(), ratchet);
        self.park(key, parked);
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn park(&self, key: (String, LogScope), mut parked: Vec<WireEnvelope>) {
        if parked.is_empty() {
            return;
        }
        if parked.len() > MAX_DEFERRED_PER_LOG {
            warn!(
                conv_id = %key.0,
                scope = ?key.1,
                dropped = parked.len() - MAX_DEFERRED_PER_LOG,
                "deferred queue full; newest events dropped"
            );
            parked.truncate(MAX_DEFERRED_PER_LOG);
        }
        self.deferred.lock().insert(key, parked);
    }

    async fn apply_one(
        &self,
        peer: &PeerContext,
        scope: LogScope,
        log_id: &str,
        ratchet: &mut ConversationRatchet,
        envelope: &WireEnvelope,
    ) -> Result<ApplyOutcome, SyncError> {
        let h = &envelope.header;
        if h.conv_id != peer.conv_id {
            return Ok(ApplyOutcome::Rejected("conversation mismatch"));
        }
        if envelope.check_version().is_err() {
            return Ok(ApplyOutcome::Rejected("unsupported version"));
        }

        if self.store.has_event(&h.event_id).await? {
            return Ok(ApplyOutcome::Duplicate);
        }

        let marks = self.store.watermarks(log_id).await?;
        if h.lamport <= marks.get(&h.author_device_id).copied().unwrap_or(0) {
            return Ok(ApplyOutcome::Replay);
        }

        let Some(author_key) = self.author_key(peer, &h.author_device_id) else {
            return Ok(ApplyOutcome::Rejected("unknown author"));
        };
        if envelope.verify_signature(author_key).is_err() {
            return Ok(ApplyOutcome::Rejected("signature verification failed"));
        }

        let pending = match ratchet.receive(h.rk.as_ref()) {
            Ok(ReceiveOutcome::Ready(p)) => p,
            Ok(ReceiveOutcome::Deferred) => return Ok(ApplyOutcome::Deferred),
            Err(e) => {
                debug!(event_id = %h.event_id, error = %e, "no message key");
                return Ok(ApplyOutcome::Rejected("message key unavailable"));
            }
        };

        let body = match envelope.open(&pending.key) {
            Ok(body) => body,
            Err(_) => return Ok(ApplyOutcome::Rejected("authentication failed")),
        };
        if body.scope() != scope {
            return Ok(ApplyOutcome::Rejected("body does not belong to this log"));
        }

        let expected_prev = self.store.log_head(log_id).await?;
        let conflict = h.prev != expected_prev;
        if conflict {
            warn!(
                log_id,
                event_id = %h.event_id,
                expected = ?expected_prev,
                found = ?h.prev,
                "hash chain conflict"
            );
        }

        // The consumed key and the event are persisted together; until that
        // write succeeds the caller's ratchet still holds the key and a
        // redelivery applies the event again.
        let mut next = ratchet.clone();
        next.commit(pending);
        self.commit_event(log_id, envelope, conflict, &next).await?;
        *ratchet = next;

        handlers::dispatch(&self.store, self.roles.as_ref(), &self.local.device_id, h, &body).await?;
        debug!(log_id, event_id = %h.event_id, lamport = h.lamport, "event applied");
        Ok(ApplyOutcome::Applied { conflict })
    }

    /// Pinned key for events in this binding. Only the bound remote device
    /// may author incoming events.
    fn author_key<'a>(&self, peer: &'a PeerContext, author: &str) -> Option<&'a PublicKeyBytes> {
        (author == peer.remote_device_id).then_some(&peer.identity_pub)
    }

    /// Events waiting for ratchet keys, per log.
    pub fn deferred_count(&self, conv_id: &str, scope: LogScope) -> usize {
        self.deferred
            .lock()
            .get(&(conv_id.to_string(), scope))
            .map_or(0, Vec::len)
    }

    // ── Inspection ───────────────────────────────────────────────────────

    /// Events persisted with the conflict flag, for a downstream
    /// reconciliation pass.
    pub async fn conflicts(&self, conv_id: &str, scope: LogScope) -> Result<Vec<EventRecord>, SyncError> {
        let events = self.store.list_events(&scope.log_id(Some(conv_id)), None).await?;
        Ok(events.into_iter().filter(|e| e.conflict).collect())
    }

    pub async fn audit(&self, conv_id: &str, scope: LogScope) -> Result<Result<ChainReport, ChainError>, SyncError> {
        let events = self.store.list_events(&scope.log_id(Some(conv_id)), None).await?;
        Ok(verify_log_chain(&events))
    }
}
