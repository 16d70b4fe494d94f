//! Semantic handlers for decrypted event bodies.
//!
//! Called once per applied event from the single dispatch site in the
//! engine, after the event has been persisted.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use nkc_proto::body::{ChatMessage, ContactRecord, ConversationMetaPatch, DeviceRole, RoleChange};
use nkc_proto::{EnvelopeHeader, EventBody};
use nkc_store::models::{Contact, Conversation, ConversationFlags, MessageRecord, TrustState};
use nkc_store::EncryptedStore;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::SyncError;

/// Device-role bookkeeping. Owned by the host application.
#[async_trait]
pub trait RoleBook: Send + Sync {
    async fn apply_role_change(&self, author_device_id: &str, change: &RoleChange) -> Result<(), SyncError>;
}

/// In-process role book.
#[derive(Default)]
pub struct MemoryRoleBook {
    roles: Mutex<HashMap<String, DeviceRole>>,
}

impl MemoryRoleBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(&self, device_id: &str) -> Option<DeviceRole> {
        self.roles.lock().get(device_id).copied()
    }
}

#[async_trait]
impl RoleBook for MemoryRoleBook {
    async fn apply_role_change(&self, _author: &str, change: &RoleChange) -> Result<(), SyncError> {
        self.roles.lock().insert(change.device_id.clone(), change.role);
        Ok(())
    }
}

/// What a handler changed, for the apply report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerEffect {
    MessageStored,
    ContactPinned,
    ContactUpdated,
    ContactBlocked,
    MetaMerged,
    RoleChanged,
}

pub async fn dispatch(
    store: &EncryptedStore,
    roles: &dyn RoleBook,
    local_device_id: &str,
    header: &EnvelopeHeader,
    body: &EventBody,
) -> Result<HandlerEffect, SyncError> {
    match body {
        EventBody::Message(msg) => on_message(store, local_device_id, header, msg).await,
        EventBody::Contact(contact) => on_contact(store, contact).await,
        EventBody::ConversationMeta(patch) => on_meta(store, &header.conv_id, patch).await,
        EventBody::RoleChange(change) => {
            roles.apply_role_change(&header.author_device_id, change).await?;
            Ok(HandlerEffect::RoleChanged)
        }
    }
}

async fn on_message(
    store: &EncryptedStore,
    local_device_id: &str,
    header: &EnvelopeHeader,
    msg: &ChatMessage,
) -> Result<HandlerEffect, SyncError> {
    store
        .save_message(&MessageRecord {
            id: msg.id.clone(),
            conv_id: header.conv_id.clone(),
            author_device_id: header.author_device_id.clone(),
            text: msg.text.clone(),
            ts: header.ts,
            event_id: Some(header.event_id.clone()),
        })
        .await?;

    let mut conv = match store.load_conversation(&header.conv_id).await? {
        Some(c) => c,
        None => {
            let mut participants = vec![local_device_id.to_string()];
            if header.author_device_id != local_device_id {
                participants.push(header.author_device_id.clone());
            }
            Conversation::direct(&header.conv_id, participants)
        }
    };
    if conv.last_ts.map_or(true, |last| header.ts >= last) {
        conv.last_ts = Some(header.ts);
        conv.last_message = Some(msg.text.clone());
    }
    store.save_conversation(&conv).await?;
    Ok(HandlerEffect::MessageStored)
}

/// Trust on first use. A key that differs from the pinned one blocks the
/// contact; the new key is never adopted.
async fn on_contact(store: &EncryptedStore, incoming: &ContactRecord) -> Result<HandlerEffect, SyncError> {
    let Some(mut existing) = store.load_contact(&incoming.friend_id).await? else {
        store
            .save_contact(&Contact {
                friend_id: incoming.friend_id.clone(),
                display_name: incoming.display_name.clone(),
                identity_pub: incoming.identity_pub.clone(),
                dh_pub: incoming.dh_pub.clone(),
                friend_key_id: incoming.friend_key_id.clone(),
                trust: TrustState::Pinned,
                updated_at: Utc::now(),
            })
            .await?;
        info!(friend_id = %incoming.friend_id, "contact pinned");
        return Ok(HandlerEffect::ContactPinned);
    };

    let identity_changed = existing.identity_pub != incoming.identity_pub;
    let dh_changed = matches!(
        (&existing.dh_pub, &incoming.dh_pub),
        (Some(old), Some(new)) if old != new
    );

    if identity_changed || dh_changed || existing.trust == TrustState::Blocked {
        if existing.trust != TrustState::Blocked {
            warn!(
                friend_id = %incoming.friend_id,
                identity_changed,
                dh_changed,
                "contact key changed; blocking"
            );
            existing.trust = TrustState::Blocked;
            existing.updated_at = Utc::now();
            store.save_contact(&existing).await?;
        }
        return Ok(HandlerEffect::ContactBlocked);
    }

    if incoming.display_name.is_some() {
        existing.display_name = incoming.display_name.clone();
    }
    if existing.dh_pub.is_none() {
        existing.dh_pub = incoming.dh_pub.clone();
    }
    if incoming.friend_key_id.is_some() {
        existing.friend_key_id = incoming.friend_key_id.clone();
    }
    existing.updated_at = Utc::now();
    store.save_contact(&existing).await?;
    Ok(HandlerEffect::ContactUpdated)
}

/// Field-wise merge: incoming value if present, else existing, else default.
pub fn merge_meta(existing: Option<&Conversation>, conv_id: &str, patch: &ConversationMetaPatch) -> Conversation {
    let base = existing
        .cloned()
        .unwrap_or_else(|| Conversation::direct(conv_id, Vec::new()));
    let flags = &base.flags;
    Conversation {
        title: patch.title.clone().or_else(|| base.title.clone()),
        flags: ConversationFlags {
            pinned: patch.pinned.unwrap_or(flags.pinned),
            muted: patch.muted.unwrap_or(flags.muted),
            blocked: patch.blocked.unwrap_or(flags.blocked),
            hidden: patch.hidden.unwrap_or(flags.hidden),
        },
        ..base.clone()
    }
}

async fn on_meta(
    store: &EncryptedStore,
    conv_id: &str,
    patch: &ConversationMetaPatch,
) -> Result<HandlerEffect, SyncError> {
    let existing = store.load_conversation(conv_id).await?;
    let merged = merge_meta(existing.as_ref(), conv_id, patch);
    store.save_conversation(&merged).await?;
    Ok(HandlerEffect::MetaMerged)
}
