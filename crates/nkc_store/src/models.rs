//! Stored record shapes. Each is serialized to JSON and sealed in its own
//! record envelope before it reaches a backend.

use chrono::{DateTime, Utc};
use nkc_crypto::identity::PublicKeyBytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub display_name: String,
    pub device_id: String,
    pub identity_pub: PublicKeyBytes,
    pub dh_pub: PublicKeyBytes,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationFlags {
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub participants: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub flags: ConversationFlags,
    /// Unix ms of the newest message.
    #[serde(default)]
    pub last_ts: Option<i64>,
    #[serde(default)]
    pub last_message: Option<String>,
}

impl Conversation {
    pub fn direct(id: &str, participants: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            kind: ConversationKind::Direct,
            participants,
            title: None,
            flags: ConversationFlags::default(),
            last_ts: None,
            last_message: None,
        }
    }
}

/// A chat message as the rest of the app sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub conv_id: String,
    pub author_device_id: String,
    pub text: String,
    /// Unix ms.
    pub ts: i64,
    /// Event that carried this message, when it arrived through sync.
    #[serde(default)]
    pub event_id: Option<String>,
}

/// On-disk message shapes. Older installs wrote a flat shape; current
/// writers wrap the record with the envelope event id. Both decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum StoredMessage {
    Wrapped {
        v: u32,
        message: MessageRecord,
    },
    #[serde(rename_all = "camelCase")]
    Legacy {
        id: String,
        conv_id: String,
        sender: String,
        text: String,
        ts: i64,
    },
}

impl From<StoredMessage> for MessageRecord {
    fn from(stored: StoredMessage) -> Self {
        match stored {
            StoredMessage::Wrapped { message, .. } => message,
            StoredMessage::Legacy { id, conv_id, sender, text, ts } => MessageRecord {
                id,
                conv_id,
                author_device_id: sender,
                text,
                ts,
                event_id: None,
            },
        }
    }
}

/// One committed log entry. Immutable once written except `conflict`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event_id: String,
    pub conv_id: String,
    pub log_id: String,
    pub author_device_id: String,
    pub lamport: u64,
    pub ts: i64,
    /// Serialized wire envelope exactly as received.
    pub envelope: String,
    #[serde(default)]
    pub prev_hash: Option<String>,
    pub event_hash: String,
    #[serde(default)]
    pub conflict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    Pinned,
    /// Key changed after first use. Never silently re-trusted.
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub friend_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub identity_pub: PublicKeyBytes,
    #[serde(default)]
    pub dh_pub: Option<PublicKeyBytes>,
    #[serde(default)]
    pub friend_key_id: Option<String>,
    pub trust: TrustState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingHints {
    #[serde(default)]
    pub direct_addr: Option<String>,
    #[serde(default)]
    pub onion_addr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    /// Last attempt failed; eligible for retry.
    Failed,
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxRecord {
    pub id: String,
    pub conv_id: String,
    pub to_device_id: String,
    /// Serialized wire envelope.
    pub ciphertext: String,
    #[serde(default)]
    pub routing: RoutingHints,
    pub attempts: u32,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_transport: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub owner: String,
    pub index: u32,
    /// Base64 chunk bytes.
    pub data: String,
}
