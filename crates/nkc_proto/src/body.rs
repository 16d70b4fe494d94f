//! Decrypted event bodies (inside the encrypted envelope).
//!
//! One closed sum type; the sync engine matches on it exhaustively at a
//! single dispatch site.

use nkc_crypto::identity::PublicKeyBytes;
use serde::{Deserialize, Serialize};

use crate::scope::LogScope;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    Message(ChatMessage),
    Contact(ContactRecord),
    ConversationMeta(ConversationMetaPatch),
    RoleChange(RoleChange),
}

impl EventBody {
    /// The log this body belongs in.
    pub fn scope(&self) -> LogScope {
        match self {
            Self::Message(_) => LogScope::Messages,
            Self::Contact(_) => LogScope::Contacts,
            Self::ConversationMeta(_) => LogScope::ConversationMeta,
            Self::RoleChange(_) => LogScope::DeviceRoles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// A friend entry as mirrored between a user's own devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub friend_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub identity_pub: PublicKeyBytes,
    #[serde(default)]
    pub dh_pub: Option<PublicKeyBytes>,
    #[serde(default)]
    pub friend_key_id: Option<String>,
}

/// Field-wise patch; `None` means "no opinion", not "clear".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetaPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub pinned: Option<bool>,
    #[serde(default)]
    pub muted: Option<bool>,
    #[serde(default)]
    pub blocked: Option<bool>,
    #[serde(default)]
    pub hidden: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Primary,
    Secondary,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleChange {
    pub device_id: String,
    pub role: DeviceRole,
}
