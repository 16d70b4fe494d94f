//! Log scopes.
//!
//! Each peer binding replicates four independent append-only logs. A log is
//! identified by `<prefix><conv id>`; the device-role log is global and uses
//! [`GLOBAL_LOG_KEY`] in place of a conversation id.

use serde::{Deserialize, Serialize};

pub const GLOBAL_LOG_KEY: &str = "device";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogScope {
    /// Direct messages of one conversation.
    Messages,
    /// Contact-list mirror.
    Contacts,
    /// Conversation-metadata mirror.
    ConversationMeta,
    /// Device-global role and settings log.
    DeviceRoles,
}

impl LogScope {
    pub const ALL: [LogScope; 4] = [
        LogScope::Messages,
        LogScope::Contacts,
        LogScope::ConversationMeta,
        LogScope::DeviceRoles,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Messages => "dm:",
            Self::Contacts => "contacts:",
            Self::ConversationMeta => "meta:",
            Self::DeviceRoles => "roles:",
        }
    }

    /// Log id for this scope. `conv_id` is ignored for the global role log.
    pub fn log_id(self, conv_id: Option<&str>) -> String {
        let key = match self {
            Self::DeviceRoles => GLOBAL_LOG_KEY,
            _ => conv_id.unwrap_or(GLOBAL_LOG_KEY),
        };
        format!("{}{}", self.prefix(), key)
    }

    pub fn from_log_id(log_id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| log_id.starts_with(s.prefix()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ids_are_prefixed_and_parse_back() {
        assert_eq!(LogScope::Messages.log_id(Some("c1")), "dm:c1");
        assert_eq!(LogScope::DeviceRoles.log_id(Some("c1")), "roles:device");
        for scope in LogScope::ALL {
            assert_eq!(LogScope::from_log_id(&scope.log_id(Some("x"))), Some(scope));
        }
        assert_eq!(LogScope::from_log_id("other:x"), None);
    }
}
