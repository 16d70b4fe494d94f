use thiserror::Error;

use crate::config::TransportKind;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The active privacy mode forbids this transport. Raised before any I/O.
    #[error("Transport {kind} is not allowed: {reason}")]
    Policy {
        kind: TransportKind,
        reason: &'static str,
    },

    #[error("No {0} transport is configured")]
    Unavailable(TransportKind),

    #[error("Transport {kind} failed: {reason}")]
    Failed { kind: TransportKind, reason: String },

    #[error("Transport {kind} timed out")]
    Timeout { kind: TransportKind },

    #[error("Send deadline exceeded")]
    DeadlineExceeded,

    #[error("Send cancelled")]
    Cancelled,

    #[error("Onion bridge error: {0}")]
    Bridge(String),

    #[error("Frame error: {0}")]
    Frame(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] nkc_store::StoreError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl TransportError {
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::Policy { .. })
    }
}
