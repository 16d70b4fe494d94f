//! The transport seam and per-attempt bookkeeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nkc_store::models::{OutboxRecord, RoutingHints};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::TransportKind;
use crate::error::TransportError;

/// One ciphertext on its way to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub id: String,
    pub conv_id: String,
    pub to_device_id: String,
    /// Serialized wire envelope.
    pub ciphertext: String,
    pub routing: RoutingHints,
}

impl From<&OutboxRecord> for OutgoingMessage {
    fn from(r: &OutboxRecord) -> Self {
        Self {
            id: r.id.clone(),
            conv_id: r.conv_id.clone(),
            to_device_id: r.to_device_id.clone(),
            ciphertext: r.ciphertext.clone(),
            routing: r.routing.clone(),
        }
    }
}

/// A concrete way of moving bytes to a peer.
///
/// `send` returns once the peer acknowledged the message id. Implementations
/// must stop promptly when `cancel` fires.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn send(&self, msg: &OutgoingMessage, cancel: CancellationToken) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Sent,
    PolicyDenied { reason: String },
    Failed { reason: String },
    TimedOut,
    Cancelled,
}

impl AttemptOutcome {
    pub(crate) fn from_result(result: &Result<(), TransportError>) -> Self {
        match result {
            Ok(()) => Self::Sent,
            Err(TransportError::Policy { reason, .. }) => Self::PolicyDenied {
                reason: (*reason).to_string(),
            },
            Err(TransportError::Timeout { .. } | TransportError::DeadlineExceeded) => Self::TimedOut,
            Err(TransportError::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed { reason: e.to_string() },
        }
    }

    /// Whether the attempt touched the network at all.
    pub fn reached_network(&self) -> bool {
        !matches!(self, Self::PolicyDenied { .. })
    }
}

/// One rung of a fail-over ladder, as recorded for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub message_id: String,
    pub transport: TransportKind,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}
