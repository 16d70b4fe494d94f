//! Sync protocol frames.
//!
//! ```text
//! A -> B  HELLO     {deviceId, identityPub}
//! A -> B  SYNC_REQ  {scope, convId?, since}
//! B -> A  SYNC_RES  {scope, convId?, events[], next}
//! ```
//!
//! `since` and `next` map author device id -> highest Lamport value seen.

use std::collections::BTreeMap;

use nkc_crypto::identity::PublicKeyBytes;
use serde::{Deserialize, Serialize};

use crate::envelope::WireEnvelope;
use crate::error::ProtoError;
use crate::scope::LogScope;

/// Per-author Lamport watermarks for one log.
pub type Watermarks = BTreeMap<String, u64>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncFrame {
    #[serde(rename_all = "camelCase")]
    Hello {
        device_id: String,
        identity_pub: PublicKeyBytes,
    },
    #[serde(rename_all = "camelCase")]
    SyncReq {
        scope: LogScope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conv_id: Option<String>,
        #[serde(default)]
        since: Watermarks,
    },
    #[serde(rename_all = "camelCase")]
    SyncRes {
        scope: LogScope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conv_id: Option<String>,
        events: Vec<WireEnvelope>,
        next: Watermarks,
    },
}

impl SyncFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        serde_json::from_slice(bytes).map_err(|_| ProtoError::Format("sync frame structure"))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "HELLO",
            Self::SyncReq { .. } => "SYNC_REQ",
            Self::SyncRes { .. } => "SYNC_RES",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_tags() {
        let req = SyncFrame::SyncReq {
            scope: LogScope::Messages,
            conv_id: Some("c1".into()),
            since: Watermarks::from([("dev-a".to_string(), 4)]),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "SYNC_REQ");
        assert_eq!(json["convId"], "c1");
        assert_eq!(json["since"]["dev-a"], 4);
        assert_eq!(SyncFrame::from_bytes(&req.to_bytes().unwrap()).unwrap(), req);
    }

    #[test]
    fn garbage_is_format_error() {
        assert!(matches!(
            SyncFrame::from_bytes(b"{\"type\":\"NOPE\"}"),
            Err(ProtoError::Format(_))
        ));
    }
}
