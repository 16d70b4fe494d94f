use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] nkc_store::StoreError),

    #[error("Protocol error: {0}")]
    Proto(#[from] nkc_proto::ProtoError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] nkc_crypto::CryptoError),

    #[error("No peer bound to conversation {0}")]
    UnknownPeer(String),

    #[error("Identity key for device {device_id} does not match the pinned key")]
    IdentityMismatch { device_id: String },

    #[error("Event rejected: {0}")]
    Rejected(&'static str),
}
