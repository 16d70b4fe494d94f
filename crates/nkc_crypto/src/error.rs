use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Input could not be decoded. The message is always a fixed string and
    /// never echoes the offending bytes.
    #[error("Malformed envelope: {0}")]
    Format(&'static str),

    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u32),

    #[error("Authentication failed")]
    Authentication,

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Message key already consumed (index {0})")]
    KeyConsumed(u64),

    #[error("Ratchet not ready: {0}")]
    RatchetNotReady(&'static str),

    #[error("Device approval invalid: {0}")]
    Approval(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl CryptoError {
    /// True for errors caused by untrusted input that must be dropped, not retried.
    pub fn is_untrusted_input(&self) -> bool {
        matches!(
            self,
            Self::Format(_)
                | Self::UnsupportedVersion(_)
                | Self::Authentication
                | Self::SignatureVerification
        )
    }
}
