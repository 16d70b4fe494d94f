use nkc_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    /// Undecodable wire data. Fixed message, never echoes input.
    #[error("Malformed wire data: {0}")]
    Format(&'static str),

    #[error("Unsupported wire version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid padding: {0}")]
    InvalidPadding(&'static str),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl ProtoError {
    /// True when the offending item must be dropped rather than retried.
    pub fn is_untrusted_input(&self) -> bool {
        match self {
            Self::Format(_) | Self::UnsupportedVersion(_) | Self::InvalidPadding(_) => true,
            Self::Crypto(e) => e.is_untrusted_input(),
            Self::Serialisation(_) => true,
        }
    }
}
