use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vault is locked - unlock with the recovery secret first")]
    VaultLocked,

    #[error("Recovery secret does not match this vault")]
    WrongSecret,

    #[error("Invalid recovery secret: {0}")]
    InvalidSecret(&'static str),

    #[error("Keystore unavailable: {0}")]
    KeystoreUnavailable(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] nkc_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupt metadata entry {0}")]
    CorruptMeta(String),

    #[error("Key rotation aborted at {family}/{id}: {source}")]
    RotationAborted {
        family: &'static str,
        id: String,
        #[source]
        source: nkc_crypto::CryptoError,
    },

    #[error("Migration error: {0}")]
    Migration(String),
}

impl StoreError {
    /// Errors that fail the whole operation and must reach the caller.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::VaultLocked | Self::KeystoreUnavailable(_))
    }
}
