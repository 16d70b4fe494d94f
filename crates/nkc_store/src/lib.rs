//! nkc_store - Encrypted local storage for NKC
//!
//! # Encryption strategy
//! The storage engine never sees plaintext. Every record is a
//! `nkc_crypto::record` envelope: its own record key derived from the vault
//! key, bound by AAD to `(id, family)`. Only sort keys (conversation / log id,
//! Lamport value, chunk index) and the metadata table are stored in clear.
//!
//! The vault key lives in a [`VaultSession`] owned by the application and
//! passed by reference. It is derived from the recovery secret and the
//! [`VaultHeader`] on unlock and zeroized on lock or auto-lock.
//!
//! # Modules
//! - `header`   - vault header (Argon2id salt + cost) and recovery-secret normalization
//! - `vault`    - in-memory vault key session with auto-lock
//! - `backend`  - storage engine contract + SQLite and in-memory engines
//! - `models`   - stored record shapes
//! - `repo`     - typed, vault-encrypted repository over a backend
//! - `rotation` - atomic vault key rotation
//! - `keystore` - platform keystore for device private keys

pub mod backend;
pub mod error;
pub mod header;
pub mod keystore;
pub mod models;
pub mod repo;
pub mod rotation;
pub mod vault;

pub use backend::{MemoryBackend, RecordFamily, SqliteBackend, StorageBackend, StoredRow};
pub use error::StoreError;
pub use header::{RecoverySecret, VaultHeader};
pub use keystore::{Keystore, MemoryKeystore, OsKeystore};
pub use repo::EncryptedStore;
pub use vault::VaultSession;
