//! nkc_sync - Replicated event logs between peer devices
//!
//! Each conversation binding replicates four append-only logs (messages,
//! contacts, conversation metadata, device roles). Events are signed by their
//! author, encrypted under a ratchet message key, hash-chained to the previous
//! head and ordered by per-author Lamport counters.
//!
//! # Modules
//! - `engine`   - authoring, SYNC_REQ/SYNC_RES serving and the apply pipeline
//! - `handlers` - semantic effects of applied bodies (messages, TOFU, meta)
//! - `approval` - device-approval gating for same-user sync
//! - `audit`    - offline hash-chain verification of a persisted log
//! - `peer`     - local identity and in-memory peer bindings

pub mod approval;
pub mod audit;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod peer;

pub use audit::{verify_log_chain, ChainError, ChainReport};
pub use engine::{ApplyOutcome, ApplyReport, SyncEngine, MAX_DEFERRED_PER_LOG};
pub use error::SyncError;
pub use handlers::{HandlerEffect, MemoryRoleBook, RoleBook};
pub use peer::{LocalDevice, PeerContext, PeerKind};
