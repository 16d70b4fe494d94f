//! nkc_proto - Wire types and serialisation for NKC sync
//!
//! All on-wire types are JSON. Anything that is signed or hashed goes through
//! `nkc_crypto::canonical` first so every device computes identical bytes.
//!
//! # Modules
//! - `envelope` - signed + encrypted event envelope (what transports carry)
//! - `body`     - decrypted event bodies, one closed sum type
//! - `frame`    - HELLO / SYNC_REQ / SYNC_RES sync frames
//! - `scope`    - the four log scopes and their log-id prefixes
//! - `codec`    - body padding to size buckets

pub mod body;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod scope;

pub use body::EventBody;
pub use codec::PaddingMode;
pub use envelope::{EnvelopeHeader, WireEnvelope};
pub use error::ProtoError;
pub use frame::{SyncFrame, Watermarks};
pub use scope::LogScope;
