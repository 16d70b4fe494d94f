//! Local device identity and runtime peer bindings.

use std::sync::Arc;

use nkc_crypto::identity::{DhKeyPair, IdentityKeyPair, PublicKeyBytes};
use nkc_crypto::Key32;
use nkc_store::models::RoutingHints;
use zeroize::Zeroize;

/// The device this engine runs on.
#[derive(Clone)]
pub struct LocalDevice {
    pub device_id: String,
    pub identity: Arc<IdentityKeyPair>,
    pub dh: DhKeyPair,
}

impl LocalDevice {
    pub fn new(device_id: &str, identity: IdentityKeyPair, dh: DhKeyPair) -> Self {
        Self {
            device_id: device_id.to_string(),
            identity: Arc::new(identity),
            dh,
        }
    }

    pub fn identity_pub(&self) -> &PublicKeyBytes {
        &self.identity.public
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// Another user's device.
    Friend,
    /// Another device of the same user. Sync requires a device approval.
    Device,
}

/// Binding of one conversation to one remote device. Held in memory only;
/// the host sets it on connect.
#[derive(Clone)]
pub struct PeerContext {
    pub conv_id: String,
    pub kind: PeerKind,
    pub remote_device_id: String,
    pub identity_pub: PublicKeyBytes,
    pub dh_pub: Option<PublicKeyBytes>,
    pub friend_key_id: Option<String>,
    pub routing: RoutingHints,
    /// Conversation base key agreed when the friendship / pairing was made.
    pub base_key: Key32,
    /// Static key of conversations that predate the ratchet.
    pub legacy_key: Option<Key32>,
}

impl Drop for PeerContext {
    fn drop(&mut self) {
        self.base_key.zeroize();
        if let Some(k) = self.legacy_key.as_mut() {
            k.zeroize();
        }
    }
}

impl std::fmt::Debug for PeerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerContext")
            .field("conv_id", &self.conv_id)
            .field("kind", &self.kind)
            .field("remote_device_id", &self.remote_device_id)
            .field("identity_pub", &self.identity_pub.fingerprint())
            .finish()
    }
}
