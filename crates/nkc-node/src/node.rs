use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use nkc_crypto::identity::{DhKeyPair, IdentityKeyPair};
use nkc_proto::SyncFrame;
use nkc_store::keystore::{DH_KEY_NAME, IDENTITY_KEY_NAME};
use nkc_store::models::Profile;
use nkc_store::{EncryptedStore, Keystore, OsKeystore, SqliteBackend, VaultSession};
use nkc_sync::{LocalDevice, SyncEngine};
use nkc_transport::{CancellationToken, InboundSink, Router, SendRequest, TransportError};
use tracing::{debug, info, warn};

use crate::settings::{NodeSettings, DATABASE_FILE};

pub const PROFILE_ID: &str = "self";
pub const KEYSTORE_SERVICE: &str = "nkc-node";

pub async fn open_store(dir: &Path, settings: &NodeSettings) -> Result<EncryptedStore> {
    let backend = SqliteBackend::open(&dir.join(DATABASE_FILE)).await?;
    Ok(EncryptedStore::new(
        Arc::new(backend),
        VaultSession::with_auto_lock(settings.auto_lock()),
    ))
}

/// Generate device keys, put the secrets in the platform keystore and the
/// public half in the profile record.
pub async fn create_device(store: &EncryptedStore, display_name: &str) -> Result<Profile> {
    let device_id = uuid::Uuid::new_v4().to_string();
    let keystore = OsKeystore::new(KEYSTORE_SERVICE, &device_id);
    if !keystore.is_available() {
        bail!("platform keystore is unavailable; cannot store device keys");
    }
    let identity = IdentityKeyPair::generate();
    let dh = DhKeyPair::generate();
    keystore.set(IDENTITY_KEY_NAME, identity.secret_bytes())?;
    keystore.set(DH_KEY_NAME, dh.secret_bytes())?;

    let profile = Profile {
        id: PROFILE_ID.into(),
        display_name: display_name.to_string(),
        device_id,
        identity_pub: identity.public.clone(),
        dh_pub: dh.public.clone(),
        created_at: Utc::now(),
    };
    store.save_profile(&profile).await?;
    info!(device_id = %profile.device_id, "device keys created");
    Ok(profile)
}

pub async fn load_device(store: &EncryptedStore) -> Result<LocalDevice> {
    let profile = store
        .load_profile(PROFILE_ID)
        .await?
        .ok_or_else(|| anyhow!("no device profile; run init first"))?;
    let keystore = OsKeystore::new(KEYSTORE_SERVICE, &profile.device_id);
    let identity = keystore
        .get(IDENTITY_KEY_NAME)?
        .ok_or_else(|| anyhow!("identity key missing from keystore"))?;
    let dh = keystore
        .get(DH_KEY_NAME)?
        .ok_or_else(|| anyhow!("dh key missing from keystore"))?;

    let identity = IdentityKeyPair::from_bytes(&identity)?;
    let dh = DhKeyPair::from_bytes(&dh)?;
    if identity.public != profile.identity_pub || dh.public != profile.dh_pub {
        bail!("keystore keys do not match the device profile");
    }
    Ok(LocalDevice::new(&profile.device_id, identity, dh))
}

/// Hands inbound sync frames to the engine and queues replies for delivery.
pub struct FrameSink {
    engine: Arc<SyncEngine>,
    router: Arc<Router>,
}

impl FrameSink {
    pub fn new(engine: Arc<SyncEngine>, router: Arc<Router>) -> Self {
        Self { engine, router }
    }
}

#[async_trait]
impl InboundSink for FrameSink {
    async fn deliver(
        &self,
        id: &str,
        conv_id: &str,
        from_device_id: &str,
        payload: &str,
    ) -> Result<(), TransportError> {
        let frame = match SyncFrame::from_bytes(payload.as_bytes()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(id, error = %err, "undecodable frame dropped");
                return Ok(());
            }
        };
        let Ok(peer) = self.engine.peer(conv_id) else {
            debug!(conv_id, "frame for unbound conversation dropped");
            return Ok(());
        };
        if peer.remote_device_id != from_device_id {
            warn!(conv_id, from = from_device_id, "frame from unexpected device dropped");
            return Ok(());
        }

        match self.engine.handle_frame(conv_id, frame).await {
            Ok(Some(reply)) => {
                let bytes = reply.to_bytes().map_err(|_| TransportError::Frame("reply encoding"))?;
                let req = SendRequest::new(
                    conv_id,
                    from_device_id,
                    String::from_utf8_lossy(&bytes).into_owned(),
                    peer.routing.clone(),
                );
                let router = self.router.clone();
                tokio::spawn(async move {
                    if let Err(err) = router.send_ciphertext(req, CancellationToken::new()).await {
                        warn!(error = %err, "queueing sync reply failed");
                    }
                });
            }
            Ok(None) => {}
            Err(err) => warn!(conv_id, error = %err, "sync frame rejected"),
        }
        Ok(())
    }
}
