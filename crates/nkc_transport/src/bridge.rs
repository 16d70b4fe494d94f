//! Onion-network bridge contract.
//!
//! Process install and lifecycle live outside this crate; the router only
//! needs the status shape and the SOCKS endpoint it reports.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::OnionProvider;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Stopped,
    Starting,
    Running,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub state: BridgeState,
    #[serde(default)]
    pub socks_url: Option<String>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BridgeStatus {
    /// `host:port` of the SOCKS proxy, if the bridge is up.
    pub fn socks_addr(&self) -> Result<String, TransportError> {
        if self.state != BridgeState::Running {
            return Err(TransportError::Bridge(
                self.error
                    .clone()
                    .unwrap_or_else(|| format!("bridge is {:?}", self.state).to_lowercase()),
            ));
        }
        let url = self
            .socks_url
            .as_deref()
            .ok_or_else(|| TransportError::Bridge("bridge reported no SOCKS endpoint".into()))?;
        let addr = url
            .strip_prefix("socks5h://")
            .or_else(|| url.strip_prefix("socks5://"))
            .unwrap_or(url);
        Ok(addr.trim_end_matches('/').to_string())
    }
}

#[async_trait]
pub trait OnionBridge: Send + Sync {
    async fn start(&self) -> Result<BridgeStatus, TransportError>;
    async fn stop(&self) -> Result<(), TransportError>;
    async fn status(&self) -> BridgeStatus;
}

/// A proxy that is already running on this machine (system Tor or Lokinet).
pub struct ExternalProxyBridge {
    provider: OnionProvider,
    socks_url: String,
    state: Mutex<BridgeState>,
}

impl ExternalProxyBridge {
    pub fn new(provider: OnionProvider, socks_url: impl Into<String>) -> Self {
        Self {
            provider,
            socks_url: socks_url.into(),
            state: Mutex::new(BridgeState::Stopped),
        }
    }
}

#[async_trait]
impl OnionBridge for ExternalProxyBridge {
    async fn start(&self) -> Result<BridgeStatus, TransportError> {
        *self.state.lock() = BridgeState::Running;
        info!(provider = ?self.provider, socks_url = %self.socks_url, "onion bridge attached");
        Ok(self.status().await)
    }

    async fn stop(&self) -> Result<(), TransportError> {
        *self.state.lock() = BridgeState::Stopped;
        Ok(())
    }

    async fn status(&self) -> BridgeStatus {
        BridgeStatus {
            state: *self.state.lock(),
            socks_url: Some(self.socks_url.clone()),
            data_dir: None,
            error: None,
        }
    }
}
