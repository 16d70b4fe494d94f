use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use nkc_proto::PaddingMode;
use nkc_transport::NetworkConfig;
use serde::{Deserialize, Serialize};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "nkc";
pub const APP_NAME: &str = "node";
pub const SETTINGS_FILE: &str = "settings.json";
pub const DATABASE_FILE: &str = "vault.db";

pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSettings {
    pub network: NetworkConfig,
    /// Where inbound direct connections are accepted.
    pub listen_addr: String,
    pub socks_url: String,
    pub padding: PaddingMode,
    /// Vault inactivity timeout; 0 disables auto-lock.
    pub auto_lock_minutes: u64,
    pub scheduler_interval_secs: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            listen_addr: "127.0.0.1:7700".into(),
            socks_url: "socks5h://127.0.0.1:9050".into(),
            padding: PaddingMode::default(),
            auto_lock_minutes: 30,
            scheduler_interval_secs: 15,
        }
    }
}

impl NodeSettings {
    /// Missing file or missing fields fall back to defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(SETTINGS_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?).with_context(|| format!("write {}", path.display()))
    }

    pub fn auto_lock(&self) -> Option<std::time::Duration> {
        (self.auto_lock_minutes > 0).then(|| std::time::Duration::from_secs(self.auto_lock_minutes * 60))
    }
}
