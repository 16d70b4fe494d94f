//! Vault session: the in-memory vault key.
//!
//! The session holds the 32-byte vault key while the app is unlocked. On
//! `lock()` (or when the inactivity timer expires) the key is dropped and
//! zeroized. Every read path goes through [`VaultSession::with_key`], which
//! fails with `VaultLocked` instead of silently doing nothing.
//!
//! There is no global: the application owns one session and hands out
//! clones (they share state).

use std::sync::Arc;
use std::time::{Duration, Instant};

use nkc_crypto::kdf::VaultKey;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::StoreError;

/// Default inactivity timeout.
pub const DEFAULT_AUTO_LOCK: Duration = Duration::from_secs(30 * 60);

struct VaultInner {
    key: VaultKey,
    last_activity: Instant,
}

#[derive(Clone)]
pub struct VaultSession {
    inner: Arc<RwLock<Option<VaultInner>>>,
    auto_lock: Arc<RwLock<Option<Duration>>>,
}

impl VaultSession {
    pub fn new() -> Self {
        Self::with_auto_lock(Some(DEFAULT_AUTO_LOCK))
    }

    /// `None` disables auto-lock.
    pub fn with_auto_lock(timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            auto_lock: Arc::new(RwLock::new(timeout)),
        }
    }

    /// Install a derived key. Replaces (and zeroizes) any previous key.
    pub async fn unlock_with_key(&self, key: VaultKey) {
        let key_id = key.key_id();
        let mut guard = self.inner.write().await;
        *guard = Some(VaultInner {
            key,
            last_activity: Instant::now(),
        });
        info!(key_id = %key_id, "vault unlocked");
    }

    pub async fn lock(&self) {
        let mut guard = self.inner.write().await;
        if guard.take().is_some() {
            info!("vault locked");
        }
    }

    pub async fn is_locked(&self) -> bool {
        let timeout = *self.auto_lock.read().await;
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(inner) => {
                if timeout.is_some_and(|t| inner.last_activity.elapsed() > t) {
                    drop(guard);
                    info!("vault auto-lock after inactivity");
                    self.lock().await;
                    return true;
                }
                false
            }
            None => true,
        }
    }

    pub async fn set_auto_lock(&self, timeout: Option<Duration>) {
        *self.auto_lock.write().await = timeout;
    }

    /// Reset the inactivity timer.
    pub async fn touch(&self) {
        if let Some(inner) = self.inner.write().await.as_mut() {
            inner.last_activity = Instant::now();
        }
    }

    /// Run `f` with the vault key. Fails when locked or expired; touches the
    /// activity timer otherwise.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&VaultKey) -> Result<R, StoreError>,
    {
        if self.is_locked().await {
            return Err(StoreError::VaultLocked);
        }
        let mut guard = self.inner.write().await;
        match guard.as_mut() {
            Some(inner) => {
                inner.last_activity = Instant::now();
                f(&inner.key)
            }
            None => Err(StoreError::VaultLocked),
        }
    }

    /// Id of the active key, if unlocked.
    pub async fn key_id(&self) -> Option<String> {
        self.inner.read().await.as_ref().map(|i| i.key.key_id())
    }

    /// Remaining time before auto-lock. `None` when locked.
    pub async fn time_until_lock(&self) -> Option<Duration> {
        let timeout = *self.auto_lock.read().await;
        let guard = self.inner.read().await;
        guard.as_ref().map(|inner| match timeout {
            Some(t) => t.saturating_sub(inner.last_activity.elapsed()),
            None => Duration::MAX,
        })
    }
}

impl Default for VaultSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locked_session_refuses_key_access() {
        let vault = VaultSession::new();
        let res = vault.with_key(|_| Ok(())).await;
        assert!(matches!(res, Err(StoreError::VaultLocked)));
    }

    #[tokio::test]
    async fn unlock_then_lock() {
        let vault = VaultSession::new();
        vault.unlock_with_key(VaultKey::from_bytes([1u8; 32])).await;
        assert!(!vault.is_locked().await);
        let id = vault.with_key(|k| Ok(k.key_id())).await.unwrap();
        assert_eq!(Some(id), vault.key_id().await);

        vault.lock().await;
        assert!(vault.is_locked().await);
        assert!(vault.key_id().await.is_none());
    }

    #[tokio::test]
    async fn auto_lock_expires_key() {
        let vault = VaultSession::with_auto_lock(Some(Duration::from_millis(20)));
        vault.unlock_with_key(VaultKey::from_bytes([1u8; 32])).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            vault.with_key(|_| Ok(())).await,
            Err(StoreError::VaultLocked)
        ));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = VaultSession::with_auto_lock(None);
        let b = a.clone();
        a.unlock_with_key(VaultKey::from_bytes([2u8; 32])).await;
        assert!(!b.is_locked().await);
        b.lock().await;
        assert!(a.is_locked().await);
    }
}
