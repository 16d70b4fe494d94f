//! Platform keystore for device private keys.
//!
//! Identity and DH secrets live in the OS credential store, not in the
//! database. Values are base64-encoded because keyring entries are strings.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyring::Entry;
use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::error::StoreError;

pub const IDENTITY_KEY_NAME: &str = "identity_secret";
pub const DH_KEY_NAME: &str = "dh_secret";

pub trait Keystore: Send + Sync {
    /// Whether the backing store can be used at all on this platform.
    fn is_available(&self) -> bool;

    fn get(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError>;

    fn set(&self, name: &str, secret: &[u8]) -> Result<(), StoreError>;

    fn remove(&self, name: &str) -> Result<(), StoreError>;
}

/// OS credential store (Keychain, Secret Service, Windows Credential Manager).
pub struct OsKeystore {
    service: String,
    account_prefix: String,
}

impl OsKeystore {
    pub fn new(service: &str, device_id: &str) -> Self {
        Self {
            service: service.to_string(),
            account_prefix: device_id.to_string(),
        }
    }

    fn entry(&self, name: &str) -> Result<Entry, StoreError> {
        Entry::new(&self.service, &format!("{}:{}", self.account_prefix, name))
            .map_err(|e| StoreError::KeystoreUnavailable(format!("keyring init: {e}")))
    }
}

impl Keystore for OsKeystore {
    fn is_available(&self) -> bool {
        match self.entry("availability") {
            Ok(entry) => matches!(entry.get_password(), Ok(_) | Err(keyring::Error::NoEntry)),
            Err(_) => false,
        }
    }

    fn get(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        let encoded = match self.entry(name)?.get_password() {
            Ok(v) => Zeroizing::new(v),
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(StoreError::KeystoreUnavailable(format!("load {name}: {e}"))),
        };
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|_| StoreError::KeystoreUnavailable(format!("entry {name} is not base64")))?;
        Ok(Some(Zeroizing::new(bytes)))
    }

    fn set(&self, name: &str, secret: &[u8]) -> Result<(), StoreError> {
        let encoded = Zeroizing::new(STANDARD.encode(secret));
        self.entry(name)?
            .set_password(&encoded)
            .map_err(|e| StoreError::KeystoreUnavailable(format!("store {name}: {e}")))
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        match self.entry(name)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::KeystoreUnavailable(format!("delete {name}: {e}"))),
        }
    }
}

/// Process-local keystore for tests and headless runs.
#[derive(Default)]
pub struct MemoryKeystore {
    entries: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
    unavailable: bool,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A keystore that reports itself unavailable and fails every call.
    pub fn unavailable() -> Self {
        Self {
            entries: Mutex::default(),
            unavailable: true,
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::KeystoreUnavailable("memory keystore disabled".into()));
        }
        Ok(())
    }
}

impl Keystore for MemoryKeystore {
    fn is_available(&self) -> bool {
        !self.unavailable
    }

    fn get(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        self.check()?;
        Ok(self.entries.lock().get(name).cloned())
    }

    fn set(&self, name: &str, secret: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.entries
            .lock()
            .insert(name.to_string(), Zeroizing::new(secret.to_vec()));
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries.lock().remove(name);
        Ok(())
    }
}
