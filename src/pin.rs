//! PIN authority.
//!
//! Owns the single shared secret gating whitelist additions. The PIN is
//! unset on first run, set once with no previous value, and thereafter
//! only changeable by presenting the current value. Only a SHA-256 digest
//! of the PIN is held in memory and persisted.

use std::sync::{Arc, Mutex};

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::config::MissingStatePolicy;
use crate::error::{CoreError, Result};
use crate::storage::Storage;

const PIN_STORAGE_KEY: &str = "__pin";

pub struct PinAuthority {
    digest: Mutex<Option<String>>,
    storage: Arc<dyn Storage>,
}

impl PinAuthority {
    /// Load the persisted PIN digest.
    ///
    /// With [`MissingStatePolicy::Fail`], a missing blob is reported as
    /// [`CoreError::Load`]; with [`MissingStatePolicy::InitEmpty`] the
    /// authority starts unset and seeds the storage key.
    pub fn init(storage: Arc<dyn Storage>, on_missing: MissingStatePolicy) -> Result<Self> {
        let digest = match storage.get(PIN_STORAGE_KEY)? {
            Some(serde_json::Value::String(digest)) => {
                tracing::debug!("loaded pin from storage using key={}", PIN_STORAGE_KEY);
                Some(digest)
            }
            Some(serde_json::Value::Null) => None,
            Some(other) => {
                return Err(CoreError::InvalidArgument(format!(
                    "unexpected pin blob: {other}"
                )));
            }
            None => match on_missing {
                MissingStatePolicy::Fail => {
                    return Err(CoreError::Load(PIN_STORAGE_KEY.to_string()));
                }
                MissingStatePolicy::InitEmpty => {
                    storage.set(PIN_STORAGE_KEY, json!(null))?;
                    None
                }
            },
        };

        Ok(Self {
            digest: Mutex::new(digest),
            storage,
        })
    }

    pub fn is_set(&self) -> bool {
        self.digest.lock().unwrap().is_some()
    }

    /// Check a candidate PIN. Always false while unset.
    pub fn check(&self, candidate: &str) -> bool {
        let digest = self.digest.lock().unwrap();
        match digest.as_deref() {
            Some(stored) => stored == hash_pin(candidate),
            None => false,
        }
    }

    /// Set or rotate the PIN. When a PIN is already set, `old_pin` must
    /// match it; the first set requires no previous value.
    pub fn update(&self, old_pin: Option<&str>, new_pin: &str) -> Result<()> {
        let mut digest = self.digest.lock().unwrap();
        if let Some(stored) = digest.as_deref() {
            let presented = old_pin.map(hash_pin);
            if presented.as_deref() != Some(stored) {
                return Err(CoreError::IncorrectPin);
            }
        }
        let new_digest = hash_pin(new_pin);
        *digest = Some(new_digest.clone());
        self.storage.set(PIN_STORAGE_KEY, json!(new_digest))?;
        tracing::info!("pin updated");
        Ok(())
    }
}

fn hash_pin(pin: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pin.as_bytes());
    let result = hasher.finalize();
    format!("sha256:{}", hex::encode(&result))
}

// Helper module for hex encoding
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn fresh() -> PinAuthority {
        PinAuthority::init(Arc::new(MemoryStorage::new()), MissingStatePolicy::InitEmpty).unwrap()
    }

    #[test]
    fn starts_unset_under_init_empty() {
        let pin = fresh();
        assert!(!pin.is_set());
        assert!(!pin.check("1234"));
    }

    #[test]
    fn missing_blob_fails_under_fail_policy() {
        let result = PinAuthority::init(Arc::new(MemoryStorage::new()), MissingStatePolicy::Fail);
        assert!(matches!(result, Err(CoreError::Load(_))));
    }

    #[test]
    fn first_set_requires_no_old_pin() {
        let pin = fresh();
        pin.update(None, "1234").unwrap();
        assert!(pin.is_set());
        assert!(pin.check("1234"));
        assert!(!pin.check("0000"));
    }

    #[test]
    fn rotation_requires_the_current_pin() {
        let pin = fresh();
        pin.update(None, "1234").unwrap();

        assert!(matches!(
            pin.update(Some("0000"), "5678"),
            Err(CoreError::IncorrectPin)
        ));
        assert!(matches!(
            pin.update(None, "5678"),
            Err(CoreError::IncorrectPin)
        ));
        assert!(pin.check("1234"));

        pin.update(Some("1234"), "5678").unwrap();
        assert!(pin.check("5678"));
        assert!(!pin.check("1234"));
    }

    #[test]
    fn persists_a_digest_not_the_plaintext() {
        let storage = Arc::new(MemoryStorage::new());
        let pin =
            PinAuthority::init(storage.clone(), MissingStatePolicy::InitEmpty).unwrap();
        pin.update(None, "1234").unwrap();

        let blob = storage.get("__pin").unwrap().unwrap();
        let stored = blob.as_str().unwrap();
        assert!(stored.starts_with("sha256:"));
        assert!(!stored.contains("1234"));
    }

    #[test]
    fn restores_from_storage_across_restarts() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let pin =
                PinAuthority::init(storage.clone(), MissingStatePolicy::InitEmpty).unwrap();
            pin.update(None, "1234").unwrap();
        }

        let pin = PinAuthority::init(storage, MissingStatePolicy::Fail).unwrap();
        assert!(pin.is_set());
        assert!(pin.check("1234"));
    }

    #[test]
    fn seeded_null_blob_reads_back_as_unset() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let _ = PinAuthority::init(storage.clone(), MissingStatePolicy::InitEmpty).unwrap();
        }
        // The seed write means a later Fail-policy init finds a blob.
        let pin = PinAuthority::init(storage, MissingStatePolicy::Fail).unwrap();
        assert!(!pin.is_set());
    }
}
