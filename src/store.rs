//! Purchase secret storage.
//!
//! The opening of a commitment must outlive the process that placed the
//! order: checkout and retrieval may happen days apart. Secrets are keyed by
//! order id and erased on success or abandonment.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

use crate::market::OrderId;
use crate::proof::PurchaseSecret;

/// Storage failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No secret for this order.
    #[error("no purchase secret for order {0}")]
    NotFound(OrderId),

    /// Filesystem failure.
    #[error("secret store I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Stored file is not a secret.
    #[error("secret store decode: {0}")]
    Decode(#[from] serde_json::Error),

    /// Store lock was poisoned.
    #[error("secret store lock poisoned")]
    Poisoned,
}

/// Persists purchase secrets between checkout and retrieval.
pub trait SecretStore: Send + Sync {
    /// Save (or replace) the secret for an order.
    fn save(&self, order_id: &OrderId, secret: &PurchaseSecret) -> Result<(), StoreError>;

    /// Load the secret for an order.
    fn load(&self, order_id: &OrderId) -> Result<PurchaseSecret, StoreError>;

    /// Remove the secret. Removing a missing secret is not an error.
    fn erase(&self, order_id: &OrderId) -> Result<(), StoreError>;
}

// =============================================================================
// FILE STORE
// =============================================================================

/// One JSON file per order: `purchaseSecrets_<orderId>.json`.
#[derive(Clone, Debug)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    /// Store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the secrets.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, order_id: &OrderId) -> PathBuf {
        self.dir.join(format!("purchaseSecrets_{}.json", order_id.as_str()))
    }
}

impl SecretStore for FileSecretStore {
    fn save(&self, order_id: &OrderId, secret: &PurchaseSecret) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(order_id);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_vec_pretty(secret)?)?;
        fs::rename(&staging, &path)?;
        debug!(order = %order_id, "Purchase secret saved");
        Ok(())
    }

    fn load(&self, order_id: &OrderId) -> Result<PurchaseSecret, StoreError> {
        let path = self.path_for(order_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(order_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn erase(&self, order_id: &OrderId) -> Result<(), StoreError> {
        let path = self.path_for(order_id);
        match fs::metadata(&path) {
            Ok(meta) => {
                // Scrub contents before unlinking.
                if let Err(e) = fs::write(&path, vec![0u8; meta.len() as usize]) {
                    warn!(order = %order_id, error = %e, "Could not scrub secret file");
                }
                fs::remove_file(&path)?;
                debug!(order = %order_id, "Purchase secret erased");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Process-local store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<OrderId, PurchaseSecret>>,
}

impl MemorySecretStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a secret is held for the order.
    pub fn contains(&self, order_id: &OrderId) -> bool {
        self.secrets
            .lock()
            .map(|map| map.contains_key(order_id))
            .unwrap_or(false)
    }
}

impl SecretStore for MemorySecretStore {
    fn save(&self, order_id: &OrderId, secret: &PurchaseSecret) -> Result<(), StoreError> {
        let mut map = self.secrets.lock().map_err(|_| StoreError::Poisoned)?;
        map.insert(order_id.clone(), secret.clone());
        Ok(())
    }

    fn load(&self, order_id: &OrderId) -> Result<PurchaseSecret, StoreError> {
        let map = self.secrets.lock().map_err(|_| StoreError::Poisoned)?;
        map.get(order_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(order_id.clone()))
    }

    fn erase(&self, order_id: &OrderId) -> Result<(), StoreError> {
        let mut map = self.secrets.lock().map_err(|_| StoreError::Poisoned)?;
        map.remove(order_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CircuitHasher;
    use crate::crypto::SeededCrypto;

    fn secret() -> PurchaseSecret {
        let mut hasher = CircuitHasher::new().unwrap();
        let mut crypto = SeededCrypto::new(77);
        PurchaseSecret::generate(&mut hasher, &mut crypto, "5", 1200).unwrap()
    }

    fn order() -> OrderId {
        OrderId::parse("order-1").unwrap()
    }

    #[test]
    fn test_file_store_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path());
        let original = secret();

        store.save(&order(), &original).unwrap();
        assert!(dir.path().join("purchaseSecrets_order-1.json").exists());

        let loaded = store.load(&order()).unwrap();
        assert_eq!(loaded.commitment, original.commitment);
        assert_eq!(loaded.nonce().unwrap(), original.nonce().unwrap());

        store.erase(&order()).unwrap();
        assert!(matches!(store.load(&order()), Err(StoreError::NotFound(_))));
        store.erase(&order()).unwrap();
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("purchaseSecrets_order-1.json"), b"{}").unwrap();
        let store = FileSecretStore::new(dir.path());
        assert!(matches!(store.load(&order()), Err(StoreError::Decode(_))));
    }

    #[test]
    fn test_memory_store_lifecycle() {
        let store = MemorySecretStore::new();
        assert!(matches!(store.load(&order()), Err(StoreError::NotFound(_))));

        store.save(&order(), &secret()).unwrap();
        assert!(store.contains(&order()));

        store.erase(&order()).unwrap();
        assert!(!store.contains(&order()));
    }
}
