//! Local key-share persistence.
//!
//! A completed keygen leaves one share per joint public key, stored as
//! `<home>/localstate-<pubkey>.json`. Keysign looks the share up by the pool
//! public key named in the request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use common::PartyId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::encoding::{base64_bytes, unix_secs};

#[derive(Debug, Error)]
pub enum ShareStoreError {
    #[error("invalid pool public key: {0}")]
    InvalidKey(String),

    #[error("key share i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("key share file is corrupt: {0}")]
    Corrupt(String),
}

/// Stored key share for persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKeyShare {
    /// Version for future compatibility
    pub version: u32,
    /// Hex-encoded joint public key
    pub pool_pub_key: String,
    /// Keygen participants, canonically sorted
    pub participants: Vec<PartyId>,
    /// Engine-specific share (base64 encoded)
    #[serde(with = "base64_bytes")]
    pub share: Vec<u8>,
    /// Timestamp when created (Unix seconds)
    pub created_at: u64,
}

impl StoredKeyShare {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(pool_pub_key: String, participants: Vec<PartyId>, share: Vec<u8>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            pool_pub_key,
            participants,
            share,
            created_at: unix_secs(),
        }
    }
}

/// Key-share store, optionally backed by a directory.
pub struct KeyShareStore {
    dir: Option<PathBuf>,
    cache: RwLock<HashMap<String, StoredKeyShare>>,
}

impl KeyShareStore {
    /// Store persisting under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Public keys are hex; anything else could escape the directory.
    fn validate_key(pool_pub_key: &str) -> Result<(), ShareStoreError> {
        if pool_pub_key.is_empty() || !pool_pub_key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ShareStoreError::InvalidKey(pool_pub_key.to_string()));
        }
        Ok(())
    }

    fn path_for(&self, pool_pub_key: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("localstate-{}.json", pool_pub_key)))
    }

    pub async fn save(&self, stored: StoredKeyShare) -> Result<(), ShareStoreError> {
        Self::validate_key(&stored.pool_pub_key)?;

        if let Some(path) = self.path_for(&stored.pool_pub_key) {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let data = serde_json::to_string_pretty(&stored)
                .map_err(|e| ShareStoreError::Corrupt(e.to_string()))?;
            tokio::fs::write(&path, data).await?;
            info!("Saved key share to {:?}", path);
        }

        self.cache
            .write()
            .await
            .insert(stored.pool_pub_key.clone(), stored);
        Ok(())
    }

    /// Look up the share for a pool public key.
    pub async fn load(&self, pool_pub_key: &str) -> Result<Option<StoredKeyShare>, ShareStoreError> {
        Self::validate_key(pool_pub_key)?;

        if let Some(stored) = self.cache.read().await.get(pool_pub_key) {
            return Ok(Some(stored.clone()));
        }

        let path = match self.path_for(pool_pub_key) {
            Some(path) => path,
            None => return Ok(None),
        };

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No key share at {:?}", path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let stored: StoredKeyShare =
            serde_json::from_str(&data).map_err(|e| ShareStoreError::Corrupt(e.to_string()))?;
        if stored.pool_pub_key != pool_pub_key {
            return Err(ShareStoreError::Corrupt(format!(
                "{:?} holds the share for {}",
                path, stored.pool_pub_key
            )));
        }
        if stored.version != StoredKeyShare::CURRENT_VERSION {
            warn!(
                "Key share version mismatch: got {}, expected {}",
                stored.version,
                StoredKeyShare::CURRENT_VERSION
            );
        }

        self.cache
            .write()
            .await
            .insert(pool_pub_key.to_string(), stored.clone());
        Ok(Some(stored))
    }

    /// Pool public keys with a share in the cache.
    pub async fn cached_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.cache.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share(key: &str) -> StoredKeyShare {
        StoredKeyShare::new(
            key.to_string(),
            vec!["p1".into(), "p2".into()],
            vec![1, 2, 3],
        )
    }

    #[tokio::test]
    async fn test_save_and_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyShareStore::new(dir.path());
        store.save(share("02abcdef")).await.unwrap();

        assert!(dir.path().join("localstate-02abcdef.json").exists());

        // A second store over the same directory finds it
        let reopened = KeyShareStore::new(dir.path());
        let loaded = reopened.load("02abcdef").await.unwrap().unwrap();
        assert_eq!(loaded.share, vec![1, 2, 3]);
        assert_eq!(loaded.participants.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_share_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyShareStore::new(dir.path());
        assert!(store.load("02ffff").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let store = KeyShareStore::in_memory();
        let err = store.load("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, ShareStoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = KeyShareStore::in_memory();
        store.save(share("03aa")).await.unwrap();
        assert!(store.load("03aa").await.unwrap().is_some());
        assert_eq!(store.cached_keys().await, vec!["03aa".to_string()]);
        assert!(store.dir().is_none());
    }
}
