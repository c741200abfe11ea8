//! Session credential persistence.
//!
//! The messaging network issues opaque session credentials at pairing time
//! and rotates them incrementally while the session is open. Losing a
//! rotation permanently strands the session (the account must be re-paired),
//! so every update is written through the store before the session
//! acknowledges it.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Current on-disk blob format version.
pub const CREDENTIALS_VERSION: u32 = 1;

/// Opaque session credentials for the single messaging account.
///
/// The contents are meaningful only to the gateway; the session layer treats
/// them as a versioned blob to load, persist, and hand back on reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Blob format version, for forward-compatible migration.
    pub version: u32,
    /// Stable device identity registered with the network at pairing time.
    pub device_id: String,
    /// Rotating session secret issued by the network.
    pub noise_key: String,
    /// When the device was first paired.
    pub paired_at: DateTime<Utc>,
}

/// Abstract persistence for session credentials.
///
/// Substitutable with a database, encrypted blob store, or filesystem
/// directory; the session layer only needs load/save/clear.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Load previously persisted credentials, if any.
    async fn load(&self) -> Result<Option<Credentials>, StoreError>;

    /// Persist credentials, replacing any prior blob. Must be durable before
    /// returning: the caller treats a success as an acknowledgment.
    async fn save(&self, credentials: &Credentials) -> Result<(), StoreError>;

    /// Remove persisted credentials (explicit logout).
    async fn clear(&self) -> Result<(), StoreError>;
}

/// Filesystem-backed credential store: one JSON blob in a directory.
///
/// Writes go through a temp file followed by an atomic rename so a crash
/// mid-write never leaves a truncated blob behind.
pub struct FsCredentialStore {
    path: PathBuf,
}

impl FsCredentialStore {
    const FILE_NAME: &'static str = "session.json";
    const TMP_NAME: &'static str = "session.json.tmp";

    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().to_path_buf(),
        }
    }

    fn blob_path(&self) -> PathBuf {
        self.path.join(Self::FILE_NAME)
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.join(Self::TMP_NAME)
    }
}

#[async_trait]
impl CredentialStore for FsCredentialStore {
    #[instrument(skip_all)]
    async fn load(&self) -> Result<Option<Credentials>, StoreError> {
        match tokio::fs::read(self.blob_path()).await {
            Ok(bytes) => {
                let credentials = serde_json::from_slice(&bytes)?;
                debug!("loaded persisted session credentials");
                Ok(Some(credentials))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    #[instrument(skip_all)]
    async fn save(&self, credentials: &Credentials) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.path).await?;
        let bytes = serde_json::to_vec_pretty(credentials)?;
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, self.blob_path()).await?;
        debug!("persisted session credentials");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.blob_path()).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl<S: CredentialStore + ?Sized> CredentialStore for std::sync::Arc<S> {
    async fn load(&self) -> Result<Option<Credentials>, StoreError> {
        (**self).load().await
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), StoreError> {
        (**self).save(credentials).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        (**self).clear().await
    }
}

/// In-memory credential store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            slot: Mutex::new(Some(credentials)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>, StoreError> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), StoreError> {
        *self.slot.lock().await = Some(credentials.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.slot.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_credentials() -> Credentials {
        Credentials {
            version: CREDENTIALS_VERSION,
            device_id: "device-17".into(),
            noise_key: "a1b2c3d4".into(),
            paired_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fs_store_round_trips_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCredentialStore::new(dir.path());

        let credentials = sample_credentials();
        store.save(&credentials).await.unwrap();

        // A fresh store instance over the same directory simulates a process
        // restart.
        let reopened = FsCredentialStore::new(dir.path());
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded, Some(credentials));
    }

    #[tokio::test]
    async fn fs_store_load_on_empty_dir_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCredentialStore::new(dir.path());
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn fs_store_clear_removes_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCredentialStore::new(dir.path());

        store.save(&sample_credentials()).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);

        // Clearing again is a no-op, not an error.
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn fs_store_save_overwrites_previous_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCredentialStore::new(dir.path());

        let first = sample_credentials();
        store.save(&first).await.unwrap();

        let mut rotated = first.clone();
        rotated.noise_key = "rotated".into();
        store.save(&rotated).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(rotated));
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryCredentialStore::new();
        assert_eq!(store.load().await.unwrap(), None);

        let credentials = sample_credentials();
        store.save(&credentials).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(credentials));

        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }
}
