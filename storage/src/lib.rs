//! # Storage backends
//!
//! Configuration and unification for the blob storage backends.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

pub(crate) mod local;
pub(crate) mod memory;

#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, Persisted, Reader, StorageError, StorageErrorKind};

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep blobs in memory. Nothing survives a restart.
    Memory,

    /// Keep blobs in a local directory.
    Local {
        /// Root directory, defaults to the registry's image path.
        path: Option<Utf8PathBuf>,
    },
}

impl StorageConfig {
    /// Build the configured backend, using `default_root` for local storage
    /// without an explicit path.
    #[tracing::instrument]
    pub async fn build(self, default_root: &Utf8Path) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            StorageConfig::Local { path } => {
                let root = path.unwrap_or_else(|| default_root.to_owned());
                tokio::fs::create_dir_all(&root)
                    .await
                    .map_err(|err| StorageError::from_io("local", err).at(root.as_str()))?;
                LocalDriver::new(root).into()
            }
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cloneable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    pub fn name(&self) -> &str {
        self.driver.name()
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(remote).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(remote).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn persist(
        &self,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<Persisted, StorageError> {
        tracing::trace!(%remote, %local, "Persisting {local} as {remote}");
        self.driver.persist(local, remote).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn open(&self, remote: &Utf8Path) -> Result<Reader, StorageError> {
        self.driver.open(remote).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(remote).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn link(&self, target: &Utf8Path, alias: &Utf8Path) -> Result<(), StorageError> {
        self.driver.link(target, alias).await
    }
}
