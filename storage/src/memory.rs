use std::collections::HashMap;
use std::io::Cursor;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use storage_driver::{
    check_remote, Driver, Metadata, Persisted, Reader, StorageError, StorageErrorKind,
};

const MEMORY: &str = "memory";

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

#[derive(Debug, Default)]
struct Files {
    items: HashMap<Utf8PathBuf, MemoryFileItem>,
    aliases: HashMap<Utf8PathBuf, Utf8PathBuf>,
}

impl Files {
    fn resolve<'p>(&'p self, remote: &'p Utf8Path) -> &'p Utf8Path {
        self.aliases
            .get(remote)
            .map(|target| target.as_path())
            .unwrap_or(remote)
    }

    fn get(&self, remote: &Utf8Path) -> Result<&MemoryFileItem, StorageError> {
        self.items.get(self.resolve(remote)).ok_or_else(|| {
            StorageError::builder(
                MEMORY,
                StorageErrorKind::NotFound,
                format!("Path not found: {remote}"),
            )
            .path(remote.as_str())
            .build()
        })
    }
}

/// Storage driver that keeps blobs in memory.
///
/// Scratch files are still read from the local filesystem when persisted.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RwLock<Files>,
}

impl MemoryStorage {
    /// Create a new, empty `MemoryStorage`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs, not counting aliases.
    pub async fn len(&self) -> usize {
        self.files.read().await.items.len()
    }

    /// Whether no blobs are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        MEMORY
    }

    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        check_remote(MEMORY, remote)?;
        let files = self.files.read().await;
        Ok(files.get(remote)?.into())
    }

    async fn persist(
        &self,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<Persisted, StorageError> {
        check_remote(MEMORY, remote)?;
        let data = tokio::fs::read(local)
            .await
            .map_err(|err| StorageError::from_io(MEMORY, err).at(local.as_str()))?;

        let outcome = {
            let mut files = self.files.write().await;
            if files.items.contains_key(remote) {
                Persisted::AlreadyPresent
            } else {
                files.items.insert(remote.to_owned(), data.into());
                Persisted::Created
            }
        };

        tokio::fs::remove_file(local)
            .await
            .map_err(|err| StorageError::from_io(MEMORY, err).at(local.as_str()))?;
        Ok(outcome)
    }

    async fn open(&self, remote: &Utf8Path) -> Result<Reader, StorageError> {
        check_remote(MEMORY, remote)?;
        let files = self.files.read().await;
        let data = files.get(remote)?.data.clone();
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        check_remote(MEMORY, remote)?;
        let mut files = self.files.write().await;
        files.items.remove(remote).ok_or_else(|| {
            StorageError::builder(
                MEMORY,
                StorageErrorKind::NotFound,
                format!("Path not found: {remote}"),
            )
            .path(remote.as_str())
            .build()
        })?;
        Ok(())
    }

    async fn link(&self, target: &Utf8Path, alias: &Utf8Path) -> Result<(), StorageError> {
        check_remote(MEMORY, target)?;
        check_remote(MEMORY, alias)?;
        let mut files = self.files.write().await;
        files.aliases.insert(alias.to_owned(), target.to_owned());
        Ok(())
    }
}
