use std::{fmt, ops::Deref, pin::Pin, sync::Arc};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for stored blob contents.
pub type Reader = Pin<Box<dyn io::AsyncRead + Send + 'static>>;

/// File object metadata, which will be generically provided by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the file in bytes.
    pub size: u64,

    /// The creation timestamp of the file.
    pub created: DateTime<Utc>,
}

/// Outcome of moving a scratch file into permanent storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    /// The scratch file now lives at the destination.
    Created,

    /// The destination already held a file; the scratch file was discarded
    /// and the existing file left untouched.
    AlreadyPresent,
}

/// A storage driver for content-addressed blobs.
///
/// Remote paths are relative to the driver's root. Drivers must refuse
/// paths which would escape that root.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Get the metadata for a stored file.
    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Check whether a stored file exists.
    async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(remote).await {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == StorageErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Move a local scratch file to `remote`.
    ///
    /// If `remote` already exists it is never overwritten: the scratch file is
    /// removed and [`Persisted::AlreadyPresent`] is returned.
    async fn persist(&self, local: &Utf8Path, remote: &Utf8Path)
        -> Result<Persisted, StorageError>;

    /// Open a stored file for streaming reads.
    async fn open(&self, remote: &Utf8Path) -> Result<Reader, StorageError>;

    /// Delete a stored file.
    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Point `alias` at the stored file `target`, replacing any previous alias.
    async fn link(&self, target: &Utf8Path, alias: &Utf8Path) -> Result<(), StorageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(remote).await
    }

    async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.deref().exists(remote).await
    }

    async fn persist(
        &self,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<Persisted, StorageError> {
        self.deref().persist(local, remote).await
    }

    async fn open(&self, remote: &Utf8Path) -> Result<Reader, StorageError> {
        self.deref().open(remote).await
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(remote).await
    }

    async fn link(&self, target: &Utf8Path, alias: &Utf8Path) -> Result<(), StorageError> {
        self.deref().link(target, alias).await
    }
}

/// Reject remote paths which are absolute or climb out of the driver root.
pub fn check_remote(engine: &'static str, remote: &Utf8Path) -> Result<(), StorageError> {
    let escapes = remote.is_absolute()
        || remote.components().any(|component| {
            !matches!(
                component,
                camino::Utf8Component::Normal(_) | camino::Utf8Component::CurDir
            )
        });

    if escapes || remote.as_str().is_empty() {
        return Err(StorageError::builder(
            engine,
            StorageErrorKind::InvalidPath,
            format!("path escapes storage root: {remote}"),
        )
        .path(remote.as_str())
        .build());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);

    #[test]
    fn remote_paths_stay_inside_root() {
        assert!(check_remote("test", Utf8Path::new("_imgs/a/b/sha256.ab.sif")).is_ok());
        assert!(check_remote("test", Utf8Path::new("./entity/c_latest.sif")).is_ok());

        for bad in ["../etc/passwd", "_imgs/../../x", "/etc/passwd", ""] {
            let err = check_remote("test", Utf8Path::new(bad)).unwrap_err();
            assert_eq!(err.kind(), StorageErrorKind::InvalidPath, "{bad}");
        }
    }
}
