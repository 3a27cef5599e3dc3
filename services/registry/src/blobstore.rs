//! Content addressed blob layout.
//!
//! Permanent blobs live at `_imgs/<shard>/sha256.<hex>.sif` relative to the
//! storage root, where the shard is one directory per leading hex character.
//! Uploads are written to a local scratch area first and moved into place
//! once their digest is known.

use camino::{Utf8Path, Utf8PathBuf};
use storage::{Persisted, Reader, Storage};

use crate::config::RegistryConfig;
use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::model::ContainerId;
use crate::store::ImageRepo;

const BLOB_ROOT: &str = "_imgs";

/// Blob storage for the registry.
#[derive(Debug, Clone)]
pub struct BlobStore {
    storage: Storage,
    scratch: Utf8PathBuf,
    hash_level: usize,
}

impl BlobStore {
    /// Create the scratch area and wrap `storage`.
    pub async fn new(storage: Storage, config: &RegistryConfig) -> RegistryResult<Self> {
        let scratch = config.scratch_dir();
        tokio::fs::create_dir_all(&scratch).await?;
        Ok(Self {
            storage,
            scratch,
            hash_level: config.image_path_hash_level.min(64),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Permanent location of a blob, relative to the storage root.
    pub fn blob_path(&self, digest: &Digest) -> Utf8PathBuf {
        let mut path = Utf8PathBuf::from(BLOB_ROOT);
        for shard in digest.hex().chars().take(self.hash_level) {
            path.push(shard.to_string());
        }
        path.push(format!("{digest}.sif"));
        path
    }

    /// Allocate an empty scratch file.
    ///
    /// The file is kept on disk: upload sessions outlive the request that
    /// opened them and clean up through [`BlobStore::discard`].
    #[tracing::instrument(skip(self))]
    pub async fn begin_temp(&self, container: ContainerId) -> RegistryResult<Utf8PathBuf> {
        let file = tempfile::Builder::new()
            .prefix(&format!("{container}-"))
            .tempfile_in(&self.scratch)?;
        let path = file.into_temp_path().keep().map_err(|err| err.error)?;
        let path = utf8(path)?;
        tracing::trace!(%path, "allocated scratch file");
        Ok(path)
    }

    /// Allocate a scratch directory for the chunks of a multipart upload.
    #[tracing::instrument(skip(self))]
    pub async fn begin_temp_dir(&self, container: ContainerId) -> RegistryResult<Utf8PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{container}-"))
            .suffix(".d")
            .tempdir_in(&self.scratch)?;
        utf8(dir.keep())
    }

    /// Move a verified scratch file to its permanent path.
    ///
    /// When the blob is already stored the scratch file is discarded and the
    /// existing location reused.
    #[tracing::instrument(skip(self))]
    pub async fn finalize(&self, temp: &Utf8Path, digest: &Digest) -> RegistryResult<Utf8PathBuf> {
        let location = self.blob_path(digest);
        match self.storage.persist(temp, &location).await? {
            Persisted::Created => tracing::debug!(%location, "stored new blob"),
            Persisted::AlreadyPresent => tracing::debug!(%location, "blob already stored"),
        }
        Ok(location)
    }

    /// Delete the blob at `location` unless an image row still references it.
    ///
    /// Returns whether the file was removed.
    #[tracing::instrument(skip(self, images))]
    pub async fn remove_if_unreferenced<I>(
        &self,
        images: &I,
        location: &Utf8Path,
    ) -> RegistryResult<bool>
    where
        I: ImageRepo + ?Sized,
    {
        if images.location_in_use(location).await? {
            tracing::debug!(%location, "blob still referenced");
            return Ok(false);
        }

        match self.storage.delete(location).await {
            Ok(()) => Ok(true),
            Err(error) if error.is_not_found() => {
                tracing::warn!(%location, "blob already gone");
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }

    pub async fn open(&self, location: &Utf8Path) -> RegistryResult<Reader> {
        Ok(self.storage.open(location).await?)
    }

    pub async fn exists(&self, location: &Utf8Path) -> RegistryResult<bool> {
        Ok(self.storage.exists(location).await?)
    }

    /// Point a legacy pull-by-path alias at a stored blob.
    pub async fn link(&self, location: &Utf8Path, alias: &Utf8Path) -> RegistryResult<()> {
        Ok(self.storage.link(location, alias).await?)
    }

    /// Remove scratch data, file or directory. Failures are logged only.
    pub async fn discard(&self, path: &Utf8Path) {
        let result = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            tracing::warn!(%path, %error, "failed to discard scratch data");
        }
    }
}

fn utf8(path: std::path::PathBuf) -> RegistryResult<Utf8PathBuf> {
    Utf8PathBuf::try_from(path).map_err(|err| err.into_io_error().into())
}

#[cfg(test)]
mod tests {
    use storage::LocalDriver;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::model::Image;
    use crate::store::MemoryMetadata;

    async fn local_store(root: &Utf8Path) -> BlobStore {
        let config = RegistryConfig {
            image_path: root.to_owned(),
            ..Default::default()
        };
        BlobStore::new(LocalDriver::new(root.to_owned()).into(), &config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sharded_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let blobs = local_store(root).await;
        let digest = Digest::of(b"");
        assert_eq!(
            blobs.blob_path(&digest),
            Utf8PathBuf::from(format!("_imgs/e/3/sha256.{}.sif", digest.hex()))
        );
    }

    #[tokio::test]
    async fn finalize_deduplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let blobs = local_store(root).await;
        let container = ContainerId::new();
        let digest = Digest::of(b"sif data");

        let first = blobs.begin_temp(container).await.unwrap();
        tokio::fs::write(&first, b"sif data").await.unwrap();
        let location = blobs.finalize(&first, &digest).await.unwrap();

        let second = blobs.begin_temp(container).await.unwrap();
        tokio::fs::write(&second, b"sif data").await.unwrap();
        let again = blobs.finalize(&second, &digest).await.unwrap();

        assert_eq!(location, again);
        assert!(!first.exists());
        assert!(!second.exists());

        let mut data = Vec::new();
        blobs
            .open(&location)
            .await
            .unwrap()
            .read_to_end(&mut data)
            .await
            .unwrap();
        assert_eq!(data, b"sif data");
    }

    #[tokio::test]
    async fn removal_respects_references() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let blobs = local_store(root).await;
        let images = MemoryMetadata::new();
        let digest = Digest::of(b"x");

        let temp = blobs.begin_temp(ContainerId::new()).await.unwrap();
        tokio::fs::write(&temp, b"x").await.unwrap();
        let location = blobs.finalize(&temp, &digest).await.unwrap();

        let mut image = Image::new(ContainerId::new(), digest, None);
        image.location = Some(location.clone());
        images.create_image(&image).await.unwrap();

        assert!(!blobs
            .remove_if_unreferenced(&images, &location)
            .await
            .unwrap());
        assert!(blobs.exists(&location).await.unwrap());

        images.delete_image(image.id).await.unwrap();
        assert!(blobs
            .remove_if_unreferenced(&images, &location)
            .await
            .unwrap());
        assert!(!blobs
            .remove_if_unreferenced(&images, &location)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn scratch_is_allocated_under_tmp() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let blobs = local_store(root).await;
        let container = ContainerId::new();

        let file = blobs.begin_temp(container).await.unwrap();
        let dir = blobs.begin_temp_dir(container).await.unwrap();
        for path in [&file, &dir] {
            assert!(path.exists());
            assert_eq!(path.parent().unwrap(), root.join("_tmp"));
            assert!(path.file_name().unwrap().starts_with(&container.to_string()));
        }
        assert!(dir.is_dir());
        assert_ne!(file, blobs.begin_temp(container).await.unwrap());
    }

    #[tokio::test]
    async fn discard_handles_dirs_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let blobs = local_store(root).await;

        let dir = blobs.begin_temp_dir(ContainerId::new()).await.unwrap();
        tokio::fs::write(dir.join("1"), b"part").await.unwrap();
        blobs.discard(&dir).await;
        assert!(!dir.exists());
        blobs.discard(&dir).await;
    }
}
