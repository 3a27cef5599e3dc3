use std::io;

use camino::{Utf8Path, Utf8PathBuf};

use storage_driver::{
    check_remote, Driver, Metadata, Persisted, Reader, StorageError, StorageErrorKind,
};

const LOCAL: &str = "local";

/// Storage driver rooted in a local directory.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        check_remote(LOCAL, remote)?;
        Ok(self.root.join(remote))
    }

    async fn create_parent(&self, path: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error("create_dir_all", parent))?;
        }
        Ok(())
    }
}

fn io_error<'p>(
    context: &'static str,
    path: &'p Utf8Path,
) -> impl FnOnce(io::Error) -> StorageError + 'p {
    move |err| {
        StorageError::builder(LOCAL, StorageErrorKind::of_io(&err), err)
            .path(path.as_str())
            .context(context)
            .build()
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        LOCAL
    }

    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(io_error("metadata", &path))?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(io_error("created timestamp", &path))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn persist(
        &self,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<Persisted, StorageError> {
        let dest = self.path(remote)?;
        self.create_parent(&dest).await?;

        // A hard link never clobbers an existing destination, so two uploads
        // racing on the same digest cannot truncate each other's file.
        match tokio::fs::hard_link(local, &dest).await {
            Ok(()) => {
                tokio::fs::remove_file(local)
                    .await
                    .map_err(io_error("remove scratch file", local))?;
                Ok(Persisted::Created)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(%dest, "blob already present, discarding scratch file");
                tokio::fs::remove_file(local)
                    .await
                    .map_err(io_error("remove scratch file", local))?;
                Ok(Persisted::AlreadyPresent)
            }
            Err(err) => {
                // Hard links fail across devices; fall back to rename.
                tracing::trace!(%dest, error = %err, "hard link failed, renaming");
                if tokio::fs::try_exists(&dest)
                    .await
                    .map_err(io_error("try_exists", &dest))?
                {
                    tokio::fs::remove_file(local)
                        .await
                        .map_err(io_error("remove scratch file", local))?;
                    return Ok(Persisted::AlreadyPresent);
                }
                tokio::fs::rename(local, &dest)
                    .await
                    .map_err(io_error("rename into place", &dest))?;
                Ok(Persisted::Created)
            }
        }
    }

    async fn open(&self, remote: &Utf8Path) -> Result<Reader, StorageError> {
        let path = self.path(remote)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(io_error("open", &path))?;
        Ok(Box::pin(file))
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(remote)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(io_error("remove_file", &path))?;
        Ok(())
    }

    async fn link(&self, target: &Utf8Path, alias: &Utf8Path) -> Result<(), StorageError> {
        let target = self.path(target)?;
        let alias = self.path(alias)?;
        self.create_parent(&alias).await?;

        match tokio::fs::remove_file(&alias).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_error("remove stale link", &alias)(err)),
        }

        tokio::fs::symlink(&target, &alias)
            .await
            .map_err(io_error("symlink", &alias))?;
        Ok(())
    }
}
