//! Upload sessions.
//!
//! ```text
//! initialized -> uploading -> uploaded -> completed
//!       \             \           \
//!        `-------------`-----------`--> failed
//! ```
//!
//! A `multipart` session coordinates `multipart_chunk` children, each moving
//! from `initialized` to `uploaded` on its own. Completing the parent joins
//! the chunks by part number and verifies the joined digest.

use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::blobstore::BlobStore;
use crate::config::RegistryConfig;
use crate::digest::{hash_file, Digest, Hasher};
use crate::error::{RegistryError, RegistryResult};
use crate::model::{
    Container, ContainerId, Image, ImageId, UploadId, UploadKind, UploadSession, UploadState,
};
use crate::quota::QuotaGuard;
use crate::store::{MetadataStore, StoreError};
use crate::tags::TagResolver;

const COPY_BUFFER: usize = 64 * 1024;

/// Parameters for a new top level upload.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub container: ContainerId,
    /// Image the bytes are for. OCI blob uploads only learn it on completion.
    pub image: Option<ImageId>,
    pub kind: UploadKind,
    pub size: Option<u64>,
    pub sha256sum: Option<Digest>,
    pub md5sum: Option<String>,
    /// Overrides the part count derived from `size` for multipart uploads.
    pub total_parts: Option<u32>,
    pub owner: Option<String>,
}

impl NewUpload {
    pub fn single(container: ContainerId, image: Option<ImageId>) -> Self {
        Self {
            container,
            image,
            kind: UploadKind::Single,
            size: None,
            sha256sum: None,
            md5sum: None,
            total_parts: None,
            owner: None,
        }
    }

    pub fn multipart(container: ContainerId, image: ImageId, size: u64) -> Self {
        Self {
            kind: UploadKind::Multipart,
            size: Some(size),
            ..Self::single(container, Some(image))
        }
    }
}

/// Drives upload sessions through their states.
#[derive(Debug, Clone)]
pub struct Uploads {
    store: Arc<dyn MetadataStore>,
    blobs: BlobStore,
    quota: QuotaGuard,
    tags: TagResolver,
    config: Arc<RegistryConfig>,
}

fn not_acceptable(message: impl Into<String>) -> RegistryError {
    RegistryError::NotAcceptable(message.into())
}

impl Uploads {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: BlobStore,
        quota: QuotaGuard,
        tags: TagResolver,
        config: Arc<RegistryConfig>,
    ) -> Self {
        Self {
            store,
            blobs,
            quota,
            tags,
            config,
        }
    }

    /// Number of parts a multipart upload of `size` bytes is split into.
    pub fn total_parts(&self, size: u64) -> u32 {
        let chunk = self.config.multipart_upload_chunk.max(1);
        u32::try_from(size.div_ceil(chunk)).unwrap_or(u32::MAX).max(1)
    }

    pub async fn get(&self, id: UploadId) -> RegistryResult<UploadSession> {
        self.store
            .get_upload(id)
            .await?
            .ok_or_else(|| RegistryError::UploadNotFound(id.to_string()))
    }

    async fn image(&self, id: ImageId) -> RegistryResult<Image> {
        self.store
            .get_image(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("image {id}")))
    }

    async fn set_image_state(&self, id: Option<ImageId>, state: UploadState) -> RegistryResult<()> {
        let Some(id) = id else {
            return Ok(());
        };
        let mut image = self.image(id).await?;
        image.upload_state = state;
        image.updated_at = Utc::now();
        self.store.update_image(&image).await?;
        Ok(())
    }

    /// Expired or terminal sessions accept nothing.
    fn ensure_active(session: &UploadSession) -> RegistryResult<()> {
        if session.is_expired(Utc::now()) {
            return Err(not_acceptable(format!("upload {} expired", session.id)));
        }
        match session.state {
            UploadState::Completed => Err(not_acceptable(format!(
                "upload {} already completed",
                session.id
            ))),
            UploadState::Failed => Err(not_acceptable(format!("upload {} failed", session.id))),
            _ => Ok(()),
        }
    }

    /// Register a session and allocate its scratch storage.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, new: NewUpload) -> RegistryResult<UploadSession> {
        let total_parts = match new.kind {
            UploadKind::Single => None,
            UploadKind::Multipart => Some(
                new.total_parts
                    .unwrap_or_else(|| self.total_parts(new.size.unwrap_or(0))),
            ),
            UploadKind::MultipartChunk => {
                return Err(RegistryError::InvalidRequest(
                    "chunks are started through their parent".into(),
                ));
            }
        };

        if let Some(image_id) = new.image {
            let image = self.image(image_id).await?;
            if image.is_completed() {
                return Err(not_acceptable(format!("image {image_id} already uploaded")));
            }
        }

        let path = match new.kind {
            UploadKind::Multipart => self.blobs.begin_temp_dir(new.container).await?,
            _ => self.blobs.begin_temp(new.container).await?,
        };

        let now = Utc::now();
        let session = UploadSession {
            id: UploadId::new(),
            path,
            size: new.size,
            md5sum: new.md5sum,
            sha256sum: new.sha256sum,
            received_digest: None,
            received_size: 0,
            state: UploadState::Initialized,
            kind: new.kind,
            part_number: None,
            total_parts,
            parent_id: None,
            image_id: new.image,
            container_id: new.container,
            owner: new.owner,
            expires_at: now + self.config.upload_ttl(),
            created_at: now,
        };
        self.store.create_upload(&session).await?;
        self.set_image_state(session.image_id, UploadState::Uploading)
            .await?;

        tracing::debug!(upload = %session.id, kind = ?session.kind, "started upload");
        Ok(session)
    }

    /// Stream `body` into the session's scratch file.
    ///
    /// With `append` the body is added to what was received before and the
    /// digest covers the whole file.
    #[tracing::instrument(skip(self, body))]
    pub async fn receive<R>(&self, id: UploadId, body: R, append: bool) -> RegistryResult<UploadSession>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut session = self.get(id).await?;
        Self::ensure_active(&session)?;
        if session.kind == UploadKind::Multipart {
            return Err(not_acceptable("multipart uploads receive bytes through their parts"));
        }
        if let Some(parent) = session.parent_id {
            Self::ensure_active(&self.get(parent).await?)?;
        }

        session.state = UploadState::Uploading;
        self.store.update_upload(&session).await?;

        let (digest, size) = write_body(&session.path, body, append).await?;
        tracing::trace!(upload = %session.id, size, "received bytes");

        if let Some(expected) = &session.sha256sum {
            if *expected != digest {
                self.fail(&session).await?;
                return Err(RegistryError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }
        // A part is held to the size announced when it was requested.
        if let Some(expected) = session.size {
            if expected != size {
                self.fail(&session).await?;
                return Err(RegistryError::SizeMismatch {
                    expected,
                    actual: size,
                });
            }
        }

        session.received_digest = Some(digest);
        session.received_size = size;
        session.state = UploadState::Uploaded;
        self.store.update_upload(&session).await?;
        if session.kind == UploadKind::Single {
            self.set_image_state(session.image_id, UploadState::Uploaded)
                .await?;
        }
        Ok(session)
    }

    /// The chunk session for `part_number`, started on first request.
    ///
    /// Repeated requests return the existing chunk. A failed chunk is reset
    /// so the part can be sent again.
    #[tracing::instrument(skip(self))]
    pub async fn next_chunk(
        &self,
        parent_id: UploadId,
        part_number: u32,
        part_size: Option<u64>,
        sha256sum: Option<Digest>,
    ) -> RegistryResult<UploadSession> {
        let mut parent = self.get(parent_id).await?;
        if parent.kind != UploadKind::Multipart {
            return Err(not_acceptable(format!("upload {parent_id} is not multipart")));
        }
        Self::ensure_active(&parent)?;

        let total_parts = parent.total_parts.unwrap_or(1);
        if part_number > total_parts {
            return Err(not_acceptable(format!(
                "part {part_number} outside 0..={total_parts}"
            )));
        }

        if let Some(mut existing) = self.store.find_child(parent_id, part_number).await? {
            if existing.state == UploadState::Failed {
                existing.state = UploadState::Initialized;
                existing.size = part_size;
                existing.sha256sum = sha256sum;
                existing.received_digest = None;
                existing.received_size = 0;
                self.store.update_upload(&existing).await?;
            }
            return Ok(existing);
        }

        let path = parent.path.join(part_number.to_string());
        File::create(&path).await?;

        let chunk = UploadSession {
            id: UploadId::new(),
            path,
            size: part_size,
            md5sum: None,
            sha256sum,
            received_digest: None,
            received_size: 0,
            state: UploadState::Initialized,
            kind: UploadKind::MultipartChunk,
            part_number: Some(part_number),
            total_parts: Some(total_parts),
            parent_id: Some(parent_id),
            image_id: parent.image_id,
            container_id: parent.container_id,
            owner: parent.owner.clone(),
            expires_at: parent.expires_at,
            created_at: Utc::now(),
        };

        match self.store.create_upload(&chunk).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return self
                    .store
                    .find_child(parent_id, part_number)
                    .await?
                    .ok_or_else(|| RegistryError::Internal(format!("part {part_number} vanished")));
            }
            Err(error) => return Err(error.into()),
        }

        if parent.state == UploadState::Initialized {
            parent.state = UploadState::Uploading;
            self.store.update_upload(&parent).await?;
        }
        Ok(chunk)
    }

    /// Finalize a session bound to an image.
    #[tracing::instrument(skip(self))]
    pub async fn complete(&self, id: UploadId) -> RegistryResult<Image> {
        let session = self.get(id).await?;
        Self::ensure_active(&session)?;
        let image_id = session
            .image_id
            .ok_or_else(|| not_acceptable(format!("upload {id} has no image")))?;
        let image = self.image(image_id).await?;

        match session.kind {
            UploadKind::Single => {
                if session.state != UploadState::Uploaded {
                    return Err(not_acceptable(format!("upload {id} has not received data")));
                }
                let received = session
                    .received_digest
                    .clone()
                    .ok_or_else(|| not_acceptable(format!("upload {id} has not received data")))?;
                if received != image.digest {
                    self.fail(&session).await?;
                    return Err(RegistryError::DigestMismatch {
                        expected: image.digest.to_string(),
                        actual: received.to_string(),
                    });
                }
                let temp = session.path.clone();
                let size = session.received_size;
                self.finish(session, image, &temp, size).await
            }
            UploadKind::Multipart => self.complete_multipart(session, image).await,
            UploadKind::MultipartChunk => Err(not_acceptable(format!(
                "upload {id} is a part, complete its parent"
            ))),
        }
    }

    async fn complete_multipart(&self, session: UploadSession, image: Image) -> RegistryResult<Image> {
        let children = self.store.children(session.id).await?;
        let total_parts = session.total_parts.unwrap_or(1);

        if children.len() != total_parts as usize
            || children.iter().any(|c| c.state != UploadState::Uploaded)
        {
            let uploaded = children
                .iter()
                .filter(|c| c.state == UploadState::Uploaded)
                .count();
            return Err(not_acceptable(format!(
                "incomplete upload: {uploaded} of {total_parts} parts uploaded"
            )));
        }

        let joined = self.blobs.begin_temp(session.container_id).await?;
        let (digest, size) = match concatenate(&children, &joined).await {
            Ok(result) => result,
            Err(error) => {
                self.blobs.discard(&joined).await;
                return Err(error.into());
            }
        };

        if digest != image.digest {
            self.blobs.discard(&joined).await;
            self.fail(&session).await?;
            return Err(RegistryError::DigestMismatch {
                expected: image.digest.to_string(),
                actual: digest.to_string(),
            });
        }

        self.finish(session, image, &joined, size).await
    }

    /// Finalize an OCI blob upload once the client names its digest.
    ///
    /// The image row is found or created in the session's container. An
    /// already completed image with the same digest is reused and the
    /// scratch data dropped.
    #[tracing::instrument(skip(self))]
    pub async fn complete_blob(&self, id: UploadId, digest: &Digest) -> RegistryResult<Image> {
        let session = self.get(id).await?;
        Self::ensure_active(&session)?;
        if session.kind != UploadKind::Single {
            return Err(not_acceptable(format!("upload {id} is not a blob upload")));
        }

        let (received, size) = hash_file(&session.path).await?;
        if received != *digest {
            self.fail(&session).await?;
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: received.to_string(),
            });
        }

        let (image, created) = match self
            .store
            .find_image_by_digest(session.container_id, digest)
            .await?
        {
            Some(image) => (image, false),
            None => {
                let mut image = Image::new(session.container_id, digest.clone(), None);
                image.media_type = "application/octet-stream".into();
                image.owner = session.owner.clone();
                match self.store.create_image(&image).await {
                    Ok(()) => (image, true),
                    Err(StoreError::Conflict(_)) => {
                        let image = self
                            .store
                            .find_image_by_digest(session.container_id, digest)
                            .await?
                            .ok_or_else(|| {
                                RegistryError::Internal(format!("image {digest} vanished"))
                            })?;
                        (image, false)
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        };

        let image_id = image.id;
        let temp = session.path.clone();
        match self.finish(session, image, &temp, size).await {
            Ok(image) => Ok(image),
            Err(error) if created => {
                // The row only existed for this upload.
                if let Err(cleanup) = self.store.delete_image(image_id).await {
                    tracing::warn!(image = %image_id, error = %cleanup, "failed to drop image row");
                }
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Quota check, move into place, mark everything completed.
    async fn finish(
        &self,
        mut session: UploadSession,
        mut image: Image,
        temp: &Utf8Path,
        size: u64,
    ) -> RegistryResult<Image> {
        let container = self.container(image.container_id).await?;

        if image.is_completed() {
            tracing::debug!(image = %image.id, "image already stored");
            self.blobs.discard(temp).await;
            self.mark_completed(&mut session).await?;
            return Ok(image);
        }

        if let Err(error) = self.quota.check(&container, size).await {
            self.blobs.discard(temp).await;
            self.fail(&session).await?;
            return Err(error);
        }

        let location = match self.blobs.finalize(temp, &image.digest).await {
            Ok(location) => location,
            Err(error) => {
                self.fail(&session).await?;
                return Err(error);
            }
        };

        image.location = Some(location.clone());
        image.size = Some(size);
        image.upload_state = UploadState::Completed;
        image.updated_at = Utc::now();
        if image.owner.is_none() {
            image.owner = session.owner.clone();
        }
        if let Err(error) = self.store.update_image(&image).await {
            self.blobs
                .remove_if_unreferenced(self.store.as_ref(), &location)
                .await?;
            self.fail(&session).await?;
            return Err(error.into());
        }
        self.mark_completed(&mut session).await?;

        tracing::info!(image = %image.id, digest = %image.digest, size, container = %container.path, "upload completed");

        // The upload is committed; these only refresh derived state.
        if let Err(error) = self.quota.recalculate(container.entity_id).await {
            tracing::warn!(entity = %container.entity_id, %error, "failed to recalculate quota");
        }
        if let Err(error) = self.tags.tag_latest(&container, &image).await {
            tracing::warn!(image = %image.id, %error, "failed to tag latest");
        }
        Ok(image)
    }

    async fn container(&self, id: ContainerId) -> RegistryResult<Container> {
        self.store
            .get_container(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("container {id}")))
    }

    async fn mark_completed(&self, session: &mut UploadSession) -> RegistryResult<()> {
        session.state = UploadState::Completed;
        self.store.update_upload(session).await?;
        for mut child in self.store.children(session.id).await? {
            child.state = UploadState::Completed;
            self.store.update_upload(&child).await?;
        }
        self.blobs.discard(&session.path).await;
        Ok(())
    }

    /// Mark a session (and its parts) failed, drop its scratch data and
    /// fail the image it was feeding.
    async fn fail(&self, session: &UploadSession) -> RegistryResult<()> {
        let mut failed = session.clone();
        failed.state = UploadState::Failed;
        self.store.update_upload(&failed).await?;
        for mut child in self.store.children(session.id).await? {
            child.state = UploadState::Failed;
            self.store.update_upload(&child).await?;
        }
        self.blobs.discard(&session.path).await;

        // A failed part leaves its parent free to retry the part.
        if session.kind != UploadKind::MultipartChunk {
            if let Some(image_id) = session.image_id {
                let image = self.store.get_image(image_id).await?;
                if let Some(mut image) = image.filter(|image| !image.is_completed()) {
                    image.upload_state = UploadState::Failed;
                    image.location = None;
                    image.updated_at = Utc::now();
                    self.store.update_image(&image).await?;
                }
            }
        }
        tracing::debug!(upload = %session.id, "upload failed");
        Ok(())
    }

    /// Give up on a session. Aborting twice is not an error.
    #[tracing::instrument(skip(self))]
    pub async fn abort(&self, id: UploadId) -> RegistryResult<()> {
        let session = self.get(id).await?;
        match session.state {
            UploadState::Failed => Ok(()),
            UploadState::Completed => Err(not_acceptable(format!("upload {id} already completed"))),
            _ => self.fail(&session).await,
        }
    }

    /// Abort every session past its expiry. Returns how many were aborted.
    pub async fn expire(&self) -> RegistryResult<usize> {
        let expired = self.store.expired_uploads(Utc::now()).await?;
        for session in &expired {
            tracing::debug!(upload = %session.id, "expiring upload");
            self.fail(session).await?;
        }
        Ok(expired.len())
    }

    /// Newest unfinished single upload for `image`.
    pub async fn pending_for_image(&self, image: ImageId) -> RegistryResult<UploadSession> {
        self.store
            .uploads_for_image(image)
            .await?
            .into_iter()
            .find(|s| s.kind == UploadKind::Single && !s.state.is_terminal())
            .ok_or_else(|| RegistryError::UploadNotFound(format!("image {image}")))
    }
}

async fn write_body<R>(path: &Utf8Path, mut body: R, append: bool) -> io::Result<(Digest, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .await?;

    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let read = body.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        file.write_all(&buf[..read]).await?;
    }
    file.flush().await?;
    drop(file);

    if append {
        hash_file(path).await
    } else {
        Ok(hasher.finish())
    }
}

/// Join `parts` (already in part order) into `target`.
async fn concatenate(parts: &[UploadSession], target: &Utf8PathBuf) -> io::Result<(Digest, u64)> {
    let mut out = File::create(target).await?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; COPY_BUFFER];

    for part in parts.iter().filter(|part| part.received_size > 0) {
        let mut input = File::open(&part.path).await?;
        loop {
            let read = input.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            out.write_all(&buf[..read]).await?;
        }
    }
    out.flush().await?;
    Ok(hasher.finish())
}
