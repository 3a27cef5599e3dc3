//! The registry engine shared by the Library and OCI surfaces.
//!
//! Every operation takes the caller's identity explicitly and checks it
//! against the configured [`AccessPolicy`] before touching any state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use storage::{Reader, Storage};
use tokio::io::AsyncRead;

use crate::access::{AccessPolicy, Identity, Resource};
use crate::blobstore::BlobStore;
use crate::config::RegistryConfig;
use crate::digest::{validate_name, Digest};
use crate::error::{RegistryError, RegistryResult};
use crate::jobs::{Job, JobId, JobQueue, JobStatus};
use crate::manifest::{
    ManifestDocument, ManifestInfo, ManifestSynthesizer, OCI_MANIFEST_MEDIA_TYPE,
    SIF_CONFIG_CONTENT,
};
use crate::model::{
    Collection, CollectionId, Container, ContainerId, ContainerPath, Entity, EntityId, Group,
    Image, ImageId, Manifest, Tag, UploadId, UploadSession, UploadState, User,
};
use crate::quota::QuotaGuard;
use crate::store::{MetadataStore, StoreError};
use crate::tags::TagResolver;
use crate::upload::{NewUpload, Uploads};

/// Entity used for paths without one when the caller is anonymous.
const DEFAULT_ENTITY: &str = "default";

const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// How a blob `GET` is answered.
#[derive(Debug)]
pub enum BlobFetch {
    /// Served in the response body.
    Inline(Bytes),
    /// Served from `/v2/__download/<token>`.
    Redirect(String),
}

#[derive(Debug, Clone)]
struct DownloadGrant {
    image: ImageId,
    expires_at: DateTime<Utc>,
}

fn denied(identity: Option<&Identity>, what: impl fmt::Display) -> RegistryError {
    match identity {
        None => RegistryError::Unauthorized,
        Some(identity) => {
            RegistryError::Forbidden(format!("{} may not access {what}", identity.username))
        }
    }
}

fn owner(identity: Option<&Identity>) -> Option<String> {
    identity.map(|identity| identity.username.clone())
}

/// The registry engine.
#[derive(Debug, Clone)]
pub struct Registry {
    config: Arc<RegistryConfig>,
    store: Arc<dyn MetadataStore>,
    policy: Arc<dyn AccessPolicy>,
    blobs: BlobStore,
    tags: TagResolver,
    manifests: ManifestSynthesizer,
    uploads: Uploads,
    quota: QuotaGuard,
    jobs: JobQueue,
    downloads: Arc<DashMap<String, DownloadGrant>>,
}

impl Registry {
    /// Build the engine on the storage backend named in `config`.
    ///
    /// Spawns the job worker, so this must run inside a tokio runtime.
    pub async fn new(
        config: RegistryConfig,
        store: Arc<dyn MetadataStore>,
        policy: Arc<dyn AccessPolicy>,
    ) -> RegistryResult<Self> {
        let storage = config.storage_config().build(&config.image_path).await?;
        Self::with_storage(config, store, policy, storage).await
    }

    pub async fn with_storage(
        config: RegistryConfig,
        store: Arc<dyn MetadataStore>,
        policy: Arc<dyn AccessPolicy>,
        storage: Storage,
    ) -> RegistryResult<Self> {
        let config = Arc::new(config);
        let blobs = BlobStore::new(storage, &config).await?;
        let quota = QuotaGuard::new(store.clone());
        let tags = TagResolver::new(store.clone(), blobs.clone(), &config);
        let manifests = ManifestSynthesizer::new(store.clone());
        let uploads = Uploads::new(
            store.clone(),
            blobs.clone(),
            quota.clone(),
            tags.clone(),
            config.clone(),
        );
        let jobs = JobQueue::spawn(quota.clone(), uploads.clone());

        tracing::debug!(storage = blobs.storage().name(), root = %config.image_path, "registry ready");
        Ok(Self {
            config,
            store,
            policy,
            blobs,
            tags,
            manifests,
            uploads,
            quota,
            jobs,
            downloads: Arc::default(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // Namespaces and access

    /// The user row for `identity`, registered with the default quota on
    /// first sight.
    pub async fn ensure_user(&self, identity: &Identity) -> RegistryResult<User> {
        if let Some(user) = self.store.get_user(&identity.username).await? {
            return Ok(user);
        }

        let user = User {
            username: identity.username.clone(),
            is_admin: identity.is_admin,
            quota: self.config.default_user_quota,
            used_quota: 0,
            created_at: Utc::now(),
        };
        match self.store.create_user(&user).await {
            Ok(()) => {
                tracing::info!(user = %user.username, quota = user.quota, "registered user");
                Ok(user)
            }
            Err(StoreError::Conflict(_)) => self
                .store
                .get_user(&identity.username)
                .await?
                .ok_or_else(|| RegistryError::Internal(format!("user {} vanished", identity.username))),
            Err(error) => Err(error.into()),
        }
    }

    /// Create a group charged against its own quota.
    pub async fn create_group(
        &self,
        identity: Option<&Identity>,
        name: &str,
        members: Vec<String>,
    ) -> RegistryResult<Group> {
        if !identity.is_some_and(|identity| identity.is_admin) {
            return Err(denied(identity, "groups"));
        }
        let group = Group {
            id: crate::model::GroupId::new(),
            name: name.to_string(),
            members,
            quota: self.config.default_group_quota,
            used_quota: 0,
        };
        self.store.create_group(&group).await?;
        Ok(group)
    }

    async fn group_of(&self, entity: &Entity) -> RegistryResult<Option<Group>> {
        match entity.group_id {
            Some(id) => Ok(self.store.get_group(id).await?),
            None => Ok(None),
        }
    }

    async fn authorize(
        &self,
        container: &Container,
        identity: Option<&Identity>,
        access: Access,
    ) -> RegistryResult<()> {
        let entity = self
            .store
            .get_entity(container.entity_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("entity {}", container.entity_id)))?;
        let group = self.group_of(&entity).await?;
        let resource = Resource::Container {
            container,
            entity: &entity,
            group: group.as_ref(),
        };

        let allowed = match access {
            Access::Read => self.policy.can_read(&resource, identity),
            Access::Write => self.policy.can_write(&resource, identity),
        };
        if allowed {
            Ok(())
        } else {
            Err(denied(identity, &container.path))
        }
    }

    fn parse_path(path: &str, identity: Option<&Identity>) -> RegistryResult<ContainerPath> {
        let default_entity = identity.map_or(DEFAULT_ENTITY, |identity| identity.username.as_str());
        ContainerPath::parse(path, default_entity)
    }

    pub async fn find_container(&self, path: &ContainerPath) -> RegistryResult<Option<Container>> {
        let Some(entity) = self.store.find_entity(&path.entity).await? else {
            return Ok(None);
        };
        let Some(collection) = self.store.find_collection(entity.id, &path.collection).await? else {
            return Ok(None);
        };
        Ok(self.store.find_container(collection.id, &path.container).await?)
    }

    /// An existing container the caller may access.
    pub async fn container_at(
        &self,
        path: &str,
        identity: Option<&Identity>,
        access: Access,
    ) -> RegistryResult<Container> {
        let path = Self::parse_path(path, identity)?;
        let container = self
            .find_container(&path)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("container {path}")))?;
        self.authorize(&container, identity, access).await?;
        Ok(container)
    }

    pub async fn container_by_id(
        &self,
        id: ContainerId,
        identity: Option<&Identity>,
        access: Access,
    ) -> RegistryResult<Container> {
        let container = self
            .store
            .get_container(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("container {id}")))?;
        self.authorize(&container, identity, access).await?;
        Ok(container)
    }

    /// Path of a container, without an access check.
    pub async fn container_path(&self, id: ContainerId) -> RegistryResult<ContainerPath> {
        self.store
            .get_container(id)
            .await?
            .map(|container| container.path)
            .ok_or_else(|| RegistryError::NotFound(format!("container {id}")))
    }

    /// Resolve `path` to a container, creating missing levels.
    ///
    /// Missing leading components default to the caller's entity and the
    /// `default` collection. A new entity may only be created by an admin or
    /// by the user it is named after.
    #[tracing::instrument(skip(self, identity))]
    pub async fn ensure_container(
        &self,
        path: &str,
        identity: Option<&Identity>,
    ) -> RegistryResult<Container> {
        let Some(caller) = identity else {
            return Err(RegistryError::Unauthorized);
        };
        self.ensure_user(caller).await?;

        let path = ContainerPath::parse(path, &caller.username)?;
        let entity = self.ensure_entity(&path.entity, caller).await?;
        let group = self.group_of(&entity).await?;
        let resource = Resource::Entity {
            entity: &entity,
            group: group.as_ref(),
        };
        if !self.policy.can_write(&resource, identity) {
            return Err(denied(identity, &entity.name));
        }

        let collection = self.ensure_collection(&entity, &path.collection, caller).await?;
        if let Some(container) = self.store.find_container(collection.id, &path.container).await? {
            return Ok(container);
        }

        let container = Container {
            id: ContainerId::new(),
            entity_id: entity.id,
            collection_id: collection.id,
            path: path.clone(),
            owner: Some(caller.username.clone()),
            private: false,
            used_quota: 0,
            created_at: Utc::now(),
        };
        match self.store.create_container(&container).await {
            Ok(()) => {
                tracing::info!(container = %container.path, "created container");
                Ok(container)
            }
            Err(StoreError::Conflict(_)) => self
                .store
                .find_container(collection.id, &path.container)
                .await?
                .ok_or_else(|| RegistryError::Internal(format!("container {path} vanished"))),
            Err(error) => Err(error.into()),
        }
    }

    async fn ensure_entity(&self, name: &str, caller: &Identity) -> RegistryResult<Entity> {
        if let Some(entity) = self.store.find_entity(name).await? {
            return Ok(entity);
        }
        if !caller.is_admin && caller.username != name {
            return Err(denied(Some(caller), name));
        }

        let entity = Entity {
            id: EntityId::new(),
            name: name.to_string(),
            owner: (caller.username == name).then(|| caller.username.clone()),
            group_id: None,
            used_quota: 0,
            created_at: Utc::now(),
        };
        match self.store.create_entity(&entity).await {
            Ok(()) => Ok(entity),
            Err(StoreError::Conflict(_)) => self
                .store
                .find_entity(name)
                .await?
                .ok_or_else(|| RegistryError::Internal(format!("entity {name} vanished"))),
            Err(error) => Err(error.into()),
        }
    }

    async fn ensure_collection(
        &self,
        entity: &Entity,
        name: &str,
        caller: &Identity,
    ) -> RegistryResult<Collection> {
        if let Some(collection) = self.store.find_collection(entity.id, name).await? {
            return Ok(collection);
        }

        let collection = Collection {
            id: CollectionId::new(),
            entity_id: entity.id,
            name: name.to_string(),
            owner: Some(caller.username.clone()),
            used_quota: 0,
            created_at: Utc::now(),
        };
        match self.store.create_collection(&collection).await {
            Ok(()) => Ok(collection),
            Err(StoreError::Conflict(_)) => self
                .store
                .find_collection(entity.id, name)
                .await?
                .ok_or_else(|| RegistryError::Internal(format!("collection {name} vanished"))),
            Err(error) => Err(error.into()),
        }
    }

    // Image lifecycle

    /// Register an image awaiting upload.
    ///
    /// An existing row for the same digest is handed back while it has no
    /// data yet, so clients can retry a failed upload.
    #[tracing::instrument(skip(self, identity, container), fields(container = %container.path))]
    pub async fn create_image(
        &self,
        identity: Option<&Identity>,
        container: &Container,
        digest: Digest,
        arch: Option<String>,
    ) -> RegistryResult<Image> {
        self.authorize(container, identity, Access::Write).await?;

        if let Some(existing) = self.store.find_image_by_digest(container.id, &digest).await? {
            if existing.is_completed() {
                return Err(RegistryError::PreconditionFailed(format!(
                    "image {digest} already exists in {}",
                    container.path
                )));
            }
            return Ok(existing);
        }

        let mut image = Image::new(container.id, digest, arch);
        image.owner = owner(identity);
        self.store.create_image(&image).await?;
        tracing::debug!(image = %image.id, "registered image");
        Ok(image)
    }

    async fn image_in(
        &self,
        id: ImageId,
        identity: Option<&Identity>,
        access: Access,
    ) -> RegistryResult<(Image, Container)> {
        let image = self
            .store
            .get_image(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("image {id}")))?;
        let container = self.container_by_id(image.container_id, identity, access).await?;
        Ok((image, container))
    }

    pub async fn get_image(&self, identity: Option<&Identity>, id: ImageId) -> RegistryResult<Image> {
        Ok(self.image_in(id, identity, Access::Read).await?.0)
    }

    /// Delete an image, its tags and, when nothing else shares it, its file.
    #[tracing::instrument(skip(self, identity))]
    pub async fn delete_image(&self, identity: Option<&Identity>, id: ImageId) -> RegistryResult<()> {
        let (image, container) = self.image_in(id, identity, Access::Write).await?;

        for tag in self.store.tags_for_image(image.id).await? {
            self.store.delete_tag(tag.id).await?;
        }
        self.store.delete_image(image.id).await?;

        if let Some(location) = &image.location {
            if self
                .blobs
                .remove_if_unreferenced(self.store.as_ref(), location)
                .await?
            {
                tracing::debug!(%location, "removed blob");
            }
        }
        self.quota.recalculate(container.entity_id).await?;
        tracing::info!(image = %image.id, container = %container.path, "deleted image");
        Ok(())
    }

    /// Resolve and stream an image by tag or digest reference.
    #[tracing::instrument(skip(self, identity))]
    pub async fn pull(
        &self,
        identity: Option<&Identity>,
        path: &str,
        reference: &str,
        arch: Option<&str>,
    ) -> RegistryResult<(Image, Reader)> {
        let container = self.container_at(path, identity, Access::Read).await?;
        let image = self.tags.resolve(&container, reference, arch).await?;
        self.open_image(image).await
    }

    /// Open a completed image and count the download. A missing file marks
    /// the image broken.
    async fn open_image(&self, mut image: Image) -> RegistryResult<(Image, Reader)> {
        let location = match &image.location {
            Some(location) if image.is_completed() => location.clone(),
            _ => {
                return Err(RegistryError::NotFound(format!(
                    "image {} has no data",
                    image.id
                )));
            }
        };

        let reader = match self.blobs.open(&location).await {
            Ok(reader) => reader,
            Err(RegistryError::Storage(error)) if error.is_not_found() => {
                tracing::warn!(image = %image.id, %location, "image file missing, marking broken");
                image.upload_state = UploadState::Broken;
                image.updated_at = Utc::now();
                self.store.update_image(&image).await?;
                return Err(RegistryError::NotFound(format!("image {}", image.id)));
            }
            Err(error) => return Err(error),
        };

        image.download_count += 1;
        self.store.update_image(&image).await?;
        Ok((image, reader))
    }

    // Library uploads

    /// Legacy single request upload.
    pub async fn upload_image<R>(
        &self,
        identity: Option<&Identity>,
        id: ImageId,
        body: R,
    ) -> RegistryResult<Image>
    where
        R: AsyncRead + Unpin + Send,
    {
        let (image, container) = self.image_in(id, identity, Access::Write).await?;
        let mut new = NewUpload::single(container.id, Some(image.id));
        new.owner = owner(identity);
        let session = self.uploads.start(new).await?;
        self.uploads.receive(session.id, body, false).await?;
        self.uploads.complete(session.id).await
    }

    pub async fn start_upload(
        &self,
        identity: Option<&Identity>,
        id: ImageId,
        size: Option<u64>,
        sha256sum: Option<Digest>,
        md5sum: Option<String>,
    ) -> RegistryResult<UploadSession> {
        let (image, container) = self.image_in(id, identity, Access::Write).await?;
        let mut new = NewUpload::single(container.id, Some(image.id));
        new.size = size;
        new.sha256sum = sha256sum;
        new.md5sum = md5sum;
        new.owner = owner(identity);
        self.uploads.start(new).await
    }

    /// Receive bytes for a session. The session id is the credential.
    pub async fn receive_upload<R>(&self, upload: UploadId, body: R) -> RegistryResult<UploadSession>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.uploads.receive(upload, body, false).await
    }

    pub async fn complete_upload(
        &self,
        identity: Option<&Identity>,
        id: ImageId,
    ) -> RegistryResult<Image> {
        let (image, _) = self.image_in(id, identity, Access::Write).await?;
        let session = self.uploads.pending_for_image(image.id).await?;
        self.uploads.complete(session.id).await
    }

    pub async fn start_multipart(
        &self,
        identity: Option<&Identity>,
        id: ImageId,
        size: u64,
    ) -> RegistryResult<UploadSession> {
        let (image, container) = self.image_in(id, identity, Access::Write).await?;
        let mut new = NewUpload::multipart(container.id, image.id, size);
        new.owner = owner(identity);
        self.uploads.start(new).await
    }

    async fn multipart_session(
        &self,
        identity: Option<&Identity>,
        id: ImageId,
        upload: UploadId,
    ) -> RegistryResult<UploadSession> {
        let (image, _) = self.image_in(id, identity, Access::Write).await?;
        let session = self.uploads.get(upload).await?;
        if session.image_id != Some(image.id) {
            return Err(RegistryError::NotAcceptable(format!(
                "upload {upload} is not for image {id}"
            )));
        }
        Ok(session)
    }

    pub async fn multipart_part(
        &self,
        identity: Option<&Identity>,
        id: ImageId,
        upload: UploadId,
        part_number: u32,
        part_size: Option<u64>,
        sha256sum: Option<Digest>,
    ) -> RegistryResult<UploadSession> {
        let session = self.multipart_session(identity, id, upload).await?;
        self.uploads
            .next_chunk(session.id, part_number, part_size, sha256sum)
            .await
    }

    /// Complete a multipart upload. `completed` pairs part numbers with the
    /// ETag each part upload returned.
    pub async fn complete_multipart(
        &self,
        identity: Option<&Identity>,
        id: ImageId,
        upload: UploadId,
        completed: &[(u32, String)],
    ) -> RegistryResult<Image> {
        let session = self.multipart_session(identity, id, upload).await?;
        for (part_number, etag) in completed {
            let chunk = self
                .store
                .find_child(session.id, *part_number)
                .await?
                .ok_or_else(|| {
                    RegistryError::NotAcceptable(format!("part {part_number} was never started"))
                })?;
            let etag = etag.trim_matches('"');
            match &chunk.received_digest {
                Some(digest) if digest.hex().eq_ignore_ascii_case(etag) => {}
                received => {
                    return Err(RegistryError::DigestMismatch {
                        expected: etag.to_string(),
                        actual: received
                            .as_ref()
                            .map_or_else(|| "nothing".to_string(), |d| d.hex().to_string()),
                    });
                }
            }
        }
        self.uploads.complete(session.id).await
    }

    pub async fn abort_multipart(
        &self,
        identity: Option<&Identity>,
        id: ImageId,
        upload: UploadId,
    ) -> RegistryResult<()> {
        let session = self.multipart_session(identity, id, upload).await?;
        self.uploads.abort(session.id).await
    }

    // Tags and manifests

    pub async fn tag_map(
        &self,
        identity: Option<&Identity>,
        container: ContainerId,
        arch: Option<&str>,
    ) -> RegistryResult<BTreeMap<String, ImageId>> {
        let container = self.container_by_id(container, identity, Access::Read).await?;
        self.tags.tag_map(&container, arch).await
    }

    pub async fn set_tag(
        &self,
        identity: Option<&Identity>,
        container: ContainerId,
        name: &str,
        image: ImageId,
        arch: Option<&str>,
    ) -> RegistryResult<Tag> {
        let container = self.container_by_id(container, identity, Access::Write).await?;
        let image = self
            .store
            .get_image(image)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("image {image}")))?;
        self.tags.tag_image(&container, name, &image, arch).await
    }

    pub async fn list_manifests(
        &self,
        identity: Option<&Identity>,
        container: ContainerId,
    ) -> RegistryResult<Vec<ManifestInfo>> {
        let container = self.container_by_id(container, identity, Access::Read).await?;
        let mut infos = Vec::new();
        for manifest in self.store.list_manifests(container.id).await? {
            infos.push(self.manifests.describe(&manifest).await?);
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(infos)
    }

    // OCI distribution

    /// The repository `name`, created on push.
    pub async fn repository(
        &self,
        identity: Option<&Identity>,
        name: &str,
        access: Access,
    ) -> RegistryResult<Container> {
        match access {
            Access::Read => self.container_at(name, identity, Access::Read).await,
            Access::Write => self.ensure_container(name, identity).await,
        }
    }

    pub async fn start_blob_upload(
        &self,
        identity: Option<&Identity>,
        name: &str,
    ) -> RegistryResult<UploadSession> {
        let container = self.repository(identity, name, Access::Write).await?;
        let mut new = NewUpload::single(container.id, None);
        new.owner = owner(identity);
        self.uploads.start(new).await
    }

    /// Monolithic push: session, bytes and digest in one request.
    pub async fn push_blob<R>(
        &self,
        identity: Option<&Identity>,
        name: &str,
        digest: &Digest,
        body: R,
    ) -> RegistryResult<Image>
    where
        R: AsyncRead + Unpin + Send,
    {
        let session = self.start_blob_upload(identity, name).await?;
        self.uploads.receive(session.id, body, false).await?;
        self.uploads.complete_blob(session.id, digest).await
    }

    pub async fn append_blob<R>(&self, upload: UploadId, body: R) -> RegistryResult<UploadSession>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.uploads.receive(upload, body, true).await
    }

    pub async fn finish_blob<R>(
        &self,
        upload: UploadId,
        digest: &Digest,
        body: R,
    ) -> RegistryResult<Image>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.uploads.receive(upload, body, true).await?;
        self.uploads.complete_blob(upload, digest).await
    }

    pub async fn upload_status(&self, upload: UploadId) -> RegistryResult<UploadSession> {
        self.uploads.get(upload).await
    }

    pub async fn cancel_blob_upload(&self, upload: UploadId) -> RegistryResult<()> {
        self.uploads.abort(upload).await
    }

    fn is_config_blob(digest: &Digest) -> bool {
        *digest == Digest::of(SIF_CONFIG_CONTENT)
    }

    async fn blob_image(
        &self,
        identity: Option<&Identity>,
        name: &str,
        digest: &Digest,
    ) -> RegistryResult<Image> {
        let container = self.repository(identity, name, Access::Read).await?;
        self.store
            .find_image_by_digest(container.id, digest)
            .await?
            .filter(Image::is_completed)
            .ok_or_else(|| RegistryError::BlobNotFound(digest.to_wire()))
    }

    /// Size of a stored blob.
    pub async fn stat_blob(
        &self,
        identity: Option<&Identity>,
        name: &str,
        digest: &Digest,
    ) -> RegistryResult<u64> {
        if Self::is_config_blob(digest) {
            return Ok(SIF_CONFIG_CONTENT.len() as u64);
        }
        let image = self.blob_image(identity, name, digest).await?;
        Ok(image.size.unwrap_or(0))
    }

    /// Answer a blob `GET` with the config blob itself or a download token.
    pub async fn fetch_blob(
        &self,
        identity: Option<&Identity>,
        name: &str,
        digest: &Digest,
    ) -> RegistryResult<BlobFetch> {
        if Self::is_config_blob(digest) {
            return Ok(BlobFetch::Inline(Bytes::from_static(SIF_CONFIG_CONTENT)));
        }
        let image = self.blob_image(identity, name, digest).await?;

        let now = Utc::now();
        self.downloads.retain(|_, grant| grant.expires_at > now);
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.downloads.insert(
            token.clone(),
            DownloadGrant {
                image: image.id,
                expires_at: now + self.config.download_token_ttl(),
            },
        );
        Ok(BlobFetch::Redirect(token))
    }

    /// Stream the blob a download token was issued for. Tokens stay valid
    /// until they expire.
    pub async fn redeem_download(&self, token: &str) -> RegistryResult<(Image, Reader)> {
        let grant = self
            .downloads
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound("download token".into()))?;
        if grant.expires_at <= Utc::now() {
            self.downloads.remove(token);
            return Err(RegistryError::NotFound("download token expired".into()));
        }

        let image = self
            .store
            .get_image(grant.image)
            .await?
            .ok_or_else(|| RegistryError::BlobNotFound(grant.image.to_string()))?;
        self.open_image(image).await
    }

    /// Store a pushed manifest, tagging its first layer when `reference` is
    /// a tag.
    #[tracing::instrument(skip(self, identity, content))]
    pub async fn put_manifest(
        &self,
        identity: Option<&Identity>,
        name: &str,
        reference: &str,
        content: String,
    ) -> RegistryResult<Manifest> {
        let container = self.repository(identity, name, Access::Write).await?;
        let document = ManifestDocument::parse(&content)?;

        if let Some(media_type) = document.media_type.as_deref() {
            if media_type != OCI_MANIFEST_MEDIA_TYPE && media_type != DOCKER_MANIFEST_MEDIA_TYPE {
                return Err(RegistryError::UnsupportedManifestType(media_type.to_string()));
            }
        }
        if document.layers.is_empty() {
            return Err(RegistryError::InvalidManifest("manifest has no layers".into()));
        }

        if let Some(config) = &document.config {
            let digest = Digest::from_wire(&config.digest)?;
            if !Self::is_config_blob(&digest) {
                self.blob_image(identity, name, &digest).await?;
            }
        }

        let expected = reference
            .starts_with("sha256:")
            .then(|| Digest::from_wire(reference))
            .transpose()?;
        if expected.is_none() {
            validate_name(reference)?;
        }
        let actual = Digest::of(content.as_bytes());
        if let Some(expected) = &expected {
            if *expected != actual {
                return Err(RegistryError::DigestMismatch {
                    expected: expected.to_wire(),
                    actual: actual.to_wire(),
                });
            }
        }

        let mut layers = Vec::with_capacity(document.layers.len());
        for layer in &document.layers {
            let digest = Digest::from_wire(&layer.digest)?;
            let image = self
                .store
                .find_image_by_digest(container.id, &digest)
                .await?
                .filter(Image::is_completed)
                .ok_or_else(|| RegistryError::BlobNotFound(layer.digest.clone()))?;
            layers.push((image, &layer.media_type));
        }

        // Nothing is written until every check above has passed.
        for (image, media_type) in &mut layers {
            if image.media_type != **media_type {
                image.media_type = (*media_type).clone();
                image.updated_at = Utc::now();
                self.store.update_image(image).await?;
            }
        }

        let manifest = self.manifests.store(&container, content).await?;

        if expected.is_none() {
            let (first, _) = &layers[0];
            let mut tag = self.tags.tag_image(&container, reference, first, None).await?;
            tag.manifest_id = Some(manifest.id);
            self.store.update_tag(&tag).await?;
        }

        tracing::info!(container = %container.path, manifest = %manifest.hash, "stored manifest");
        Ok(manifest)
    }

    /// Manifest for a tag (synthesized when needed) or a `sha256:` digest.
    pub async fn get_manifest(
        &self,
        identity: Option<&Identity>,
        name: &str,
        reference: &str,
    ) -> RegistryResult<Manifest> {
        let container = self.repository(identity, name, Access::Read).await?;

        if reference.starts_with("sha256:") {
            let digest = Digest::from_wire(reference)?;
            return self
                .store
                .find_manifest(container.id, &digest)
                .await?
                .ok_or_else(|| RegistryError::ManifestNotFound(reference.to_string()));
        }

        let tag = self
            .tags
            .find(&container, reference, None)
            .await?
            .ok_or_else(|| RegistryError::ManifestNotFound(reference.to_string()))?;
        self.manifests.build(&container, &tag).await
    }

    /// Unlink a manifest from its tags and drop it.
    pub async fn delete_manifest(
        &self,
        identity: Option<&Identity>,
        name: &str,
        reference: &str,
    ) -> RegistryResult<()> {
        let container = self.repository(identity, name, Access::Read).await?;
        self.authorize(&container, identity, Access::Write).await?;

        let digest = Digest::from_wire(reference)?;
        let manifest = self
            .store
            .find_manifest(container.id, &digest)
            .await?
            .ok_or_else(|| RegistryError::ManifestNotFound(reference.to_string()))?;
        self.store.delete_manifest(manifest.id).await?;
        tracing::info!(container = %container.path, manifest = %manifest.hash, "deleted manifest");
        Ok(())
    }

    pub async fn tag_names(
        &self,
        identity: Option<&Identity>,
        name: &str,
    ) -> RegistryResult<Vec<String>> {
        let container = self.repository(identity, name, Access::Read).await?;
        let names: BTreeSet<String> = self
            .store
            .list_tags(container.id)
            .await?
            .into_iter()
            .map(|tag| tag.name)
            .collect();
        Ok(names.into_iter().collect())
    }

    // Jobs

    /// Queue a maintenance job. Admins only.
    pub fn enqueue(&self, identity: Option<&Identity>, job: Job) -> RegistryResult<JobId> {
        if !identity.is_some_and(|identity| identity.is_admin) {
            return Err(denied(identity, "jobs"));
        }
        self.jobs.enqueue(job)
    }

    pub fn job_status(&self, identity: Option<&Identity>, id: JobId) -> RegistryResult<JobStatus> {
        if identity.is_none() {
            return Err(RegistryError::Unauthorized);
        }
        self.jobs
            .status(id)
            .ok_or_else(|| RegistryError::NotFound(format!("job {id}")))
    }
}

/// Content type to serve `manifest` with.
pub fn manifest_media_type(manifest: &Manifest) -> String {
    ManifestDocument::parse(&manifest.content)
        .ok()
        .and_then(|document| document.media_type)
        .unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_string())
}
