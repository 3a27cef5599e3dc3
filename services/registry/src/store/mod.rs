//! Repository traits for registry metadata.
//!
//! Every call is atomic on its own. Unique constraints are reported as
//! [`StoreError::Conflict`] so callers can catch and reuse the existing row.

use std::fmt;

use async_trait::async_trait;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::digest::Digest;
use crate::model::{
    Collection, CollectionId, Container, ContainerId, Entity, EntityId, Group, GroupId, Image,
    ImageId, Manifest, ManifestId, Tag, TagId, UploadId, UploadSession, User,
};

mod memory;

pub use memory::MemoryMetadata;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unique constraint violated: {0}")]
    Conflict(String),
}

/// Result type for metadata operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Users, groups, entities, collections and containers.
#[async_trait]
pub trait NamespaceRepo: Send + Sync {
    async fn get_user(&self, username: &str) -> StoreResult<Option<User>>;
    async fn create_user(&self, user: &User) -> StoreResult<()>;
    async fn update_user(&self, user: &User) -> StoreResult<()>;

    async fn create_group(&self, group: &Group) -> StoreResult<()>;
    async fn get_group(&self, id: GroupId) -> StoreResult<Option<Group>>;
    async fn update_group(&self, group: &Group) -> StoreResult<()>;

    /// Entity names are unique.
    async fn create_entity(&self, entity: &Entity) -> StoreResult<()>;
    async fn get_entity(&self, id: EntityId) -> StoreResult<Option<Entity>>;
    async fn find_entity(&self, name: &str) -> StoreResult<Option<Entity>>;
    async fn list_entities(&self) -> StoreResult<Vec<Entity>>;
    async fn update_entity(&self, entity: &Entity) -> StoreResult<()>;

    /// Collection names are unique per entity.
    async fn create_collection(&self, collection: &Collection) -> StoreResult<()>;
    async fn find_collection(
        &self,
        entity: EntityId,
        name: &str,
    ) -> StoreResult<Option<Collection>>;
    async fn list_collections(&self, entity: EntityId) -> StoreResult<Vec<Collection>>;
    async fn update_collection(&self, collection: &Collection) -> StoreResult<()>;

    /// Container names are unique per collection.
    async fn create_container(&self, container: &Container) -> StoreResult<()>;
    async fn get_container(&self, id: ContainerId) -> StoreResult<Option<Container>>;
    async fn find_container(
        &self,
        collection: CollectionId,
        name: &str,
    ) -> StoreResult<Option<Container>>;
    async fn list_containers(&self, collection: CollectionId) -> StoreResult<Vec<Container>>;
    async fn update_container(&self, container: &Container) -> StoreResult<()>;
}

/// Image (blob) rows.
#[async_trait]
pub trait ImageRepo: Send + Sync {
    /// `(digest, container)` is unique.
    async fn create_image(&self, image: &Image) -> StoreResult<()>;
    async fn get_image(&self, id: ImageId) -> StoreResult<Option<Image>>;
    async fn find_image_by_digest(
        &self,
        container: ContainerId,
        digest: &Digest,
    ) -> StoreResult<Option<Image>>;
    async fn update_image(&self, image: &Image) -> StoreResult<()>;
    async fn delete_image(&self, id: ImageId) -> StoreResult<()>;
    async fn list_images(&self, container: ContainerId) -> StoreResult<Vec<Image>>;

    /// Whether any image row references `location`.
    async fn location_in_use(&self, location: &Utf8Path) -> StoreResult<bool>;
}

#[async_trait]
pub trait TagRepo: Send + Sync {
    /// `(container, name, arch)` is unique.
    async fn create_tag(&self, tag: &Tag) -> StoreResult<()>;
    async fn find_tag(
        &self,
        container: ContainerId,
        name: &str,
        arch: Option<&str>,
    ) -> StoreResult<Option<Tag>>;
    async fn list_tags(&self, container: ContainerId) -> StoreResult<Vec<Tag>>;
    async fn tags_for_image(&self, image: ImageId) -> StoreResult<Vec<Tag>>;
    async fn tags_for_manifest(&self, manifest: ManifestId) -> StoreResult<Vec<Tag>>;
    async fn update_tag(&self, tag: &Tag) -> StoreResult<()>;
    async fn delete_tag(&self, id: TagId) -> StoreResult<()>;
}

/// Upload sessions, with chunk sessions keyed by `parent_id`.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    async fn create_upload(&self, session: &UploadSession) -> StoreResult<()>;
    async fn get_upload(&self, id: UploadId) -> StoreResult<Option<UploadSession>>;
    async fn update_upload(&self, session: &UploadSession) -> StoreResult<()>;

    /// The chunk of `parent` with `part_number`, if one was started.
    async fn find_child(
        &self,
        parent: UploadId,
        part_number: u32,
    ) -> StoreResult<Option<UploadSession>>;

    /// Top level sessions feeding `image`, newest first.
    async fn uploads_for_image(&self, image: ImageId) -> StoreResult<Vec<UploadSession>>;

    /// Chunks of `parent`, ordered by ascending part number.
    async fn children(&self, parent: UploadId) -> StoreResult<Vec<UploadSession>>;

    /// Deletes the session and its chunks.
    async fn delete_upload(&self, id: UploadId) -> StoreResult<()>;

    /// Top level sessions past their expiry that are not yet terminal.
    async fn expired_uploads(&self, now: DateTime<Utc>) -> StoreResult<Vec<UploadSession>>;
}

#[async_trait]
pub trait ManifestRepo: Send + Sync {
    /// `(hash, container)` is unique.
    async fn create_manifest(&self, manifest: &Manifest) -> StoreResult<()>;
    async fn get_manifest(&self, id: ManifestId) -> StoreResult<Option<Manifest>>;
    async fn find_manifest(
        &self,
        container: ContainerId,
        hash: &Digest,
    ) -> StoreResult<Option<Manifest>>;
    async fn list_manifests(&self, container: ContainerId) -> StoreResult<Vec<Manifest>>;
    async fn delete_manifest(&self, id: ManifestId) -> StoreResult<()>;
}

/// Combined metadata store.
pub trait MetadataStore:
    NamespaceRepo + ImageRepo + TagRepo + UploadRepo + ManifestRepo + fmt::Debug + Send + Sync
{
}

impl<T> MetadataStore for T where
    T: NamespaceRepo + ImageRepo + TagRepo + UploadRepo + ManifestRepo + fmt::Debug + Send + Sync
{
}
