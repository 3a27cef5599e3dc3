use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    ImageRepo, ManifestRepo, NamespaceRepo, StoreError, StoreResult, TagRepo, UploadRepo,
};
use crate::digest::Digest;
use crate::model::{
    Collection, CollectionId, Container, ContainerId, Entity, EntityId, Group, GroupId, Image,
    ImageId, Manifest, ManifestId, Tag, TagId, UploadId, UploadSession, User,
};

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<String, User>,
    groups: HashMap<GroupId, Group>,
    entities: HashMap<EntityId, Entity>,
    collections: HashMap<CollectionId, Collection>,
    containers: HashMap<ContainerId, Container>,
    images: HashMap<ImageId, Image>,
    tags: HashMap<TagId, Tag>,
    uploads: HashMap<UploadId, UploadSession>,
    manifests: HashMap<ManifestId, Manifest>,
}

/// Metadata store kept in memory behind a single lock.
#[derive(Debug, Default)]
pub struct MemoryMetadata {
    tables: RwLock<Tables>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }
}

fn replace<K, V>(map: &mut HashMap<K, V>, key: K, value: &V, what: &str) -> StoreResult<()>
where
    K: std::hash::Hash + Eq + std::fmt::Display,
    V: Clone,
{
    match map.get_mut(&key) {
        Some(slot) => {
            *slot = value.clone();
            Ok(())
        }
        None => Err(StoreError::NotFound(format!("{what} {key}"))),
    }
}

#[async_trait]
impl NamespaceRepo for MemoryMetadata {
    async fn get_user(&self, username: &str) -> StoreResult<Option<User>> {
        Ok(self.tables.read().await.users.get(username).cloned())
    }

    async fn create_user(&self, user: &User) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.users.contains_key(&user.username) {
            return Err(StoreError::Conflict(format!("user {}", user.username)));
        }
        tables.users.insert(user.username.clone(), user.clone());
        Ok(())
    }

    async fn update_user(&self, user: &User) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        match tables.users.get_mut(&user.username) {
            Some(slot) => {
                *slot = user.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("user {}", user.username))),
        }
    }

    async fn create_group(&self, group: &Group) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.groups.values().any(|g| g.name == group.name) {
            return Err(StoreError::Conflict(format!("group {}", group.name)));
        }
        tables.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn get_group(&self, id: GroupId) -> StoreResult<Option<Group>> {
        Ok(self.tables.read().await.groups.get(&id).cloned())
    }

    async fn update_group(&self, group: &Group) -> StoreResult<()> {
        replace(&mut self.tables.write().await.groups, group.id, group, "group")
    }

    async fn create_entity(&self, entity: &Entity) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.entities.values().any(|e| e.name == entity.name) {
            return Err(StoreError::Conflict(format!("entity {}", entity.name)));
        }
        tables.entities.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn get_entity(&self, id: EntityId) -> StoreResult<Option<Entity>> {
        Ok(self.tables.read().await.entities.get(&id).cloned())
    }

    async fn find_entity(&self, name: &str) -> StoreResult<Option<Entity>> {
        let tables = self.tables.read().await;
        Ok(tables.entities.values().find(|e| e.name == name).cloned())
    }

    async fn list_entities(&self) -> StoreResult<Vec<Entity>> {
        let tables = self.tables.read().await;
        let mut entities: Vec<_> = tables.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entities)
    }

    async fn update_entity(&self, entity: &Entity) -> StoreResult<()> {
        replace(
            &mut self.tables.write().await.entities,
            entity.id,
            entity,
            "entity",
        )
    }

    async fn create_collection(&self, collection: &Collection) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables
            .collections
            .values()
            .any(|c| c.entity_id == collection.entity_id && c.name == collection.name)
        {
            return Err(StoreError::Conflict(format!(
                "collection {}",
                collection.name
            )));
        }
        tables.collections.insert(collection.id, collection.clone());
        Ok(())
    }

    async fn find_collection(
        &self,
        entity: EntityId,
        name: &str,
    ) -> StoreResult<Option<Collection>> {
        let tables = self.tables.read().await;
        Ok(tables
            .collections
            .values()
            .find(|c| c.entity_id == entity && c.name == name)
            .cloned())
    }

    async fn list_collections(&self, entity: EntityId) -> StoreResult<Vec<Collection>> {
        let tables = self.tables.read().await;
        let mut collections: Vec<_> = tables
            .collections
            .values()
            .filter(|c| c.entity_id == entity)
            .cloned()
            .collect();
        collections.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(collections)
    }

    async fn update_collection(&self, collection: &Collection) -> StoreResult<()> {
        replace(
            &mut self.tables.write().await.collections,
            collection.id,
            collection,
            "collection",
        )
    }

    async fn create_container(&self, container: &Container) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.containers.values().any(|c| {
            c.collection_id == container.collection_id && c.name() == container.name()
        }) {
            return Err(StoreError::Conflict(format!("container {}", container.path)));
        }
        tables.containers.insert(container.id, container.clone());
        Ok(())
    }

    async fn get_container(&self, id: ContainerId) -> StoreResult<Option<Container>> {
        Ok(self.tables.read().await.containers.get(&id).cloned())
    }

    async fn find_container(
        &self,
        collection: CollectionId,
        name: &str,
    ) -> StoreResult<Option<Container>> {
        let tables = self.tables.read().await;
        Ok(tables
            .containers
            .values()
            .find(|c| c.collection_id == collection && c.name() == name)
            .cloned())
    }

    async fn list_containers(&self, collection: CollectionId) -> StoreResult<Vec<Container>> {
        let tables = self.tables.read().await;
        let mut containers: Vec<_> = tables
            .containers
            .values()
            .filter(|c| c.collection_id == collection)
            .cloned()
            .collect();
        containers.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(containers)
    }

    async fn update_container(&self, container: &Container) -> StoreResult<()> {
        replace(
            &mut self.tables.write().await.containers,
            container.id,
            container,
            "container",
        )
    }
}

#[async_trait]
impl ImageRepo for MemoryMetadata {
    async fn create_image(&self, image: &Image) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables
            .images
            .values()
            .any(|i| i.container_id == image.container_id && i.digest == image.digest)
        {
            return Err(StoreError::Conflict(format!("image {}", image.digest)));
        }
        tables.images.insert(image.id, image.clone());
        Ok(())
    }

    async fn get_image(&self, id: ImageId) -> StoreResult<Option<Image>> {
        Ok(self.tables.read().await.images.get(&id).cloned())
    }

    async fn find_image_by_digest(
        &self,
        container: ContainerId,
        digest: &Digest,
    ) -> StoreResult<Option<Image>> {
        let tables = self.tables.read().await;
        Ok(tables
            .images
            .values()
            .find(|i| i.container_id == container && &i.digest == digest)
            .cloned())
    }

    async fn update_image(&self, image: &Image) -> StoreResult<()> {
        replace(&mut self.tables.write().await.images, image.id, image, "image")
    }

    async fn delete_image(&self, id: ImageId) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .images
            .remove(&id)
            .map(drop)
            .ok_or_else(|| StoreError::NotFound(format!("image {id}")))
    }

    async fn list_images(&self, container: ContainerId) -> StoreResult<Vec<Image>> {
        let tables = self.tables.read().await;
        let mut images: Vec<_> = tables
            .images
            .values()
            .filter(|i| i.container_id == container)
            .cloned()
            .collect();
        images.sort_by_key(|i| i.created_at);
        Ok(images)
    }

    async fn location_in_use(&self, location: &Utf8Path) -> StoreResult<bool> {
        let tables = self.tables.read().await;
        Ok(tables
            .images
            .values()
            .any(|i| i.location.as_deref() == Some(location)))
    }
}

#[async_trait]
impl TagRepo for MemoryMetadata {
    async fn create_tag(&self, tag: &Tag) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.tags.values().any(|t| {
            t.container_id == tag.container_id && t.name == tag.name && t.arch == tag.arch
        }) {
            return Err(StoreError::Conflict(format!("tag {}", tag.name)));
        }
        tables.tags.insert(tag.id, tag.clone());
        Ok(())
    }

    async fn find_tag(
        &self,
        container: ContainerId,
        name: &str,
        arch: Option<&str>,
    ) -> StoreResult<Option<Tag>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tags
            .values()
            .find(|t| t.container_id == container && t.name == name && t.arch.as_deref() == arch)
            .cloned())
    }

    async fn list_tags(&self, container: ContainerId) -> StoreResult<Vec<Tag>> {
        let tables = self.tables.read().await;
        let mut tags: Vec<_> = tables
            .tags
            .values()
            .filter(|t| t.container_id == container)
            .cloned()
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.arch.cmp(&b.arch)));
        Ok(tags)
    }

    async fn tags_for_image(&self, image: ImageId) -> StoreResult<Vec<Tag>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tags
            .values()
            .filter(|t| t.image_id == image)
            .cloned()
            .collect())
    }

    async fn tags_for_manifest(&self, manifest: ManifestId) -> StoreResult<Vec<Tag>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tags
            .values()
            .filter(|t| t.manifest_id == Some(manifest))
            .cloned()
            .collect())
    }

    async fn update_tag(&self, tag: &Tag) -> StoreResult<()> {
        replace(&mut self.tables.write().await.tags, tag.id, tag, "tag")
    }

    async fn delete_tag(&self, id: TagId) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .tags
            .remove(&id)
            .map(drop)
            .ok_or_else(|| StoreError::NotFound(format!("tag {id}")))
    }
}

#[async_trait]
impl UploadRepo for MemoryMetadata {
    async fn create_upload(&self, session: &UploadSession) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if let (Some(parent), Some(part)) = (session.parent_id, session.part_number) {
            if tables
                .uploads
                .values()
                .any(|u| u.parent_id == Some(parent) && u.part_number == Some(part))
            {
                return Err(StoreError::Conflict(format!("upload part {part}")));
            }
        }
        tables.uploads.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_upload(&self, id: UploadId) -> StoreResult<Option<UploadSession>> {
        Ok(self.tables.read().await.uploads.get(&id).cloned())
    }

    async fn update_upload(&self, session: &UploadSession) -> StoreResult<()> {
        replace(
            &mut self.tables.write().await.uploads,
            session.id,
            session,
            "upload",
        )
    }

    async fn find_child(
        &self,
        parent: UploadId,
        part_number: u32,
    ) -> StoreResult<Option<UploadSession>> {
        let tables = self.tables.read().await;
        Ok(tables
            .uploads
            .values()
            .find(|u| u.parent_id == Some(parent) && u.part_number == Some(part_number))
            .cloned())
    }

    async fn uploads_for_image(&self, image: ImageId) -> StoreResult<Vec<UploadSession>> {
        let tables = self.tables.read().await;
        let mut uploads: Vec<_> = tables
            .uploads
            .values()
            .filter(|u| u.parent_id.is_none() && u.image_id == Some(image))
            .cloned()
            .collect();
        uploads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(uploads)
    }

    async fn children(&self, parent: UploadId) -> StoreResult<Vec<UploadSession>> {
        let tables = self.tables.read().await;
        let mut children: Vec<_> = tables
            .uploads
            .values()
            .filter(|u| u.parent_id == Some(parent))
            .cloned()
            .collect();
        children.sort_by_key(|u| u.part_number);
        Ok(children)
    }

    async fn delete_upload(&self, id: UploadId) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .uploads
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        tables.uploads.retain(|_, u| u.parent_id != Some(id));
        Ok(())
    }

    async fn expired_uploads(&self, now: DateTime<Utc>) -> StoreResult<Vec<UploadSession>> {
        let tables = self.tables.read().await;
        Ok(tables
            .uploads
            .values()
            .filter(|u| u.parent_id.is_none() && !u.state.is_terminal() && u.is_expired(now))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ManifestRepo for MemoryMetadata {
    async fn create_manifest(&self, manifest: &Manifest) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables
            .manifests
            .values()
            .any(|m| m.container_id == manifest.container_id && m.hash == manifest.hash)
        {
            return Err(StoreError::Conflict(format!("manifest {}", manifest.hash)));
        }
        tables.manifests.insert(manifest.id, manifest.clone());
        Ok(())
    }

    async fn get_manifest(&self, id: ManifestId) -> StoreResult<Option<Manifest>> {
        Ok(self.tables.read().await.manifests.get(&id).cloned())
    }

    async fn find_manifest(
        &self,
        container: ContainerId,
        hash: &Digest,
    ) -> StoreResult<Option<Manifest>> {
        let tables = self.tables.read().await;
        Ok(tables
            .manifests
            .values()
            .find(|m| m.container_id == container && &m.hash == hash)
            .cloned())
    }

    async fn list_manifests(&self, container: ContainerId) -> StoreResult<Vec<Manifest>> {
        let tables = self.tables.read().await;
        let mut manifests: Vec<_> = tables
            .manifests
            .values()
            .filter(|m| m.container_id == container)
            .cloned()
            .collect();
        manifests.sort_by_key(|m| m.created_at);
        Ok(manifests)
    }

    async fn delete_manifest(&self, id: ManifestId) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .manifests
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("manifest {id}")))?;
        for tag in tables.tags.values_mut() {
            if tag.manifest_id == Some(id) {
                tag.manifest_id = None;
            }
        }
        Ok(())
    }
}
