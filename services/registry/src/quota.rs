//! Storage quota enforcement and usage aggregates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::error::{RegistryError, RegistryResult};
use crate::model::{CollectionId, Container, ContainerId, Entity, EntityId, Image, ImageId};
use crate::store::MetadataStore;

/// Who a container's bytes are charged to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaOwner {
    Group(crate::model::GroupId),
    User(String),
    /// No owner on record. Never limited.
    Nobody,
}

/// Rejects finalizes that would reach the owner's quota and keeps the cached
/// `used_quota` figures current.
#[derive(Debug, Clone)]
pub struct QuotaGuard {
    store: Arc<dyn MetadataStore>,
}

/// Identity of a physical file for dedup purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FileKey {
    Location(Utf8PathBuf),
    Unplaced(ImageId),
}

impl From<&Image> for FileKey {
    fn from(image: &Image) -> Self {
        match &image.location {
            Some(location) => FileKey::Location(location.clone()),
            None => FileKey::Unplaced(image.id),
        }
    }
}

/// Sums sizes, counting each physical file once.
#[derive(Debug, Default)]
struct UniqueSum {
    seen: HashSet<FileKey>,
    total: u64,
}

impl UniqueSum {
    fn add(&mut self, image: &Image) {
        if self.seen.insert(FileKey::from(image)) {
            self.total += image.size.unwrap_or(0);
        }
    }
}

impl QuotaGuard {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Group quota wins over the owning user's.
    pub fn owner_of(entity: &Entity) -> QuotaOwner {
        match (&entity.group_id, &entity.owner) {
            (Some(group), _) => QuotaOwner::Group(*group),
            (None, Some(user)) => QuotaOwner::User(user.clone()),
            (None, None) => QuotaOwner::Nobody,
        }
    }

    /// Fails when `used + additional >= quota`. A quota of zero is unlimited.
    #[tracing::instrument(skip(self, container), fields(container = %container.path))]
    pub async fn check(&self, container: &Container, additional: u64) -> RegistryResult<()> {
        let entity = self
            .store
            .get_entity(container.entity_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("entity {}", container.entity_id)))?;

        let (quota, used) = match Self::owner_of(&entity) {
            QuotaOwner::Group(id) => match self.store.get_group(id).await? {
                Some(group) => (group.quota, group.used_quota),
                None => return Ok(()),
            },
            QuotaOwner::User(username) => match self.store.get_user(&username).await? {
                Some(user) => (user.quota, user.used_quota),
                None => return Ok(()),
            },
            QuotaOwner::Nobody => return Ok(()),
        };

        if quota == 0 {
            return Ok(());
        }

        if used.saturating_add(additional) >= quota {
            tracing::info!(used, additional, quota, "quota exceeded");
            return Err(RegistryError::QuotaExceeded {
                used,
                additional,
                quota,
            });
        }
        Ok(())
    }

    /// Completed images below an entity, with where they live.
    async fn completed_images(
        &self,
        entity: EntityId,
    ) -> RegistryResult<Vec<(CollectionId, ContainerId, Image)>> {
        let mut found = Vec::new();
        for collection in self.store.list_collections(entity).await? {
            for container in self.store.list_containers(collection.id).await? {
                for image in self.store.list_images(container.id).await? {
                    if image.is_completed() {
                        found.push((collection.id, container.id, image));
                    }
                }
            }
        }
        Ok(found)
    }

    /// Recompute the cached usage of an entity, its collections and
    /// containers, then of the user or group it is charged to.
    ///
    /// Returns the entity total.
    #[tracing::instrument(skip(self))]
    pub async fn recalculate(&self, entity_id: EntityId) -> RegistryResult<u64> {
        let mut entity = self
            .store
            .get_entity(entity_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("entity {entity_id}")))?;

        let images = self.completed_images(entity_id).await?;

        let mut entity_sum = UniqueSum::default();
        let mut collection_sums: HashMap<CollectionId, UniqueSum> = HashMap::new();
        let mut container_sums: HashMap<ContainerId, UniqueSum> = HashMap::new();
        for (collection, container, image) in &images {
            entity_sum.add(image);
            collection_sums.entry(*collection).or_default().add(image);
            container_sums.entry(*container).or_default().add(image);
        }

        for mut collection in self.store.list_collections(entity_id).await? {
            collection.used_quota = collection_sums
                .get(&collection.id)
                .map_or(0, |sum| sum.total);
            self.store.update_collection(&collection).await?;

            for mut container in self.store.list_containers(collection.id).await? {
                container.used_quota = container_sums.get(&container.id).map_or(0, |sum| sum.total);
                self.store.update_container(&container).await?;
            }
        }

        entity.used_quota = entity_sum.total;
        self.store.update_entity(&entity).await?;
        tracing::debug!(entity = %entity.name, used = entity.used_quota, "recalculated entity usage");

        self.recalculate_owner(&Self::owner_of(&entity)).await?;
        Ok(entity.used_quota)
    }

    /// Recompute every entity.
    pub async fn recalculate_all(&self) -> RegistryResult<u64> {
        let mut total = 0;
        for entity in self.store.list_entities().await? {
            total += self.recalculate(entity.id).await?;
        }
        Ok(total)
    }

    async fn recalculate_owner(&self, owner: &QuotaOwner) -> RegistryResult<()> {
        if *owner == QuotaOwner::Nobody {
            return Ok(());
        }

        let mut sum = UniqueSum::default();
        for entity in self.store.list_entities().await? {
            if Self::owner_of(&entity) == *owner {
                for (_, _, image) in self.completed_images(entity.id).await? {
                    sum.add(&image);
                }
            }
        }

        match owner {
            QuotaOwner::Group(id) => {
                if let Some(mut group) = self.store.get_group(*id).await? {
                    group.used_quota = sum.total;
                    self.store.update_group(&group).await?;
                }
            }
            QuotaOwner::User(username) => {
                if let Some(mut user) = self.store.get_user(username).await? {
                    user.used_quota = sum.total;
                    self.store.update_user(&user).await?;
                }
            }
            QuotaOwner::Nobody => {}
        }
        Ok(())
    }
}
