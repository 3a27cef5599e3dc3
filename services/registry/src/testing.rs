//! Fixtures shared by unit tests.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use storage::LocalDriver;
use tempfile::TempDir;

use crate::blobstore::BlobStore;
use crate::config::RegistryConfig;
use crate::digest::Digest;
use crate::model::{
    Collection, CollectionId, Container, ContainerId, ContainerPath, Entity, EntityId, Image,
    UploadState, User,
};
use crate::store::{ImageRepo, MemoryMetadata, NamespaceRepo};

pub(crate) struct Fixture {
    _tmp: TempDir,
    pub root: Utf8PathBuf,
    pub config: Arc<RegistryConfig>,
    pub store: Arc<MemoryMetadata>,
    pub blobs: BlobStore,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(RegistryConfig::default()).await
    }

    pub async fn with_config(config: RegistryConfig) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap().to_owned();
        let config = Arc::new(RegistryConfig {
            image_path: root.clone(),
            ..config
        });
        let blobs = BlobStore::new(LocalDriver::new(root.clone()).into(), &config)
            .await
            .unwrap();
        Self {
            _tmp: tmp,
            root,
            config,
            store: Arc::new(MemoryMetadata::new()),
            blobs,
        }
    }

    /// Creates `alice`, her entity and collection if needed, then the
    /// container.
    pub async fn container(&self, name: &str) -> Container {
        if self.store.get_user("alice").await.unwrap().is_none() {
            self.store
                .create_user(&User {
                    username: "alice".into(),
                    is_admin: false,
                    quota: 0,
                    used_quota: 0,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let entity = match self.store.find_entity("alice").await.unwrap() {
            Some(entity) => entity,
            None => {
                let entity = Entity {
                    id: EntityId::new(),
                    name: "alice".into(),
                    owner: Some("alice".into()),
                    group_id: None,
                    used_quota: 0,
                    created_at: Utc::now(),
                };
                self.store.create_entity(&entity).await.unwrap();
                entity
            }
        };

        let collection = match self
            .store
            .find_collection(entity.id, "default")
            .await
            .unwrap()
        {
            Some(collection) => collection,
            None => {
                let collection = Collection {
                    id: CollectionId::new(),
                    entity_id: entity.id,
                    name: "default".into(),
                    owner: Some("alice".into()),
                    used_quota: 0,
                    created_at: Utc::now(),
                };
                self.store.create_collection(&collection).await.unwrap();
                collection
            }
        };

        let container = Container {
            id: ContainerId::new(),
            entity_id: entity.id,
            collection_id: collection.id,
            path: ContainerPath::parse(name, "alice").unwrap(),
            owner: Some("alice".into()),
            private: false,
            used_quota: 0,
            created_at: Utc::now(),
        };
        self.store.create_container(&container).await.unwrap();
        container
    }

    /// A completed image whose bytes are stored.
    pub async fn completed_image(&self, container: &Container, data: &[u8]) -> Image {
        let digest = Digest::of(data);
        let temp = self.blobs.begin_temp(container.id).await.unwrap();
        tokio::fs::write(&temp, data).await.unwrap();
        let location = self.blobs.finalize(&temp, &digest).await.unwrap();

        let mut image = Image::new(container.id, digest, None);
        image.size = Some(data.len() as u64);
        image.location = Some(location);
        image.upload_state = UploadState::Completed;
        self.store.create_image(&image).await.unwrap();
        image
    }

    /// An image row waiting for its bytes.
    pub async fn pending_image(&self, container: &Container, data: &[u8]) -> Image {
        let image = Image::new(container.id, Digest::of(data), None);
        self.store.create_image(&image).await.unwrap();
        image
    }
}
