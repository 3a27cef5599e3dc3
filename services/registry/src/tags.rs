//! Tag resolution and mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::blobstore::BlobStore;
use crate::config::RegistryConfig;
use crate::digest::{validate_name, Digest};
use crate::error::{RegistryError, RegistryResult};
use crate::model::{Container, Image, ImageId, Tag, TagId};
use crate::store::{MetadataStore, StoreError};

/// Name of the tag moved on every completed Singularity upload.
pub const LATEST: &str = "latest";

/// Maps `(container, tag, arch)` to images.
#[derive(Debug, Clone)]
pub struct TagResolver {
    store: Arc<dyn MetadataStore>,
    blobs: BlobStore,
    default_arch: String,
}

impl TagResolver {
    pub fn new(store: Arc<dyn MetadataStore>, blobs: BlobStore, config: &RegistryConfig) -> Self {
        Self {
            store,
            blobs,
            default_arch: config.default_arch.clone(),
        }
    }

    pub fn default_arch(&self) -> &str {
        &self.default_arch
    }

    /// Find the tag row a lookup for `name` at `arch` lands on.
    ///
    /// Without an arch the default arch is used. Lookups at the default arch
    /// fall back to a tag recorded without any arch.
    pub async fn find(
        &self,
        container: &Container,
        name: &str,
        arch: Option<&str>,
    ) -> RegistryResult<Option<Tag>> {
        let arch = arch.unwrap_or(&self.default_arch);
        if let Some(tag) = self.store.find_tag(container.id, name, Some(arch)).await? {
            return Ok(Some(tag));
        }
        if arch == self.default_arch {
            return Ok(self.store.find_tag(container.id, name, None).await?);
        }
        Ok(None)
    }

    /// Resolve a tag name or `sha256.<hex>` reference to an image.
    #[tracing::instrument(skip(self, container), fields(container = %container.path))]
    pub async fn resolve(
        &self,
        container: &Container,
        reference: &str,
        arch: Option<&str>,
    ) -> RegistryResult<Image> {
        if Digest::is_reference(reference) {
            let digest = Digest::parse(reference)?;
            return self
                .store
                .find_image_by_digest(container.id, &digest)
                .await?
                .ok_or_else(|| RegistryError::NotFound(format!("image {digest}")));
        }

        let tag = self
            .find(container, reference, arch)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("tag {reference}")))?;

        self.store
            .get_image(tag.image_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("image {}", tag.image_id)))
    }

    /// Point `name` at `image`, creating the tag or repointing the existing
    /// row for the same arch.
    #[tracing::instrument(skip(self, container, image), fields(container = %container.path, image = %image.id))]
    pub async fn tag_image(
        &self,
        container: &Container,
        name: &str,
        image: &Image,
        arch: Option<&str>,
    ) -> RegistryResult<Tag> {
        validate_name(name)?;
        if image.container_id != container.id {
            return Err(RegistryError::InvalidRequest(format!(
                "image {} does not belong to {}",
                image.id, container.path
            )));
        }

        let arch = arch
            .or(image.arch.as_deref())
            .unwrap_or(&self.default_arch)
            .to_string();

        let tag = match self
            .store
            .find_tag(container.id, name, Some(&arch))
            .await?
        {
            Some(existing) => self.repoint(existing, image.id).await?,
            None => {
                let now = Utc::now();
                let tag = Tag {
                    id: TagId::new(),
                    container_id: container.id,
                    name: name.to_string(),
                    arch: Some(arch.clone()),
                    image_id: image.id,
                    manifest_id: None,
                    created_at: now,
                    updated_at: now,
                };
                match self.store.create_tag(&tag).await {
                    Ok(()) => tag,
                    Err(StoreError::Conflict(_)) => {
                        // Lost a race with a concurrent create; last write wins.
                        let existing = self
                            .store
                            .find_tag(container.id, name, Some(&arch))
                            .await?
                            .ok_or_else(|| RegistryError::Internal(format!("tag {name} vanished")))?;
                        self.repoint(existing, image.id).await?
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        };

        tracing::info!(tag = %tag.name, arch = ?tag.arch, "tagged image");
        self.link_legacy(container, &tag.name, image).await;
        Ok(tag)
    }

    async fn repoint(&self, mut tag: Tag, image: ImageId) -> RegistryResult<Tag> {
        tag.image_id = image;
        tag.updated_at = Utc::now();
        self.store.update_tag(&tag).await?;
        Ok(tag)
    }

    /// Move the `latest` tag after a Singularity image completes.
    pub async fn tag_latest(&self, container: &Container, image: &Image) -> RegistryResult<()> {
        if image.is_singularity() {
            self.tag_image(container, LATEST, image, None).await?;
        }
        Ok(())
    }

    /// Symlink for clients pulling by `<entity>/<collection>/<container>_<tag>.sif`.
    async fn link_legacy(&self, container: &Container, tag: &str, image: &Image) {
        let Some(location) = image.location.as_deref().filter(|_| image.is_completed()) else {
            return;
        };
        let alias = container.path.link_path(tag);
        if let Err(error) = self.blobs.link(location, &alias).await {
            tracing::warn!(%alias, %error, "failed to create legacy symlink");
        }
    }

    /// `{tag: image}` for tags visible at `arch` (or the default arch).
    pub async fn tag_map(
        &self,
        container: &Container,
        arch: Option<&str>,
    ) -> RegistryResult<BTreeMap<String, ImageId>> {
        let arch = arch.unwrap_or(&self.default_arch);
        let mut map = BTreeMap::new();
        for tag in self.store.list_tags(container.id).await? {
            match tag.arch.as_deref() {
                Some(tag_arch) if tag_arch == arch => {
                    map.insert(tag.name, tag.image_id);
                }
                None if arch == self.default_arch => {
                    map.entry(tag.name).or_insert(tag.image_id);
                }
                _ => {}
            }
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::TagRepo;
    use crate::testing::Fixture;

    fn resolver(f: &Fixture) -> TagResolver {
        TagResolver::new(f.store.clone(), f.blobs.clone(), &f.config)
    }

    #[tokio::test]
    async fn tagging_twice_repoints_same_row() {
        let f = Fixture::new().await;
        let tags = resolver(&f);
        let container = f.container("tools").await;
        let image = f.completed_image(&container, b"blob a").await;

        let first = tags.tag_image(&container, "v1", &image, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = tags.tag_image(&container, "v1", &image, None).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at > first.updated_at);

        let rows = f.store.list_tags(container.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].arch.as_deref(), Some("amd64"));
        assert_eq!(rows[0].image_id, image.id);
    }

    #[tokio::test]
    async fn repoint_moves_resolution() {
        let f = Fixture::new().await;
        let tags = resolver(&f);
        let container = f.container("tools").await;
        let a = f.completed_image(&container, b"blob a").await;
        let b = f.completed_image(&container, b"blob b").await;

        tags.tag_image(&container, "v1", &a, None).await.unwrap();
        tags.tag_image(&container, "v1", &b, None).await.unwrap();

        let resolved = tags.resolve(&container, "v1", None).await.unwrap();
        assert_eq!(resolved.id, b.id);
    }

    #[tokio::test]
    async fn digest_references_bypass_tags() {
        let f = Fixture::new().await;
        let tags = resolver(&f);
        let container = f.container("tools").await;
        let image = f.completed_image(&container, b"blob").await;

        let resolved = tags
            .resolve(&container, &image.digest.to_string(), Some("arm64"))
            .await
            .unwrap();
        assert_eq!(resolved.id, image.id);

        let missing = Digest::of(b"other").to_string();
        let err = tags.resolve(&container, &missing, None).await.unwrap_err();
        assert_eq!(err.status_code().as_u16(), 404);
    }

    #[tokio::test]
    async fn archless_tags_serve_default_arch() {
        let f = Fixture::new().await;
        let tags = resolver(&f);
        let container = f.container("tools").await;
        let image = f.completed_image(&container, b"blob").await;

        let now = Utc::now();
        f.store
            .create_tag(&Tag {
                id: TagId::new(),
                container_id: container.id,
                name: "old".into(),
                arch: None,
                image_id: image.id,
                manifest_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        assert_eq!(tags.resolve(&container, "old", None).await.unwrap().id, image.id);
        assert_eq!(
            tags.resolve(&container, "old", Some("amd64")).await.unwrap().id,
            image.id
        );
        assert!(tags.resolve(&container, "old", Some("arm64")).await.is_err());
    }

    #[tokio::test]
    async fn arch_scoped_tags() {
        let f = Fixture::new().await;
        let tags = resolver(&f);
        let container = f.container("tools").await;
        let amd = f.completed_image(&container, b"amd").await;
        let arm = f.completed_image(&container, b"arm").await;

        tags.tag_image(&container, "v1", &amd, None).await.unwrap();
        tags.tag_image(&container, "v1", &arm, Some("arm64")).await.unwrap();

        assert_eq!(tags.resolve(&container, "v1", None).await.unwrap().id, amd.id);
        assert_eq!(
            tags.resolve(&container, "v1", Some("arm64")).await.unwrap().id,
            arm.id
        );
        let map = tags.tag_map(&container, Some("arm64")).await.unwrap();
        assert_eq!(map.get("v1"), Some(&arm.id));
    }

    #[tokio::test]
    async fn rejects_bad_names() {
        let f = Fixture::new().await;
        let tags = resolver(&f);
        let container = f.container("tools").await;
        let image = f.completed_image(&container, b"blob").await;

        for bad in ["-v1", "v1.", "v 1", ""] {
            let err = tags.tag_image(&container, bad, &image, None).await.unwrap_err();
            assert!(matches!(err, RegistryError::InvalidName(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn completed_images_get_legacy_links() {
        let f = Fixture::new().await;
        let tags = resolver(&f);
        let container = f.container("tools").await;
        let image = f.completed_image(&container, b"blob").await;

        tags.tag_image(&container, "v1", &image, None).await.unwrap();
        let link = f.root.join("alice/default/tools_v1.sif");
        assert_eq!(tokio::fs::read(&link).await.unwrap(), b"blob");
    }

    #[tokio::test]
    async fn latest_only_for_singularity_images() {
        let f = Fixture::new().await;
        let tags = resolver(&f);
        let container = f.container("tools").await;
        let mut image = f.completed_image(&container, b"blob").await;

        image.media_type = "application/vnd.oci.image.layer.v1.tar+gzip".into();
        tags.tag_latest(&container, &image).await.unwrap();
        assert!(f.store.list_tags(container.id).await.unwrap().is_empty());

        image.media_type = crate::config::SIF_LAYER_MEDIA_TYPE.into();
        tags.tag_latest(&container, &image).await.unwrap();
        assert_eq!(
            tags.resolve(&container, LATEST, None).await.unwrap().id,
            image.id
        );
    }
}
