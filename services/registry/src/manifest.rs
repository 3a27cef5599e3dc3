//! OCI manifest synthesis, classification and staleness.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{SIF_CONFIG_MEDIA_TYPE, SIF_LAYER_MEDIA_TYPE};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::model::{Container, Manifest, ManifestId, Tag};
use crate::store::{MetadataStore, StoreError};

/// Content of the fixed Singularity config blob.
pub const SIF_CONFIG_CONTENT: &[u8] = b"{}";

/// OCI image manifest media type.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const ORAS_CONFIG_MEDIA_TYPE: &str = "application/vnd.unknown.config.v1+json";

const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";
const UNPACK_ANNOTATION: &str = "io.deis.oras.content.unpack";

/// The parts of a manifest document the registry looks at.
///
/// Field order matters: synthesized manifests are hashed as serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDocument {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// A content descriptor, digest in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ManifestDocument {
    pub fn parse(content: &str) -> RegistryResult<Self> {
        serde_json::from_str(content).map_err(|err| RegistryError::InvalidManifest(err.to_string()))
    }

    /// Sum of declared layer sizes, missing sizes count as zero.
    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(|layer| layer.size.unwrap_or(0)).sum()
    }

    /// Download name derived from layer title annotations.
    pub fn filename(&self) -> String {
        let names: BTreeSet<String> = self
            .layers
            .iter()
            .filter_map(|layer| {
                let title = layer.annotations.get(TITLE_ANNOTATION)?;
                let mut name = title.clone();
                if layer.annotations.get(UNPACK_ANNOTATION).map(String::as_str) == Some("true") {
                    name.push_str(".tar");
                    if layer.media_type.ends_with("+gzip") {
                        name.push_str(".gz");
                    }
                }
                Some(name)
            })
            .collect();

        let mut names = names.into_iter();
        match (names.next(), names.next()) {
            (None, _) => "(none)".to_string(),
            (Some(name), None) => name,
            (Some(_), Some(_)) => "(multiple)".to_string(),
        }
    }

    pub fn manifest_type(&self) -> ManifestType {
        let Some(config) = &self.config else {
            return ManifestType::Invalid;
        };
        match config.media_type.as_str() {
            SIF_CONFIG_MEDIA_TYPE => ManifestType::Singularity,
            DOCKER_CONFIG_MEDIA_TYPE => ManifestType::Docker,
            OCI_CONFIG_MEDIA_TYPE => ManifestType::Oci,
            ORAS_CONFIG_MEDIA_TYPE => ManifestType::Oras,
            _ => ManifestType::Other,
        }
    }
}

/// Manifest classification by config media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestType {
    Singularity,
    Docker,
    Oci,
    Oras,
    Other,
    Invalid,
}

impl fmt::Display for ManifestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManifestType::Singularity => "singularity",
            ManifestType::Docker => "docker",
            ManifestType::Oci => "oci",
            ManifestType::Oras => "oras",
            ManifestType::Other => "other",
            ManifestType::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// Classify stored manifest content. Unparseable content is invalid.
pub fn classify(manifest: &Manifest) -> ManifestType {
    ManifestDocument::parse(&manifest.content)
        .map(|doc| doc.manifest_type())
        .unwrap_or(ManifestType::Invalid)
}

/// Summary of a stored manifest for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestInfo {
    pub id: ManifestId,
    pub hash: Digest,
    #[serde(rename = "type")]
    pub manifest_type: ManifestType,
    pub filename: String,
    #[serde(rename = "total_size")]
    pub total_size: u64,
    pub stale: bool,
    pub tags: Vec<String>,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Builds, caches and invalidates manifests.
#[derive(Debug, Clone)]
pub struct ManifestSynthesizer {
    store: Arc<dyn MetadataStore>,
}

impl ManifestSynthesizer {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Single layer manifest wrapping a Singularity image.
    pub fn synthesize(
        container: &Container,
        tag: &str,
        digest: &Digest,
        size: u64,
    ) -> RegistryResult<String> {
        let config = Descriptor {
            media_type: SIF_CONFIG_MEDIA_TYPE.to_string(),
            digest: Digest::of(SIF_CONFIG_CONTENT).to_wire(),
            size: Some(SIF_CONFIG_CONTENT.len() as u64),
            annotations: BTreeMap::new(),
        };
        let layer = Descriptor {
            media_type: SIF_LAYER_MEDIA_TYPE.to_string(),
            digest: digest.to_wire(),
            size: Some(size),
            annotations: BTreeMap::from([(
                TITLE_ANNOTATION.to_string(),
                format!("{}_{}.sif", container.name(), tag),
            )]),
        };
        let document = ManifestDocument {
            schema_version: 2,
            media_type: None,
            config: Some(config),
            layers: vec![layer],
        };

        serde_json::to_string(&document)
            .map_err(|err| RegistryError::Internal(format!("manifest serialization: {err}")))
    }

    /// Store `content` for `container`, reusing an identical manifest.
    pub async fn store(&self, container: &Container, content: String) -> RegistryResult<Manifest> {
        let manifest = Manifest::new(container.id, content);
        if let Some(existing) = self.store.find_manifest(container.id, &manifest.hash).await? {
            return Ok(existing);
        }
        match self.store.create_manifest(&manifest).await {
            Ok(()) => Ok(manifest),
            Err(StoreError::Conflict(_)) => self
                .store
                .find_manifest(container.id, &manifest.hash)
                .await?
                .ok_or_else(|| RegistryError::Internal(format!("manifest {} vanished", manifest.hash))),
            Err(error) => Err(error.into()),
        }
    }

    /// The manifest served for `tag`.
    ///
    /// A linked manifest is returned unless it went stale, in which case a
    /// new one is synthesized from the tagged image and linked instead.
    #[tracing::instrument(skip(self, container, tag), fields(container = %container.path, tag = %tag.name))]
    pub async fn build(&self, container: &Container, tag: &Tag) -> RegistryResult<Manifest> {
        if let Some(id) = tag.manifest_id {
            if let Some(manifest) = self.store.get_manifest(id).await? {
                if !self.is_stale(&manifest).await? {
                    return Ok(manifest);
                }
                tracing::debug!(manifest = %manifest.hash, "manifest is stale");
            }
        }

        let image = self
            .store
            .get_image(tag.image_id)
            .await?
            .filter(|image| image.is_completed())
            .ok_or_else(|| RegistryError::ManifestNotFound(tag.name.clone()))?;

        let content =
            Self::synthesize(container, &tag.name, &image.digest, image.size.unwrap_or(0))?;
        let manifest = self.store(container, content).await?;

        let mut linked = tag.clone();
        linked.manifest_id = Some(manifest.id);
        self.store.update_tag(&linked).await?;
        tracing::info!(manifest = %manifest.hash, "synthesized manifest");
        Ok(manifest)
    }

    /// Whether a Singularity layer of `manifest` no longer matches what its
    /// tags point at. Other layers never make a manifest stale.
    pub async fn is_stale(&self, manifest: &Manifest) -> RegistryResult<bool> {
        let Ok(document) = ManifestDocument::parse(&manifest.content) else {
            return Ok(false);
        };

        let tags = self.store.tags_for_manifest(manifest.id).await?;
        for layer in document
            .layers
            .iter()
            .filter(|layer| layer.media_type == SIF_LAYER_MEDIA_TYPE)
        {
            let Ok(digest) = Digest::from_wire(&layer.digest) else {
                return Ok(true);
            };
            if self
                .store
                .find_image_by_digest(manifest.container_id, &digest)
                .await?
                .is_none()
            {
                return Ok(true);
            }
            for tag in &tags {
                match self.store.get_image(tag.image_id).await? {
                    Some(image) if image.digest == digest => {}
                    _ => return Ok(true),
                }
            }
        }
        Ok(false)
    }

    pub async fn describe(&self, manifest: &Manifest) -> RegistryResult<ManifestInfo> {
        let document = ManifestDocument::parse(&manifest.content).ok();
        let tags = self
            .store
            .tags_for_manifest(manifest.id)
            .await?
            .into_iter()
            .map(|tag| tag.name)
            .collect();

        Ok(ManifestInfo {
            id: manifest.id,
            hash: manifest.hash.clone(),
            manifest_type: document
                .as_ref()
                .map_or(ManifestType::Invalid, ManifestDocument::manifest_type),
            filename: document
                .as_ref()
                .map_or_else(|| "(none)".to_string(), ManifestDocument::filename),
            total_size: document.as_ref().map_or(0, ManifestDocument::total_size),
            stale: self.is_stale(manifest).await?,
            tags,
            content: serde_json::from_str(&manifest.content).unwrap_or(serde_json::Value::Null),
            created_at: manifest.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::{ManifestRepo, TagRepo};
    use crate::tags::TagResolver;
    use crate::testing::Fixture;

    fn doc(value: serde_json::Value) -> ManifestDocument {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn synthesized_content_is_exact() {
        let container = Container {
            id: crate::model::ContainerId::new(),
            entity_id: crate::model::EntityId::new(),
            collection_id: crate::model::CollectionId::new(),
            path: crate::model::ContainerPath::parse("lab/tools/samtools", "x").unwrap(),
            owner: None,
            private: false,
            used_quota: 0,
            created_at: Utc::now(),
        };
        let digest = Digest::of(b"sif");
        let content = ManifestSynthesizer::synthesize(&container, "v1", &digest, 3).unwrap();
        let expected = format!(
            concat!(
                r#"{{"schemaVersion":2,"config":{{"mediaType":"application/vnd.sylabs.sif.config.v1+json","#,
                r#""digest":"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a","size":2}},"#,
                r#""layers":[{{"mediaType":"application/vnd.sylabs.sif.layer.v1.sif","digest":"{}","size":3,"#,
                r#""annotations":{{"org.opencontainers.image.title":"samtools_v1.sif"}}}}]}}"#
            ),
            digest.to_wire()
        );
        assert_eq!(content, expected);
        assert_eq!(
            content,
            ManifestSynthesizer::synthesize(&container, "v1", &digest, 3).unwrap()
        );
    }

    #[test]
    fn classification() {
        let cases = [
            (SIF_CONFIG_MEDIA_TYPE, ManifestType::Singularity),
            (DOCKER_CONFIG_MEDIA_TYPE, ManifestType::Docker),
            (OCI_CONFIG_MEDIA_TYPE, ManifestType::Oci),
            (ORAS_CONFIG_MEDIA_TYPE, ManifestType::Oras),
            ("application/x-custom", ManifestType::Other),
        ];
        for (media_type, expected) in cases {
            let document = doc(json!({
                "schemaVersion": 2,
                "config": {"mediaType": media_type, "digest": "sha256:00", "size": 2},
                "layers": [],
            }));
            assert_eq!(document.manifest_type(), expected, "{media_type}");
        }

        let no_config = doc(json!({"schemaVersion": 2, "layers": []}));
        assert_eq!(no_config.manifest_type(), ManifestType::Invalid);

        let garbage = Manifest::new(crate::model::ContainerId::new(), "not json".into());
        assert_eq!(classify(&garbage), ManifestType::Invalid);
    }

    #[test]
    fn sizes_and_filenames() {
        let layer = |title: Option<&str>, media_type: &str, unpack: bool, size: Option<u64>| {
            let mut annotations = serde_json::Map::new();
            if let Some(title) = title {
                annotations.insert(TITLE_ANNOTATION.into(), json!(title));
            }
            if unpack {
                annotations.insert(UNPACK_ANNOTATION.into(), json!("true"));
            }
            let mut value = json!({"mediaType": media_type, "digest": "sha256:00", "annotations": annotations});
            if let Some(size) = size {
                value["size"] = json!(size);
            }
            value
        };

        let single = doc(json!({"schemaVersion": 2, "layers": [layer(Some("a.sif"), SIF_LAYER_MEDIA_TYPE, false, Some(5))]}));
        assert_eq!(single.filename(), "a.sif");
        assert_eq!(single.total_size(), 5);

        let multiple = doc(json!({"schemaVersion": 2, "layers": [
            layer(Some("a"), "x", false, Some(1)),
            layer(Some("b"), "x", false, None),
        ]}));
        assert_eq!(multiple.filename(), "(multiple)");
        assert_eq!(multiple.total_size(), 1);

        let none = doc(json!({"schemaVersion": 2, "layers": [layer(None, "x", false, Some(2))]}));
        assert_eq!(none.filename(), "(none)");

        let tarball = doc(json!({"schemaVersion": 2, "layers": [layer(Some("dir"), "application/vnd.oci.image.layer.v1.tar+gzip", true, None)]}));
        assert_eq!(tarball.filename(), "dir.tar.gz");

        let plain_tar = doc(json!({"schemaVersion": 2, "layers": [layer(Some("dir"), "application/vnd.oci.image.layer.v1.tar", true, None)]}));
        assert_eq!(plain_tar.filename(), "dir.tar");
    }

    #[tokio::test]
    async fn build_is_deterministic_and_cached() {
        let f = Fixture::new().await;
        let tags = TagResolver::new(f.store.clone(), f.blobs.clone(), &f.config);
        let manifests = ManifestSynthesizer::new(f.store.clone());
        let container = f.container("tools").await;
        let image = f.completed_image(&container, b"sif bytes").await;

        let tag = tags.tag_image(&container, "v1", &image, None).await.unwrap();
        let first = manifests.build(&container, &tag).await.unwrap();
        assert_eq!(first.hash, Digest::of(first.content.as_bytes()));

        let tag = f.store.find_tag(container.id, "v1", Some("amd64")).await.unwrap().unwrap();
        assert_eq!(tag.manifest_id, Some(first.id));
        let second = manifests.build(&container, &tag).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.hash, second.hash);
        assert_eq!(f.store.list_manifests(container.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retagging_makes_manifest_stale() {
        let f = Fixture::new().await;
        let tags = TagResolver::new(f.store.clone(), f.blobs.clone(), &f.config);
        let manifests = ManifestSynthesizer::new(f.store.clone());
        let container = f.container("tools").await;
        let d1 = f.completed_image(&container, b"first build").await;
        let d2 = f.completed_image(&container, b"second build").await;

        let tag = tags.tag_image(&container, "v1", &d1, None).await.unwrap();
        let m = manifests.build(&container, &tag).await.unwrap();
        assert!(!manifests.is_stale(&m).await.unwrap());

        let tag = tags.tag_image(&container, "v1", &d2, None).await.unwrap();
        assert!(manifests.is_stale(&m).await.unwrap());
        let info = manifests.describe(&m).await.unwrap();
        assert!(info.stale);
        assert_eq!(info.tags, vec!["v1".to_string()]);

        let rebuilt = manifests.build(&container, &tag).await.unwrap();
        assert_ne!(rebuilt.hash, m.hash);
        let document = ManifestDocument::parse(&rebuilt.content).unwrap();
        assert_eq!(document.layers[0].digest, d2.digest.to_wire());
        assert!(!manifests.is_stale(&rebuilt).await.unwrap());
    }

    #[tokio::test]
    async fn non_sif_layers_never_stale() {
        let f = Fixture::new().await;
        let manifests = ManifestSynthesizer::new(f.store.clone());
        let container = f.container("tools").await;

        let content = json!({
            "schemaVersion": 2,
            "config": {"mediaType": OCI_CONFIG_MEDIA_TYPE, "digest": Digest::of(b"cfg").to_wire(), "size": 3},
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar", "digest": Digest::of(b"gone").to_wire(), "size": 4}],
        })
        .to_string();
        let manifest = manifests.store(&container, content.clone()).await.unwrap();
        assert!(!manifests.is_stale(&manifest).await.unwrap());

        let again = manifests.store(&container, content).await.unwrap();
        assert_eq!(again.id, manifest.id);
    }
}
