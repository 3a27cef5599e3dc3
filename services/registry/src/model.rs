//! Plain records kept by the metadata store.

use std::fmt;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SIF_LAYER_MEDIA_TYPE;
use crate::digest::{validate_name, Digest};
use crate::error::{RegistryError, RegistryResult};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// A fresh random id.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::RegistryError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s).map(Self).map_err(|_| {
                    $crate::error::RegistryError::InvalidRequest(format!("invalid id: {s}"))
                })
            }
        }
    };
}

pub(crate) use id_type;

id_type!(
    /// Group id
    GroupId
);
id_type!(
    /// Entity id
    EntityId
);
id_type!(
    /// Collection id
    CollectionId
);
id_type!(
    /// Container id
    ContainerId
);
id_type!(
    /// Image (blob row) id
    ImageId
);
id_type!(
    /// Tag id
    TagId
);
id_type!(
    /// Upload session id, also the opaque upload token
    UploadId
);
id_type!(
    /// Stored manifest id
    ManifestId
);

/// A user, created on first sight.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub is_admin: bool,
    pub quota: u64,
    pub used_quota: u64,
    pub created_at: DateTime<Utc>,
}

/// A group of users sharing entities and a quota.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub members: Vec<String>,
    pub quota: u64,
    pub used_quota: u64,
}

/// Top level namespace, owned by a user or a group.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub owner: Option<String>,
    pub group_id: Option<GroupId>,
    pub used_quota: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: CollectionId,
    pub entity_id: EntityId,
    pub name: String,
    pub owner: Option<String>,
    pub used_quota: u64,
    pub created_at: DateTime<Utc>,
}

/// A named image repository inside a collection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: ContainerId,
    pub entity_id: EntityId,
    pub collection_id: CollectionId,
    pub path: ContainerPath,
    pub owner: Option<String>,
    pub private: bool,
    pub used_quota: u64,
    pub created_at: DateTime<Utc>,
}

impl Container {
    pub fn name(&self) -> &str {
        &self.path.container
    }
}

/// `entity/collection/container`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerPath {
    pub entity: String,
    pub collection: String,
    pub container: String,
}

impl ContainerPath {
    /// Parse a slash separated repository path.
    ///
    /// A missing entity defaults to `default_entity`, a missing collection to
    /// `default`.
    pub fn parse(path: &str, default_entity: &str) -> RegistryResult<Self> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        let (entity, collection, container) = match parts.as_slice() {
            [container] => (default_entity, "default", *container),
            [collection, container] => (default_entity, *collection, *container),
            [entity, collection, container] => (*entity, *collection, *container),
            _ => return Err(RegistryError::InvalidName(path.to_string())),
        };

        for name in [entity, collection, container] {
            validate_name(name)?;
        }

        Ok(Self {
            entity: entity.to_string(),
            collection: collection.to_string(),
            container: container.to_string(),
        })
    }

    /// Relative path of the legacy pull-by-path symlink for `tag`.
    pub fn link_path(&self, tag: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.entity)
            .join(&self.collection)
            .join(format!("{}_{}.sif", self.container, tag))
    }
}

impl fmt::Display for ContainerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.entity, self.collection, self.container)
    }
}

/// Upload state of an image or upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Initialized,
    Uploading,
    Uploaded,
    Completed,
    Failed,
    Broken,
}

impl UploadState {
    /// `completed` and `failed` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Completed | UploadState::Failed)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadState::Initialized => "initialized",
            UploadState::Uploading => "uploading",
            UploadState::Uploaded => "uploaded",
            UploadState::Completed => "completed",
            UploadState::Failed => "failed",
            UploadState::Broken => "broken",
        };
        f.write_str(name)
    }
}

/// One stored blob for one container.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub id: ImageId,
    pub container_id: ContainerId,
    pub digest: Digest,
    pub size: Option<u64>,
    /// Path relative to the storage root once finalized.
    pub location: Option<Utf8PathBuf>,
    pub upload_state: UploadState,
    pub media_type: String,
    pub arch: Option<String>,
    pub owner: Option<String>,
    pub signed: bool,
    pub signature_verified: bool,
    pub sigdata: Option<serde_json::Value>,
    pub download_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    pub fn new(container_id: ContainerId, digest: Digest, arch: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ImageId::new(),
            container_id,
            digest,
            size: None,
            location: None,
            upload_state: UploadState::Initialized,
            media_type: SIF_LAYER_MEDIA_TYPE.to_string(),
            arch,
            owner: None,
            signed: false,
            signature_verified: false,
            sigdata: None,
            download_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.upload_state == UploadState::Completed
    }

    pub fn is_singularity(&self) -> bool {
        self.media_type == SIF_LAYER_MEDIA_TYPE
    }
}

/// Architecture scoped pointer from a container to an image.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: TagId,
    pub container_id: ContainerId,
    pub name: String,
    pub arch: Option<String>,
    pub image_id: ImageId,
    pub manifest_id: Option<ManifestId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    Single,
    Multipart,
    MultipartChunk,
}

/// One upload attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: UploadId,
    /// Scratch file (single, chunk) or directory (multipart).
    pub path: Utf8PathBuf,
    /// Announced size.
    pub size: Option<u64>,
    pub md5sum: Option<String>,
    /// Announced digest.
    pub sha256sum: Option<Digest>,
    /// Digest of the bytes actually received.
    pub received_digest: Option<Digest>,
    pub received_size: u64,
    pub state: UploadState,
    pub kind: UploadKind,
    pub part_number: Option<u32>,
    pub total_parts: Option<u32>,
    pub parent_id: Option<UploadId>,
    pub image_id: Option<ImageId>,
    pub container_id: ContainerId,
    pub owner: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A manifest document, keyed by the hash of its exact content.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: ManifestId,
    pub container_id: ContainerId,
    pub hash: Digest,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    pub fn new(container_id: ContainerId, content: String) -> Self {
        Self {
            id: ManifestId::new(),
            container_id,
            hash: Digest::of(content.as_bytes()),
            content,
            created_at: Utc::now(),
        }
    }
}
