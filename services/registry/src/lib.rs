//! # SIF Registry
//!
//! A registry for Singularity (SIF) container images that speaks two
//! protocols over one content addressed blob store:
//!
//! - the Singularity Library API (`/v1/...` and `/v2/imagefile/...`), with
//!   single and multipart uploads, tags per architecture and pull by path
//! - the [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec)
//!   (`/v2/<name>/...`), with manifests synthesized for Library images
//!
//! Blobs are deduplicated by digest, uploads are charged against per-user or
//! per-group quotas, and maintenance jobs run on a background worker.
//!
//! ## Example
//!
//! ```no_run
//! use sif_registry::{RegistryBuilder, RegistryConfig, TokenAuthenticator};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let auth = TokenAuthenticator::default().with_token("s3cret", "alice", false);
//! let app = RegistryBuilder::new()
//!     .config(RegistryConfig::default())
//!     .authenticator(Arc::new(auth))
//!     .build()
//!     .await?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

mod access;
mod api;
mod blobstore;
mod config;
mod digest;
mod error;
mod jobs;
mod manifest;
mod model;
mod quota;
mod service;
mod store;
mod tags;
mod upload;

#[cfg(test)]
mod testing;

pub use access::{AccessPolicy, Identity, OwnerPolicy, Resource};
pub use api::{router, AppState, Authenticator, Caller, RegistryBuilder, TokenAuthenticator};
pub use config::{RegistryConfig, TokenGrant, SIF_CONFIG_MEDIA_TYPE, SIF_LAYER_MEDIA_TYPE};
pub use digest::Digest;
pub use error::{RegistryError, RegistryResult};
pub use jobs::{Job, JobId, JobState, JobStatus};
pub use manifest::ManifestInfo;
pub use model::{
    Collection, CollectionId, Container, ContainerId, ContainerPath, Entity, EntityId, Group,
    GroupId, Image, ImageId, Manifest, ManifestId, Tag, TagId, UploadId, UploadKind,
    UploadSession, UploadState, User,
};
pub use service::{Access, BlobFetch, Registry};
pub use store::{
    ImageRepo, ManifestRepo, MemoryMetadata, MetadataStore, NamespaceRepo, StoreError,
    StoreResult, TagRepo, UploadRepo,
};
