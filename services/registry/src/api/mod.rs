//! API server builder and router

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::routing::{any, get};
use axum::{Json, Router};
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use storage::{Reader, Storage};
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::trace::TraceLayer;

use crate::access::{AccessPolicy, OwnerPolicy};
use crate::config::RegistryConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::service::Registry;
use crate::store::{MemoryMetadata, MetadataStore};

mod auth;
mod library;
mod oci;

pub use auth::{Authenticator, Caller, TokenAuthenticator};

/// Largest JSON or manifest body read into memory.
const MAX_DOCUMENT_BYTES: usize = 4 * 1024 * 1024;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    registry: Registry,
    auth: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(registry: Registry, auth: Arc<dyn Authenticator>) -> Self {
        Self { registry, auth }
    }
}

/// Registry builder for configuring and creating the registry service
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    config: RegistryConfig,
    storage: Option<Storage>,
    metadata: Option<Arc<dyn MetadataStore>>,
    policy: Option<Arc<dyn AccessPolicy>>,
    auth: Option<Arc<dyn Authenticator>>,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the storage backend named in the config
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Metadata store, in memory by default
    pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Access policy, [`OwnerPolicy`] by default
    pub fn policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Authenticator, the config's token table by default
    pub fn authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Build the engine and its shared state.
    pub async fn build_state(self) -> RegistryResult<AppState> {
        let auth = self
            .auth
            .unwrap_or_else(|| Arc::new(TokenAuthenticator::from_config(&self.config)));
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(MemoryMetadata::new()));
        let policy = self.policy.unwrap_or_else(|| Arc::new(OwnerPolicy));

        let registry = match self.storage {
            Some(storage) => Registry::with_storage(self.config, metadata, policy, storage).await?,
            None => Registry::new(self.config, metadata, policy).await?,
        };
        Ok(AppState::new(registry, auth))
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub async fn build(self) -> RegistryResult<Router> {
        Ok(router(self.build_state().await?))
    }
}

/// Both protocol surfaces over one engine.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(library::router())
        .route("/v2/", get(oci::base))
        .route("/v2/{*path}", any(oci::dispatch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Library responses carry their payload under `data`.
fn data<T: Serialize>(value: T) -> Json<serde_json::Value> {
    Json(json!({ "data": value }))
}

/// Stream a request body without buffering it.
fn body_reader(body: Body) -> impl AsyncRead + Unpin + Send {
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

fn reader_body(reader: Reader) -> Body {
    Body::from_stream(ReaderStream::new(reader))
}

async fn read_document(body: Body) -> RegistryResult<bytes::Bytes> {
    axum::body::to_bytes(body, MAX_DOCUMENT_BYTES)
        .await
        .map_err(|err| RegistryError::InvalidRequest(err.to_string()))
}

async fn json_body<T: DeserializeOwned>(body: Body) -> RegistryResult<T> {
    let bytes = read_document(body).await?;
    serde_json::from_slice(&bytes).map_err(|err| RegistryError::InvalidRequest(err.to_string()))
}
