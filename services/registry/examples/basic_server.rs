//! Registry server with in-memory blobs and one user.
//!
//! Run with: cargo run -p sif-registry --example basic_server

use std::sync::Arc;

use sif_registry::{RegistryBuilder, RegistryConfig, TokenAuthenticator};
use storage::MemoryStorage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Scratch uploads still go to disk.
    let scratch = tempfile::tempdir()?;
    let config = RegistryConfig {
        image_path: camino::Utf8PathBuf::try_from(scratch.path().to_path_buf())?,
        ..Default::default()
    };

    let auth = TokenAuthenticator::default().with_token("demo", "demo", false);
    let app = RegistryBuilder::new()
        .config(config)
        .storage(MemoryStorage::new().into())
        .authenticator(Arc::new(auth))
        .build()
        .await?;

    let addr = "127.0.0.1:5000";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("SIF registry listening on http://{}", addr);
    tracing::info!("Try: curl -H 'Authorization: Bearer demo' http://{}/v2/", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
