//! SIF registry server binary.

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr as _;
use sif_registry::{RegistryBuilder, RegistryConfig};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

/// Singularity Library and OCI distribution server.
#[derive(Debug, Parser)]
#[command(name = "sif-registry-server", version, about)]
struct Args {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "SIF_REGISTRY_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:5000")]
    bind: SocketAddr,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn load_config(path: Option<&Utf8PathBuf>) -> eyre::Result<RegistryConfig> {
    let Some(path) = path else {
        tracing::info!("no configuration file, using defaults");
        return Ok(RegistryConfig::default());
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("reading {path}"))?;
    let config = toml_edit::de::from_str(&text).wrap_err_with(|| format!("parsing {path}"))?;
    tracing::info!(%path, "loaded configuration");
    Ok(config)
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);
    tracing::info!("sif-registry v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(args.config.as_ref()).await?;
    let app = RegistryBuilder::new()
        .config(config)
        .build()
        .await
        .wrap_err("building registry")?;

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .wrap_err_with(|| format!("binding {}", args.bind))?;
    tracing::info!(addr = %args.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await
        .wrap_err("serving")?;
    Ok(())
}

async fn shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
