//! Registry configuration.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::Deserialize;
use storage::StorageConfig;

/// Media type of a Singularity image layer.
pub const SIF_LAYER_MEDIA_TYPE: &str = "application/vnd.sylabs.sif.layer.v1.sif";

/// Media type of the fixed Singularity config blob.
pub const SIF_CONFIG_MEDIA_TYPE: &str = "application/vnd.sylabs.sif.config.v1+json";

/// Settings consumed by every registry component.
///
/// Loaded from TOML by the server binary; every key is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistryConfig {
    /// Root for permanent blobs (`_imgs/`), scratch uploads (`_tmp/`) and
    /// legacy symlinks.
    pub image_path: Utf8PathBuf,

    /// Number of leading digest characters turned into nested directories.
    pub image_path_hash_level: usize,

    /// Part size announced to multipart clients.
    pub multipart_upload_chunk: u64,

    /// Architecture assumed when a request does not name one.
    pub default_arch: String,

    /// Lifetime of OCI blob download tokens, in seconds.
    pub download_token_expiration: u64,

    /// Lifetime of upload sessions, in seconds.
    pub upload_expiration: u64,

    /// Quota for newly seen users. Zero is unlimited.
    pub default_user_quota: u64,

    /// Quota for newly created groups. Zero is unlimited.
    pub default_group_quota: u64,

    /// Blob backend. Defaults to local storage under `image-path`.
    pub storage: Option<StorageConfig>,

    /// Static bearer tokens.
    pub tokens: BTreeMap<String, TokenGrant>,
}

/// Identity granted to a bearer token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    /// Username the token authenticates as.
    pub username: String,

    /// Whether the user is an administrator.
    #[serde(default)]
    pub admin: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            image_path: Utf8PathBuf::from("./data"),
            image_path_hash_level: 2,
            multipart_upload_chunk: 64 * 1024 * 1024,
            default_arch: "amd64".into(),
            download_token_expiration: 86400,
            upload_expiration: 3600,
            default_user_quota: 0,
            default_group_quota: 0,
            storage: None,
            tokens: BTreeMap::new(),
        }
    }
}

impl RegistryConfig {
    /// The configured storage backend, falling back to local storage.
    pub fn storage_config(&self) -> StorageConfig {
        self.storage
            .clone()
            .unwrap_or(StorageConfig::Local { path: None })
    }

    pub fn upload_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.upload_expiration).unwrap_or(i64::MAX / 1000))
    }

    pub fn download_token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.download_token_expiration).unwrap_or(i64::MAX / 1000),
        )
    }

    /// Scratch area for uploads in progress.
    pub fn scratch_dir(&self) -> Utf8PathBuf {
        self.image_path.join("_tmp")
    }
}
