//! Content digests and name validation.
//!
//! Digests are stored as `sha256.<hex>`. The OCI wire form `sha256:<hex>` is
//! only produced and accepted at the HTTP boundary.

use std::fmt;
use std::str::FromStr;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{RegistryError, RegistryResult};

const INTERNAL_PREFIX: &str = "sha256.";
const WIRE_PREFIX: &str = "sha256:";
const HEX_LEN: usize = 64;

/// A SHA-256 content digest.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Build a digest from 64 hex characters.
    pub fn from_hex(hex: &str) -> RegistryResult<Self> {
        if hex.len() != HEX_LEN || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RegistryError::InvalidDigest(hex.to_string()));
        }
        Ok(Self {
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Parse the internal `sha256.<hex>` form.
    pub fn parse(value: &str) -> RegistryResult<Self> {
        value
            .strip_prefix(INTERNAL_PREFIX)
            .ok_or_else(|| RegistryError::InvalidDigest(value.to_string()))
            .and_then(Self::from_hex)
            .map_err(|_| RegistryError::InvalidDigest(value.to_string()))
    }

    /// Parse the OCI wire `sha256:<hex>` form.
    pub fn from_wire(value: &str) -> RegistryResult<Self> {
        value
            .strip_prefix(WIRE_PREFIX)
            .ok_or_else(|| RegistryError::InvalidDigest(value.to_string()))
            .and_then(Self::from_hex)
            .map_err(|_| RegistryError::InvalidDigest(value.to_string()))
    }

    /// Digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        Self {
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    /// Whether a tag reference is really a digest reference.
    pub fn is_reference(value: &str) -> bool {
        value.starts_with(INTERNAL_PREFIX)
    }

    /// The bare hex string.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// The `sha256:<hex>` wire form.
    pub fn to_wire(&self) -> String {
        format!("{WIRE_PREFIX}{}", self.hex)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{INTERNAL_PREFIX}{}", self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({INTERNAL_PREFIX}{})", self.hex)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

/// Running SHA-256 over a byte stream, counting bytes as it goes.
#[derive(Debug, Clone, Default)]
pub struct Hasher {
    inner: Sha256,
    size: u64,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.size += data.len() as u64;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> (Digest, u64) {
        let digest = Digest {
            hex: hex::encode(self.inner.finalize()),
        };
        (digest, self.size)
    }
}

/// Digest and size of a file on disk.
pub async fn hash_file(path: &Utf8Path) -> std::io::Result<(Digest, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finish())
}

/// Entity, collection, container and tag names: alphanumerics plus `.`, `-`
/// and `_`, starting and ending with an alphanumeric.
pub fn validate_name(name: &str) -> RegistryResult<()> {
    let bytes = name.as_bytes();
    let valid = match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}
