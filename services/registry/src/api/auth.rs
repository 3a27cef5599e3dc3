//! Resolving request credentials to an [`Identity`].

use std::collections::BTreeMap;
use std::fmt;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};

use super::AppState;
use crate::access::Identity;
use crate::config::{RegistryConfig, TokenGrant};
use crate::error::{RegistryError, RegistryResult};

/// Turns request headers into a caller identity.
///
/// `Ok(None)` is an anonymous caller. Credentials that are present but not
/// recognized are an error.
pub trait Authenticator: fmt::Debug + Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> RegistryResult<Option<Identity>>;
}

/// Static `Authorization: Bearer <token>` table.
#[derive(Clone, Default)]
pub struct TokenAuthenticator {
    tokens: BTreeMap<String, TokenGrant>,
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl TokenAuthenticator {
    pub fn new(tokens: BTreeMap<String, TokenGrant>) -> Self {
        Self { tokens }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.tokens.clone())
    }

    /// Add a token, mostly useful in tests.
    pub fn with_token(mut self, token: impl Into<String>, username: impl Into<String>, admin: bool) -> Self {
        self.tokens.insert(
            token.into(),
            TokenGrant {
                username: username.into(),
                admin,
            },
        );
        self
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> RegistryResult<Option<Identity>> {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Ok(None);
        };
        let token = value
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or(RegistryError::Unauthorized)?;

        let grant = self.tokens.get(token).ok_or(RegistryError::Unauthorized)?;
        Ok(Some(Identity {
            username: grant.username.clone(),
            is_admin: grant.admin,
        }))
    }
}

/// The authenticated caller of a request, if any.
#[derive(Debug, Clone)]
pub struct Caller(pub Option<Identity>);

impl Caller {
    pub fn identity(&self) -> Option<&Identity> {
        self.0.as_ref()
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = RegistryError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let identity = state.auth.authenticate(&parts.headers)?;
        if let Some(identity) = &identity {
            tracing::trace!(user = %identity.username, "authenticated request");
        }
        Ok(Caller(identity))
    }
}
