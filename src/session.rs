//! Resolve bearer tokens into identities and rotate refresh tokens.

use std::sync::Arc;

use crate::cache::{IDENTITY_TTL, IdentityCache, identity_key};
use crate::error::{Result, ServerError};
use crate::token::{Scope, TokenManager, TokenPair};
use crate::user::{Identity, UserRepository};

pub const INVALID_REFRESH_TOKEN: &str = "Invalid refresh token";

/// Session resolver.
#[derive(Clone)]
pub struct SessionResolver {
    tokens: Arc<TokenManager>,
    users: Arc<dyn UserRepository>,
    cache: Arc<dyn IdentityCache>,
}

impl SessionResolver {
    /// Create a new [`SessionResolver`].
    pub fn new(
        tokens: Arc<TokenManager>,
        users: Arc<dyn UserRepository>,
        cache: Arc<dyn IdentityCache>,
    ) -> Self {
        Self {
            tokens,
            users,
            cache,
        }
    }

    /// Resolve an access token into the [`Identity`] of its owner.
    ///
    /// Identities are served from cache when possible.
    pub async fn resolve(&self, access_token: &str) -> Result<Identity> {
        let email = self
            .tokens
            .validate(access_token, Some(Scope::AccessToken))?;

        if let Some(identity) = self.cached(&email).await {
            return Ok(identity);
        }

        let user = self
            .users
            .find_by_email(&email)
            .await?
            .ok_or(ServerError::InvalidToken)?;

        let identity = Identity::from(&user);
        self.remember(&identity).await;

        Ok(identity)
    }

    async fn cached(&self, email: &str) -> Option<Identity> {
        let key = identity_key(email);

        let raw = match self.cache.get(&key).await {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!(error = %err, key, "cache lookup failed");
                return None;
            },
        };

        match serde_json::from_str(&raw) {
            Ok(identity) => Some(identity),
            Err(err) => {
                tracing::warn!(error = %err, key, "undecodable cache entry");
                None
            },
        }
    }

    /// Overwrite the cached [`Identity`].
    ///
    /// Failures are logged only.
    pub async fn remember(&self, identity: &Identity) {
        let key = identity_key(&identity.email);

        let value = match serde_json::to_string(identity) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, key, "identity serialization failed");
                return;
            },
        };

        if let Err(err) = self.cache.set(&key, &value).await {
            tracing::warn!(error = %err, key, "cache write failed");
            return;
        }
        if let Err(err) = self.cache.expire(&key, IDENTITY_TTL).await {
            tracing::warn!(error = %err, key, "cache expiry failed");
        }
    }

    /// Trade a refresh token for a new token pair.
    ///
    /// A refresh token that is not the stored one revokes the session.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let email = self
            .tokens
            .validate(refresh_token, Some(Scope::RefreshToken))?;

        let user = self
            .users
            .find_by_email(&email)
            .await?
            .ok_or(ServerError::InvalidToken)?;

        if user.refresh_token.as_deref() != Some(refresh_token) {
            tracing::warn!(user_id = user.id, "refresh token reuse, session revoked");
            self.users.update_refresh_token(user.id, None).await?;
            return Err(ServerError::unauthorized(INVALID_REFRESH_TOKEN));
        }

        let pair = self.tokens.issue_pair(&email)?;

        let rotated = self
            .users
            .rotate_refresh_token(user.id, refresh_token, &pair.refresh_token)
            .await?;
        if !rotated {
            tracing::debug!(user_id = user.id, "concurrent refresh lost the rotation");
            return Err(ServerError::unauthorized(INVALID_REFRESH_TOKEN));
        }

        Ok(pair)
    }
}
