//! Manage json web tokens.
//!
//! Every token is signed with the same key; the `scope` claim restricts a
//! token to the purpose it was minted for.

use std::sync::Arc;

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Result, ServerError};

/// Access token lifetime, 15 minutes.
pub const ACCESS_TOKEN_EXPIRATION: u64 = 60 * 15;
/// Refresh token lifetime, 7 days.
pub const REFRESH_TOKEN_EXPIRATION: u64 = 60 * 60 * 24 * 7;
/// Email confirmation token lifetime, 1 day.
pub const EMAIL_TOKEN_EXPIRATION: u64 = 60 * 60 * 24;
/// Reset password token lifetime, 30 minutes.
pub const RESET_PASSWORD_TOKEN_EXPIRATION: u64 = 60 * 30;

pub const TOKEN_TYPE: &str = "bearer";
const JTI_LENGTH: usize = 12;

/// Purpose a token was minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    AccessToken,
    RefreshToken,
    ResetPasswordToken,
}

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User email.
    pub sub: String,
    /// Identifies the time at which the JWT was issued.
    pub iat: u64,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: u64,
    /// Unique identifier of this token.
    pub jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
}

/// Access and refresh tokens handed out on login and refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

/// Manage JWT tokens.
#[derive(Clone)]
pub struct TokenManager {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("algorithm", &self.algorithm)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

impl TokenManager {
    /// Create a new [`TokenManager`].
    ///
    /// `algorithm` must be `HS256` or `HS512`.
    pub fn new(
        secret: &str,
        algorithm: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let algorithm = match algorithm {
            "HS256" => Algorithm::HS256,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(ServerError::Internal {
                    details: format!("algorithm must be HS256 or HS512, got {other}"),
                    source: None,
                });
            },
        };

        if secret.is_empty() {
            return Err(ServerError::Internal {
                details: "token secret is empty".into(),
                source: None,
            });
        }

        Ok(Self {
            algorithm,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            clock,
        })
    }

    fn issue(
        &self,
        email: &str,
        lifetime: u64,
        scope: Option<Scope>,
    ) -> Result<String> {
        let now = self.clock.now();
        let claims = Claims {
            sub: email.to_owned(),
            iat: now,
            exp: now + lifetime,
            jti: Alphanumeric.sample_string(&mut OsRng, JTI_LENGTH),
            scope,
        };

        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|err| ServerError::internal("failed to sign token", err))
    }

    /// Create a 15-minute access token.
    pub fn issue_access_token(&self, email: &str) -> Result<String> {
        self.issue(email, ACCESS_TOKEN_EXPIRATION, Some(Scope::AccessToken))
    }

    /// Create a 7-day refresh token.
    ///
    /// Callers must persist it as the user's only refresh token.
    pub fn issue_refresh_token(&self, email: &str) -> Result<String> {
        self.issue(email, REFRESH_TOKEN_EXPIRATION, Some(Scope::RefreshToken))
    }

    /// Create a 1-day email confirmation token, without scope.
    pub fn issue_email_token(&self, email: &str) -> Result<String> {
        self.issue(email, EMAIL_TOKEN_EXPIRATION, None)
    }

    /// Create a 30-minute reset password token.
    pub fn issue_reset_password_token(&self, email: &str) -> Result<String> {
        self.issue(
            email,
            RESET_PASSWORD_TOKEN_EXPIRATION,
            Some(Scope::ResetPasswordToken),
        )
    }

    /// Create an access and refresh token pair.
    pub fn issue_pair(&self, email: &str) -> Result<TokenPair> {
        Ok(TokenPair {
            access_token: self.issue_access_token(email)?,
            refresh_token: self.issue_refresh_token(email)?,
            token_type: TOKEN_TYPE.to_owned(),
        })
    }

    /// Decode and check a token.
    pub fn decode(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm);
        // expiry is checked against our own clock.
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|err| {
                tracing::debug!(error = %err, "token rejected");
                ServerError::InvalidToken
            })?
            .claims;

        if claims.exp <= self.clock.now() {
            tracing::debug!(sub = claims.sub, "token expired");
            return Err(ServerError::InvalidToken);
        }

        Ok(claims)
    }

    /// Check a token and return its subject.
    ///
    /// When `expected` is set, the token must carry that exact scope.
    pub fn validate(
        &self,
        token: &str,
        expected: Option<Scope>,
    ) -> Result<String> {
        let claims = self.decode(token)?;

        match expected {
            Some(scope) if claims.scope != Some(scope) => {
                tracing::debug!(?scope, found = ?claims.scope, "token scope mismatch");
                Err(ServerError::InvalidToken)
            },
            _ => Ok(claims.sub),
        }
    }
}
