//! Account lifecycle: signup, login, email confirmation, password reset and
//! avatar update.

use std::sync::Arc;

use crate::avatar::{self, AvatarHost};
use crate::crypto::PasswordManager;
use crate::error::{Result, ServerError};
use crate::mail::{Mailer, Template, Variables};
use crate::session::SessionResolver;
use crate::token::{Scope, TokenManager, TokenPair};
use crate::user::{EMAIL_TAKEN, Identity, NewUser, User, UserRepository};

pub const INVALID_EMAIL: &str = "Invalid email";
pub const EMAIL_NOT_CONFIRMED: &str = "Email not confirmed";
pub const INVALID_PASSWORD: &str = "Invalid password";
pub const INVALID_EMAIL_TOKEN: &str = "Invalid token for email verification";
pub const VERIFICATION_ERROR: &str = "Verification error";
pub const ALREADY_CONFIRMED: &str = "Your email is already confirmed";
pub const EMAIL_CONFIRMED: &str = "Email confirmed";
pub const CHECK_CONFIRMATION: &str = "Check your email for confirmation.";
pub const CHECK_RESET: &str = "Check your email for reset password link.";
pub const USER_NOT_FOUND: &str = "User not found";
pub const PASSWORDS_MISMATCH: &str = "Passwords do not match";
pub const INVALID_RESET_TOKEN: &str = "Invalid or expired token";
pub const PASSWORD_RESET: &str = "Password successfully reset.";

/// Account service.
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserRepository>,
    tokens: Arc<TokenManager>,
    passwords: Arc<PasswordManager>,
    session: Arc<SessionResolver>,
    mailer: Arc<dyn Mailer>,
    avatars: Arc<dyn AvatarHost>,
    /// Public URL put in emails.
    host: String,
}

impl AuthService {
    /// Create a new [`AuthService`].
    pub fn new(
        users: Arc<dyn UserRepository>,
        tokens: Arc<TokenManager>,
        passwords: Arc<PasswordManager>,
        session: Arc<SessionResolver>,
        mailer: Arc<dyn Mailer>,
        avatars: Arc<dyn AvatarHost>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            users,
            tokens,
            passwords,
            session,
            mailer,
            avatars,
            host: host.into(),
        }
    }

    /// Register a new unconfirmed user and send them a confirmation link.
    pub async fn signup(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<User> {
        if self.users.find_by_email(email).await?.is_some() {
            return Err(ServerError::Conflict(EMAIL_TAKEN.into()));
        }

        let user = self
            .users
            .insert(NewUser {
                username: username.to_owned(),
                email: email.to_owned(),
                password: self.passwords.hash(password)?,
                avatar: Some(avatar::gravatar_url(email)),
            })
            .await?;

        tracing::info!(user_id = user.id, "user created");

        self.send_confirmation(&user).await;

        Ok(user)
    }

    async fn send_confirmation(&self, user: &User) {
        let token = match self.tokens.issue_email_token(&user.email) {
            Ok(token) => token,
            Err(err) => {
                tracing::error!(error = %err, user_id = user.id, "confirmation token not created");
                return;
            },
        };

        self.send(user, Template::ConfirmEmail, token).await;
    }

    async fn send(&self, user: &User, template: Template, token: String) {
        let variables = Variables::from([
            ("host", self.host.clone()),
            ("username", user.username.clone()),
            ("token", token),
        ]);

        if let Err(err) = self.mailer.send(&user.email, template, variables).await {
            tracing::error!(error = %err, user_id = user.id, ?template, "mail not sent");
        }
    }

    /// Check credentials and open a session.
    ///
    /// The new refresh token replaces any previous one.
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair> {
        let user = self
            .users
            .find_by_email(email)
            .await?
            .ok_or_else(|| ServerError::unauthorized(INVALID_EMAIL))?;

        if !user.confirmed {
            return Err(ServerError::unauthorized(EMAIL_NOT_CONFIRMED));
        }

        if !self.passwords.verify(password, &user.password) {
            return Err(ServerError::unauthorized(INVALID_PASSWORD));
        }

        let pair = self.tokens.issue_pair(&user.email)?;
        self.users
            .update_refresh_token(user.id, Some(&pair.refresh_token))
            .await?;

        tracing::debug!(user_id = user.id, "user logged in");

        Ok(pair)
    }

    /// Confirm the email carried by an email token.
    pub async fn confirm_email(&self, token: &str) -> Result<&'static str> {
        let email = self
            .tokens
            .validate(token, None)
            .map_err(|_| ServerError::BadRequest(INVALID_EMAIL_TOKEN.into()))?;

        let user = self
            .users
            .find_by_email(&email)
            .await?
            .ok_or_else(|| ServerError::BadRequest(VERIFICATION_ERROR.into()))?;

        if user.confirmed {
            return Ok(ALREADY_CONFIRMED);
        }

        self.users.set_confirmed(&email).await?;
        tracing::info!(user_id = user.id, "email confirmed");

        Ok(EMAIL_CONFIRMED)
    }

    /// Send the confirmation link again.
    ///
    /// Unknown emails get the same answer as known ones.
    pub async fn request_email(&self, email: &str) -> Result<&'static str> {
        match self.users.find_by_email(email).await? {
            Some(user) if user.confirmed => Ok(ALREADY_CONFIRMED),
            Some(user) => {
                self.send_confirmation(&user).await;
                Ok(CHECK_CONFIRMATION)
            },
            None => Ok(CHECK_CONFIRMATION),
        }
    }

    /// Send a reset password link.
    pub async fn request_reset_password(&self, email: &str) -> Result<&'static str> {
        let user = self
            .users
            .find_by_email(email)
            .await?
            .ok_or_else(|| ServerError::NotFound(USER_NOT_FOUND.into()))?;

        let token = self.tokens.issue_reset_password_token(&user.email)?;
        self.send(&user, Template::ResetPassword, token).await;

        Ok(CHECK_RESET)
    }

    /// Set a new password using a reset password token.
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
        confirm_password: &str,
    ) -> Result<&'static str> {
        if new_password != confirm_password {
            return Err(ServerError::BadRequest(PASSWORDS_MISMATCH.into()));
        }

        let email = self
            .tokens
            .validate(token, Some(Scope::ResetPasswordToken))
            .map_err(|_| ServerError::BadRequest(INVALID_RESET_TOKEN.into()))?;

        let user = self
            .users
            .find_by_email(&email)
            .await?
            .ok_or_else(|| ServerError::NotFound(USER_NOT_FOUND.into()))?;

        let hash = self.passwords.hash(new_password)?;
        self.users.update_password(&user.email, &hash).await?;

        tracing::info!(user_id = user.id, "password reset");

        Ok(PASSWORD_RESET)
    }

    /// Upload a new avatar and refresh the cached identity.
    pub async fn update_avatar(
        &self,
        identity: &Identity,
        image: Vec<u8>,
    ) -> Result<User> {
        let url = self
            .avatars
            .upload(&avatar::public_id(&identity.email), image)
            .await?;

        let user = self.users.update_avatar(&identity.email, &url).await?;
        self.session.remember(&Identity::from(&user)).await;

        Ok(user)
    }
}
