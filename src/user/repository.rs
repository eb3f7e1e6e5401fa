//! Handle database requests.

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::error::{Result, ServerError};
use crate::user::{NewUser, User};

pub const EMAIL_TAKEN: &str = "Account with this email already exists";

/// Credential store.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Find a [`User`] by email.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Insert a new [`User`] with role `user`, unconfirmed.
    ///
    /// Fails with [`ServerError::Conflict`] when the email is taken.
    async fn insert(&self, user: NewUser) -> Result<User>;

    /// Overwrite the stored refresh token.
    async fn update_refresh_token(
        &self,
        user_id: i32,
        token: Option<&str>,
    ) -> Result<()>;

    /// Replace the stored refresh token only if it still equals `current`.
    ///
    /// Returns whether the rotation happened.
    async fn rotate_refresh_token(
        &self,
        user_id: i32,
        current: &str,
        next: &str,
    ) -> Result<bool>;

    /// Mark the account email as confirmed.
    async fn set_confirmed(&self, email: &str) -> Result<()>;

    /// Store a new avatar URL and return the updated [`User`].
    async fn update_avatar(&self, email: &str, url: &str) -> Result<User>;

    /// Store a new password hash.
    async fn update_password(&self, email: &str, password: &str) -> Result<()>;
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i32,
    username: String,
    email: String,
    password: String,
    avatar: Option<String>,
    refresh_token: Option<String>,
    role: String,
    confirmed: bool,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = ServerError;

    fn try_from(row: UserRow) -> Result<Self> {
        let role = row
            .role
            .parse()
            .map_err(|err| ServerError::internal("invalid stored role", err))?;

        Ok(User {
            id: row.id,
            username: row.username,
            email: row.email,
            password: row.password,
            avatar: row.avatar,
            refresh_token: row.refresh_token,
            role,
            confirmed: row.confirmed,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const COLUMNS: &str = "id, username, email, password, avatar, refresh_token, role, confirmed, created_at, updated_at";

/// PostgreSQL credential store.
#[derive(Clone)]
pub struct PgUserRepository {
    pool: Pool<Postgres>,
}

impl PgUserRepository {
    /// Create a new [`PgUserRepository`].
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let query = format!("SELECT {COLUMNS} FROM users WHERE email = $1");

        sqlx::query_as::<_, UserRow>(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn insert(&self, user: NewUser) -> Result<User> {
        let query = format!(
            "INSERT INTO users (username, email, password, avatar) VALUES ($1, $2, $3, $4) RETURNING {COLUMNS}"
        );

        let row = sqlx::query_as::<_, UserRow>(&query)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password)
            .bind(&user.avatar)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| match err.as_database_error() {
                Some(db) if db.is_unique_violation() => {
                    ServerError::Conflict(EMAIL_TAKEN.into())
                },
                _ => ServerError::Sql(err),
            })?;

        row.try_into()
    }

    async fn update_refresh_token(
        &self,
        user_id: i32,
        token: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE users SET refresh_token = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(token)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        user_id: i32,
        current: &str,
        next: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET refresh_token = $1, updated_at = NOW() WHERE id = $2 AND refresh_token = $3",
        )
        .bind(next)
        .bind(user_id)
        .bind(current)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_confirmed(&self, email: &str) -> Result<()> {
        sqlx::query(
            "UPDATE users SET confirmed = TRUE, updated_at = NOW() WHERE email = $1",
        )
        .bind(email)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_avatar(&self, email: &str, url: &str) -> Result<User> {
        let query = format!(
            "UPDATE users SET avatar = $1, updated_at = NOW() WHERE email = $2 RETURNING {COLUMNS}"
        );

        sqlx::query_as::<_, UserRow>(&query)
            .bind(url)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ServerError::NotFound("User not found".into()))?
            .try_into()
    }

    async fn update_password(&self, email: &str, password: &str) -> Result<()> {
        sqlx::query(
            "UPDATE users SET password = $1, updated_at = NOW() WHERE email = $2",
        )
        .bind(password)
        .bind(email)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
