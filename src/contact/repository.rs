//! Handle contact database requests.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{Pool, Postgres};

use crate::contact::{Contact, ContactFilter, ContactPatch, NewContact};
use crate::error::{Result, ServerError};

pub const CONTACT_TAKEN: &str = "Contact with this email already exists";

/// Contact store.
#[async_trait]
pub trait ContactRepository: Send + Sync {
    /// List contacts matching `filter`.
    ///
    /// Without `owner`, every user's contacts are listed.
    async fn list(
        &self,
        owner: Option<i32>,
        filter: &ContactFilter,
    ) -> Result<Vec<Contact>>;

    /// Get a contact of `owner`.
    async fn get(&self, owner: i32, id: i32) -> Result<Option<Contact>>;

    /// List contacts of `owner` whose birthday is within `days` of `today`.
    async fn upcoming_birthdays(
        &self,
        owner: i32,
        today: NaiveDate,
        days: u32,
    ) -> Result<Vec<Contact>>;

    /// Create a contact for `owner`.
    ///
    /// Fails with [`ServerError::Conflict`] when `owner` already has a
    /// contact with the same email.
    async fn create(&self, owner: i32, contact: NewContact) -> Result<Contact>;

    /// Apply the set fields of `patch`.
    async fn update(
        &self,
        owner: i32,
        id: i32,
        patch: ContactPatch,
    ) -> Result<Option<Contact>>;

    /// Delete a contact. Returns whether it existed.
    async fn delete(&self, owner: i32, id: i32) -> Result<bool>;

    /// Check the store is reachable.
    async fn healthcheck(&self) -> Result<()>;
}

fn conflict_or_sql(err: sqlx::Error) -> ServerError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => {
            ServerError::Conflict(CONTACT_TAKEN.into())
        },
        _ => ServerError::Sql(err),
    }
}

/// Escape `LIKE` wildcards of user input.
fn like_pattern(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).map(|v| {
        let escaped = v
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        format!("%{escaped}%")
    })
}

/// PostgreSQL contact store.
#[derive(Clone)]
pub struct PgContactRepository {
    pool: Pool<Postgres>,
}

impl PgContactRepository {
    /// Create a new [`PgContactRepository`].
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactRepository for PgContactRepository {
    async fn list(
        &self,
        owner: Option<i32>,
        filter: &ContactFilter,
    ) -> Result<Vec<Contact>> {
        let contacts = sqlx::query_as::<_, Contact>(
            r#"SELECT * FROM contacts
                WHERE ($1::INT IS NULL OR user_id = $1)
                AND ($2::TEXT IS NULL OR first_name ILIKE $2)
                AND ($3::TEXT IS NULL OR last_name ILIKE $3)
                AND ($4::TEXT IS NULL OR email ILIKE $4)
                ORDER BY id
                OFFSET $5 LIMIT $6"#,
        )
        .bind(owner)
        .bind(like_pattern(&filter.first_name))
        .bind(like_pattern(&filter.last_name))
        .bind(like_pattern(&filter.email))
        .bind(filter.offset)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(contacts)
    }

    async fn get(&self, owner: i32, id: i32) -> Result<Option<Contact>> {
        let contact = sqlx::query_as::<_, Contact>(
            "SELECT * FROM contacts WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        Ok(contact)
    }

    async fn upcoming_birthdays(
        &self,
        owner: i32,
        today: NaiveDate,
        days: u32,
    ) -> Result<Vec<Contact>> {
        let contacts = sqlx::query_as::<_, Contact>(
            "SELECT * FROM contacts WHERE user_id = $1 ORDER BY id",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        Ok(contacts
            .into_iter()
            .filter(|c| super::is_upcoming_birthday(c.birthday, today, days))
            .collect())
    }

    async fn create(&self, owner: i32, contact: NewContact) -> Result<Contact> {
        sqlx::query_as::<_, Contact>(
            r#"INSERT INTO contacts (first_name, last_name, email, phone, birthday, additional_info, user_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING *"#,
        )
        .bind(&contact.first_name)
        .bind(&contact.last_name)
        .bind(&contact.email)
        .bind(&contact.phone)
        .bind(contact.birthday)
        .bind(&contact.additional_info)
        .bind(owner)
        .fetch_one(&self.pool)
        .await
        .map_err(conflict_or_sql)
    }

    async fn update(
        &self,
        owner: i32,
        id: i32,
        patch: ContactPatch,
    ) -> Result<Option<Contact>> {
        sqlx::query_as::<_, Contact>(
            r#"UPDATE contacts SET
                first_name = COALESCE($1, first_name),
                last_name = COALESCE($2, last_name),
                email = COALESCE($3, email),
                phone = COALESCE($4, phone),
                birthday = COALESCE($5, birthday),
                additional_info = COALESCE($6, additional_info),
                updated_at = NOW()
                WHERE id = $7 AND user_id = $8
                RETURNING *"#,
        )
        .bind(&patch.first_name)
        .bind(&patch.last_name)
        .bind(&patch.email)
        .bind(&patch.phone)
        .bind(patch.birthday)
        .bind(&patch.additional_info)
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await
        .map_err(conflict_or_sql)
    }

    async fn delete(&self, owner: i32, id: i32) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM contacts WHERE id = $1 AND user_id = $2")
                .bind(id)
                .bind(owner)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn healthcheck(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
