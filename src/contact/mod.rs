//! Contacts owned by users.
mod repository;

pub use repository::*;

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use validator::Validate;

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 1000;
/// Shortest birthday window accepted.
pub const MIN_BIRTHDAY_WINDOW: u32 = 7;

/// Contact as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contact {
    pub id: i32,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub birthday: NaiveDate,
    pub additional_info: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub user_id: i32,
}

/// Body of a contact creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct NewContact {
    #[validate(length(min = 1, max = 50, message = "First name must contain 1 to 50 characters."))]
    pub first_name: String,
    #[validate(length(min = 1, max = 50, message = "Last name must contain 1 to 50 characters."))]
    pub last_name: String,
    #[validate(
        email(message = "Email must be formatted."),
        length(max = 50, message = "Email must contain at most 50 characters.")
    )]
    pub email: String,
    #[validate(length(min = 1, max = 50, message = "Phone must contain 1 to 50 characters."))]
    pub phone: String,
    pub birthday: NaiveDate,
    pub additional_info: Option<String>,
}

/// Body of a contact update. Missing fields are kept.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct ContactPatch {
    #[validate(length(min = 1, max = 50))]
    pub first_name: Option<String>,
    #[validate(length(min = 1, max = 50))]
    pub last_name: Option<String>,
    #[validate(email, length(max = 50))]
    pub email: Option<String>,
    #[validate(length(min = 1, max = 50))]
    pub phone: Option<String>,
    pub birthday: Option<NaiveDate>,
    pub additional_info: Option<String>,
}

/// Query of contact listings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ContactFilter {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    #[validate(range(min = 0))]
    pub offset: i64,
    #[validate(range(min = 1, max = MAX_LIMIT))]
    pub limit: i64,
}

impl Default for ContactFilter {
    fn default() -> Self {
        Self {
            first_name: None,
            last_name: None,
            email: None,
            offset: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl ContactFilter {
    /// Check whether `contact` matches every set field, ignoring case.
    pub fn matches(&self, contact: &Contact) -> bool {
        fn contains(value: &str, needle: &Option<String>) -> bool {
            needle
                .as_ref()
                .filter(|n| !n.is_empty())
                .is_none_or(|n| value.to_lowercase().contains(&n.to_lowercase()))
        }

        contains(&contact.first_name, &self.first_name)
            && contains(&contact.last_name, &self.last_name)
            && contains(&contact.email, &self.email)
    }
}

/// Date of the next birthday on or after `today`.
///
/// 29 February falls back to 28 February on common years.
pub fn next_birthday(birthday: NaiveDate, today: NaiveDate) -> Option<NaiveDate> {
    let in_year = |year: i32| {
        NaiveDate::from_ymd_opt(year, birthday.month(), birthday.day())
            .or_else(|| NaiveDate::from_ymd_opt(year, birthday.month(), birthday.day() - 1))
    };

    in_year(today.year())
        .filter(|date| *date >= today)
        .or_else(|| in_year(today.year() + 1))
}

/// Check whether a birthday falls within `[today, today + days]`.
pub fn is_upcoming_birthday(birthday: NaiveDate, today: NaiveDate, days: u32) -> bool {
    let Some(end) = today.checked_add_days(Days::new(days.into())) else {
        return false;
    };

    next_birthday(birthday, today).is_some_and(|date| date <= end)
}
