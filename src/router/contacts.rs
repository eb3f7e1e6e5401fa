//! Contacts HTTP API.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::NaiveDate;
use serde::Serialize;

use crate::AppState;
use crate::contact::{
    Contact, ContactFilter, ContactPatch, MIN_BIRTHDAY_WINDOW, NewContact,
};
use crate::error::{Result, ServerError};
use crate::router::{Valid, ValidQuery};
use crate::user::Identity;

pub const DATABASE_UNAVAILABLE: &str = "Could not connect to the database";

fn not_found(id: i32) -> ServerError {
    ServerError::NotFound(format!("Contact id = {id} not found"))
}

fn today(state: &AppState) -> Result<NaiveDate> {
    let now = i64::try_from(state.clock.now()).unwrap_or(i64::MAX);

    chrono::DateTime::from_timestamp(now, 0)
        .map(|date| date.date_naive())
        .ok_or_else(|| ServerError::Internal {
            details: "clock out of range".into(),
            source: None,
        })
}

pub async fn list(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ValidQuery(filter): ValidQuery<ContactFilter>,
) -> Result<Json<Vec<Contact>>> {
    Ok(Json(state.contacts.list(Some(identity.id), &filter).await?))
}

/// Every user's contacts. Staff only.
pub async fn list_all(
    State(state): State<AppState>,
    ValidQuery(filter): ValidQuery<ContactFilter>,
) -> Result<Json<Vec<Contact>>> {
    Ok(Json(state.contacts.list(None, &filter).await?))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<i32>,
) -> Result<Json<Contact>> {
    state
        .contacts
        .get(identity.id, id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(id))
}

pub async fn birthdays(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(days): Path<u32>,
) -> Result<Json<Vec<Contact>>> {
    if days < MIN_BIRTHDAY_WINDOW {
        return Err(ServerError::BadRequest(format!(
            "Days must be greater than or equal to {MIN_BIRTHDAY_WINDOW}"
        )));
    }

    let today = today(&state)?;
    Ok(Json(
        state
            .contacts
            .upcoming_birthdays(identity.id, today, days)
            .await?,
    ))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Valid(body): Valid<NewContact>,
) -> Result<(StatusCode, Json<Contact>)> {
    let contact = state.contacts.create(identity.id, body).await?;
    Ok((StatusCode::CREATED, Json(contact)))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<i32>,
    Valid(patch): Valid<ContactPatch>,
) -> Result<Json<Contact>> {
    state
        .contacts
        .update(identity.id, id, patch)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(id))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<i32>,
) -> Result<StatusCode> {
    if state.contacts.delete(identity.id, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(id))
    }
}

#[derive(Serialize)]
pub struct Health {
    message: &'static str,
}

pub async fn healthchecker(State(state): State<AppState>) -> Result<Json<Health>> {
    if let Err(err) = state.contacts.healthcheck().await {
        tracing::error!(error = %err, "healthcheck failed");
        return Err(ServerError::Unavailable(DATABASE_UNAVAILABLE.into()));
    }

    Ok(Json(Health {
        message: "The API is up and running!",
    }))
}
