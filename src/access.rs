//! Role-based access control.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::{Result, ServerError};
use crate::user::{Identity, Role};

pub const OPERATION_FORBIDDEN: &str = "Operation forbidden";

/// Roles allowed to read every user's contacts.
pub const STAFF: &[Role] = &[Role::Admin, Role::Moderator];

/// Check `identity` holds one of the `allowed` roles.
pub fn authorize<'a>(identity: &'a Identity, allowed: &[Role]) -> Result<&'a Identity> {
    if allowed.contains(&identity.role) {
        Ok(identity)
    } else {
        tracing::debug!(user_id = identity.id, role = %identity.role, "access denied");
        Err(ServerError::Forbidden(OPERATION_FORBIDDEN.into()))
    }
}

/// Middleware restricting a route to some roles.
///
/// Must run after authentication.
pub async fn guard(
    State(allowed): State<&'static [Role]>,
    req: Request,
    next: Next,
) -> Result<Response> {
    {
        let identity = req
            .extensions()
            .get::<Identity>()
            .ok_or(ServerError::InvalidToken)?;
        authorize(identity, allowed)?;
    }

    Ok(next.run(req).await)
}
