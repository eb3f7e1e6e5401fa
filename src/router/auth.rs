//! Account HTTP API.

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::router::{Message, Valid, ValidForm, bearer};
use crate::token::TokenPair;
use crate::user::{Identity, User};

const AVATAR_FIELD: &str = "file";

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct SignupBody {
    #[validate(length(
        min = 5,
        max = 16,
        message = "Username must contain 5 to 16 characters."
    ))]
    pub username: String,
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
    #[validate(length(
        min = 6,
        max = 255,
        message = "Password must contain at least 6 characters."
    ))]
    pub password: String,
}

/// OAuth2 password form. `username` holds the email.
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct LoginForm {
    #[validate(email(message = "Email must be formatted."))]
    pub username: String,
    #[validate(length(min = 1, max = 255))]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct EmailBody {
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordForm {
    #[validate(length(min = 1))]
    pub token: String,
    #[validate(length(
        min = 6,
        max = 255,
        message = "Password must contain at least 6 characters."
    ))]
    pub new_password: String,
    pub confirm_password: String,
}

/// Handler to create user.
pub async fn signup(
    State(state): State<AppState>,
    Valid(body): Valid<SignupBody>,
) -> Result<(StatusCode, Json<User>)> {
    let user = state
        .auth
        .signup(&body.username, &body.email, &body.password)
        .await?;

    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn login(
    State(state): State<AppState>,
    ValidForm(form): ValidForm<LoginForm>,
) -> Result<Json<TokenPair>> {
    Ok(Json(state.auth.login(&form.username, &form.password).await?))
}

/// Get a new token pair with the refresh token sent as bearer.
pub async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TokenPair>> {
    let token = bearer(&headers)?;
    Ok(Json(state.session.refresh(token).await?))
}

pub async fn confirmed_email(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<Message>> {
    Ok(Json(state.auth.confirm_email(&token).await?.into()))
}

pub async fn request_email(
    State(state): State<AppState>,
    Valid(body): Valid<EmailBody>,
) -> Result<Json<Message>> {
    Ok(Json(state.auth.request_email(&body.email).await?.into()))
}

pub async fn request_reset_password(
    State(state): State<AppState>,
    Valid(body): Valid<EmailBody>,
) -> Result<Json<Message>> {
    Ok(Json(
        state.auth.request_reset_password(&body.email).await?.into(),
    ))
}

pub async fn reset_password(
    State(state): State<AppState>,
    ValidForm(form): ValidForm<ResetPasswordForm>,
) -> Result<Json<Message>> {
    let message = state
        .auth
        .reset_password(&form.token, &form.new_password, &form.confirm_password)
        .await?;

    Ok(Json(message.into()))
}

/// Replace the avatar with the uploaded `file` field.
pub async fn avatar(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    mut multipart: Multipart,
) -> Result<Json<User>> {
    let mut image = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(AVATAR_FIELD) {
            image = Some(field.bytes().await?.to_vec());
            break;
        }
    }

    let image = image
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| ServerError::BadRequest("Missing avatar file".into()))?;

    Ok(Json(state.auth.update_avatar(&identity, image).await?))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{Method, StatusCode, header};
    use serde_json::{Value, json};

    use crate::app;
    use crate::config::Configuration;
    use crate::testing::{self, body_json, request};
    use crate::user::UserRepository;

    const EMAIL: &str = "jane@example.com";

    fn signup_body() -> String {
        json!({
            "username": "jane_doe",
            "email": EMAIL,
            "password": "s3cret!",
        })
        .to_string()
    }

    async fn signed_up(ctx: &testing::TestContext) {
        let response = request(app(ctx.state.clone()), Method::POST, "/api/auth/signup")
            .json(signup_body())
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    async fn login(ctx: &testing::TestContext) -> Value {
        let response = request(app(ctx.state.clone()), Method::POST, "/api/auth/login")
            .form("username=jane%40example.com&password=s3cret%21")
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }

    #[tokio::test]
    async fn test_signup_handler() {
        let ctx = testing::context();

        let response = request(app(ctx.state.clone()), Method::POST, "/api/auth/signup")
            .json(signup_body())
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = body_json(response).await;
        assert_eq!(body["email"], EMAIL);
        assert_eq!(body["username"], "jane_doe");
        assert_eq!(body["role"], "user");
        assert_eq!(body["confirmed"], false);
        assert!(body["avatar"].as_str().unwrap().contains("gravatar"));
        assert!(body.get("password").is_none());

        let response = request(app(ctx.state.clone()), Method::POST, "/api/auth/signup")
            .json(
                json!({
                    "username": "impostor",
                    "email": EMAIL,
                    "password": "another!",
                })
                .to_string(),
            )
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // the first account is left untouched.
        assert_eq!(ctx.users.len(), 1);
        let stored = ctx.users.stored(EMAIL);
        assert_eq!(body["id"], stored.id);
        assert_eq!(stored.username, "jane_doe");
    }

    #[tokio::test]
    async fn test_signup_is_rate_limited() {
        let ctx = testing::context();
        let app = app(ctx.state.clone());

        let response = request(app.clone(), Method::POST, "/api/auth/signup")
            .json(signup_body())
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        for _ in 0..2 {
            let response = request(app.clone(), Method::POST, "/api/auth/signup")
                .json(signup_body())
                .send()
                .await;
            assert_eq!(response.status(), StatusCode::CONFLICT);
        }

        let response = request(app, Method::POST, "/api/auth/signup")
            .json(signup_body())
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ctx.users.len(), 1);
    }

    #[tokio::test]
    async fn test_signup_validation() {
        let ctx = testing::context();

        let response = request(app(ctx.state.clone()), Method::POST, "/api/auth/signup")
            .json(json!({"username": "jan", "email": "nope", "password": "1"}).to_string())
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["errors"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_login_and_refresh() {
        let ctx = testing::context();
        signed_up(&ctx).await;

        let response = request(app(ctx.state.clone()), Method::POST, "/api/auth/login")
            .form("username=jane%40example.com&password=s3cret%21")
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["detail"], "Email not confirmed");

        ctx.users.set_confirmed(EMAIL).await.unwrap();
        let pair = login(&ctx).await;
        assert_eq!(pair["token_type"], "bearer");
        let rt1 = pair["refresh_token"].as_str().unwrap().to_owned();

        let response = request(app(ctx.state.clone()), Method::GET, "/api/auth/refresh_token")
            .bearer(&rt1)
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let rotated = body_json(response).await;
        assert_ne!(rotated["refresh_token"], rt1.as_str());

        // replay.
        let response = request(app(ctx.state.clone()), Method::GET, "/api/auth/refresh_token")
            .bearer(&rt1)
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");
        assert_eq!(ctx.users.stored(EMAIL).refresh_token, None);
    }

    #[tokio::test]
    async fn test_login_is_rate_limited() {
        let ctx = testing::context();
        let app = app(ctx.state.clone());

        for _ in 0..3 {
            let response = request(app.clone(), Method::POST, "/api/auth/login")
                .form("username=ghost%40example.com&password=whatever")
                .send()
                .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let response = request(app.clone(), Method::POST, "/api/auth/login")
            .form("username=ghost%40example.com&password=whatever")
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // a spoofed forwarded address does not reset the budget.
        let response = request(app, Method::POST, "/api/auth/login")
            .form("username=ghost%40example.com&password=whatever")
            .header("x-forwarded-for", "198.51.100.4")
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_login_behind_trusted_proxy() {
        let mut ctx = testing::context();
        let mut config = Configuration::default();
        config.trusted_proxy = true;
        ctx.state.config = Arc::new(config);
        let app = app(ctx.state.clone());

        for _ in 0..3 {
            let response = request(app.clone(), Method::POST, "/api/auth/login")
                .form("username=ghost%40example.com&password=whatever")
                .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
                .send()
                .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let response = request(app.clone(), Method::POST, "/api/auth/login")
            .form("username=ghost%40example.com&password=whatever")
            .header("x-forwarded-for", "203.0.113.9")
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // other clients keep their budget.
        let response = request(app, Method::POST, "/api/auth/login")
            .form("username=ghost%40example.com&password=whatever")
            .header("x-forwarded-for", "198.51.100.4")
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_confirm_email_handler() {
        let ctx = testing::context();
        signed_up(&ctx).await;
        let token = ctx.mailer.sent()[0].2["token"].clone();
        let path = format!("/api/auth/confirmed_email/{token}");

        let response = request(app(ctx.state.clone()), Method::GET, &path).send().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["message"], "Email confirmed");

        let response = request(app(ctx.state.clone()), Method::GET, &path).send().await;
        assert_eq!(body_json(response).await["message"], "Your email is already confirmed");

        let response =
            request(app(ctx.state.clone()), Method::GET, "/api/auth/confirmed_email/nope")
                .send()
                .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_password_reset_handlers() {
        let ctx = testing::context();
        signed_up(&ctx).await;
        ctx.users.set_confirmed(EMAIL).await.unwrap();

        let response =
            request(app(ctx.state.clone()), Method::POST, "/api/auth/request_reset_password")
                .json(json!({"email": "ghost@example.com"}).to_string())
                .send()
                .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response =
            request(app(ctx.state.clone()), Method::POST, "/api/auth/request_reset_password")
                .json(json!({"email": EMAIL}).to_string())
                .send()
                .await;
        assert_eq!(response.status(), StatusCode::OK);

        let token = ctx.mailer.sent().last().unwrap().2["token"].clone();

        let response = request(app(ctx.state.clone()), Method::POST, "/api/auth/reset_password")
            .form(format!("token={token}&newPassword=brand_new&confirmPassword=different"))
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["detail"], "Passwords do not match");

        let response = request(app(ctx.state.clone()), Method::POST, "/api/auth/reset_password")
            .form(format!("token={token}&newPassword=brand_new&confirmPassword=brand_new"))
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["message"], "Password successfully reset.");

        assert!(ctx.auth.login(EMAIL, "brand_new").await.is_ok());
    }

    #[tokio::test]
    async fn test_request_email_handler() {
        let ctx = testing::context();

        let response = request(app(ctx.state.clone()), Method::POST, "/api/auth/request_email")
            .json(json!({"email": EMAIL}).to_string())
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["message"], "Check your email for confirmation.");
        assert!(ctx.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_avatar_handler() {
        let ctx = testing::context();
        signed_up(&ctx).await;
        ctx.users.set_confirmed(EMAIL).await.unwrap();
        let pair = login(&ctx).await;
        let access = pair["access_token"].as_str().unwrap();

        let boundary = "X-BOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.png\"\r\nContent-Type: image/png\r\n\r\nPNGDATA\r\n--{boundary}--\r\n"
        );

        let response = request(app(ctx.state.clone()), Method::PATCH, "/api/auth/avatar")
            .body(format!("multipart/form-data; boundary={boundary}"), body.clone())
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = request(app(ctx.state.clone()), Method::PATCH, "/api/auth/avatar")
            .bearer(access)
            .body(format!("multipart/form-data; boundary={boundary}"), body)
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let user = body_json(response).await;
        assert!(user["avatar"].as_str().unwrap().starts_with(testing::AVATAR_HOST));
    }

    #[tokio::test]
    async fn test_avatar_is_rate_limited() {
        let ctx = testing::context();
        let app = app(ctx.state.clone());

        // the budget is spent before authentication runs.
        for _ in 0..3 {
            let response = request(app.clone(), Method::PATCH, "/api/auth/avatar")
                .body("multipart/form-data; boundary=X", "--X--\r\n")
                .send()
                .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let response = request(app, Method::PATCH, "/api/auth/avatar")
            .body("multipart/form-data; boundary=X", "--X--\r\n")
            .send()
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
