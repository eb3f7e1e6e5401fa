//! Contacta is a contacts manager with accounts, sessions and roles.
#![forbid(unsafe_code)]

pub mod access;
pub mod auth;
pub mod avatar;
pub mod cache;
pub mod clock;
pub mod config;
pub mod contact;
pub mod crypto;
pub mod database;
pub mod error;
pub mod limits;
pub mod mail;
pub mod middleware;
pub mod router;
pub mod session;
pub mod telemetry;
pub mod token;
pub mod user;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::{MethodRouter, get, patch, post, put};
use axum::{Router, middleware as AxumMiddleware};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use crate::auth::AuthService;
use crate::cache::{IdentityCache, MemoryCache, RedisCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{Configuration, Limit};
use crate::contact::{ContactRepository, PgContactRepository};
use crate::limits::RateLimiter;
use crate::mail::{MailManager, Mailer};
use crate::session::SessionResolver;
use crate::token::TokenManager;
use crate::user::{PgUserRepository, UserRepository};

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Configuration>,
    pub auth: Arc<AuthService>,
    pub session: Arc<SessionResolver>,
    pub tokens: Arc<TokenManager>,
    pub contacts: Arc<dyn ContactRepository>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Option<PrometheusHandle>,
}

/// Throttle `route` with its own [`RateLimiter`].
fn limited(
    route: MethodRouter<AppState>,
    limit: Limit,
    trusted_proxy: bool,
) -> MethodRouter<AppState> {
    route.layer(AxumMiddleware::from_fn_with_state(
        middleware::Throttle::new(RateLimiter::from(limit), trusted_proxy),
        middleware::rate_limit,
    ))
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    let limits = &state.config.limits;
    let trusted_proxy = state.config.trusted_proxy;
    let authenticated = || {
        AxumMiddleware::from_fn_with_state(state.clone(), router::authenticate)
    };

    let auth = Router::new()
        .route("/signup", limited(post(router::auth::signup), limits.signup, trusted_proxy))
        .route("/login", limited(post(router::auth::login), limits.login, trusted_proxy))
        .route("/refresh_token", get(router::auth::refresh_token))
        .route("/confirmed_email/{token}", get(router::auth::confirmed_email))
        .route("/request_email", post(router::auth::request_email))
        .route(
            "/request_reset_password",
            post(router::auth::request_reset_password),
        )
        .route("/reset_password", post(router::auth::reset_password))
        .route(
            "/avatar",
            limited(
                patch(router::auth::avatar).layer(authenticated()),
                limits.avatar,
                trusted_proxy,
            ),
        );

    let contacts = Router::new()
        .route(
            "/",
            get(router::contacts::list)
                .merge(limited(
                    post(router::contacts::create),
                    limits.create_contact,
                    trusted_proxy,
                )),
        )
        .route(
            "/all/",
            get(router::contacts::list_all).layer(
                AxumMiddleware::from_fn_with_state(access::STAFF, access::guard),
            ),
        )
        .route(
            "/{id}",
            get(router::contacts::get)
                .merge(limited(
                    put(router::contacts::update),
                    limits.update_contact,
                    trusted_proxy,
                ))
                .delete(router::contacts::delete),
        )
        .route("/birthday/{days}", get(router::contacts::birthdays))
        .route_layer(authenticated());

    let api = Router::new()
        .nest("/auth", auth)
        .nest("/contacts", contacts)
        .route("/healthchecker", get(router::contacts::healthchecker));

    let banned = middleware::BannedAgents::new(&state.config.banned_user_agents);

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        .route("/metrics", get(router::status::metrics))
        .nest("/api", api)
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(AxumMiddleware::from_fn_with_state(
            banned,
            middleware::ban_user_agents,
        ))
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>>
{
    // read configuration file. let it in memory.
    let config = Configuration::default()
        .path(std::env::var("CONFIG_PATH").unwrap_or_default())
        .read()?;

    let Some(postgres) = &config.postgres else {
        return Err("missing `postgres` entry on `config.yaml` file".into());
    };
    let db = database::Database::new(postgres).await?;

    // execute migrations scripts on start.
    db.migrate().await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let cache: Arc<dyn IdentityCache> = match &config.redis {
        Some(redis) => Arc::new(RedisCache::new(&redis.url).await?),
        None => {
            tracing::warn!("missing `redis` entry, identities are cached in memory");
            Arc::new(MemoryCache::new(Arc::clone(&clock)))
        },
    };

    // handle mail sender.
    let mailer: Arc<dyn Mailer> = match &config.mail {
        Some(cfg) => Arc::new(MailManager::new(cfg).await?),
        None => Arc::new(MailManager::default()),
    };

    let avatars: Arc<dyn avatar::AvatarHost> = match &config.cloudinary {
        Some(cfg) => Arc::new(avatar::Cloudinary::new(cfg.clone(), Arc::clone(&clock))),
        None => {
            tracing::warn!("missing `cloudinary` entry, avatar upload is disabled");
            Arc::new(avatar::Unconfigured)
        },
    };

    let tokens = Arc::new(TokenManager::new(
        &config.token.secret,
        &config.token.algorithm,
        Arc::clone(&clock),
    )?);
    let passwords = Arc::new(crypto::PasswordManager::new(config.argon2.clone())?);

    let users: Arc<dyn UserRepository> =
        Arc::new(PgUserRepository::new(db.postgres.clone()));
    let contacts: Arc<dyn ContactRepository> =
        Arc::new(PgContactRepository::new(db.postgres.clone()));

    let session = Arc::new(SessionResolver::new(
        Arc::clone(&tokens),
        Arc::clone(&users),
        cache,
    ));
    let auth = Arc::new(AuthService::new(
        users,
        Arc::clone(&tokens),
        passwords,
        Arc::clone(&session),
        mailer,
        avatars,
        config.url.trim_end_matches('/'),
    ));

    let metrics = match telemetry::setup_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "prometheus recorder not installed");
            None
        },
    };

    Ok(AppState {
        config,
        auth,
        session,
        tokens,
        contacts,
        clock,
        metrics,
    })
}
