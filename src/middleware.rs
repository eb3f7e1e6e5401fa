//! Middlewares for routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use regex_lite::Regex;

use crate::error::{Result, ServerError};
use crate::limits::RateLimiter;

const FORWARDED_FOR: &str = "x-forwarded-for";
pub const BANNED: &str = "You are banned";

/// Find the client address.
/// `X-Forwarded-For` is only read when the proxy in front is trusted.
pub fn client_ip(req: &Request, trust_forwarded: bool) -> String {
    let forwarded = if trust_forwarded {
        req.headers()
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|ip| ip.trim().to_owned())
            .filter(|ip| !ip.is_empty())
    } else {
        None
    };

    forwarded
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Limiter of one route, and how its clients are told apart.
#[derive(Debug, Clone)]
pub struct Throttle {
    limiter: Arc<RateLimiter>,
    trust_forwarded: bool,
}

impl Throttle {
    pub fn new(limiter: RateLimiter, trust_forwarded: bool) -> Self {
        Self {
            limiter: Arc::new(limiter),
            trust_forwarded,
        }
    }
}

/// Middleware limiting requests per client address.
pub async fn rate_limit(
    State(throttle): State<Throttle>,
    req: Request,
    next: Next,
) -> Result<Response> {
    let ip = client_ip(&req, throttle.trust_forwarded);

    if !throttle.limiter.check(&ip) {
        tracing::debug!(%ip, path = req.uri().path(), "rate limited");
        return Err(ServerError::RateLimited);
    }

    Ok(next.run(req).await)
}

/// Compiled User-Agent ban list.
#[derive(Debug, Clone, Default)]
pub struct BannedAgents(Arc<Vec<Regex>>);

impl BannedAgents {
    /// Compile patterns. Invalid ones are logged and skipped.
    pub fn new(patterns: &[String]) -> Self {
        let regexes = patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    tracing::warn!(%pattern, error = %err, "invalid user-agent pattern");
                    None
                },
            })
            .collect();

        Self(Arc::new(regexes))
    }

    pub fn is_banned(&self, user_agent: &str) -> bool {
        self.0.iter().any(|regex| regex.is_match(user_agent))
    }
}

/// Middleware refusing banned User-Agents.
pub async fn ban_user_agents(
    State(banned): State<BannedAgents>,
    req: Request,
    next: Next,
) -> Result<Response> {
    let is_banned = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|user_agent| banned.is_banned(user_agent));

    if is_banned {
        tracing::debug!(path = req.uri().path(), "banned user-agent");
        return Err(ServerError::Forbidden(BANNED.into()));
    }

    Ok(next.run(req).await)
}
