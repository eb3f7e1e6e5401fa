//! Configuration manager for contacta.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_URL: &str = "http://localhost:8000";
const DEFAULT_PORT: u16 = 8000;
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Public base URL, used in links sent by email.
    pub url: String,
    /// Listening port.
    pub port: u16,
    #[serde(skip_deserializing)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to JsonWebToken configuration.
    #[serde(skip_serializing)]
    pub token: Token,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to Redis configuration.
    /// Identities are cached in memory when missing.
    #[serde(skip_serializing)]
    pub redis: Option<Redis>,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    /// Related to automatic mail sending.
    #[serde(skip_serializing)]
    pub mail: Option<Mail>,
    /// Related to avatar hosting.
    #[serde(skip_serializing)]
    pub cloudinary: Option<Cloudinary>,
    /// Per-route request budgets.
    #[serde(skip_serializing)]
    pub limits: Limits,
    /// Key rate limits on the first `X-Forwarded-For` entry.
    /// Only enable behind a reverse proxy that overwrites this header.
    #[serde(skip_serializing)]
    pub trusted_proxy: bool,
    /// User-Agent patterns refused by the API.
    #[serde(skip_serializing)]
    pub banned_user_agents: Vec<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_owned(),
            url: DEFAULT_URL.to_owned(),
            port: DEFAULT_PORT,
            version: VERSION.to_owned(),
            path: PathBuf::default(),
            token: Token::default(),
            postgres: None,
            redis: None,
            argon2: None,
            mail: None,
            cloudinary: None,
            limits: Limits::default(),
            trusted_proxy: false,
            banned_user_agents: vec!["Googlebot".into(), "Python-urllib".into()],
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Redis configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Redis {
    /// Connection URL, e.g. `redis://:password@localhost:6379/0`.
    pub url: String,
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 1024 * 64, // 64 MiB.
            iterations: 4,
            parallelism: 2,
            hash_length: 32,
        }
    }
}

/// Mail broker configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    /// Hostname:(?port) for RabbitMQ instance.
    pub address: String,
    /// RabbitMQ default vhost.
    pub vhost: Option<String>,
    /// RabbitMQ username to access queue.
    pub username: String,
    /// RabbitMQ password to access queue.
    pub password: String,
    /// Max channel connections.
    pub pool: Option<u16>,
    /// Queue name to send mailing events.
    pub queue: String,
}

/// Cloudinary credentials.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cloudinary {
    pub cloud_name: String,
    pub api_key: String,
    /// Should never be shared!
    pub api_secret: String,
}

/// Json Web Token configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Token {
    /// HMAC secret. `SECRET_KEY` environment variable takes precedence.
    pub secret: String,
    /// `HS256` or `HS512`.
    pub algorithm: String,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            secret: String::default(),
            algorithm: "HS256".into(),
        }
    }
}

/// A request budget: `requests` allowed per `seconds` window.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct Limit {
    pub requests: usize,
    pub seconds: u64,
}

impl Limit {
    const fn new(requests: usize, seconds: u64) -> Self {
        Self { requests, seconds }
    }
}

/// Budgets of throttled routes.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub login: Limit,
    pub signup: Limit,
    pub avatar: Limit,
    pub create_contact: Limit,
    pub update_contact: Limit,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            login: Limit::new(3, 20),
            signup: Limit::new(3, 20),
            avatar: Limit::new(3, 20),
            create_contact: Limit::new(5, 20),
            update_contact: Limit::new(1, 20),
        }
    }
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Application version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        let mut config = match File::open(file_path) {
            Ok(file) => match serde_yaml::from_reader::<_, Configuration>(file)
            {
                Ok(config) => config,
                Err(err) => self.error(err),
            },
            Err(err) => self.error(err),
        };

        config.version = VERSION.to_owned();
        config.url = Self::normalize_url(&config.url)?;

        if let Ok(secret) = std::env::var("SECRET_KEY") {
            config.token.secret = secret;
        }

        Ok(Arc::new(config))
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found or invalid");
        Self::default()
    }
}
