//! Send emails to users through the mail renderer queue.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{
    AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo,
};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, RecoveryConfig,
};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::Serialize;
use url::Url;

use crate::config::Mail;
use crate::error::{Result, ServerError};

const DEFAULT_AMPQ_HOST: &str = "localhost";
const DEFAULT_AMPQ_PORT: u16 = 5672;
const DEFAULT_AMPQ_VHOST: &str = "/";

const CONTENT_ENCODING: &str = "utf8";
const CONTENT_TYPE: &str = "application/cloudevents+json";
const DATA_CONTENT_TYPE: &str = "application/json";
const CLOUDEVENT_VERSION: &str = "1.0";
const ID_LENGTH: usize = 12;

/// Mail templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Link to confirm account email.
    ConfirmEmail,
    /// Link to choose a new password.
    ResetPassword,
}

/// Template variables.
pub type Variables = BTreeMap<&'static str, String>;

/// Email sender port.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send `template` rendered with `variables` to `to`.
    async fn send(
        &self,
        to: &str,
        template: Template,
        variables: Variables,
    ) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct Cloudevent<'a> {
    specversion: &'static str,
    r#type: &'static str,
    source: &'static str,
    id: String,
    time: String,
    datacontenttype: &'static str,
    data: Content<'a>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    to: &'a str,
    template: Template,
    variables: Variables,
}

/// RabbitMQ mail publisher.
///
/// Without a connection, events are dropped.
#[derive(Debug, Clone, Default)]
pub struct MailManager {
    queue: String,
    conn: Option<Arc<Connection>>,
}

impl MailManager {
    /// Create a new [`MailManager`].
    pub async fn new(config: &Mail) -> Result<Self> {
        let addr = Url::parse(&config.address)
            .map_err(|err| ServerError::internal("invalid mail address", err))?;
        let scheme = AMQPScheme::from_str(addr.scheme()).map_err(|err| {
            ServerError::Internal {
                details: format!("invalid amqp scheme: {err}"),
                source: None,
            }
        })?;

        let uri = AMQPUri {
            scheme,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: config.username.clone(),
                    password: config.password.clone(),
                },
                host: addr.host_str().unwrap_or(DEFAULT_AMPQ_HOST).into(),
                port: addr.port().unwrap_or(DEFAULT_AMPQ_PORT),
            },
            vhost: config
                .vhost
                .clone()
                .unwrap_or(DEFAULT_AMPQ_VHOST.to_string()),
            query: AMQPQueryString {
                channel_max: config.pool,
                ..Default::default()
            },
        };

        let recovery_config =
            RecoveryConfig::default().auto_recover_connection();
        let conn_config = ConnectionProperties::default()
            .with_connection_name("contacta_mail_client".into())
            .with_experimental_recovery_config(recovery_config);
        let conn = Connection::connect_uri(uri, conn_config)
            .await
            .map_err(|err| ServerError::internal("rabbitmq connection failed", err))?;

        tracing::info!(%addr, queue = config.queue, "rabbitmq connected");

        Ok(Self {
            queue: config.queue.clone(),
            conn: Some(Arc::new(conn)),
        })
    }

    async fn create_channel(
        conn: &Connection,
        queue: &str,
    ) -> std::result::Result<Channel, lapin::Error> {
        let channel = conn.create_channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(channel)
    }

    fn create_event(data: Content<'_>) -> Cloudevent<'_> {
        Cloudevent {
            specversion: CLOUDEVENT_VERSION,
            r#type: "com.contacta.email",
            source: "com.contacta.api",
            id: Alphanumeric.sample_string(&mut OsRng, ID_LENGTH),
            time: Utc::now().to_rfc3339(),
            datacontenttype: DATA_CONTENT_TYPE,
            data,
        }
    }
}

#[async_trait]
impl Mailer for MailManager {
    async fn send(
        &self,
        to: &str,
        template: Template,
        variables: Variables,
    ) -> Result<()> {
        let Some(conn) = &self.conn else {
            tracing::debug!(?template, "mail is not configured, event dropped");
            return Ok(());
        };

        let channel = Self::create_channel(conn, &self.queue)
            .await
            .map_err(|err| ServerError::internal("rabbitmq channel failed", err))?;

        let payload = Self::create_event(Content {
            to,
            template,
            variables,
        });
        let payload = serde_json::to_vec(&payload)
            .map_err(|err| ServerError::internal("event serialization failed", err))?;

        channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_encoding(CONTENT_ENCODING.into())
                    .with_content_type(CONTENT_TYPE.into()),
            )
            .await
            .map_err(|err| ServerError::internal("rabbitmq publish failed", err))?;

        tracing::trace!(?template, "mail event sent");

        Ok(())
    }
}
