//! Avatar hosting on Cloudinary.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::clock::Clock;
use crate::config::Cloudinary as CloudinaryConfig;
use crate::error::{Result, ServerError};

const UPLOAD_URL: &str = "https://api.cloudinary.com/v1_1";
const DELIVERY_URL: &str = "https://res.cloudinary.com";
const TRANSFORMATION: &str = "c_fill,h_200,w_200";
const GRAVATAR_URL: &str = "https://www.gravatar.com/avatar";

/// Image host port.
#[async_trait]
pub trait AvatarHost: Send + Sync {
    /// Upload `image` under `public_id`, overwriting any previous one.
    ///
    /// Returns the public URL of the 200x200 cropped picture.
    async fn upload(&self, public_id: &str, image: Vec<u8>) -> Result<String>;
}

/// Public id of the avatar of an email.
pub fn public_id(email: &str) -> String {
    hex::encode(Sha1::digest(email.trim().to_lowercase().as_bytes()))
}

/// Default avatar of an email.
pub fn gravatar_url(email: &str) -> String {
    let hash = hex::encode(Sha256::digest(email.trim().to_lowercase().as_bytes()));
    format!("{GRAVATAR_URL}/{hash}?d=identicon")
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    version: u64,
    public_id: String,
}

/// Cloudinary client using signed uploads.
pub struct Cloudinary {
    client: reqwest::Client,
    config: CloudinaryConfig,
    clock: std::sync::Arc<dyn Clock>,
}

impl Cloudinary {
    /// Create a new [`Cloudinary`] client.
    pub fn new(
        config: CloudinaryConfig,
        clock: std::sync::Arc<dyn Clock>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            clock,
        }
    }

    /// Sign upload parameters.
    ///
    /// Parameters must be sorted by name.
    fn sign(&self, params: &[(&str, &str)]) -> String {
        let to_sign = params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");

        hex::encode(Sha1::digest(
            format!("{to_sign}{}", self.config.api_secret).as_bytes(),
        ))
    }

    fn delivery_url(&self, version: u64, public_id: &str) -> String {
        format!(
            "{DELIVERY_URL}/{}/image/upload/{TRANSFORMATION}/v{version}/{public_id}",
            self.config.cloud_name
        )
    }
}

#[async_trait]
impl AvatarHost for Cloudinary {
    async fn upload(&self, public_id: &str, image: Vec<u8>) -> Result<String> {
        let timestamp = self.clock.now().to_string();
        let signature = self.sign(&[
            ("overwrite", "true"),
            ("public_id", public_id),
            ("timestamp", &timestamp),
        ]);

        let form = Form::new()
            .part("file", Part::bytes(image).file_name("avatar"))
            .text("api_key", self.config.api_key.clone())
            .text("overwrite", "true")
            .text("public_id", public_id.to_owned())
            .text("timestamp", timestamp)
            .text("signature", signature);

        let response = self
            .client
            .post(format!("{UPLOAD_URL}/{}/image/upload", self.config.cloud_name))
            .multipart(form)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| ServerError::internal("avatar upload failed", err))?
            .json::<UploadResponse>()
            .await
            .map_err(|err| ServerError::internal("invalid avatar host response", err))?;

        tracing::debug!(public_id = response.public_id, "avatar uploaded");

        Ok(self.delivery_url(response.version, &response.public_id))
    }
}

/// Host used when no `cloudinary` entry is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfigured;

#[async_trait]
impl AvatarHost for Unconfigured {
    async fn upload(&self, _public_id: &str, _image: Vec<u8>) -> Result<String> {
        Err(ServerError::Unavailable(
            "Avatar upload is not configured".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    fn cloudinary() -> Cloudinary {
        Cloudinary::new(
            CloudinaryConfig {
                cloud_name: "demo".into(),
                api_key: "1234".into(),
                api_secret: "abcd".into(),
            },
            ManualClock::arc(),
        )
    }

    #[test]
    fn test_signature() {
        // sha1("public_id=sample&timestamp=1315060510abcd")
        let expected = hex::encode(Sha1::digest(b"public_id=sample&timestamp=1315060510abcd"));

        assert_eq!(
            cloudinary().sign(&[("public_id", "sample"), ("timestamp", "1315060510")]),
            expected
        );
    }

    #[test]
    fn test_delivery_url() {
        assert_eq!(
            cloudinary().delivery_url(42, "abc"),
            "https://res.cloudinary.com/demo/image/upload/c_fill,h_200,w_200/v42/abc"
        );
    }

    #[test]
    fn test_ids_ignore_case() {
        assert_eq!(public_id("Jane@Example.com"), public_id("jane@example.com"));
        assert_eq!(public_id("jane@example.com").len(), 40);

        let url = gravatar_url("jane@example.com");
        assert!(url.starts_with("https://www.gravatar.com/avatar/"));
        assert!(url.ends_with("?d=identicon"));
        assert_eq!(url, gravatar_url(" JANE@example.com "));
    }

    #[tokio::test]
    async fn test_unconfigured_host_refuses_uploads() {
        assert!(matches!(
            Unconfigured.upload("abc", vec![1, 2, 3]).await,
            Err(ServerError::Unavailable(_))
        ));
    }
}
