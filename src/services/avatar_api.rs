//! Client for the avatar-rendering service.
//!
//! Two operations matter to the session: uploading a photo in exchange for
//! an opaque asset id, and fetching an existing asset (metadata plus the
//! rendered image) by id. The base URL is injected so tests can point the
//! client at a mock server.

use crate::config::AvatarServiceConfig;
use crate::error::{AvatarError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Metadata for a created avatar asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMetadata {
    pub asset_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAvatarResponse {
    asset_id: String,
}

/// HTTP client for the avatar-rendering service.
#[derive(Debug, Clone)]
pub struct AvatarApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl AvatarApiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AvatarError::AvatarService(format!("cannot build client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key,
        })
    }

    /// Build a client from config, resolving the API key from its env var.
    ///
    /// A missing key is not fatal here — requests are simply sent without
    /// authentication and the service decides.
    pub fn from_config(config: &AvatarServiceConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            warn!(
                var = config.api_key_env,
                "avatar service API key not set; requests go unauthenticated"
            );
        }
        Self::new(
            config.base_url.clone(),
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-API-Key", key),
            None => builder,
        }
    }

    /// Upload a photo and receive the opaque asset id for the new avatar.
    pub async fn create_avatar(&self, photo: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(photo)
            .file_name("photo.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| AvatarError::AvatarService(format!("bad multipart mime: {e}")))?;
        let form = reqwest::multipart::Form::new().part("photo", part);

        let response = self
            .request(self.http.post(format!("{}/v1/avatars", self.base_url)))
            .multipart(form)
            .send()
            .await
            .map_err(|e| AvatarError::AvatarService(format!("upload failed: {e}")))?;

        if !response.status().is_success() {
            return Err(service_error("create avatar", response).await);
        }

        let created: CreateAvatarResponse = response
            .json()
            .await
            .map_err(|e| AvatarError::AvatarService(format!("bad create response: {e}")))?;
        info!(asset_id = created.asset_id, "avatar asset created");
        Ok(created.asset_id)
    }

    /// Fetch metadata for an existing asset.
    pub async fn get_asset(&self, asset_id: &str) -> Result<AssetMetadata> {
        let response = self
            .request(
                self.http
                    .get(format!("{}/v1/avatars/{asset_id}", self.base_url)),
            )
            .send()
            .await
            .map_err(|e| AvatarError::AvatarService(format!("asset fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(service_error("get asset", response).await);
        }

        response
            .json()
            .await
            .map_err(|e| AvatarError::AvatarService(format!("bad asset response: {e}")))
    }

    /// Download the rendered image bytes for an existing asset.
    ///
    /// Used by the filter pipeline, which re-fetches the current avatar from
    /// the service rather than caching it — so this depends on the service
    /// still holding the asset.
    pub async fn download_asset_image(&self, asset_id: &str) -> Result<Vec<u8>> {
        let metadata = self.get_asset(asset_id).await?;
        let url = metadata.download_url.ok_or_else(|| {
            AvatarError::AvatarService(format!("asset {asset_id} has no download URL"))
        })?;

        let response = self
            .request(self.http.get(url))
            .send()
            .await
            .map_err(|e| AvatarError::AvatarService(format!("asset download failed: {e}")))?;

        if !response.status().is_success() {
            return Err(service_error("download asset", response).await);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AvatarError::AvatarService(format!("asset body read failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Render a non-success response into an error with a bounded body snippet.
async fn service_error(operation: &str, response: reqwest::Response) -> AvatarError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    AvatarError::AvatarService(format!(
        "{operation} returned {status}: {}",
        body_snippet(&body)
    ))
}

pub(crate) fn body_snippet(body: &str) -> &str {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(200) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client =
            AvatarApiClient::new("https://api.test/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, "https://api.test");
    }

    #[test]
    fn body_snippet_bounds_long_bodies() {
        let long = "x".repeat(500);
        assert_eq!(body_snippet(&long).len(), 200);
        assert_eq!(body_snippet("short"), "short");
    }

    #[test]
    fn asset_metadata_uses_camel_case() {
        let metadata = AssetMetadata {
            asset_id: "a1".to_owned(),
            status: "ready".to_owned(),
            download_url: Some("https://cdn.test/a1.png".to_owned()),
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["assetId"], "a1");
        assert_eq!(value["downloadUrl"], "https://cdn.test/a1.png");
    }
}
