//! Client for the image generation / enhancement service.
//!
//! The service can transform an existing portrait (`enhance`) or produce a
//! new one from a text prompt (`generate`). Failures are classified so the
//! UI can explain a safety-system rejection differently from a generic
//! error; the upstream does not mark rejections structurally, so detection
//! is by string-matching the error body.

use crate::config::ImageServiceConfig;
use crate::error::AvatarError;
use base64::Engine as _;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Image service failure, with safety rejections distinguished.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ImageApiError {
    /// The service's safety system refused the request.
    #[error("image request rejected by safety system: {0}")]
    SafetyRejected(String),

    /// Any other failure (network, server error, bad payload).
    #[error("image request failed: {0}")]
    Failed(String),
}

impl ImageApiError {
    #[must_use]
    pub fn is_safety_rejection(&self) -> bool {
        matches!(self, Self::SafetyRejected(_))
    }
}

impl From<ImageApiError> for AvatarError {
    fn from(e: ImageApiError) -> Self {
        Self::ImageService(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    /// Base64-encoded image bytes.
    image: String,
}

/// HTTP client for the image AI service.
#[derive(Debug, Clone)]
pub struct ImageApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ImageApiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> crate::error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AvatarError::ImageService(format!("cannot build client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key,
        })
    }

    /// Build a client from config, resolving the API key from its env var.
    pub fn from_config(config: &ImageServiceConfig) -> crate::error::Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            warn!(
                var = config.api_key_env,
                "image service API key not set; requests go unauthenticated"
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
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Transform an existing portrait according to a prompt.
    pub async fn enhance(&self, photo: &[u8], prompt: &str) -> Result<Vec<u8>, ImageApiError> {
        let part = reqwest::multipart::Part::bytes(photo.to_vec())
            .file_name("photo.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| ImageApiError::Failed(format!("bad multipart mime: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("prompt", prompt.to_owned());

        let response = self
            .request(self.http.post(format!("{}/v1/images/edits", self.base_url)))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ImageApiError::Failed(format!("enhance request failed: {e}")))?;

        decode_image_response(response).await
    }

    /// Generate a new portrait from a text prompt.
    pub async fn generate(&self, prompt: &str) -> Result<Vec<u8>, ImageApiError> {
        let response = self
            .request(
                self.http
                    .post(format!("{}/v1/images/generations", self.base_url)),
            )
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|e| ImageApiError::Failed(format!("generate request failed: {e}")))?;

        decode_image_response(response).await
    }
}

async fn decode_image_response(response: reqwest::Response) -> Result<Vec<u8>, ImageApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_failure(status, &body));
    }

    let parsed: ImageResponse = response
        .json()
        .await
        .map_err(|e| ImageApiError::Failed(format!("bad image response: {e}")))?;
    base64::engine::general_purpose::STANDARD
        .decode(parsed.image.as_bytes())
        .map_err(|e| ImageApiError::Failed(format!("image payload is not valid base64: {e}")))
}

/// Markers the upstream uses in safety-rejection error bodies.
const SAFETY_MARKERS: &[&str] = &["safety", "content_policy", "content policy", "moderation"];

fn classify_failure(status: reqwest::StatusCode, body: &str) -> ImageApiError {
    let lower = body.to_ascii_lowercase();
    let snippet = crate::services::avatar_api::body_snippet(body);
    if SAFETY_MARKERS.iter().any(|marker| lower.contains(marker)) {
        ImageApiError::SafetyRejected(snippet.to_owned())
    } else {
        ImageApiError::Failed(format!("{status}: {snippet}"))
    }
}
