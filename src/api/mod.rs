//! HTTP API for the avatar session.
//!
//! The serverless-route surface the browser client talks to: token issuance,
//! avatar creation, image enhancement/generation, and the small state bag
//! the voice-agent backend polls.
//!
//! ## Endpoints
//!
//! - `POST /api/connection-details` — issue room connection details + token
//! - `GET /api/connection-details` — same, for resuming with a cached asset
//! - `POST /api/create-avatar` — multipart photo upload → `{ assetId }`
//! - `GET /api/avatar-asset/{id}` — asset metadata incl. download URL
//! - `POST /api/enhance-image` — multipart photo + prompt → base64 image
//! - `POST /api/generate-image` — prompt → base64 image
//! - `POST /api/set-avatar-id`, `GET /api/avatar-state`,
//!   `POST /api/clear-avatar-state` — state-bag set/get/clear
//! - `POST /api/reset-voice-state`, `POST /api/switch-mode` — voice/mode flags
//! - `POST /api/restart-avatar` — write the restart sentinel
//!
//! Remote-service failures never crash a handler: image routes answer
//! `200 { success: false, … }` (the session is expected to proceed without
//! the feature), proxy failures map to `502`.

pub mod token;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::protocol::SessionMode;
use crate::services::avatar_api::AvatarApiClient;
use crate::services::image_api::{ImageApiClient, ImageApiError};
use crate::state_store::{StateStore, write_restart_sentinel};
use axum::Router;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared state injected into every route handler.
pub struct ApiContext {
    pub config: SessionConfig,
    pub store: Arc<dyn StateStore>,
    pub avatar: AvatarApiClient,
    pub images: ImageApiClient,
    pub restart_sentinel: PathBuf,
}

impl ApiContext {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn StateStore>,
        avatar: AvatarApiClient,
        images: ImageApiClient,
    ) -> Self {
        Self {
            config,
            store,
            avatar,
            images,
            restart_sentinel: crate::app_dirs::restart_sentinel_path(),
        }
    }

    #[must_use]
    pub fn with_restart_sentinel(mut self, path: PathBuf) -> Self {
        self.restart_sentinel = path;
        self
    }
}

type ApiError = (StatusCode, Json<serde_json::Value>);
type ApiResult = std::result::Result<Json<serde_json::Value>, ApiError>;

/// Build the API router.
pub fn router(context: Arc<ApiContext>) -> Router {
    Router::new()
        .route(
            "/api/connection-details",
            post(connection_details_post).get(connection_details_get),
        )
        .route("/api/create-avatar", post(create_avatar))
        .route("/api/avatar-asset/{id}", get(avatar_asset))
        .route("/api/enhance-image", post(enhance_image))
        .route("/api/generate-image", post(generate_image))
        .route("/api/set-avatar-id", post(set_avatar_id))
        .route("/api/avatar-state", get(avatar_state))
        .route("/api/clear-avatar-state", post(clear_avatar_state))
        .route("/api/reset-voice-state", post(reset_voice_state))
        .route("/api/switch-mode", post(switch_mode))
        .route("/api/restart-avatar", post(restart_avatar))
        .with_state(context)
}

/// Bind and serve the API, returning the bound address and the server task.
pub async fn serve(
    context: Arc<ApiContext>,
    bind_addr: &str,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let app = router(context);
    let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
        crate::error::AvatarError::Config(format!("cannot bind {bind_addr}: {e}"))
    })?;
    let addr = listener
        .local_addr()
        .map_err(crate::error::AvatarError::Io)?;
    info!(%addr, "API server listening");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("API server error: {e}");
        }
    });
    Ok((addr, handle))
}

fn internal_error(message: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message.to_string() })),
    )
}

fn bad_gateway(message: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "error": message.to_string() })),
    )
}

fn bad_request(message: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.to_string() })),
    )
}

// ---------------------------------------------------------------------------
// Connection details
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConnectionRequest {
    #[serde(rename = "participantName")]
    participant_name: Option<String>,
    #[serde(rename = "avatarAssetId")]
    avatar_asset_id: Option<String>,
}

fn connection_details(
    context: &ApiContext,
    participant_name: Option<String>,
    asset_id: Option<String>,
) -> ApiResult {
    let secret = context.config.room_secret().map_err(internal_error)?;
    let room_name = format!(
        "{}-{}",
        context.config.room.room_prefix,
        uuid::Uuid::new_v4().simple()
    );
    let participant_name = participant_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("user-{}", uuid::Uuid::new_v4().simple()));

    let token = token::mint_room_token(
        &context.config.room,
        &secret,
        &participant_name,
        &room_name,
        asset_id.as_deref(),
    )
    .map_err(internal_error)?;

    Ok(Json(json!({
        "serverUrl": context.config.room.server_url,
        "roomName": room_name,
        "participantName": participant_name,
        "participantToken": token,
    })))
}

async fn connection_details_post(
    State(context): State<Arc<ApiContext>>,
    Json(request): Json<ConnectionRequest>,
) -> ApiResult {
    // A fresh connection: the client may bind an asset id it already holds.
    let asset_id = match request.avatar_asset_id {
        Some(id) => Some(id),
        None => context
            .store
            .get()
            .map_err(internal_error)?
            .asset_id,
    };
    connection_details(&context, request.participant_name, asset_id)
}

async fn connection_details_get(State(context): State<Arc<ApiContext>>) -> ApiResult {
    // Resume path: the asset id comes from the server-side state bag.
    let asset_id = context.store.get().map_err(internal_error)?.asset_id;
    connection_details(&context, None, asset_id)
}

// ---------------------------------------------------------------------------
// Avatar assets
// ---------------------------------------------------------------------------

async fn create_avatar(
    State(context): State<Arc<ApiContext>>,
    mut multipart: Multipart,
) -> ApiResult {
    let mut photo: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("bad multipart body: {e}")))?
    {
        if field.name() == Some("photo") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| bad_request(format!("bad photo field: {e}")))?;
            photo = Some(bytes.to_vec());
        }
    }
    let photo = photo.ok_or_else(|| bad_request("missing `photo` field"))?;
    if photo.is_empty() {
        return Err(bad_request("empty `photo` field"));
    }

    let asset_id = context.avatar.create_avatar(photo).await.map_err(|e| {
        warn!("create-avatar proxy failed: {e}");
        bad_gateway(e)
    })?;

    if let Err(e) = context.store.update(&mut |record| {
        record.asset_id = Some(asset_id.clone());
    }) {
        // The asset exists remotely; losing the local record is recoverable.
        warn!("failed to record new asset id: {e}");
    }

    Ok(Json(json!({ "assetId": asset_id })))
}

async fn avatar_asset(
    State(context): State<Arc<ApiContext>>,
    Path(id): Path<String>,
) -> ApiResult {
    let metadata = context.avatar.get_asset(&id).await.map_err(|e| {
        warn!(asset_id = id, "asset fetch failed: {e}");
        bad_gateway(e)
    })?;
    serde_json::to_value(&metadata)
        .map(Json)
        .map_err(internal_error)
}

// ---------------------------------------------------------------------------
// Image enhancement / generation
// ---------------------------------------------------------------------------

fn image_failure(error: &ImageApiError) -> Json<serde_json::Value> {
    Json(json!({
        "success": false,
        "error": error.to_string(),
        "isSafetyRejection": error.is_safety_rejection(),
    }))
}

async fn enhance_image(
    State(context): State<Arc<ApiContext>>,
    mut multipart: Multipart,
) -> ApiResult {
    let mut photo: Option<Vec<u8>> = None;
    let mut prompt: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("bad multipart body: {e}")))?
    {
        match field.name() {
            Some("photo") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("bad photo field: {e}")))?;
                photo = Some(bytes.to_vec());
            }
            Some("prompt") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("bad prompt field: {e}")))?;
                prompt = Some(text);
            }
            _ => {}
        }
    }
    let photo = photo.ok_or_else(|| bad_request("missing `photo` field"))?;
    let prompt = prompt.unwrap_or_else(|| context.config.image.enhance_prompt.clone());

    // Fail-open: the caller falls back to the unenhanced photo, so failures
    // are reported in-band rather than as error statuses.
    match context.images.enhance(&photo, &prompt).await {
        Ok(enhanced) => Ok(Json(json!({
            "success": true,
            "enhancedImage": base64::engine::general_purpose::STANDARD.encode(&enhanced),
        }))),
        Err(e) => {
            warn!("enhance-image failed: {e}");
            Ok(image_failure(&e))
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
}

async fn generate_image(
    State(context): State<Arc<ApiContext>>,
    Json(request): Json<GenerateRequest>,
) -> ApiResult {
    if request.prompt.trim().is_empty() {
        return Err(bad_request("prompt cannot be empty"));
    }
    match context.images.generate(&request.prompt).await {
        Ok(generated) => Ok(Json(json!({
            "success": true,
            "generatedImage": base64::engine::general_purpose::STANDARD.encode(&generated),
        }))),
        Err(e) => {
            warn!("generate-image failed: {e}");
            Ok(image_failure(&e))
        }
    }
}

// ---------------------------------------------------------------------------
// State bag
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SetAvatarIdRequest {
    #[serde(rename = "assetId")]
    asset_id: String,
    /// Ask the agent to adopt the cloned voice alongside the new avatar.
    #[serde(default, rename = "switchVoice")]
    switch_voice: bool,
}

async fn set_avatar_id(
    State(context): State<Arc<ApiContext>>,
    Json(request): Json<SetAvatarIdRequest>,
) -> ApiResult {
    if request.asset_id.trim().is_empty() {
        return Err(bad_request("assetId cannot be empty"));
    }
    context
        .store
        .update(&mut |record| {
            record.asset_id = Some(request.asset_id.clone());
            if request.switch_voice {
                record.switch_voice = true;
            }
        })
        .map_err(internal_error)?;
    Ok(Json(json!({ "success": true })))
}

async fn avatar_state(State(context): State<Arc<ApiContext>>) -> ApiResult {
    let record = context.store.get().map_err(internal_error)?;
    serde_json::to_value(&record)
        .map(Json)
        .map_err(internal_error)
}

async fn clear_avatar_state(State(context): State<Arc<ApiContext>>) -> ApiResult {
    context.store.clear().map_err(internal_error)?;
    Ok(Json(json!({ "success": true })))
}

async fn reset_voice_state(State(context): State<Arc<ApiContext>>) -> ApiResult {
    context
        .store
        .update(&mut |record| {
            record.switch_voice = false;
            record.custom_voice_id = None;
        })
        .map_err(internal_error)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct SwitchModeRequest {
    mode: String,
    #[serde(default, rename = "avatarId")]
    avatar_id: Option<String>,
}

async fn switch_mode(
    State(context): State<Arc<ApiContext>>,
    Json(request): Json<SwitchModeRequest>,
) -> ApiResult {
    let mode = SessionMode::parse(&request.mode)
        .ok_or_else(|| bad_request(format!("unknown mode `{}`", request.mode)))?;
    context
        .store
        .update(&mut |record| {
            record.mode = mode;
            if record.asset_id.is_none()
                && let Some(avatar_id) = &request.avatar_id
            {
                record.asset_id = Some(avatar_id.clone());
            }
        })
        .map_err(internal_error)?;
    info!(mode = mode.as_str(), "mode switched");
    Ok(Json(json!({ "success": true, "mode": mode.as_str() })))
}

async fn restart_avatar(State(context): State<Arc<ApiContext>>) -> ApiResult {
    write_restart_sentinel(&context.restart_sentinel).map_err(internal_error)?;
    info!(path = %context.restart_sentinel.display(), "restart sentinel written");
    Ok(Json(json!({ "success": true })))
}
