//! End-to-end tests for the HTTP API against mocked upstream services.

use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use visage::api::{ApiContext, serve, token};
use visage::config::SessionConfig;
use visage::services::avatar_api::AvatarApiClient;
use visage::services::image_api::ImageApiClient;
use visage::state_store::{AvatarStateRecord, MemoryStateStore, StateStore};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET_VAR: &str = "VISAGE_TEST_ROOM_SECRET";
const SECRET: &str = "s3cret-for-tests";

struct TestApi {
    addr: SocketAddr,
    store: Arc<MemoryStateStore>,
    sentinel: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

impl TestApi {
    fn url(&self, route: &str) -> String {
        format!("http://{}{route}", self.addr)
    }
}

async fn start_api(upstream: &MockServer) -> TestApi {
    // Same value in every test, so concurrent setting is harmless.
    unsafe {
        std::env::set_var(SECRET_VAR, SECRET);
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = SessionConfig::default();
    config.room.api_secret_env = SECRET_VAR.to_owned();
    config.avatar.base_url = upstream.uri();
    config.image.base_url = upstream.uri();

    let store = Arc::new(MemoryStateStore::default());
    let avatar = AvatarApiClient::new(upstream.uri(), None, Duration::from_secs(5))
        .expect("avatar client");
    let images =
        ImageApiClient::new(upstream.uri(), None, Duration::from_secs(5)).expect("image client");

    let sentinel = dir.path().join("restart_requested");
    let context = Arc::new(
        ApiContext::new(
            config,
            Arc::clone(&store) as Arc<dyn StateStore>,
            avatar,
            images,
        )
        .with_restart_sentinel(sentinel.clone()),
    );

    let (addr, _handle) = serve(context, "127.0.0.1:0").await.expect("serve");
    TestApi {
        addr,
        store,
        sentinel,
        _dir: dir,
    }
}

#[tokio::test]
async fn connection_details_issues_a_valid_token() {
    let upstream = MockServer::start().await;
    let api = start_api(&upstream).await;

    let body: Value = reqwest::Client::new()
        .post(api.url("/api/connection-details"))
        .json(&json!({ "participantName": "sam" }))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert_eq!(body["participantName"], "sam");
    assert!(body["roomName"].as_str().unwrap().starts_with("visage-"));

    let claims =
        token::decode_room_token(SECRET, body["participantToken"].as_str().unwrap())
            .expect("valid token");
    assert_eq!(claims.sub, "sam");
    assert_eq!(claims.room, body["roomName"].as_str().unwrap());
    assert!(claims.metadata.is_none());
}

#[tokio::test]
async fn connection_details_binds_stored_asset_id() {
    let upstream = MockServer::start().await;
    let api = start_api(&upstream).await;
    api.store
        .set(&AvatarStateRecord {
            asset_id: Some("asset-resume".to_owned()),
            ..Default::default()
        })
        .expect("seed store");

    let body: Value = reqwest::Client::new()
        .get(api.url("/api/connection-details"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    let claims =
        token::decode_room_token(SECRET, body["participantToken"].as_str().unwrap())
            .expect("valid token");
    let metadata: Value = serde_json::from_str(claims.metadata.as_deref().unwrap()).unwrap();
    assert_eq!(metadata["assetId"], "asset-resume");
}

#[tokio::test]
async fn create_avatar_proxies_upload_and_records_asset() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/avatars"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "assetId": "asset-31" })))
        .expect(1)
        .mount(&upstream)
        .await;
    let api = start_api(&upstream).await;

    let form = reqwest::multipart::Form::new().part(
        "photo",
        reqwest::multipart::Part::bytes(vec![0xFF, 0xD8, 0x00])
            .file_name("photo.jpg")
            .mime_str("image/jpeg")
            .unwrap(),
    );
    let body: Value = reqwest::Client::new()
        .post(api.url("/api/create-avatar"))
        .multipart(form)
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert_eq!(body["assetId"], "asset-31");
    assert_eq!(
        api.store.get().unwrap().asset_id.as_deref(),
        Some("asset-31")
    );
}

#[tokio::test]
async fn create_avatar_without_photo_is_a_bad_request() {
    let upstream = MockServer::start().await;
    let api = start_api(&upstream).await;

    let form = reqwest::multipart::Form::new().text("name", "no photo here");
    let response = reqwest::Client::new()
        .post(api.url("/api/create-avatar"))
        .multipart(form)
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_avatar_upstream_failure_maps_to_bad_gateway() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/avatars"))
        .respond_with(ResponseTemplate::new(500).set_body_string("kaput"))
        .mount(&upstream)
        .await;
    let api = start_api(&upstream).await;

    let form = reqwest::multipart::Form::new().part(
        "photo",
        reqwest::multipart::Part::bytes(vec![1, 2])
            .file_name("photo.jpg")
            .mime_str("image/jpeg")
            .unwrap(),
    );
    let response = reqwest::Client::new()
        .post(api.url("/api/create-avatar"))
        .multipart(form)
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    // The state bag keeps whatever it had; nothing is half-written.
    assert_eq!(api.store.get().unwrap().asset_id, None);
}

#[tokio::test]
async fn enhance_image_failure_is_reported_in_band() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images/edits"))
        .respond_with(
            ResponseTemplate::new(400).set_body_string("blocked by moderation filters"),
        )
        .mount(&upstream)
        .await;
    let api = start_api(&upstream).await;

    let form = reqwest::multipart::Form::new()
        .part(
            "photo",
            reqwest::multipart::Part::bytes(vec![1, 2, 3])
                .file_name("photo.jpg")
                .mime_str("image/jpeg")
                .unwrap(),
        )
        .text("prompt", "make it sparkle");
    let response = reqwest::Client::new()
        .post(api.url("/api/enhance-image"))
        .multipart(form)
        .send()
        .await
        .expect("request");

    // Fail-open: HTTP 200 with the failure described in the body.
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["success"], false);
    assert_eq!(body["isSafetyRejection"], true);
}

#[tokio::test]
async fn generate_image_returns_base64_payload() {
    use base64::Engine as _;
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "image": base64::engine::general_purpose::STANDARD.encode([5u8, 6]),
        })))
        .mount(&upstream)
        .await;
    let api = start_api(&upstream).await;

    let body: Value = reqwest::Client::new()
        .post(api.url("/api/generate-image"))
        .json(&json!({ "prompt": "a friendly portrait" }))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert_eq!(body["success"], true);
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(body["generatedImage"].as_str().unwrap())
        .unwrap();
    assert_eq!(decoded, vec![5, 6]);
}

#[tokio::test]
async fn state_bag_set_get_clear_round_trips() {
    let upstream = MockServer::start().await;
    let api = start_api(&upstream).await;
    let client = reqwest::Client::new();

    client
        .post(api.url("/api/set-avatar-id"))
        .json(&json!({ "assetId": "asset-55", "switchVoice": true }))
        .send()
        .await
        .expect("set");

    let state: Value = client
        .get(api.url("/api/avatar-state"))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(state["assetId"], "asset-55");
    assert_eq!(state["switchVoice"], true);

    client
        .post(api.url("/api/clear-avatar-state"))
        .send()
        .await
        .expect("clear");

    let state: Value = client
        .get(api.url("/api/avatar-state"))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(state["assetId"], Value::Null);
    assert_eq!(state["switchVoice"], false);
}

#[tokio::test]
async fn reset_voice_state_clears_voice_flags_only() {
    let upstream = MockServer::start().await;
    let api = start_api(&upstream).await;
    api.store
        .set(&AvatarStateRecord {
            asset_id: Some("asset-1".to_owned()),
            switch_voice: true,
            custom_voice_id: Some("voice-1".to_owned()),
            ..Default::default()
        })
        .expect("seed");

    reqwest::Client::new()
        .post(api.url("/api/reset-voice-state"))
        .send()
        .await
        .expect("reset");

    let record = api.store.get().unwrap();
    assert!(!record.switch_voice);
    assert_eq!(record.custom_voice_id, None);
    assert_eq!(record.asset_id.as_deref(), Some("asset-1"));
}

#[tokio::test]
async fn switch_mode_validates_and_persists() {
    let upstream = MockServer::start().await;
    let api = start_api(&upstream).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(api.url("/api/switch-mode"))
        .json(&json!({ "mode": "avatar", "avatarId": "asset-9" }))
        .send()
        .await
        .expect("switch")
        .json()
        .await
        .expect("json");
    assert_eq!(body["mode"], "avatar");

    let record = api.store.get().unwrap();
    assert_eq!(record.mode, visage::SessionMode::Avatar);
    assert_eq!(record.asset_id.as_deref(), Some("asset-9"));

    let response = client
        .post(api.url("/api/switch-mode"))
        .json(&json!({ "mode": "pirate" }))
        .send()
        .await
        .expect("bad mode");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn restart_avatar_writes_the_sentinel() {
    let upstream = MockServer::start().await;
    let api = start_api(&upstream).await;

    reqwest::Client::new()
        .post(api.url("/api/restart-avatar"))
        .send()
        .await
        .expect("restart");

    let content = std::fs::read_to_string(&api.sentinel).expect("sentinel file");
    assert!(chrono::DateTime::parse_from_rfc3339(&content).is_ok());
}
