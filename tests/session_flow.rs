//! End-to-end session pipeline: capture → create → notify, with the
//! transport mocked and the avatar service behind a mock server.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use visage::asset_cache::AssetCache;
use visage::capture::SyntheticCamera;
use visage::config::SessionConfig;
use visage::services::avatar_api::AvatarApiClient;
use visage::services::image_api::ImageApiClient;
use visage::session::AvatarSession;
use visage::state_store::{MemoryStateStore, StateStore};
use visage::{ControlMessage, Result, RoomTransport, SetupStep};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct RecordingTransport {
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingTransport {
    fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    fn decoded(&self) -> Vec<ControlMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, payload)| {
                ControlMessage::decode(topic, payload).expect("published message decodes")
            })
            .collect()
    }
}

#[async_trait]
impl RoomTransport for RecordingTransport {
    async fn connect(&self, _server_url: &str, _token: &str) -> Result<()> {
        Ok(())
    }
    async fn send_data(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_owned(), payload.to_vec()));
        Ok(())
    }
    async fn set_microphone(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }
    async fn set_camera(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

struct Flow {
    session: Arc<AvatarSession>,
    transport: Arc<RecordingTransport>,
    store: Arc<MemoryStateStore>,
    cache_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn start_flow(upstream: &MockServer) -> Flow {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache_path = dir.path().join("asset.json");
    let transport = Arc::new(RecordingTransport::default());
    let store = Arc::new(MemoryStateStore::default());

    let mut config = SessionConfig::default();
    config.avatar.base_url = upstream.uri();
    config.image.base_url = upstream.uri();

    let avatar_client = AvatarApiClient::new(upstream.uri(), None, Duration::from_secs(5))
        .expect("avatar client");
    let image_client =
        ImageApiClient::new(upstream.uri(), None, Duration::from_secs(5)).expect("image client");

    let session = AvatarSession::new(
        config,
        Arc::clone(&transport) as Arc<dyn RoomTransport>,
        Box::new(SyntheticCamera::default()),
        Arc::clone(&store) as Arc<dyn StateStore>,
        AssetCache::new(cache_path.clone()),
        avatar_client,
        image_client,
    );
    session.connect("wss://rooms.test", "token").await.expect("connect");
    tokio::spawn(Arc::clone(&session).run());

    Flow {
        session,
        transport,
        store,
        cache_path,
        _dir: dir,
    }
}

/// Wait until `predicate` holds or a deadline passes.
async fn wait_for(mut predicate: impl FnMut() -> bool) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn captured_photo_becomes_a_ready_avatar() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/avatars"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "assetId": "asset-e2e" })))
        .expect(1)
        .mount(&upstream)
        .await;

    let flow = start_flow(&upstream).await;
    let room = flow.session.room();

    room.invoke_procedure("startCamera", "");
    room.invoke_procedure("capturePhoto", "");

    let store = Arc::clone(&flow.store);
    wait_for(move || {
        store
            .get()
            .map(|record| record.asset_id.as_deref() == Some("asset-e2e"))
            .unwrap_or(false)
    })
    .await;

    let state = flow.session.setup_state();
    assert_eq!(state.step, SetupStep::Ready);
    assert_eq!(state.asset_id.as_deref(), Some("asset-e2e"));
    assert!(state.error.is_none());

    // The asset id is durable across reloads.
    assert_eq!(
        AssetCache::new(flow.cache_path.clone()).load().as_deref(),
        Some("asset-e2e")
    );

    // Step (b): both notifications went out over the data channel.
    let topics = flow.transport.topics();
    assert!(topics.contains(&"avatar_data".to_owned()));
    assert!(topics.contains(&"mode_switch".to_owned()));
    for msg in flow.transport.decoded() {
        if let ControlMessage::AvatarData { asset_id } = msg {
            assert_eq!(asset_id, "asset-e2e");
        }
    }
}

#[tokio::test]
async fn creation_failure_fails_open_and_keeps_the_session_alive() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/avatars"))
        .respond_with(ResponseTemplate::new(500).set_body_string("no capacity"))
        .mount(&upstream)
        .await;

    let flow = start_flow(&upstream).await;
    let room = flow.session.room();

    room.invoke_procedure("startCamera", "");
    room.invoke_procedure("capturePhoto", "");

    let session = Arc::clone(&flow.session);
    wait_for(move || session.setup_state().step == SetupStep::Ready).await;

    let state = flow.session.setup_state();
    assert_eq!(state.asset_id, None);
    assert!(state.error.as_deref().unwrap().contains("500"));
    // No avatar_data went out for a failed creation.
    assert!(!flow.transport.topics().contains(&"avatar_data".to_owned()));
}

#[tokio::test]
async fn generate_avatar_procedure_runs_the_prompt_pipeline() {
    use base64::Engine as _;
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "image": base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]),
        })))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/avatars"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "assetId": "asset-gen" })))
        .mount(&upstream)
        .await;

    let flow = start_flow(&upstream).await;
    let room = flow.session.room();

    let reply: serde_json::Value = serde_json::from_str(
        &room.invoke_procedure("generateAvatar", r#"{"prompt": "a cheerful explorer"}"#),
    )
    .expect("json reply");
    assert_eq!(reply["success"], true);

    let session = Arc::clone(&flow.session);
    wait_for(move || session.setup_state().asset_id.as_deref() == Some("asset-gen")).await;
    assert_eq!(flow.session.setup_state().step, SetupStep::Ready);
}

#[tokio::test]
async fn remote_frontend_control_drives_capture() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/avatars"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "assetId": "asset-fc" })))
        .mount(&upstream)
        .await;

    let flow = start_flow(&upstream).await;
    let room = flow.session.room();

    // The agent publishes imperative actions on the frontend_control topic.
    room.handle_incoming("frontend_control", br#"{"action":"start_camera"}"#);
    let session = Arc::clone(&flow.session);
    wait_for(move || {
        session
            .room()
            .invoke_procedure("isCameraActive", "")
            .contains("true")
    })
    .await;

    room.handle_incoming("frontend_control", br#"{"action":"capture_photo"}"#);
    let session = Arc::clone(&flow.session);
    wait_for(move || session.setup_state().asset_id.as_deref() == Some("asset-fc")).await;
}

#[tokio::test]
async fn filter_pipeline_refetches_asset_and_recreates() {
    use base64::Engine as _;
    let upstream = MockServer::start().await;
    // First creation.
    Mock::given(method("POST"))
        .and(path("/v1/avatars"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "assetId": "asset-first" })),
        )
        .mount(&upstream)
        .await;
    // Asset re-fetch for the filter source image.
    Mock::given(method("GET"))
        .and(path("/v1/avatars/asset-first"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "assetId": "asset-first",
            "status": "ready",
            "downloadUrl": format!("{}/files/asset-first.png", upstream.uri()),
        })))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/asset-first.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![4, 4, 4]))
        .mount(&upstream)
        .await;
    // Filter enhancement pass.
    Mock::given(method("POST"))
        .and(path("/v1/images/edits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "image": base64::engine::general_purpose::STANDARD.encode([9u8, 9]),
        })))
        .mount(&upstream)
        .await;

    let flow = start_flow(&upstream).await;
    let room = flow.session.room();

    room.invoke_procedure("startCamera", "");
    room.invoke_procedure("capturePhoto", "");
    let store = Arc::clone(&flow.store);
    wait_for(move || {
        store
            .get()
            .map(|record| record.asset_id.is_some())
            .unwrap_or(false)
    })
    .await;

    let accepted = flow.session.apply_filter("studio").await.expect("filter");
    assert!(accepted);

    let topics = flow.transport.topics();
    assert!(topics.contains(&"filter_selection".to_owned()));
    // A second immediate request is gated by the cooldown.
    assert!(!flow.session.apply_filter("painterly").await.expect("gated"));
}
