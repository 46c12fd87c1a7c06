//! Contract tests for the external-service clients against mock servers.

use base64::Engine as _;
use serde_json::json;
use std::time::Duration;
use visage::AvatarError;
use visage::services::avatar_api::AvatarApiClient;
use visage::services::image_api::ImageApiClient;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn avatar_client(server: &MockServer) -> AvatarApiClient {
    AvatarApiClient::new(server.uri(), Some("test-key".to_owned()), Duration::from_secs(5))
        .expect("build avatar client")
}

fn image_client(server: &MockServer) -> ImageApiClient {
    ImageApiClient::new(server.uri(), Some("test-key".to_owned()), Duration::from_secs(5))
        .expect("build image client")
}

// ────────────────────────────────────────────────────────────────────────────
// Avatar service
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_avatar_returns_asset_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/avatars"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "assetId": "asset-77" })))
        .expect(1)
        .mount(&server)
        .await;

    let asset_id = avatar_client(&server)
        .create_avatar(vec![0xFF, 0xD8, 0xFF])
        .await
        .expect("create avatar");

    assert_eq!(asset_id, "asset-77");
}

#[tokio::test]
async fn create_avatar_failure_maps_to_service_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/avatars"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance window"))
        .mount(&server)
        .await;

    let result = avatar_client(&server).create_avatar(vec![1, 2, 3]).await;

    match result {
        Err(AvatarError::AvatarService(message)) => {
            assert!(message.contains("503"));
            assert!(message.contains("maintenance window"));
        }
        other => panic!("expected AvatarService error, got {other:?}"),
    }
}

#[tokio::test]
async fn get_asset_parses_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/avatars/asset-5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "assetId": "asset-5",
            "status": "ready",
            "downloadUrl": format!("{}/files/asset-5.png", server.uri()),
        })))
        .mount(&server)
        .await;

    let metadata = avatar_client(&server)
        .get_asset("asset-5")
        .await
        .expect("get asset");

    assert_eq!(metadata.asset_id, "asset-5");
    assert_eq!(metadata.status, "ready");
    assert!(metadata.download_url.is_some());
}

#[tokio::test]
async fn download_asset_image_follows_download_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/avatars/asset-5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "assetId": "asset-5",
            "status": "ready",
            "downloadUrl": format!("{}/files/asset-5.png", server.uri()),
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/asset-5.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9, 9, 9]))
        .mount(&server)
        .await;

    let bytes = avatar_client(&server)
        .download_asset_image("asset-5")
        .await
        .expect("download asset");

    assert_eq!(bytes, vec![9, 9, 9]);
}

#[tokio::test]
async fn download_without_url_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/avatars/asset-6"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "assetId": "asset-6",
            "status": "processing",
        })))
        .mount(&server)
        .await;

    let result = avatar_client(&server).download_asset_image("asset-6").await;
    assert!(matches!(result, Err(AvatarError::AvatarService(_))));
}

// ────────────────────────────────────────────────────────────────────────────
// Image service
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn enhance_decodes_base64_payload() {
    let server = MockServer::start().await;
    let image_bytes = vec![0xFF, 0xD8, 0x01, 0x02];
    Mock::given(method("POST"))
        .and(path("/v1/images/edits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "image": base64::engine::general_purpose::STANDARD.encode(&image_bytes),
        })))
        .mount(&server)
        .await;

    let enhanced = image_client(&server)
        .enhance(&[1, 2, 3], "soft studio lighting")
        .await
        .expect("enhance");

    assert_eq!(enhanced, image_bytes);
}

#[tokio::test]
async fn enhance_server_error_is_generic_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images/edits"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let error = image_client(&server)
        .enhance(&[1], "prompt")
        .await
        .expect_err("should fail");

    assert!(!error.is_safety_rejection());
}

#[tokio::test]
async fn safety_rejection_is_flagged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string("request rejected by the content_policy system"),
        )
        .mount(&server)
        .await;

    let error = image_client(&server)
        .generate("something disallowed")
        .await
        .expect_err("should be rejected");

    assert!(error.is_safety_rejection());
}

#[tokio::test]
async fn generate_decodes_base64_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "image": base64::engine::general_purpose::STANDARD.encode([7u8, 8, 9]),
        })))
        .mount(&server)
        .await;

    let generated = image_client(&server)
        .generate("a friendly portrait")
        .await
        .expect("generate");

    assert_eq!(generated, vec![7, 8, 9]);
}

#[tokio::test]
async fn invalid_base64_payload_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "image": "%%%" })))
        .mount(&server)
        .await;

    let result = image_client(&server).generate("prompt").await;
    assert!(result.is_err());
}
