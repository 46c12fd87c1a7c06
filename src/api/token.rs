//! Room access token minting.
//!
//! Connection details include an HS256 JWT granting the participant access
//! to one room. The claims optionally bind the current avatar asset id as
//! metadata so a freshly-joining agent can pick the avatar up without
//! waiting for a data-channel message.

use crate::config::RoomConfig;
use crate::error::{AvatarError, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by a room access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomClaims {
    /// Issuer: the deployment API key.
    pub iss: String,
    /// Subject: the participant identity.
    pub sub: String,
    /// Room the grant is scoped to.
    pub room: String,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
    /// Issued-at, seconds since the epoch.
    pub iat: u64,
    /// Token id.
    pub jti: String,
    /// Optional JSON metadata (carries the bound avatar asset id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// Mint a participant token for one room.
pub fn mint_room_token(
    config: &RoomConfig,
    secret: &str,
    identity: &str,
    room: &str,
    asset_id: Option<&str>,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    let metadata = asset_id
        .map(|id| serde_json::json!({ "assetId": id }).to_string());

    let claims = RoomClaims {
        iss: config.api_key.clone(),
        sub: identity.to_owned(),
        room: room.to_owned(),
        exp: now + config.token_ttl_secs,
        iat: now,
        jti: uuid::Uuid::new_v4().to_string(),
        metadata,
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AvatarError::Token(format!("token encode failed: {e}")))
}

/// Decode and validate a room token.
pub fn decode_room_token(secret: &str, token: &str) -> Result<RoomClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    jsonwebtoken::decode::<RoomClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| AvatarError::Token(format!("token decode failed: {e}")))
}
