//! Configuration types for the avatar session engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for an avatar companion session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Real-time room connection settings.
    pub room: RoomConfig,
    /// Avatar-rendering service settings.
    pub avatar: AvatarServiceConfig,
    /// Image generation / enhancement service settings.
    pub image: ImageServiceConfig,
    /// Photo capture settings.
    pub capture: CaptureConfig,
    /// Visual controls (personalities, filters, cooldowns).
    pub controls: ControlsConfig,
    /// Error-handling policy knobs.
    pub policy: PolicyConfig,
    /// HTTP API server settings.
    pub api: ApiConfig,
}

/// Real-time room connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Room service URL handed to connecting clients.
    pub server_url: String,
    /// Prefix for generated room names.
    pub room_prefix: String,
    /// API key identifying this deployment to the room service.
    pub api_key: String,
    /// Environment variable holding the token-signing secret.
    pub api_secret_env: String,
    /// Lifetime of issued participant tokens, in seconds.
    pub token_ttl_secs: u64,
    /// Whether a successful connect enables the local microphone.
    ///
    /// On by default: the conversation starts hands-free as soon as the
    /// room is up.
    pub mic_on_connect: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            server_url: "wss://rooms.example.dev".to_owned(),
            room_prefix: "visage".to_owned(),
            api_key: "devkey".to_owned(),
            api_secret_env: "VISAGE_ROOM_SECRET".to_owned(),
            token_ttl_secs: 6 * 60 * 60,
            mic_on_connect: true,
        }
    }
}

/// Avatar-rendering service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarServiceConfig {
    /// Base URL of the avatar-rendering service.
    pub base_url: String,
    /// Environment variable holding the service API key.
    pub api_key_env: String,
    /// Asset id used when the user skips photo capture and no cached
    /// asset exists.
    pub default_asset_id: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for AvatarServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.avatar-render.example".to_owned(),
            api_key_env: "AVATAR_API_KEY".to_owned(),
            default_asset_id: "6467b4a7-5386-4ecf-a9da-574c061478e9".to_owned(),
            timeout_secs: 60,
        }
    }
}

/// Image generation / enhancement service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageServiceConfig {
    /// Base URL of the image AI service.
    pub base_url: String,
    /// Environment variable holding the service API key.
    pub api_key_env: String,
    /// Prompt applied by the default enhancement pass.
    pub enhance_prompt: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ImageServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.image-gen.example".to_owned(),
            api_key_env: "IMAGE_API_KEY".to_owned(),
            enhance_prompt: "Enhance this portrait for a talking avatar: \
                             even studio lighting, sharp focus on the face, neutral background."
                .to_owned(),
            timeout_secs: 120,
        }
    }
}

/// Photo capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// JPEG quality for captured frames (1-100).
    pub jpeg_quality: u8,
    /// Whether the optional enhancement pass runs after capture.
    pub enhance_enabled: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 90,
            enhance_enabled: false,
        }
    }
}

/// Visual controls configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    /// Personality names offered by the carousel, in display order.
    pub personalities: Vec<String>,
    /// Filters the user can apply to the current avatar.
    pub filters: Vec<FilterConfig>,
    /// Minimum spacing between filter applications, in seconds.
    ///
    /// In-memory only: a restart resets the countdown.
    pub filter_cooldown_secs: u64,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            personalities: vec![
                "warm".to_owned(),
                "playful".to_owned(),
                "focused".to_owned(),
                "calm".to_owned(),
            ],
            filters: vec![
                FilterConfig {
                    id: "studio".to_owned(),
                    prompt: "Relight this portrait with soft studio lighting.".to_owned(),
                },
                FilterConfig {
                    id: "painterly".to_owned(),
                    prompt: "Repaint this portrait in a warm painterly style, keeping the \
                             likeness intact."
                        .to_owned(),
                },
            ],
            filter_cooldown_secs: 20,
        }
    }
}

/// A single avatar filter: an id shown to the client and the prompt sent to
/// the image service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub id: String,
    pub prompt: String,
}

/// Error-handling policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Whether a failed avatar creation lets the session proceed without a
    /// custom avatar (`true`) or returns the user to photo capture
    /// (`false`).
    pub fail_open_avatar_creation: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            fail_open_avatar_creation: true,
        }
    }
}

/// HTTP API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Bind address for `visage-server`.
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_owned(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::AvatarError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot
    /// be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::AvatarError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config_dir>/config.toml`.
    pub fn default_config_path() -> PathBuf {
        crate::app_dirs::config_dir().join("config.toml")
    }

    /// Resolve the token-signing secret from the configured env var.
    pub fn room_secret(&self) -> crate::error::Result<String> {
        let var = &self.room.api_secret_env;
        let value = std::env::var(var).map_err(|_| {
            crate::error::AvatarError::Config(format!("room secret env var is missing: {var}"))
        })?;
        if value.trim().is_empty() {
            return Err(crate::error::AvatarError::Config(format!(
                "room secret env var is empty: {var}"
            )));
        }
        Ok(value)
    }
}
