//! Control protocol shared by the browser client and the remote voice agent.
//!
//! Two channels carry control intent across the room:
//!
//! 1. **Remote procedures** ([`ProcedureName`]) — the agent invokes a named
//!    function on the client and awaits a JSON-encoded string result.
//! 2. **Topic data channel** ([`ControlMessage`]) — either side publishes a
//!    JSON payload under a [`Topic`]; the other side subscribes.
//!
//! Every topic payload is an explicit variant of the [`ControlMessage`] sum
//! type, validated at the boundary: unknown topics and malformed payloads
//! fail closed with a [`ProtocolError`] instead of being silently ignored.
//!
//! Ordering between the two channels is not guaranteed. Consumers must not
//! depend on `avatar_data` arriving before `mode_switch`; readiness is
//! decided by asset-id presence, not message order.

use serde::{Deserialize, Serialize};

/// Topic strings routing data-channel messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "voice_cloning_preference")]
    VoiceCloningPreference,
    #[serde(rename = "avatar_data")]
    AvatarData,
    #[serde(rename = "mode_switch")]
    ModeSwitch,
    #[serde(rename = "user_state_change")]
    UserStateChange,
    #[serde(rename = "agent_message")]
    AgentMessage,
    #[serde(rename = "personality_selection")]
    PersonalitySelection,
    #[serde(rename = "filter_selection")]
    FilterSelection,
    #[serde(rename = "filter_error")]
    FilterError,
    #[serde(rename = "frontend_control")]
    FrontendControl,
}

impl Topic {
    /// Render the topic to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VoiceCloningPreference => "voice_cloning_preference",
            Self::AvatarData => "avatar_data",
            Self::ModeSwitch => "mode_switch",
            Self::UserStateChange => "user_state_change",
            Self::AgentMessage => "agent_message",
            Self::PersonalitySelection => "personality_selection",
            Self::FilterSelection => "filter_selection",
            Self::FilterError => "filter_error",
            Self::FrontendControl => "frontend_control",
        }
    }

    /// Parse a topic from wire format.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "voice_cloning_preference" => Some(Self::VoiceCloningPreference),
            "avatar_data" => Some(Self::AvatarData),
            "mode_switch" => Some(Self::ModeSwitch),
            "user_state_change" => Some(Self::UserStateChange),
            "agent_message" => Some(Self::AgentMessage),
            "personality_selection" => Some(Self::PersonalitySelection),
            "filter_selection" => Some(Self::FilterSelection),
            "filter_error" => Some(Self::FilterError),
            "frontend_control" => Some(Self::FrontendControl),
            _ => None,
        }
    }
}

/// Remote procedures the client exposes to the agent.
///
/// Each takes a JSON string payload and returns a JSON-encoded string result.
/// Invocation is at-most-once; there are no retries and no idempotency keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcedureName {
    #[serde(rename = "startCamera")]
    StartCamera,
    #[serde(rename = "capturePhoto")]
    CapturePhoto,
    #[serde(rename = "skipPhoto")]
    SkipPhoto,
    #[serde(rename = "isCameraActive")]
    IsCameraActive,
    #[serde(rename = "generateAvatar")]
    GenerateAvatar,
    #[serde(rename = "modifyAvatar")]
    ModifyAvatar,
    #[serde(rename = "endCall")]
    EndCall,
    #[serde(rename = "openCamera")]
    OpenCamera,
}

impl ProcedureName {
    /// Render the procedure name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartCamera => "startCamera",
            Self::CapturePhoto => "capturePhoto",
            Self::SkipPhoto => "skipPhoto",
            Self::IsCameraActive => "isCameraActive",
            Self::GenerateAvatar => "generateAvatar",
            Self::ModifyAvatar => "modifyAvatar",
            Self::EndCall => "endCall",
            Self::OpenCamera => "openCamera",
        }
    }

    /// Parse a procedure name from wire format.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "startCamera" => Some(Self::StartCamera),
            "capturePhoto" => Some(Self::CapturePhoto),
            "skipPhoto" => Some(Self::SkipPhoto),
            "isCameraActive" => Some(Self::IsCameraActive),
            "generateAvatar" => Some(Self::GenerateAvatar),
            "modifyAvatar" => Some(Self::ModifyAvatar),
            "endCall" => Some(Self::EndCall),
            "openCamera" => Some(Self::OpenCamera),
            _ => None,
        }
    }
}

/// Conversation mode of the remote agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Generic voice assistant guiding the user through setup.
    #[default]
    Assistant,
    /// The user's personalized avatar persona.
    Avatar,
}

impl SessionMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::Avatar => "avatar",
        }
    }

    /// Parse a mode from wire format. Accepts `"assistant"` (and the legacy
    /// spelling `"alexa"`) or `"avatar"`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "assistant" | "alexa" => Some(Self::Assistant),
            "avatar" => Some(Self::Avatar),
            _ => None,
        }
    }
}

/// Imperative actions carried on the `frontend_control` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontendAction {
    ShowPhotoCapture,
    StartCamera,
    CapturePhoto,
    SkipPhoto,
    GenerateAvatar,
}

/// A decoded data-channel message: one variant per topic.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Whether the agent should adopt a cloned voice when available.
    VoiceCloningPreference { enabled: bool },
    /// A new avatar asset is ready.
    AvatarData { asset_id: String },
    /// Switch the agent's conversation mode.
    ModeSwitch {
        mode: SessionMode,
        avatar_id: Option<String>,
    },
    /// Client-side lifecycle notification (e.g. `"call_ended"`).
    UserStateChange { action: String, timestamp: i64 },
    /// Free-text message from the agent, optionally tied to a filter.
    AgentMessage {
        message: String,
        filter_name: Option<String>,
        timestamp: i64,
    },
    /// The user confirmed a personality from the carousel.
    PersonalitySelection { name: String, index: u32 },
    /// The user applied a filter to the current avatar.
    FilterSelection { filter_id: String, timestamp: i64 },
    /// A filter pipeline run failed.
    FilterError {
        error_type: String,
        error_details: String,
        safety_rejection: bool,
        timestamp: i64,
    },
    /// Imperative UI action requested by the agent.
    FrontendControl {
        action: FrontendAction,
        prompt: Option<String>,
    },
}

// Wire shapes. Field casing is part of the contract and must not drift.

#[derive(Serialize, Deserialize)]
struct VoiceCloningPreferenceWire {
    #[serde(rename = "voiceCloningEnabled")]
    voice_cloning_enabled: bool,
}

#[derive(Serialize, Deserialize)]
struct AvatarDataWire {
    #[serde(rename = "assetId")]
    asset_id: String,
}

#[derive(Serialize, Deserialize)]
struct ModeSwitchWire {
    action: String,
    mode: SessionMode,
    #[serde(rename = "avatarId", skip_serializing_if = "Option::is_none")]
    avatar_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct UserStateChangeWire {
    action: String,
    timestamp: i64,
}

#[derive(Serialize, Deserialize)]
struct AgentMessageWire {
    message: String,
    #[serde(rename = "filterName", skip_serializing_if = "Option::is_none")]
    filter_name: Option<String>,
    timestamp: i64,
}

#[derive(Serialize, Deserialize)]
struct PersonalitySelectionWire {
    #[serde(rename = "personalityName")]
    personality_name: String,
    #[serde(rename = "personalityIndex")]
    personality_index: u32,
}

#[derive(Serialize, Deserialize)]
struct FilterSelectionWire {
    #[serde(rename = "filterID")]
    filter_id: String,
    timestamp: i64,
}

#[derive(Serialize, Deserialize)]
struct FilterErrorWire {
    #[serde(rename = "errorType")]
    error_type: String,
    #[serde(rename = "errorDetails")]
    error_details: String,
    #[serde(rename = "isSafetyRejection")]
    is_safety_rejection: bool,
    timestamp: i64,
}

#[derive(Serialize, Deserialize)]
struct FrontendControlWire {
    action: FrontendAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
}

/// Action constant embedded in every `mode_switch` payload.
const MODE_SWITCH_ACTION: &str = "switch_mode";

impl ControlMessage {
    /// Topic this message is published under.
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::VoiceCloningPreference { .. } => Topic::VoiceCloningPreference,
            Self::AvatarData { .. } => Topic::AvatarData,
            Self::ModeSwitch { .. } => Topic::ModeSwitch,
            Self::UserStateChange { .. } => Topic::UserStateChange,
            Self::AgentMessage { .. } => Topic::AgentMessage,
            Self::PersonalitySelection { .. } => Topic::PersonalitySelection,
            Self::FilterSelection { .. } => Topic::FilterSelection,
            Self::FilterError { .. } => Topic::FilterError,
            Self::FrontendControl { .. } => Topic::FrontendControl,
        }
    }

    /// Encode the message to its wire payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let value = match self {
            Self::VoiceCloningPreference { enabled } => {
                serde_json::to_vec(&VoiceCloningPreferenceWire {
                    voice_cloning_enabled: *enabled,
                })
            }
            Self::AvatarData { asset_id } => serde_json::to_vec(&AvatarDataWire {
                asset_id: asset_id.clone(),
            }),
            Self::ModeSwitch { mode, avatar_id } => serde_json::to_vec(&ModeSwitchWire {
                action: MODE_SWITCH_ACTION.to_owned(),
                mode: *mode,
                avatar_id: avatar_id.clone(),
            }),
            Self::UserStateChange { action, timestamp } => {
                serde_json::to_vec(&UserStateChangeWire {
                    action: action.clone(),
                    timestamp: *timestamp,
                })
            }
            Self::AgentMessage {
                message,
                filter_name,
                timestamp,
            } => serde_json::to_vec(&AgentMessageWire {
                message: message.clone(),
                filter_name: filter_name.clone(),
                timestamp: *timestamp,
            }),
            Self::PersonalitySelection { name, index } => {
                serde_json::to_vec(&PersonalitySelectionWire {
                    personality_name: name.clone(),
                    personality_index: *index,
                })
            }
            Self::FilterSelection {
                filter_id,
                timestamp,
            } => serde_json::to_vec(&FilterSelectionWire {
                filter_id: filter_id.clone(),
                timestamp: *timestamp,
            }),
            Self::FilterError {
                error_type,
                error_details,
                safety_rejection,
                timestamp,
            } => serde_json::to_vec(&FilterErrorWire {
                error_type: error_type.clone(),
                error_details: error_details.clone(),
                is_safety_rejection: *safety_rejection,
                timestamp: *timestamp,
            }),
            Self::FrontendControl { action, prompt } => serde_json::to_vec(&FrontendControlWire {
                action: *action,
                prompt: prompt.clone(),
            }),
        };
        value.map_err(|e| ProtocolError::new(ProtocolErrorKind::Malformed, e.to_string()))
    }

    /// Decode a message from a raw topic string and payload bytes.
    ///
    /// Fails closed: an unknown topic or a payload that does not match the
    /// topic's shape is an error, never a silently-dropped message.
    pub fn decode(topic: &str, payload: &[u8]) -> Result<Self, ProtocolError> {
        let topic = Topic::parse(topic)
            .ok_or_else(|| ProtocolError::new(ProtocolErrorKind::UnknownTopic, topic.to_owned()))?;

        fn malformed<E: std::fmt::Display>(topic: Topic) -> impl FnOnce(E) -> ProtocolError {
            move |e| {
                ProtocolError::new(
                    ProtocolErrorKind::Malformed,
                    format!("{}: {e}", topic.as_str()),
                )
            }
        }

        match topic {
            Topic::VoiceCloningPreference => {
                let wire: VoiceCloningPreferenceWire =
                    serde_json::from_slice(payload).map_err(malformed(topic))?;
                Ok(Self::VoiceCloningPreference {
                    enabled: wire.voice_cloning_enabled,
                })
            }
            Topic::AvatarData => {
                let wire: AvatarDataWire =
                    serde_json::from_slice(payload).map_err(malformed(topic))?;
                if wire.asset_id.trim().is_empty() {
                    return Err(ProtocolError::new(
                        ProtocolErrorKind::Malformed,
                        "avatar_data: assetId cannot be empty".to_owned(),
                    ));
                }
                Ok(Self::AvatarData {
                    asset_id: wire.asset_id,
                })
            }
            Topic::ModeSwitch => {
                let wire: ModeSwitchWire =
                    serde_json::from_slice(payload).map_err(malformed(topic))?;
                if wire.action != MODE_SWITCH_ACTION {
                    return Err(ProtocolError::new(
                        ProtocolErrorKind::Malformed,
                        format!("mode_switch: unexpected action `{}`", wire.action),
                    ));
                }
                Ok(Self::ModeSwitch {
                    mode: wire.mode,
                    avatar_id: wire.avatar_id,
                })
            }
            Topic::UserStateChange => {
                let wire: UserStateChangeWire =
                    serde_json::from_slice(payload).map_err(malformed(topic))?;
                Ok(Self::UserStateChange {
                    action: wire.action,
                    timestamp: wire.timestamp,
                })
            }
            Topic::AgentMessage => {
                let wire: AgentMessageWire =
                    serde_json::from_slice(payload).map_err(malformed(topic))?;
                Ok(Self::AgentMessage {
                    message: wire.message,
                    filter_name: wire.filter_name,
                    timestamp: wire.timestamp,
                })
            }
            Topic::PersonalitySelection => {
                let wire: PersonalitySelectionWire =
                    serde_json::from_slice(payload).map_err(malformed(topic))?;
                Ok(Self::PersonalitySelection {
                    name: wire.personality_name,
                    index: wire.personality_index,
                })
            }
            Topic::FilterSelection => {
                let wire: FilterSelectionWire =
                    serde_json::from_slice(payload).map_err(malformed(topic))?;
                Ok(Self::FilterSelection {
                    filter_id: wire.filter_id,
                    timestamp: wire.timestamp,
                })
            }
            Topic::FilterError => {
                let wire: FilterErrorWire =
                    serde_json::from_slice(payload).map_err(malformed(topic))?;
                Ok(Self::FilterError {
                    error_type: wire.error_type,
                    error_details: wire.error_details,
                    safety_rejection: wire.is_safety_rejection,
                    timestamp: wire.timestamp,
                })
            }
            Topic::FrontendControl => {
                let wire: FrontendControlWire =
                    serde_json::from_slice(payload).map_err(malformed(topic))?;
                Ok(Self::FrontendControl {
                    action: wire.action,
                    prompt: wire.prompt,
                })
            }
        }
    }
}

/// Current time as a millisecond Unix timestamp, the unit used on the wire.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Protocol validation error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    UnknownTopic,
    Malformed,
}

/// Protocol validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
}

impl ProtocolError {
    #[must_use]
    pub fn new(kind: ProtocolErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProtocolError {}

impl From<ProtocolError> for crate::error::AvatarError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e.to_string())
    }
}
