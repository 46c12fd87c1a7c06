//! Avatar setup state machine.
//!
//! Coordinates photo acquisition, remote avatar-asset creation, and
//! readiness signalling. The state is a value object mutated only through
//! the named transitions in [`SetupAction`]; anything else is rejected
//! without a state change.
//!
//! Avatar creation failure is **fail-open** by default: the conversation
//! proceeds without a custom avatar rather than blocking the user. The
//! policy is an explicit knob (`PolicyConfig::fail_open_avatar_creation`);
//! when disabled, a failure returns the user to photo capture instead.

use crate::asset_cache::AssetCache;
use crate::error::{AvatarError, Result};
use tracing::{info, warn};

/// Phase of the avatar setup flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetupStep {
    /// Waiting for the user to capture (or skip) a photo.
    #[default]
    PhotoCapture,
    /// Photo is uploading / the asset is being created remotely.
    CreatingAvatar,
    /// Setup finished; an asset may or may not exist (fail-open).
    Ready,
    /// The user skipped photo capture.
    Skipped,
}

/// The setup state value object.
///
/// At most one exists per session. `asset_id` only moves unset → set except
/// through [`SetupAction::Reset`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvatarSetupState {
    pub step: SetupStep,
    /// Captured photo bytes, owned here until consumed by the upload.
    pub user_photo: Option<Vec<u8>>,
    /// Opaque id issued by the avatar-rendering service.
    pub asset_id: Option<String>,
    /// Last failure message, surfaced but non-blocking.
    pub error: Option<String>,
}

impl AvatarSetupState {
    /// The documented initial state.
    #[must_use]
    pub fn initial() -> Self {
        Self::default()
    }
}

/// Named transitions of the setup machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SetupAction {
    /// A photo was captured and avatar creation should begin.
    PhotoCaptured(Vec<u8>),
    /// The avatar service issued an asset id.
    AvatarCreated(String),
    /// Avatar creation failed with a message.
    AvatarCreationFailed(String),
    /// The remote agent asked the user to go through photo capture again.
    ShowPhotoCapture,
    /// The user skipped photo capture.
    PhotoSkipped,
    /// Clear everything, including durable state.
    Reset,
}

/// UI-side signals emitted by transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupSignal {
    /// Show the creation loading indicator.
    ShowLoading,
    /// Hide the creation loading indicator.
    HideLoading,
    /// Server-side cached state (asset id, mode flags) must be cleared too.
    ClearServerState,
}

/// The setup machine plus its durable asset-id cache.
pub struct AvatarSetup {
    state: AvatarSetupState,
    cache: AssetCache,
    fail_open: bool,
}

impl AvatarSetup {
    /// Create the machine, hydrating a cached asset id from a previous
    /// session when one exists.
    pub fn new(cache: AssetCache, fail_open: bool) -> Self {
        let mut state = AvatarSetupState::initial();
        if let Some(asset_id) = cache.load() {
            info!(asset_id, "resuming with cached avatar asset");
            state.asset_id = Some(asset_id);
            state.step = SetupStep::Ready;
        }
        Self {
            state,
            cache,
            fail_open,
        }
    }

    pub fn state(&self) -> &AvatarSetupState {
        &self.state
    }

    pub fn step(&self) -> SetupStep {
        self.state.step
    }

    pub fn asset_id(&self) -> Option<&str> {
        self.state.asset_id.as_deref()
    }

    /// Consume the stored photo bytes for upload.
    pub fn take_photo(&mut self) -> Option<Vec<u8>> {
        self.state.user_photo.take()
    }

    /// Apply a named transition.
    ///
    /// Invalid `(state, action)` pairs are rejected with an error and leave
    /// the state untouched — there are no arbitrary jumps.
    pub fn apply(&mut self, action: SetupAction) -> Result<Vec<SetupSignal>> {
        match action {
            SetupAction::PhotoCaptured(photo) => self.on_photo_captured(photo),
            SetupAction::AvatarCreated(asset_id) => self.on_avatar_created(asset_id),
            SetupAction::AvatarCreationFailed(message) => self.on_creation_failed(message),
            SetupAction::ShowPhotoCapture => self.on_show_photo_capture(),
            SetupAction::PhotoSkipped => self.on_photo_skipped(),
            SetupAction::Reset => self.on_reset(),
        }
    }

    fn on_photo_captured(&mut self, photo: Vec<u8>) -> Result<Vec<SetupSignal>> {
        match self.state.step {
            SetupStep::PhotoCapture | SetupStep::Ready | SetupStep::Skipped => {
                self.state.user_photo = Some(photo);
                self.state.step = SetupStep::CreatingAvatar;
                Ok(vec![SetupSignal::ShowLoading])
            }
            SetupStep::CreatingAvatar => Err(AvatarError::Setup(
                "photo captured while a creation is already in flight".to_owned(),
            )),
        }
    }

    fn on_avatar_created(&mut self, asset_id: String) -> Result<Vec<SetupSignal>> {
        if self.state.step != SetupStep::CreatingAvatar {
            return Err(AvatarError::Setup(format!(
                "avatar created in unexpected step {:?}",
                self.state.step
            )));
        }
        if let Err(e) = self.cache.store(&asset_id) {
            // Persistence failure is not worth failing the whole flow over;
            // the session just loses resume-on-reload.
            warn!("failed to persist avatar asset id: {e}");
        }
        info!(asset_id, "avatar ready");
        self.state.asset_id = Some(asset_id);
        self.state.user_photo = None;
        self.state.error = None;
        self.state.step = SetupStep::Ready;
        Ok(vec![SetupSignal::HideLoading])
    }

    fn on_creation_failed(&mut self, message: String) -> Result<Vec<SetupSignal>> {
        if self.state.step != SetupStep::CreatingAvatar {
            return Err(AvatarError::Setup(format!(
                "creation failure in unexpected step {:?}",
                self.state.step
            )));
        }
        warn!("avatar creation failed: {message}");
        self.state.error = Some(message);
        self.state.user_photo = None;
        self.state.step = if self.fail_open {
            SetupStep::Ready
        } else {
            SetupStep::PhotoCapture
        };
        Ok(vec![SetupSignal::HideLoading])
    }

    fn on_show_photo_capture(&mut self) -> Result<Vec<SetupSignal>> {
        if self.state.step != SetupStep::Ready {
            return Err(AvatarError::Setup(format!(
                "show photo capture in unexpected step {:?}",
                self.state.step
            )));
        }
        self.state.step = SetupStep::PhotoCapture;
        Ok(Vec::new())
    }

    fn on_photo_skipped(&mut self) -> Result<Vec<SetupSignal>> {
        if self.state.step != SetupStep::PhotoCapture {
            return Err(AvatarError::Setup(format!(
                "skip in unexpected step {:?}",
                self.state.step
            )));
        }
        self.state.step = SetupStep::Skipped;
        Ok(Vec::new())
    }

    fn on_reset(&mut self) -> Result<Vec<SetupSignal>> {
        if let Err(e) = self.cache.clear() {
            warn!("failed to clear asset cache on reset: {e}");
        }
        self.state = AvatarSetupState::initial();
        Ok(vec![SetupSignal::HideLoading, SetupSignal::ClearServerState])
    }
}
