//! The avatar session orchestrator.
//!
//! Wires the room connection, photo capture engine, setup state machine,
//! service clients, and visual controls into one session: registers the
//! remote procedures the agent can call, routes inbound control messages,
//! and drives the photo → avatar-creation → notify pipeline.
//!
//! Everything here follows the session-wide error policy: remote-service
//! failures are logged and surfaced, never escalated into a crash. With the
//! default fail-open policy the conversation continues without a custom
//! avatar when creation fails.

use crate::asset_cache::AssetCache;
use crate::capture::{CameraDevice, CaptureEngine};
use crate::config::SessionConfig;
use crate::controls::{
    FilterCooldown, PersonalityCarousel, TransitionSequencer, filter_selected_message,
};
use crate::error::{AvatarError, Result};
use crate::protocol::{
    ControlMessage, FrontendAction, ProcedureName, SessionMode, now_millis,
};
use crate::room::{ProcedureHandler, RoomManager, RoomTransport};
use crate::services::avatar_api::AvatarApiClient;
use crate::services::image_api::{ImageApiClient, ImageApiError};
use crate::setup::{AvatarSetup, AvatarSetupState, SetupAction, SetupSignal};
use crate::state_store::StateStore;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One browser tab's avatar companion session.
pub struct AvatarSession {
    config: SessionConfig,
    room: Arc<RoomManager>,
    setup: Mutex<AvatarSetup>,
    capture: Mutex<CaptureEngine>,
    avatar_client: AvatarApiClient,
    image_client: ImageApiClient,
    store: Arc<dyn StateStore>,
    carousel: Mutex<PersonalityCarousel>,
    cooldown: Mutex<FilterCooldown>,
    sequencer: Mutex<TransitionSequencer>,
    /// Original captured photo, kept as a fallback source for the filter
    /// pipeline when the remote asset fetch fails.
    original_photo: Mutex<Option<Vec<u8>>>,
    photo_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    cancel: CancellationToken,
}

impl AvatarSession {
    /// Build a session. All collaborators are injected; the returned session
    /// already has its remote procedures registered.
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn RoomTransport>,
        camera: Box<dyn CameraDevice>,
        store: Arc<dyn StateStore>,
        asset_cache: AssetCache,
        avatar_client: AvatarApiClient,
        image_client: ImageApiClient,
    ) -> Arc<Self> {
        let room = Arc::new(RoomManager::new(transport, config.room.mic_on_connect));
        let (photo_tx, photo_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let capture = CaptureEngine::new(camera, config.capture.jpeg_quality)
            .with_photo_callback(Box::new(move |bytes| {
                let _ = photo_tx.send(bytes.to_vec());
            }));
        let setup = AvatarSetup::new(asset_cache, config.policy.fail_open_avatar_creation);
        let carousel = PersonalityCarousel::new(config.controls.personalities.clone());
        let cooldown =
            FilterCooldown::new(Duration::from_secs(config.controls.filter_cooldown_secs));

        let session = Arc::new(Self {
            config,
            room,
            setup: Mutex::new(setup),
            capture: Mutex::new(capture),
            avatar_client,
            image_client,
            store,
            carousel: Mutex::new(carousel),
            cooldown: Mutex::new(cooldown),
            sequencer: Mutex::new(TransitionSequencer::default()),
            original_photo: Mutex::new(None),
            photo_rx: Mutex::new(Some(photo_rx)),
            cancel: CancellationToken::new(),
        });
        session.register_procedures();
        session
    }

    /// The room manager, for callers that need transport-level access.
    #[must_use]
    pub fn room(&self) -> Arc<RoomManager> {
        Arc::clone(&self.room)
    }

    /// Connect to the room. On failure the caller is expected to continue in
    /// degraded, no-avatar mode — the error is informational, not fatal.
    pub async fn connect(&self, server_url: &str, token: &str) -> Result<()> {
        self.room.connect(server_url, token).await
    }

    /// Stop the session's event loop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn lock_setup(&self) -> Result<MutexGuard<'_, AvatarSetup>> {
        self.setup
            .lock()
            .map_err(|e| AvatarError::Setup(format!("setup lock poisoned: {e}")))
    }

    fn lock_capture(&self) -> Result<MutexGuard<'_, CaptureEngine>> {
        self.capture
            .lock()
            .map_err(|e| AvatarError::Capture(format!("capture lock poisoned: {e}")))
    }

    // ------------------------------------------------------------------
    // Remote procedures
    // ------------------------------------------------------------------

    fn register_procedures(self: &Arc<Self>) {
        let start_camera: ProcedureHandler = {
            let session = Arc::clone(self);
            Arc::new(move |_payload| {
                let mut capture = session.lock_capture()?;
                capture.start_camera()?;
                let reply = match capture.error() {
                    Some(message) => serde_json::json!({ "success": false, "error": message }),
                    None => serde_json::json!({ "success": true }),
                };
                Ok(reply.to_string())
            })
        };
        self.register(ProcedureName::StartCamera, Arc::clone(&start_camera));
        // `openCamera` is the agent-tool spelling of the same request.
        self.register(ProcedureName::OpenCamera, start_camera);
        self.register(ProcedureName::CapturePhoto, {
            let session = Arc::clone(self);
            Arc::new(move |_payload| {
                let captured = session.lock_capture()?.capture_photo()?;
                Ok(serde_json::json!({ "success": captured }).to_string())
            })
        });
        self.register(ProcedureName::SkipPhoto, {
            let session = Arc::clone(self);
            Arc::new(move |_payload| {
                session.skip_photo()?;
                Ok(serde_json::json!({ "success": true }).to_string())
            })
        });
        self.register(ProcedureName::IsCameraActive, {
            let session = Arc::clone(self);
            Arc::new(move |_payload| {
                let active = session.lock_capture()?.is_camera_active();
                Ok(serde_json::json!({ "active": active }).to_string())
            })
        });
        self.register(ProcedureName::GenerateAvatar, {
            let session = Arc::clone(self);
            Arc::new(move |payload| {
                let prompt = parse_prompt(payload).ok_or_else(|| {
                    AvatarError::Setup("generateAvatar requires a prompt".to_owned())
                })?;
                let task = Arc::clone(&session);
                tokio::spawn(async move { task.generate_avatar(&prompt).await });
                Ok(serde_json::json!({ "success": true, "status": "generating" }).to_string())
            })
        });
        self.register(ProcedureName::ModifyAvatar, {
            let session = Arc::clone(self);
            Arc::new(move |payload| {
                let prompt = parse_prompt(payload).ok_or_else(|| {
                    AvatarError::Setup("modifyAvatar requires a prompt".to_owned())
                })?;
                let task = Arc::clone(&session);
                tokio::spawn(async move { task.modify_avatar(&prompt, None).await });
                Ok(serde_json::json!({ "success": true, "status": "modifying" }).to_string())
            })
        });
        self.register(ProcedureName::EndCall, {
            let session = Arc::clone(self);
            Arc::new(move |_payload| {
                let task = Arc::clone(&session);
                tokio::spawn(async move { task.end_call().await });
                Ok(serde_json::json!({ "success": true }).to_string())
            })
        });
    }

    fn register(self: &Arc<Self>, name: ProcedureName, handler: ProcedureHandler) {
        self.room.register_procedure(name, handler);
    }

    fn skip_photo(&self) -> Result<()> {
        self.lock_capture()?.skip();
        let mut setup = self.lock_setup()?;
        if let Err(e) = setup.apply(SetupAction::PhotoSkipped) {
            // Skipping outside the capture phase is harmless.
            debug!("skip ignored by setup machine: {e}");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Photo → avatar pipeline
    // ------------------------------------------------------------------

    /// Drive the session until cancelled: consume captured photos and
    /// inbound control messages.
    pub async fn run(self: Arc<Self>) {
        let mut photo_rx = match self.photo_rx.lock() {
            Ok(mut guard) => match guard.take() {
                Some(rx) => rx,
                None => {
                    warn!("session run() called twice; ignoring");
                    return;
                }
            },
            Err(_) => return,
        };
        let mut control_rx = self.room.subscribe();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                photo = photo_rx.recv() => match photo {
                    Some(bytes) => self.handle_photo_captured(bytes).await,
                    None => break,
                },
                msg = control_rx.recv() => match msg {
                    Ok(msg) => self.handle_control_message(msg).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("control stream lagged, skipped {n} messages");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("session loop stopped");
    }

    /// A photo came out of the capture engine: run the optional enhancement
    /// pass, then start avatar creation.
    async fn handle_photo_captured(&self, bytes: Vec<u8>) {
        if let Ok(mut original) = self.original_photo.lock() {
            *original = Some(bytes.clone());
        }

        let final_photo = if self.config.capture.enhance_enabled {
            self.enhance_captured_photo(bytes).await
        } else {
            if let Ok(mut capture) = self.capture.lock()
                && let Err(e) = capture.confirm()
            {
                debug!("confirm skipped: {e}");
            }
            bytes
        };

        self.start_creation(final_photo).await;
    }

    /// Run the enhancement pass over the captured still.
    ///
    /// Failure is non-fatal: the original bytes are confirmed and used.
    async fn enhance_captured_photo(&self, original: Vec<u8>) -> Vec<u8> {
        let upload = match self.lock_capture().and_then(|mut c| c.begin_enhance()) {
            Ok(upload) => upload,
            Err(e) => {
                warn!("cannot begin enhancement: {e}");
                return original;
            }
        };

        let outcome = self
            .image_client
            .enhance(&upload, &self.config.image.enhance_prompt)
            .await
            .map_err(|e| e.to_string());

        match self.lock_capture() {
            Ok(mut capture) => {
                capture.complete_enhance(outcome);
                capture.photo_bytes().map(<[u8]>::to_vec).unwrap_or(original)
            }
            Err(e) => {
                warn!("capture lock lost during enhancement: {e}");
                original
            }
        }
    }

    /// Feed a finalized photo into the setup machine and create the asset.
    async fn start_creation(&self, photo: Vec<u8>) {
        {
            let mut setup = match self.lock_setup() {
                Ok(setup) => setup,
                Err(e) => {
                    warn!("{e}");
                    return;
                }
            };
            match setup.apply(SetupAction::PhotoCaptured(photo)) {
                Ok(signals) => self.apply_signals(&signals),
                Err(e) => {
                    warn!("photo rejected by setup machine: {e}");
                    return;
                }
            }
        }
        if let Ok(mut sequencer) = self.sequencer.lock() {
            sequencer.begin_generating();
        }
        self.create_avatar().await;
    }

    /// Two-step avatar creation: (a) upload the photo for an asset id, then
    /// (b) notify the agent over the data channel. Step (b) failing never
    /// rolls back step (a) — the asset id is durable the moment it exists.
    async fn create_avatar(&self) {
        let photo = match self.lock_setup() {
            Ok(mut setup) => setup.take_photo(),
            Err(e) => {
                warn!("{e}");
                return;
            }
        };
        let Some(photo) = photo else {
            warn!("no photo to create an avatar from");
            return;
        };

        match self.avatar_client.create_avatar(photo).await {
            Ok(asset_id) => {
                match self.lock_setup() {
                    Ok(mut setup) => match setup.apply(SetupAction::AvatarCreated(asset_id.clone()))
                    {
                        Ok(signals) => self.apply_signals(&signals),
                        Err(e) => warn!("created asset not accepted by setup machine: {e}"),
                    },
                    Err(e) => warn!("{e}"),
                }
                if let Err(e) = self.store.update(&mut |record| {
                    record.asset_id = Some(asset_id.clone());
                }) {
                    warn!("failed to record asset id in state bag: {e}");
                }

                // Step (b): fire-and-forget notifications.
                self.room
                    .publish(&ControlMessage::AvatarData {
                        asset_id: asset_id.clone(),
                    })
                    .await;
                self.room
                    .publish(&ControlMessage::ModeSwitch {
                        mode: SessionMode::Avatar,
                        avatar_id: Some(asset_id),
                    })
                    .await;

                if let Ok(mut sequencer) = self.sequencer.lock() {
                    sequencer.on_asset_ready();
                }
            }
            Err(e) => {
                match self.lock_setup() {
                    Ok(mut setup) => {
                        match setup.apply(SetupAction::AvatarCreationFailed(e.to_string())) {
                            Ok(signals) => self.apply_signals(&signals),
                            Err(apply_err) => warn!("failure not accepted: {apply_err}"),
                        }
                    }
                    Err(lock_err) => warn!("{lock_err}"),
                }
                if let Ok(mut sequencer) = self.sequencer.lock() {
                    sequencer.reset();
                }
            }
        }
    }

    fn apply_signals(&self, signals: &[SetupSignal]) {
        for signal in signals {
            match signal {
                SetupSignal::ShowLoading | SetupSignal::HideLoading => {
                    debug!(?signal, "setup signal");
                }
                SetupSignal::ClearServerState => {
                    if let Err(e) = self.store.clear() {
                        warn!("failed to clear server state: {e}");
                    }
                }
            }
        }
    }

    /// Generate an avatar from a text prompt (no camera involved).
    pub async fn generate_avatar(&self, prompt: &str) {
        match self.image_client.generate(prompt).await {
            Ok(photo) => self.start_creation(photo).await,
            Err(e) => {
                warn!("avatar generation failed: {e}");
                self.publish_filter_error("generation_failed", &e).await;
            }
        }
    }

    /// Re-style the current avatar with a prompt, then re-create the asset.
    ///
    /// The source image is re-fetched from the avatar service by id, with
    /// the session's original photo as fallback — the remote fetch depends
    /// on the service still holding the asset.
    pub async fn modify_avatar(&self, prompt: &str, filter_id: Option<&str>) {
        let Some(source) = self.current_avatar_image().await else {
            warn!("no source image available for modification");
            self.publish_filter_error(
                "no_source_image",
                &ImageApiError::Failed("no avatar or photo to modify".to_owned()),
            )
            .await;
            return;
        };

        match self.image_client.enhance(&source, prompt).await {
            Ok(photo) => self.start_creation(photo).await,
            Err(e) => {
                warn!("avatar modification failed: {e}");
                self.publish_filter_error("modification_failed", &e).await;
            }
        }
    }

    async fn publish_filter_error(&self, error_type: &str, error: &ImageApiError) {
        self.room
            .publish(&ControlMessage::FilterError {
                error_type: error_type.to_owned(),
                error_details: error.to_string(),
                safety_rejection: error.is_safety_rejection(),
                timestamp: now_millis(),
            })
            .await;
    }

    /// Resolve the image to feed the filter pipeline: the current remote
    /// asset first, the in-memory original photo as fallback.
    async fn current_avatar_image(&self) -> Option<Vec<u8>> {
        let asset_id = self
            .store
            .get()
            .ok()
            .and_then(|record| record.asset_id)
            .or_else(|| self.lock_setup().ok().and_then(|s| s.asset_id().map(str::to_owned)));

        if let Some(asset_id) = asset_id {
            match self.avatar_client.download_asset_image(&asset_id).await {
                Ok(bytes) => return Some(bytes),
                Err(e) => warn!(asset_id, "asset re-fetch failed, trying original photo: {e}"),
            }
        }
        self.original_photo.lock().ok().and_then(|g| g.clone())
    }

    // ------------------------------------------------------------------
    // Visual controls
    // ------------------------------------------------------------------

    /// Apply a configured filter to the current avatar.
    ///
    /// Returns `false` when the cooldown gate rejected the request.
    pub async fn apply_filter(&self, filter_id: &str) -> Result<bool> {
        let Some(filter) = self
            .config
            .controls
            .filters
            .iter()
            .find(|f| f.id == filter_id)
            .cloned()
        else {
            let error = ImageApiError::Failed(format!("unknown filter `{filter_id}`"));
            self.publish_filter_error("unknown_filter", &error).await;
            return Err(AvatarError::Setup(format!("unknown filter `{filter_id}`")));
        };

        let accepted = self
            .cooldown
            .lock()
            .map(|mut gate| gate.try_begin())
            .unwrap_or(false);
        if !accepted {
            debug!(filter_id, "filter request gated by cooldown");
            return Ok(false);
        }

        self.room.publish(&filter_selected_message(filter_id)).await;
        self.modify_avatar(&filter.prompt, Some(filter_id)).await;
        Ok(true)
    }

    /// Move the personality carousel forward.
    pub fn next_personality(&self) {
        if let Ok(mut carousel) = self.carousel.lock() {
            carousel.next();
        }
    }

    /// Move the personality carousel back.
    pub fn prev_personality(&self) {
        if let Ok(mut carousel) = self.carousel.lock() {
            carousel.prev();
        }
    }

    /// Confirm the selected personality and notify the agent.
    pub async fn confirm_personality(&self) -> Result<()> {
        let msg = self
            .carousel
            .lock()
            .map_err(|e| AvatarError::Setup(format!("carousel lock poisoned: {e}")))?
            .confirm()?;
        self.room.publish(&msg).await;
        Ok(())
    }

    /// Snapshot of the setup state, for the UI to render.
    pub fn setup_state(&self) -> AvatarSetupState {
        self.lock_setup()
            .map(|setup| setup.state().clone())
            .unwrap_or_default()
    }

    /// Current transition phase, for the UI to render.
    pub fn transition_phase(&self) -> crate::controls::TransitionPhase {
        self.sequencer
            .lock()
            .map(|s| s.phase())
            .unwrap_or_default()
    }

    /// The reveal video finished playing.
    pub fn reveal_complete(&self) {
        if let Ok(mut sequencer) = self.sequencer.lock() {
            sequencer.on_reveal_complete();
        }
    }

    // ------------------------------------------------------------------
    // Inbound control messages
    // ------------------------------------------------------------------

    async fn handle_control_message(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::FrontendControl { action, prompt } => {
                self.handle_frontend_action(action, prompt).await;
            }
            ControlMessage::ModeSwitch { mode, avatar_id } => {
                self.switch_mode(mode, avatar_id).await;
            }
            ControlMessage::VoiceCloningPreference { enabled } => {
                if let Err(e) = self.store.update(&mut |record| {
                    record.voice_cloning_enabled = enabled;
                }) {
                    warn!("failed to store voice cloning preference: {e}");
                }
            }
            ControlMessage::AvatarData { asset_id } => {
                // Tolerates arriving before or after mode_switch; readiness
                // keys off the stored asset id, not message order.
                if let Err(e) = self.store.update(&mut |record| {
                    record.asset_id = Some(asset_id.clone());
                }) {
                    warn!("failed to store avatar asset id: {e}");
                }
                if let Ok(mut sequencer) = self.sequencer.lock() {
                    sequencer.on_asset_ready();
                }
            }
            ControlMessage::AgentMessage { message, .. } => {
                debug!(message, "agent message");
            }
            ControlMessage::UserStateChange { action, .. } => {
                debug!(action, "user state change");
            }
            ControlMessage::FilterError { error_details, .. } => {
                warn!("remote filter error: {error_details}");
            }
            ControlMessage::PersonalitySelection { .. } | ControlMessage::FilterSelection { .. } => {
                // Client-originated topics; nothing to do when echoed back.
                debug!("ignoring client-originated topic");
            }
        }
    }

    async fn handle_frontend_action(&self, action: FrontendAction, prompt: Option<String>) {
        match action {
            FrontendAction::ShowPhotoCapture => {
                match self.lock_setup().map(|mut s| s.apply(SetupAction::ShowPhotoCapture)) {
                    Ok(Ok(_)) => info!("photo capture reopened by agent"),
                    Ok(Err(e)) => warn!("show_photo_capture ignored: {e}"),
                    Err(e) => warn!("{e}"),
                }
            }
            FrontendAction::StartCamera => {
                if let Ok(mut capture) = self.capture.lock()
                    && let Err(e) = capture.start_camera()
                {
                    warn!("start_camera failed: {e}");
                }
            }
            FrontendAction::CapturePhoto => {
                if let Ok(mut capture) = self.capture.lock()
                    && let Err(e) = capture.capture_photo()
                {
                    warn!("capture_photo failed: {e}");
                }
            }
            FrontendAction::SkipPhoto => {
                if let Err(e) = self.skip_photo() {
                    warn!("skip_photo failed: {e}");
                }
            }
            FrontendAction::GenerateAvatar => {
                let prompt = prompt.unwrap_or_default();
                if prompt.trim().is_empty() {
                    warn!("generate_avatar action without a prompt, ignored");
                } else {
                    self.generate_avatar(&prompt).await;
                }
            }
        }
    }

    /// Switch conversation modes, resolving the avatar id when entering
    /// avatar mode: state bag first, then the id carried by the message,
    /// then the configured default.
    async fn switch_mode(&self, mode: SessionMode, avatar_id: Option<String>) {
        let resolved = if mode == SessionMode::Avatar {
            self.store
                .get()
                .ok()
                .and_then(|record| record.asset_id)
                .or(avatar_id)
                .or_else(|| self.lock_setup().ok().and_then(|s| s.asset_id().map(str::to_owned)))
                .or_else(|| Some(self.config.avatar.default_asset_id.clone()))
        } else {
            None
        };

        if let Err(e) = self.store.update(&mut |record| {
            record.mode = mode;
            if let Some(id) = &resolved {
                record.asset_id = Some(id.clone());
            }
        }) {
            warn!("failed to store mode switch: {e}");
        }
        info!(mode = mode.as_str(), avatar_id = ?resolved, "mode switched");
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// End the call: notify the agent, disconnect, and reset all session
    /// state including durable storage.
    pub async fn end_call(&self) {
        self.room
            .publish(&ControlMessage::UserStateChange {
                action: "call_ended".to_owned(),
                timestamp: now_millis(),
            })
            .await;
        if let Err(e) = self.room.disconnect().await {
            warn!("disconnect failed: {e}");
        }
        self.reset();
        self.cancel.cancel();
    }

    /// Reset the session to its initial state, clearing durable local
    /// storage and the server-side state bag.
    pub fn reset(&self) {
        match self.lock_setup() {
            Ok(mut setup) => match setup.apply(SetupAction::Reset) {
                Ok(signals) => self.apply_signals(&signals),
                Err(e) => warn!("reset failed: {e}"),
            },
            Err(e) => warn!("{e}"),
        }
        if let Ok(mut capture) = self.capture.lock() {
            capture.shutdown();
        }
        if let Ok(mut sequencer) = self.sequencer.lock() {
            sequencer.reset();
        }
        if let Ok(mut original) = self.original_photo.lock() {
            *original = None;
        }
    }
}

/// Extract a prompt from a procedure payload: either `{"prompt": "..."}` or
/// the raw payload text.
fn parse_prompt(payload: &str) -> Option<String> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed)
        && let Some(prompt) = value.get("prompt").and_then(serde_json::Value::as_str)
    {
        let prompt = prompt.trim();
        return (!prompt.is_empty()).then(|| prompt.to_owned());
    }
    Some(trimmed.to_owned())
}
