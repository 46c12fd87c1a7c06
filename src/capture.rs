//! Photo capture engine.
//!
//! Drives the camera through its lifecycle (`Idle → Streaming → Captured →
//! (Enhancing) → Confirmed`), rasterizes the current frame into a JPEG still,
//! and tracks the display handle attached to the captured photo so nothing
//! leaks across retakes or teardown.
//!
//! Camera hardware is an external collaborator behind the [`CameraDevice`]
//! trait. The engine owns the hardware handle exclusively while streaming and
//! releases it on capture, skip, and teardown.

use crate::error::{AvatarError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Lifecycle of the capture flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureState {
    #[default]
    Idle,
    Streaming,
    Captured,
    Enhancing,
    Confirmed,
    Skipped,
}

/// Classified camera acquisition failures.
///
/// Each maps to a human-readable explanation the UI can show directly; none
/// of them are fatal to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFailure {
    /// The user denied the camera permission prompt.
    PermissionDenied,
    /// No camera hardware is present.
    NotFound,
    /// The platform cannot provide a camera stream.
    NotSupported,
    /// The camera exists but is held by another application.
    NotReadable,
    /// Camera access requires a secure context.
    InsecureContext,
}

impl CameraFailure {
    /// User-facing explanation for this failure class.
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Camera permission was denied. Allow camera access and try again."
            }
            Self::NotFound => "No camera was found on this device.",
            Self::NotSupported => "This device does not support camera capture.",
            Self::NotReadable => {
                "The camera is in use by another application. Close it and try again."
            }
            Self::InsecureContext => {
                "Camera access requires a secure (HTTPS) connection."
            }
        }
    }
}

/// Camera acquisition or frame-grab error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraError {
    pub kind: CameraFailure,
    pub detail: String,
}

impl CameraError {
    #[must_use]
    pub fn new(kind: CameraFailure, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for CameraError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.kind.user_message(), self.detail)
    }
}

impl std::error::Error for CameraError {}

/// One raw RGB frame from the camera at native resolution.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGB8 pixel data (`width * height * 3` bytes).
    pub pixels: Vec<u8>,
}

/// Seam to the camera hardware.
///
/// Implementations request video-only access with a front-facing hint.
pub trait CameraDevice: Send {
    /// Acquire the camera and start streaming.
    fn open(&mut self) -> std::result::Result<(), CameraError>;
    /// Grab the current frame. Valid only while open.
    fn grab_frame(&mut self) -> std::result::Result<Frame, CameraError>;
    /// Release the camera hardware. Idempotent.
    fn close(&mut self);
    /// Whether the camera is currently streaming.
    fn is_open(&self) -> bool;
}

/// Counts display-handle acquisition and release.
///
/// The captured still is shown through an object-reference handle whose
/// lifetime the engine must manage explicitly; an imbalance between
/// `acquired` and `released` after teardown is a leak.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    acquired: AtomicU64,
    released: AtomicU64,
}

impl HandleRegistry {
    fn acquire(self: &Arc<Self>) -> DisplayHandle {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        DisplayHandle {
            registry: Arc::clone(self),
        }
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Handles currently live (acquired minus released).
    pub fn live(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}

/// A live display handle for a captured still.
///
/// Must be released exactly once when the still is superseded or torn down;
/// there is deliberately no `Drop` fallback, so a forgotten release shows up
/// in the registry counters.
#[derive(Debug)]
pub struct DisplayHandle {
    registry: Arc<HandleRegistry>,
}

impl DisplayHandle {
    pub fn release(self) {
        self.registry.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// A captured still image and its display handle.
#[derive(Debug)]
struct CapturedPhoto {
    bytes: Vec<u8>,
    handle: DisplayHandle,
}

/// Callback invoked with the finalized JPEG bytes when a photo is captured.
///
/// In the default non-interactive mode this immediately drives avatar
/// creation with no further user confirmation.
pub type PhotoCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// The capture engine.
pub struct CaptureEngine {
    state: CaptureState,
    camera: Box<dyn CameraDevice>,
    handles: Arc<HandleRegistry>,
    photo: Option<CapturedPhoto>,
    /// Last human-readable, non-fatal error.
    error: Option<String>,
    jpeg_quality: u8,
    on_photo: Option<PhotoCallback>,
}

impl CaptureEngine {
    pub fn new(camera: Box<dyn CameraDevice>, jpeg_quality: u8) -> Self {
        Self {
            state: CaptureState::Idle,
            camera,
            handles: Arc::new(HandleRegistry::default()),
            photo: None,
            error: None,
            jpeg_quality,
            on_photo: None,
        }
    }

    /// Install the capture completion callback.
    #[must_use]
    pub fn with_photo_callback(mut self, callback: PhotoCallback) -> Self {
        self.on_photo = Some(callback);
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Last non-fatal error message, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Display-handle registry, for leak accounting.
    #[must_use]
    pub fn handles(&self) -> Arc<HandleRegistry> {
        Arc::clone(&self.handles)
    }

    /// Bytes of the current still, if one exists.
    pub fn photo_bytes(&self) -> Option<&[u8]> {
        self.photo.as_ref().map(|p| p.bytes.as_slice())
    }

    /// Whether the camera is actively streaming.
    pub fn is_camera_active(&self) -> bool {
        self.state == CaptureState::Streaming
    }

    /// Request camera access and begin streaming.
    ///
    /// Never fails the session: on denial or missing hardware the failure is
    /// classified into a human-readable message, the state stays `Idle`, and
    /// the user may retry.
    pub fn start_camera(&mut self) -> Result<()> {
        if self.state == CaptureState::Streaming {
            return Ok(());
        }
        match self.camera.open() {
            Ok(()) => {
                self.state = CaptureState::Streaming;
                self.error = None;
                info!("camera streaming");
            }
            Err(e) => {
                warn!(kind = ?e.kind, "camera acquisition failed: {}", e.detail);
                self.error = Some(e.to_string());
            }
        }
        Ok(())
    }

    /// Rasterize the current video frame into a JPEG still.
    ///
    /// Valid only while `Streaming`; any other state is a no-op (no crash,
    /// no state change, no emission), which also guards against a second
    /// rapid call racing the first. On success the camera hardware is
    /// released, the engine transitions to `Captured`, and the completion
    /// callback fires with the image bytes.
    ///
    /// Returns whether a photo was captured.
    pub fn capture_photo(&mut self) -> Result<bool> {
        if self.state != CaptureState::Streaming {
            debug!(state = ?self.state, "capture_photo ignored outside streaming");
            return Ok(false);
        }

        let frame = match self.camera.grab_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = ?e.kind, "frame grab failed: {}", e.detail);
                self.error = Some(e.to_string());
                return Ok(false);
            }
        };

        let bytes = encode_jpeg(&frame, self.jpeg_quality)?;

        // Transition before the callback runs so a re-entrant capture
        // observes non-streaming state and no-ops.
        self.camera.close();
        self.state = CaptureState::Captured;
        let handle = self.handles.acquire();
        self.photo = Some(CapturedPhoto {
            bytes,
            handle,
        });
        info!(
            width = frame.width,
            height = frame.height,
            "photo captured, camera released"
        );

        if let (Some(callback), Some(photo)) = (self.on_photo.as_ref(), self.photo.as_ref()) {
            callback(&photo.bytes);
        }
        Ok(true)
    }

    /// Discard the current still and return to streaming.
    ///
    /// Releases the superseded still's display handle before re-acquiring
    /// the camera.
    pub fn retake_photo(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            CaptureState::Captured | CaptureState::Enhancing | CaptureState::Confirmed
        ) {
            return Err(AvatarError::Capture(format!(
                "retake is invalid in state {:?}",
                self.state
            )));
        }
        if let Some(photo) = self.photo.take() {
            photo.handle.release();
        }
        self.state = CaptureState::Idle;
        self.start_camera()
    }

    /// Begin the optional enhancement pass, returning a copy of the still's
    /// bytes to upload. Valid only from `Captured`.
    pub fn begin_enhance(&mut self) -> Result<Vec<u8>> {
        if self.state != CaptureState::Captured {
            return Err(AvatarError::Capture(format!(
                "enhance is invalid in state {:?}",
                self.state
            )));
        }
        let bytes = self
            .photo
            .as_ref()
            .map(|p| p.bytes.clone())
            .ok_or_else(|| AvatarError::Capture("no captured photo".to_owned()))?;
        self.state = CaptureState::Enhancing;
        Ok(bytes)
    }

    /// Complete the enhancement pass.
    ///
    /// Enhancement failure is non-fatal: the engine confirms with the
    /// original, unenhanced still and records the error.
    pub fn complete_enhance(&mut self, outcome: std::result::Result<Vec<u8>, String>) {
        if self.state != CaptureState::Enhancing {
            debug!(state = ?self.state, "complete_enhance ignored");
            return;
        }
        match outcome {
            Ok(bytes) => {
                if let Some(photo) = self.photo.as_mut() {
                    photo.bytes = bytes;
                }
            }
            Err(message) => {
                warn!("enhancement failed, keeping original still: {message}");
                self.error = Some(format!("Enhancement failed: {message}"));
            }
        }
        self.state = CaptureState::Confirmed;
    }

    /// Confirm the captured still without enhancement.
    pub fn confirm(&mut self) -> Result<()> {
        if self.state != CaptureState::Captured {
            return Err(AvatarError::Capture(format!(
                "confirm is invalid in state {:?}",
                self.state
            )));
        }
        self.state = CaptureState::Confirmed;
        Ok(())
    }

    /// External skip signal: stop the camera and end the capture flow.
    pub fn skip(&mut self) {
        if self.camera.is_open() {
            self.camera.close();
        }
        if let Some(photo) = self.photo.take() {
            photo.handle.release();
        }
        self.state = CaptureState::Skipped;
        info!("photo capture skipped");
    }

    /// Tear the engine down: stop any active camera stream and release any
    /// live display handle. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if self.camera.is_open() {
            self.camera.close();
        }
        if let Some(photo) = self.photo.take() {
            photo.handle.release();
        }
        self.state = CaptureState::Idle;
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Encode a raw RGB frame to JPEG at the frame's native resolution.
fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.pixels.len() != expected {
        return Err(AvatarError::Capture(format!(
            "frame buffer size mismatch: got {} bytes, expected {expected}",
            frame.pixels.len()
        )));
    }
    let mut out = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(std::io::Cursor::new(&mut out), quality);
    image::ImageEncoder::write_image(
        encoder,
        &frame.pixels,
        frame.width,
        frame.height,
        image::ExtendedColorType::Rgb8,
    )
    .map_err(|e| AvatarError::Capture(format!("jpeg encode failed: {e}")))?;
    Ok(out)
}

/// A deterministic camera that yields a flat test-pattern frame.
///
/// Useful for headless demos and tests; real deployments wire in a hardware
/// implementation of [`CameraDevice`].
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    open: bool,
}

impl SyntheticCamera {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            open: false,
        }
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new(64, 48)
    }
}

impl CameraDevice for SyntheticCamera {
    fn open(&mut self) -> std::result::Result<(), CameraError> {
        self.open = true;
        Ok(())
    }

    fn grab_frame(&mut self) -> std::result::Result<Frame, CameraError> {
        if !self.open {
            return Err(CameraError::new(
                CameraFailure::NotReadable,
                "camera not open",
            ));
        }
        Ok(Frame {
            width: self.width,
            height: self.height,
            pixels: vec![0x80; self.width as usize * self.height as usize * 3],
        })
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::Mutex;

    /// Camera double that fails acquisition with a chosen failure class.
    struct DeniedCamera {
        kind: CameraFailure,
    }

    impl CameraDevice for DeniedCamera {
        fn open(&mut self) -> std::result::Result<(), CameraError> {
            Err(CameraError::new(self.kind, "test denial"))
        }
        fn grab_frame(&mut self) -> std::result::Result<Frame, CameraError> {
            Err(CameraError::new(self.kind, "test denial"))
        }
        fn close(&mut self) {}
        fn is_open(&self) -> bool {
            false
        }
    }

    fn engine() -> CaptureEngine {
        CaptureEngine::new(Box::new(SyntheticCamera::default()), 90)
    }

    #[test]
    fn permission_denied_sets_message_and_stays_idle() {
        let mut engine = CaptureEngine::new(
            Box::new(DeniedCamera {
                kind: CameraFailure::PermissionDenied,
            }),
            90,
        );

        // Resolves without throwing.
        engine.start_camera().unwrap();

        assert_eq!(engine.state(), CaptureState::Idle);
        let message = engine.error().unwrap();
        assert!(message.contains("permission"));
    }

    #[test]
    fn each_failure_class_has_distinct_message() {
        let kinds = [
            CameraFailure::PermissionDenied,
            CameraFailure::NotFound,
            CameraFailure::NotSupported,
            CameraFailure::NotReadable,
            CameraFailure::InsecureContext,
        ];
        let mut messages: Vec<&str> = kinds.iter().map(|k| k.user_message()).collect();
        messages.dedup();
        assert_eq!(messages.len(), kinds.len());
    }

    #[test]
    fn capture_outside_streaming_is_noop() {
        let mut engine = engine();

        assert!(!engine.capture_photo().unwrap());
        assert_eq!(engine.state(), CaptureState::Idle);
        assert!(engine.photo_bytes().is_none());
    }

    #[test]
    fn capture_releases_camera_and_transitions() {
        let mut engine = engine();
        engine.start_camera().unwrap();

        assert!(engine.capture_photo().unwrap());

        assert_eq!(engine.state(), CaptureState::Captured);
        assert!(!engine.is_camera_active());
        let bytes = engine.photo_bytes().unwrap();
        // JPEG SOI marker.
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn second_rapid_capture_emits_once() {
        let emitted = Arc::new(Mutex::new(0usize));
        let emitted_cb = Arc::clone(&emitted);
        let mut engine = CaptureEngine::new(Box::new(SyntheticCamera::default()), 90)
            .with_photo_callback(Box::new(move |_| {
                *emitted_cb.lock().unwrap() += 1;
            }));
        engine.start_camera().unwrap();

        assert!(engine.capture_photo().unwrap());
        assert!(!engine.capture_photo().unwrap());

        assert_eq!(*emitted.lock().unwrap(), 1);
        assert_eq!(engine.state(), CaptureState::Captured);
    }

    #[test]
    fn retake_releases_previous_display_handle() {
        let mut engine = engine();
        let handles = engine.handles();
        engine.start_camera().unwrap();
        engine.capture_photo().unwrap();
        assert_eq!(handles.live(), 1);

        engine.retake_photo().unwrap();

        assert_eq!(handles.acquired(), 1);
        assert_eq!(handles.released(), 1);
        assert_eq!(handles.live(), 0);
        assert_eq!(engine.state(), CaptureState::Streaming);
    }

    #[test]
    fn retake_from_idle_is_rejected() {
        let mut engine = engine();
        assert!(engine.retake_photo().is_err());
    }

    #[test]
    fn enhance_failure_confirms_with_original() {
        let mut engine = engine();
        engine.start_camera().unwrap();
        engine.capture_photo().unwrap();
        let original = engine.photo_bytes().unwrap().to_vec();

        let upload = engine.begin_enhance().unwrap();
        assert_eq!(upload, original);
        engine.complete_enhance(Err("HTTP 500".to_owned()));

        assert_eq!(engine.state(), CaptureState::Confirmed);
        assert_eq!(engine.photo_bytes().unwrap(), original.as_slice());
        assert!(engine.error().unwrap().contains("Enhancement failed"));
    }

    #[test]
    fn enhance_success_swaps_bytes() {
        let mut engine = engine();
        engine.start_camera().unwrap();
        engine.capture_photo().unwrap();

        engine.begin_enhance().unwrap();
        engine.complete_enhance(Ok(vec![1, 2, 3]));

        assert_eq!(engine.state(), CaptureState::Confirmed);
        assert_eq!(engine.photo_bytes().unwrap(), &[1, 2, 3]);
        assert!(engine.error().is_none());
    }

    #[test]
    fn skip_releases_camera_and_handle() {
        let mut engine = engine();
        let handles = engine.handles();
        engine.start_camera().unwrap();
        engine.capture_photo().unwrap();

        engine.skip();

        assert_eq!(engine.state(), CaptureState::Skipped);
        assert_eq!(handles.live(), 0);
    }

    #[test]
    fn shutdown_balances_handles() {
        let handles;
        {
            let mut engine = engine();
            handles = engine.handles();
            engine.start_camera().unwrap();
            engine.capture_photo().unwrap();
            assert_eq!(handles.live(), 1);
            // Dropped here without an explicit shutdown call.
        }
        assert_eq!(handles.live(), 0);
    }

    #[test]
    fn start_camera_while_streaming_is_noop() {
        let mut engine = engine();
        engine.start_camera().unwrap();
        engine.start_camera().unwrap();
        assert_eq!(engine.state(), CaptureState::Streaming);
    }
}
