//! Room connection manager.
//!
//! Owns the single real-time room session for the client and exposes the two
//! communication primitives the control protocol is built on: a registry of
//! remote-callable procedures and a typed publish/subscribe data channel.
//!
//! The transport itself (media, signalling, delivery) is an external
//! collaborator behind the [`RoomTransport`] trait; this module only manages
//! lifecycle, routing, and validation.

use crate::error::{AvatarError, Result};
use crate::protocol::{ControlMessage, ProcedureName};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Connection lifecycle of the room session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Seam to the external real-time transport SDK.
#[async_trait]
pub trait RoomTransport: Send + Sync + 'static {
    /// Establish the session. Fails on bad credentials or an unreachable
    /// server.
    async fn connect(&self, server_url: &str, token: &str) -> Result<()>;
    /// Publish a raw data payload under a topic string.
    async fn send_data(&self, topic: &str, payload: &[u8]) -> Result<()>;
    /// Enable or disable the local microphone track.
    async fn set_microphone(&self, enabled: bool) -> Result<()>;
    /// Enable or disable the local camera track.
    async fn set_camera(&self, enabled: bool) -> Result<()>;
    /// Tear the session down.
    async fn disconnect(&self) -> Result<()>;
}

/// Handler for one remote procedure.
///
/// Handlers are synchronous by design: long-running work is deferred through
/// channels or spawned tasks, and the JSON-encoded reply string goes back to
/// the agent immediately. No timeout is enforced on the remote side's await,
/// so a handler that blocks hangs the agent's call indefinitely — an open
/// risk inherited from the protocol.
pub type ProcedureHandler = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Capacity of the inbound control-message broadcast channel.
const CONTROL_CHANNEL_CAPACITY: usize = 64;

/// Owns the room session and its communication primitives.
pub struct RoomManager {
    transport: Arc<dyn RoomTransport>,
    state: Mutex<ConnectionState>,
    /// Participant identity, unique per session.
    identity: String,
    procedures: Mutex<HashMap<ProcedureName, ProcedureHandler>>,
    control_tx: broadcast::Sender<ControlMessage>,
    mic_enabled: AtomicBool,
    camera_enabled: AtomicBool,
    /// Inbound messages dropped by fail-closed decoding.
    decode_failures: AtomicU64,
    /// Whether a successful connect enables the microphone.
    mic_on_connect: bool,
}

impl RoomManager {
    pub fn new(transport: Arc<dyn RoomTransport>, mic_on_connect: bool) -> Self {
        let (control_tx, _) = broadcast::channel(CONTROL_CHANNEL_CAPACITY);
        Self {
            transport,
            state: Mutex::new(ConnectionState::Disconnected),
            identity: format!("user-{}", uuid::Uuid::new_v4()),
            procedures: Mutex::new(HashMap::new()),
            control_tx,
            mic_enabled: AtomicBool::new(false),
            camera_enabled: AtomicBool::new(false),
            decode_failures: AtomicU64::new(0),
            mic_on_connect,
        }
    }

    /// Participant identity used in the room.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|g| *g)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    /// Connect to the room.
    ///
    /// On success the local microphone is enabled by default (the
    /// conversation starts hands-free). On failure the manager returns to
    /// `Disconnected` and the caller is expected to continue in degraded,
    /// no-avatar mode rather than crash the session.
    pub async fn connect(&self, server_url: &str, token: &str) -> Result<()> {
        let current = self.state();
        if current != ConnectionState::Disconnected {
            return Err(AvatarError::Connection(format!(
                "already {current:?}; disconnect first"
            )));
        }

        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.transport.connect(server_url, token).await {
            self.set_state(ConnectionState::Disconnected);
            return Err(AvatarError::Connection(format!(
                "room connect failed: {e}"
            )));
        }
        self.set_state(ConnectionState::Connected);
        info!(identity = %self.identity, server_url, "room connected");

        if self.mic_on_connect {
            if let Err(e) = self.set_microphone(true).await {
                warn!("failed to enable microphone after connect: {e}");
            }
        }
        Ok(())
    }

    /// Publish a control message on the data channel.
    ///
    /// Fire-and-forget: at-most-once delivery, no acknowledgment. Transport
    /// failures are logged and never surfaced to the caller, never retried.
    pub async fn publish(&self, msg: &ControlMessage) {
        if self.state() != ConnectionState::Connected {
            warn!(topic = msg.topic().as_str(), "publish while not connected, dropped");
            return;
        }
        let payload = match msg.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(topic = msg.topic().as_str(), "failed to encode message: {e}");
                return;
            }
        };
        if let Err(e) = self.transport.send_data(msg.topic().as_str(), &payload).await {
            warn!(topic = msg.topic().as_str(), "publish failed: {e}");
        }
    }

    /// Register a remote procedure handler.
    ///
    /// Idempotent: re-registering a name replaces the prior handler, because
    /// reconnect logic may re-run setup. Returns `true` when a prior handler
    /// was replaced.
    pub fn register_procedure(&self, name: ProcedureName, handler: ProcedureHandler) -> bool {
        let replaced = match self.procedures.lock() {
            Ok(mut guard) => guard.insert(name, handler).is_some(),
            Err(_) => false,
        };
        debug!(procedure = name.as_str(), replaced, "procedure registered");
        replaced
    }

    /// Invoke a registered procedure on behalf of the remote peer.
    ///
    /// Always produces a JSON-encoded string result; an unknown or
    /// unregistered procedure yields an error object, never a crash.
    pub fn invoke_procedure(&self, name: &str, payload: &str) -> String {
        let Some(procedure) = ProcedureName::parse(name) else {
            warn!(name, "remote invoked unknown procedure");
            return error_reply(&format!("unknown procedure `{name}`"));
        };

        let handler = self
            .procedures
            .lock()
            .ok()
            .and_then(|guard| guard.get(&procedure).cloned());

        match handler {
            Some(handler) => match handler(payload) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(procedure = procedure.as_str(), "procedure handler failed: {e}");
                    error_reply(&e.to_string())
                }
            },
            None => {
                warn!(procedure = procedure.as_str(), "procedure not registered");
                error_reply(&format!("procedure `{name}` not registered"))
            }
        }
    }

    /// Subscribe to decoded inbound control messages.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControlMessage> {
        self.control_tx.subscribe()
    }

    /// Route a raw inbound data-channel payload.
    ///
    /// Valid messages are broadcast to subscribers. Unknown topics and
    /// malformed payloads fail closed: logged, counted, not delivered.
    pub fn handle_incoming(&self, topic: &str, payload: &[u8]) {
        match ControlMessage::decode(topic, payload) {
            Ok(msg) => {
                let _ = self.control_tx.send(msg);
            }
            Err(e) => {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(topic, "dropped undecodable message: {e}");
            }
        }
    }

    /// Number of inbound messages dropped by fail-closed decoding.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Enable or disable the local microphone.
    pub async fn set_microphone(&self, enabled: bool) -> Result<()> {
        self.transport.set_microphone(enabled).await?;
        self.mic_enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Enable or disable the local camera track.
    pub async fn set_camera(&self, enabled: bool) -> Result<()> {
        self.transport.set_camera(enabled).await?;
        self.camera_enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    pub fn microphone_enabled(&self) -> bool {
        self.mic_enabled.load(Ordering::Relaxed)
    }

    pub fn camera_enabled(&self) -> bool {
        self.camera_enabled.load(Ordering::Relaxed)
    }

    /// Tear the session down.
    pub async fn disconnect(&self) -> Result<()> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        let result = self.transport.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
        self.mic_enabled.store(false, Ordering::Relaxed);
        self.camera_enabled.store(false, Ordering::Relaxed);
        info!(identity = %self.identity, "room disconnected");
        result
    }
}

fn error_reply(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}
