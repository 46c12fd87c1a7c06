//! Visage: avatar companion session engine.
//!
//! This crate implements the control plane of a talking-avatar demo: a user
//! captures (or generates) a portrait, the portrait becomes an avatar asset
//! at an external rendering service, and the avatar is driven live over a
//! real-time room while the user converses with a voice agent.
//!
//! # Architecture
//!
//! The session is built from independent pieces connected by async channels:
//! - **Room manager**: owns the room session, the remote-procedure registry,
//!   and the typed data channel (transport is external, behind a trait)
//! - **Capture engine**: camera lifecycle, frame capture, display-handle
//!   accounting
//! - **Setup machine**: photo → avatar-creation → readiness, fail-open on
//!   creation errors
//! - **Control protocol**: the validated tagged-union message contract
//!   shared with the remote agent
//! - **Services**: HTTP clients for the avatar-rendering and image AI
//!   services
//! - **API**: the HTTP routes the browser client calls, backed by an
//!   injected state store

pub mod api;
pub mod app_dirs;
pub mod asset_cache;
pub mod capture;
pub mod config;
pub mod controls;
pub mod error;
pub mod protocol;
pub mod room;
pub mod services;
pub mod session;
pub mod setup;
pub mod state_store;

pub use config::SessionConfig;
pub use error::{AvatarError, Result};
pub use protocol::{ControlMessage, FrontendAction, ProcedureName, SessionMode, Topic};
pub use room::{ConnectionState, RoomManager, RoomTransport};
pub use session::AvatarSession;
pub use setup::{AvatarSetupState, SetupAction, SetupStep};
pub use state_store::{AvatarStateRecord, StateStore};
