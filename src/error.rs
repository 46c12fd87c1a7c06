//! Error types for the avatar session engine.

/// Top-level error type for the avatar companion system.
#[derive(Debug, thiserror::Error)]
pub enum AvatarError {
    /// Room connection or authentication error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Data channel / remote procedure plumbing error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Control protocol encode/decode error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Camera hardware or frame capture error.
    #[error("capture error: {0}")]
    Capture(String),

    /// Avatar setup state machine error.
    #[error("setup error: {0}")]
    Setup(String),

    /// Avatar-rendering service error.
    #[error("avatar service error: {0}")]
    AvatarService(String),

    /// Image generation / enhancement service error.
    #[error("image service error: {0}")]
    ImageService(String),

    /// Room access token minting error.
    #[error("token error: {0}")]
    Token(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Session state persistence error.
    #[error("state error: {0}")]
    State(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AvatarError>;
