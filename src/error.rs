use thiserror::Error;

/// Media acquisition failures. Permission denial and device absence are
/// distinguished so the user-facing message can differ.
#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("access to the device was denied: {0}")]
    AccessDenied(String),

    #[error("no usable device: {0}")]
    Unavailable(String),

    #[error("media backend error: {0}")]
    Backend(String),
}

/// Errors crossing the call-coordination boundary.
#[derive(Debug, Error)]
pub enum CallError {
    /// No or invalid token for the signaling connection. Fatal, reported
    /// once, never retried.
    #[error("signaling authentication failed: {0}")]
    Auth(String),

    /// Could not reach the relay on the initial attempt. Post-establishment
    /// drops are retried by the transport and never surface here.
    #[error("signaling transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("peer connection error: {0}")]
    Peer(#[from] webrtc::Error),

    #[error("screen capture error: {0}")]
    ScreenShare(String),
}
