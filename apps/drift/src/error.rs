use thiserror::Error;

/// Media acquisition failures. Terminal for the current search attempt; the
/// controller stays in (or returns to) idle and surfaces these to the user.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error("no usable capture device: {0}")]
    DeviceUnavailable(String),
}

/// Error taxonomy for the negotiation core.
///
/// None of these cross the controller boundary as a panic or a bare `Err`
/// from a callback; they are converted to observable events for the UI
/// layer. Stale and duplicate signaling events are not errors at all; they
/// are expected under at-least-once delivery and silently dropped.
#[derive(Debug, Error)]
pub enum DriftError {
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Transport-level failure. Retried indefinitely with backoff unless the
    /// channel was latched closed by a ban.
    #[error("transport: {0}")]
    Transport(String),

    /// The server banned this identity. Permanent; reconnection is disabled.
    #[error("banned: {0}")]
    Banned(String),

    #[error("matchmaking: {0}")]
    Matchmaking(String),

    #[error("peer connection: {0}")]
    Peer(String),

    #[error("storage: {0}")]
    Storage(#[from] std::io::Error),
}
