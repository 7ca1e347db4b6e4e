//! Seam around the peer connection primitive.
//!
//! The controller owns exactly one live peer at a time and never names a
//! concrete WebRTC type; everything flows through `PeerConnector` /
//! `PeerHandle` plus the tagged `PeerEvent` stream. Every event carries the
//! connection id of the handle that produced it, so callbacks captured
//! before a teardown are recognized as stale and dropped.

use drift_proto::Role;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::DriftError;
use crate::session::media::LocalMedia;

pub mod mock;
pub mod webrtc;

/// Events emitted by a peer connection, tagged with its connection id.
#[derive(Debug)]
pub enum PeerEvent {
    /// The peer object finished constructing; signaling can now be applied.
    /// The controller takes ownership of the handle here.
    Ready(Box<dyn PeerHandle>),
    /// The media/data channel is established end to end.
    Connected,
    /// Locally generated signaling payload that must be relayed to the
    /// partner via the transport channel.
    SignalReady(Value),
    /// Inbound data-channel bytes from the partner.
    Data(Vec<u8>),
    /// The connection errored or closed. `error` is `None` for a clean
    /// close.
    Closed { error: Option<String> },
}

pub type PeerEventSender = mpsc::UnboundedSender<(Uuid, PeerEvent)>;

/// Everything a connector needs to build one peer connection.
pub struct PeerSetup {
    pub connection_id: Uuid,
    pub room: String,
    pub role: Role,
    /// Local capture stream for voice/video modes; `None` for text.
    pub local_media: Option<LocalMedia>,
    pub ice_servers: Vec<String>,
    pub events: PeerEventSender,
}

/// Factory for peer connections. `connect` returns immediately; the handle
/// arrives later as `PeerEvent::Ready` because real construction is
/// asynchronous (ICE setup, media attachment). An immediate `Err` means the
/// attempt never started.
pub trait PeerConnector: Send + Sync {
    fn connect(&self, setup: PeerSetup) -> Result<(), DriftError>;
}

/// One live peer connection.
pub trait PeerHandle: Send + std::fmt::Debug {
    fn connection_id(&self) -> Uuid;

    /// Apply an inbound signaling payload. Best-effort: malformed or
    /// out-of-order payloads are logged by the implementation, not raised.
    fn apply_signal(&self, payload: &Value);

    /// Send bytes over the data channel. Best-effort; failures are logged.
    fn send_data(&self, data: &[u8]);

    fn is_connected(&self) -> bool;

    /// Tear the connection down and detach all callbacks. Idempotent: the
    /// second and later calls are no-ops and emit nothing.
    fn teardown(&mut self);
}
