//! Transport Channel: a persistent, auto-reconnecting duplex event channel
//! to the rendezvous server, one instance per chat mode.

use std::time::Duration;

use drift_proto::{ClientMessage, ServerMessage};

pub mod mock;
pub mod websocket;

pub use websocket::WebSocketChannel;

/// Events surfaced by a transport channel. Connection failures are reported
/// here, never thrown; the consumer decides what to tell the user.
#[derive(Debug)]
pub enum TransportEvent {
    /// Channel is up and authenticated.
    Connected,
    Disconnected {
        reason: String,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// A single connect attempt failed; the channel keeps retrying.
    ReconnectFailed {
        error: String,
    },
    /// Parsed message from the server.
    Message(ServerMessage),
    /// The server banned this identity (or rejected a duplicate connection).
    /// Terminal: auto-reconnect is permanently disabled.
    BannedClosed {
        message: String,
    },
}

/// Duplex event channel to the rendezvous server.
///
/// `send` is best-effort fire: no delivery acknowledgment is modeled, and
/// callers must not assume at-least-once delivery; the session layer
/// deduplicates on receive instead.
pub trait SignalingChannel: Send + Sync {
    fn send(&self, msg: ClientMessage);

    /// Nudge the channel after an external suspension (page foregrounded):
    /// if a reconnect backoff sleep is in progress, retry immediately.
    fn resume(&self);

    fn is_connected(&self) -> bool;

    fn shutdown(&self);
}

/// Reconnect delay for the given attempt: exponential from `initial`, capped
/// at `max`, with up to 20% random jitter so simultaneously dropped clients
/// do not stampede the server.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    use rand::Rng;

    let exp = initial.saturating_mul(1u32 << attempt.min(16));
    let base = exp.min(max);
    let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..0.2));
    base + jitter
}
