//! Client core of an anonymous random-pairing chat service.
//!
//! The crate is the session-negotiation state machine only: a reconnecting
//! transport channel to the rendezvous server, a peer session controller
//! driving one peer-to-peer connection at a time, a signal queue that makes
//! at-least-once signaling delivery safe, and liveness keepalives. Rendering
//! and moderation live elsewhere and talk to this core through intents and
//! events.

pub mod config;
pub mod error;
pub mod peer;
pub mod session;
pub mod storage;
pub mod transport;

use std::sync::Arc;

use drift_proto::ChatMode;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::peer::PeerConnector;
use crate::session::media::MediaSource;
use crate::session::{Controller, ControllerEvent, Intent};
use crate::storage::SessionStore;
use crate::transport::WebSocketChannel;

/// Handle to a running per-mode session: feed it intents, read its events.
pub struct SessionHandle {
    pub intents: mpsc::UnboundedSender<Intent>,
    pub events: mpsc::UnboundedReceiver<ControllerEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl SessionHandle {
    /// Ask the controller to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.intents.send(Intent::Shutdown);
        let _ = self.task.await;
    }
}

/// Wire up a websocket transport and a controller for one chat mode and
/// spawn the controller's event loop.
pub fn start_session(
    mode: ChatMode,
    config: Config,
    connector: Arc<dyn PeerConnector>,
    media: Arc<dyn MediaSource>,
    store: Arc<dyn SessionStore>,
) -> SessionHandle {
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let transport = WebSocketChannel::spawn(&config, mode, store.clone(), transport_tx);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    let controller = Controller::new(mode, config, transport, connector, media, store, event_tx);
    let task = tokio::spawn(controller.run(intent_rx, transport_rx));

    SessionHandle {
        intents: intent_tx,
        events: event_rx,
        task,
    }
}
