//! In-memory transport double for tests: records everything sent and lets
//! the test inject server-side events.

use drift_proto::{ClientMessage, ServerMessage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use super::{SignalingChannel, TransportEvent};

pub struct MockChannel {
    sent: Mutex<Vec<ClientMessage>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: AtomicBool,
    resumed: Mutex<u32>,
    shutdown: AtomicBool,
}

impl MockChannel {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            events,
            connected: AtomicBool::new(true),
            resumed: Mutex::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Everything the client has emitted, in order.
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self, wanted: fn(&ClientMessage) -> bool) -> usize {
        self.sent.lock().iter().filter(|m| wanted(m)).count()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Inject a parsed server message, as the websocket task would.
    pub fn push_server(&self, msg: ServerMessage) {
        let _ = self.events.send(TransportEvent::Message(msg));
    }

    pub fn push_event(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn resume_count(&self) -> u32 {
        *self.resumed.lock()
    }

    pub fn was_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl SignalingChannel for MockChannel {
    fn send(&self, msg: ClientMessage) {
        if self.connected.load(Ordering::SeqCst) {
            self.sent.lock().push(msg);
        }
    }

    fn resume(&self) {
        *self.resumed.lock() += 1;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
