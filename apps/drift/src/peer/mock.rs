//! Scriptable peer double for controller tests.
//!
//! `auto` mode delivers `PeerEvent::Ready` synchronously from `connect`;
//! `manual` mode lets a test hold the handle back to exercise the signal
//! queue's buffering window.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use drift_proto::Role;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use super::{PeerConnector, PeerEvent, PeerEventSender, PeerHandle, PeerSetup};
use crate::error::DriftError;

/// Shared observable state of one mock connection.
pub struct MockPeerState {
    pub connection_id: Uuid,
    pub room: String,
    pub role: Role,
    pub had_media: bool,
    events: PeerEventSender,
    applied: Mutex<Vec<Value>>,
    sent: Mutex<Vec<Vec<u8>>>,
    connected: AtomicBool,
    torn_down: AtomicBool,
    teardown_calls: AtomicU32,
}

impl MockPeerState {
    /// Signals applied to this peer, in order.
    pub fn applied(&self) -> Vec<Value> {
        self.applied.lock().clone()
    }

    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn teardown_calls(&self) -> u32 {
        self.teardown_calls.load(Ordering::SeqCst)
    }

    pub fn was_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Emit an event as this connection (test-side injection).
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send((self.connection_id, event));
    }
}

#[derive(Debug)]
pub struct MockPeerHandle {
    id: Uuid,
    state: Arc<MockPeerState>,
}

impl std::fmt::Debug for MockPeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeerState")
            .field("connection_id", &self.connection_id)
            .field("room", &self.room)
            .finish()
    }
}

impl PeerHandle for MockPeerHandle {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn apply_signal(&self, payload: &Value) {
        self.state.applied.lock().push(payload.clone());
    }

    fn send_data(&self, data: &[u8]) {
        self.state.sent.lock().push(data.to_vec());
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn teardown(&mut self) {
        self.state.teardown_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.connected.store(false, Ordering::SeqCst);
    }
}

pub struct MockConnector {
    auto_ready: bool,
    fail_next: AtomicBool,
    states: Mutex<Vec<Arc<MockPeerState>>>,
}

impl MockConnector {
    /// Handles become available as soon as `connect` runs.
    pub fn auto() -> Arc<Self> {
        Arc::new(Self {
            auto_ready: true,
            fail_next: AtomicBool::new(false),
            states: Mutex::new(Vec::new()),
        })
    }

    /// The test delivers `Ready` itself via [`MockConnector::deliver_ready`].
    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            auto_ready: false,
            fail_next: AtomicBool::new(false),
            states: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next_connect(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.states.lock().len()
    }

    /// Observable state of the n-th connection attempt.
    pub fn peer(&self, index: usize) -> Arc<MockPeerState> {
        self.states.lock()[index].clone()
    }

    pub fn last_peer(&self) -> Arc<MockPeerState> {
        self.states.lock().last().cloned().expect("no connections made")
    }

    /// Hand the controller the handle for the n-th connection.
    pub fn deliver_ready(&self, index: usize) {
        let state = self.peer(index);
        let handle = MockPeerHandle {
            id: state.connection_id,
            state: state.clone(),
        };
        state.emit(PeerEvent::Ready(Box::new(handle)));
    }
}

impl PeerConnector for MockConnector {
    fn connect(&self, setup: PeerSetup) -> Result<(), DriftError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DriftError::Peer("mock connect failure".to_string()));
        }
        let state = Arc::new(MockPeerState {
            connection_id: setup.connection_id,
            room: setup.room,
            role: setup.role,
            had_media: setup.local_media.is_some(),
            events: setup.events,
            applied: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            teardown_calls: AtomicU32::new(0),
        });
        let index = {
            let mut states = self.states.lock();
            states.push(state);
            states.len() - 1
        };
        if self.auto_ready {
            self.deliver_ready(index);
        }
        Ok(())
    }
}
