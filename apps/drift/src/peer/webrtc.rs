//! WebRTC implementation of the peer seam.
//!
//! One data channel ("drift-data") per connection. The initiator creates the
//! channel and the offer; the responder answers. SDP and ICE ride inside the
//! opaque signaling payloads relayed by the rendezvous server:
//! `{"kind":"offer"|"answer","sdp":...}` and
//! `{"kind":"ice","candidate":...,"sdp_mid":...,"sdp_mline_index":...}`.
//!
//! Renegotiation is the same code path: a later inbound offer is applied to
//! the live connection and answered in place.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{PeerConnector, PeerEvent, PeerEventSender, PeerHandle, PeerSetup};
use crate::error::DriftError;

const DATA_CHANNEL_LABEL: &str = "drift-data";

pub struct WebRtcConnector;

impl PeerConnector for WebRtcConnector {
    fn connect(&self, setup: PeerSetup) -> Result<(), DriftError> {
        tokio::spawn(async move {
            let id = setup.connection_id;
            let events = setup.events.clone();
            if let Err(err) = build_and_run(setup).await {
                warn!(%id, %err, "peer setup failed");
                let _ = events.send((
                    id,
                    PeerEvent::Closed {
                        error: Some(err.to_string()),
                    },
                ));
            }
        });
        Ok(())
    }
}

#[derive(Debug)]
struct WebRtcHandle {
    id: Uuid,
    signal_tx: mpsc::UnboundedSender<Value>,
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    teardown: Arc<Notify>,
    /// Set before closing so our own close never reads as a remote failure.
    closing: Arc<AtomicBool>,
    torn: bool,
}

impl PeerHandle for WebRtcHandle {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn apply_signal(&self, payload: &Value) {
        let _ = self.signal_tx.send(payload.clone());
    }

    fn send_data(&self, data: &[u8]) {
        let _ = self.data_tx.send(data.to_vec());
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn teardown(&mut self) {
        if self.torn {
            return;
        }
        self.torn = true;
        self.closing.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so the driver cannot miss the wakeup
        // even if it is not parked on `notified` right now.
        self.teardown.notify_one();
    }
}

async fn build_and_run(setup: PeerSetup) -> Result<(), DriftError> {
    let id = setup.connection_id;
    let events = setup.events.clone();

    let api = APIBuilder::new().build();
    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: setup.ice_servers.clone(),
            ..Default::default()
        }],
        ..Default::default()
    };
    let pc = Arc::new(
        api.new_peer_connection(config)
            .await
            .map_err(|e| DriftError::Peer(e.to_string()))?,
    );

    let connected = Arc::new(AtomicBool::new(false));
    let closing = Arc::new(AtomicBool::new(false));
    let closed_reported = Arc::new(AtomicBool::new(false));
    let data_channel: Arc<parking_lot::Mutex<Option<Arc<RTCDataChannel>>>> =
        Arc::new(parking_lot::Mutex::new(None));

    // Outbound ICE candidates become opaque signal payloads.
    {
        let events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let payload = json!({
                            "kind": "ice",
                            "candidate": init.candidate,
                            "sdp_mid": init.sdp_mid,
                            "sdp_mline_index": init.sdp_mline_index,
                        });
                        let _ = events.send((id, PeerEvent::SignalReady(payload)));
                    }
                    Err(err) => warn!(%err, "failed to serialize local ICE candidate"),
                }
            })
        }));
    }

    // Remote-side failures; our own teardown is suppressed via `closing`.
    {
        let events = events.clone();
        let closing = closing.clone();
        let closed_reported = closed_reported.clone();
        let connected = connected.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            trace!(?state, "peer connection state");
            match state {
                RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Disconnected
                | RTCPeerConnectionState::Closed => {
                    connected.store(false, Ordering::SeqCst);
                    if !closing.load(Ordering::SeqCst)
                        && !closed_reported.swap(true, Ordering::SeqCst)
                    {
                        let error = match state {
                            RTCPeerConnectionState::Closed => None,
                            other => Some(format!("peer connection {:?}", other)),
                        };
                        let _ = events.send((id, PeerEvent::Closed { error }));
                    }
                }
                _ => {}
            }
            Box::pin(async {})
        }));
    }

    let wire_dc = {
        let events = events.clone();
        let connected = connected.clone();
        let slot = data_channel.clone();
        move |dc: Arc<RTCDataChannel>| {
            *slot.lock() = Some(dc.clone());
            {
                let events = events.clone();
                let connected = connected.clone();
                dc.on_open(Box::new(move || {
                    connected.store(true, Ordering::SeqCst);
                    let _ = events.send((id, PeerEvent::Connected));
                    Box::pin(async {})
                }));
            }
            {
                let events = events.clone();
                dc.on_message(Box::new(move |msg: DataChannelMessage| {
                    let _ = events.send((id, PeerEvent::Data(msg.data.to_vec())));
                    Box::pin(async {})
                }));
            }
        }
    };

    if setup.role.is_initiator() {
        let dc = pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| DriftError::Peer(e.to_string()))?;
        wire_dc(dc);
    } else {
        let wire_dc = wire_dc.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            debug!(label = %dc.label(), "remote data channel");
            wire_dc(dc);
            Box::pin(async {})
        }));
    }

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let teardown = Arc::new(Notify::new());

    let handle = WebRtcHandle {
        id,
        signal_tx,
        data_tx,
        connected,
        teardown: teardown.clone(),
        closing: closing.clone(),
        torn: false,
    };
    let _ = events.send((id, PeerEvent::Ready(Box::new(handle))));

    if setup.role.is_initiator() {
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| DriftError::Peer(e.to_string()))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| DriftError::Peer(e.to_string()))?;
        let _ = events.send((
            id,
            PeerEvent::SignalReady(json!({"kind": "offer", "sdp": offer.sdp})),
        ));
    }

    drive(pc, events, id, signal_rx, data_rx, teardown, data_channel).await;
    Ok(())
}

/// Own the connection until teardown: apply inbound signaling, forward
/// outbound data, close on request.
async fn drive(
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSender,
    id: Uuid,
    mut signal_rx: mpsc::UnboundedReceiver<Value>,
    mut data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    teardown: Arc<Notify>,
    data_channel: Arc<parking_lot::Mutex<Option<Arc<RTCDataChannel>>>>,
) {
    loop {
        tokio::select! {
            _ = teardown.notified() => {
                if let Err(err) = pc.close().await {
                    debug!(%err, "peer close error");
                }
                return;
            }
            payload = signal_rx.recv() => match payload {
                Some(payload) => {
                    if let Err(err) = apply_signal(&pc, &events, id, &payload).await {
                        warn!(%err, "failed to apply signaling payload");
                    }
                }
                None => {
                    let _ = pc.close().await;
                    return;
                }
            },
            data = data_rx.recv() => match data {
                Some(data) => {
                    let dc = data_channel.lock().clone();
                    match dc {
                        Some(dc) => {
                            if let Err(err) = dc.send(&Bytes::from(data)).await {
                                // Not fatal: teardown is driven by the
                                // connection's own close/error callbacks.
                                debug!(%err, "data channel send failed");
                            }
                        }
                        None => debug!("dropping data: channel not open yet"),
                    }
                }
                None => {
                    let _ = pc.close().await;
                    return;
                }
            },
        }
    }
}

async fn apply_signal(
    pc: &Arc<RTCPeerConnection>,
    events: &PeerEventSender,
    id: Uuid,
    payload: &Value,
) -> Result<(), DriftError> {
    let kind = payload.get("kind").and_then(Value::as_str).unwrap_or("");
    match kind {
        "offer" => {
            let sdp = payload_sdp(payload)?;
            let offer = RTCSessionDescription::offer(sdp)
                .map_err(|e| DriftError::Peer(e.to_string()))?;
            pc.set_remote_description(offer)
                .await
                .map_err(|e| DriftError::Peer(e.to_string()))?;
            let answer = pc
                .create_answer(None)
                .await
                .map_err(|e| DriftError::Peer(e.to_string()))?;
            pc.set_local_description(answer.clone())
                .await
                .map_err(|e| DriftError::Peer(e.to_string()))?;
            let _ = events.send((
                id,
                PeerEvent::SignalReady(json!({"kind": "answer", "sdp": answer.sdp})),
            ));
        }
        "answer" => {
            let sdp = payload_sdp(payload)?;
            let answer = RTCSessionDescription::answer(sdp)
                .map_err(|e| DriftError::Peer(e.to_string()))?;
            pc.set_remote_description(answer)
                .await
                .map_err(|e| DriftError::Peer(e.to_string()))?;
        }
        "ice" => {
            let init = RTCIceCandidateInit {
                candidate: payload
                    .get("candidate")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                sdp_mid: payload
                    .get("sdp_mid")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                sdp_mline_index: payload
                    .get("sdp_mline_index")
                    .and_then(Value::as_u64)
                    .map(|i| i as u16),
                username_fragment: None,
            };
            pc.add_ice_candidate(init)
                .await
                .map_err(|e| DriftError::Peer(e.to_string()))?;
        }
        other => {
            trace!(kind = other, "ignoring unknown signal payload kind");
        }
    }
    Ok(())
}

fn payload_sdp(payload: &Value) -> Result<String, DriftError> {
    payload
        .get("sdp")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DriftError::Peer("signal payload missing sdp".to_string()))
}
