//! Peer Session Controller: the state machine driving one peer session from
//! idle to connected and back.
//!
//! One controller instance per chat-mode page. All state lives in this
//! struct and every transition runs synchronously inside `run`'s event loop,
//! so there is no locking. Handlers still interleave with async I/O, so every
//! peer event is checked against the live connection id and every signal
//! against the current room before it is allowed to touch anything.
//!
//! Disconnect authority: a server `leave` for the current room wins. The
//! controller tears the peer down itself on `leave`, which clears the live
//! connection id, so the peer's own `Closed` callback for that connection
//! arrives stale and is dropped. Peer-level close/error events only drive
//! the transition when no server event got there first.

use std::sync::Arc;

use drift_proto::{ChatMode, ClientMessage, DataMessage, PeerInfo, Role, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{DriftError, MediaError};
use crate::peer::{PeerConnector, PeerEvent, PeerHandle, PeerSetup};
use crate::session::keepalive;
use crate::session::media::{LocalMedia, MediaSource};
use crate::session::signal_queue::{SignalDisposition, SignalQueue};
use crate::storage::SessionStore;
use crate::transport::{SignalingChannel, TransportEvent};

/// The one finite-state value the controller owns. Never two at once; the
/// machine has no terminal state and is re-entered indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Searching,
    Connecting,
    Connected,
    Disconnected,
}

/// UI-layer intents.
#[derive(Debug)]
pub enum Intent {
    StartSearch,
    Cancel,
    Next,
    Leave,
    SendMessage(String),
    /// Page visibility: `true` when foregrounded.
    VisibilityChanged(bool),
    Shutdown,
}

/// User-facing notifications. These shape copy only, never state.
#[derive(Debug)]
pub enum Notice {
    Searching,
    Connected { peer_info: Option<PeerInfo> },
    PartnerLeft { message: String },
    SearchCancelled { message: String },
    NoMatch { message: String },
    NoUsersOnline { message: String },
    MediaFailed { error: MediaError },
    Banned { message: String },
    PartnerBanned { message: String },
    TransportOffline { reason: String },
    TransportOnline,
}

/// Everything observable about the controller.
#[derive(Debug)]
pub enum ControllerEvent {
    StateChanged(ConnectionState),
    Notice(Notice),
    /// Chat line from the partner.
    PeerMessage(String),
    Error(DriftError),
}

enum LoopControl {
    Continue,
    Stop,
}

pub struct Controller {
    mode: ChatMode,
    config: Config,
    transport: Arc<dyn SignalingChannel>,
    connector: Arc<dyn PeerConnector>,
    media: Arc<dyn MediaSource>,
    store: Arc<dyn SessionStore>,
    events: mpsc::UnboundedSender<ControllerEvent>,

    peer_tx: mpsc::UnboundedSender<(Uuid, PeerEvent)>,
    peer_rx: Option<mpsc::UnboundedReceiver<(Uuid, PeerEvent)>>,
    media_tx: mpsc::UnboundedSender<Result<LocalMedia, MediaError>>,
    media_rx: Option<mpsc::UnboundedReceiver<Result<LocalMedia, MediaError>>>,

    state: ConnectionState,
    room: Option<String>,
    role: Option<Role>,
    peer_info: Option<PeerInfo>,
    /// Connection id of the peer we currently accept events from. Cleared
    /// first thing in every teardown so in-flight callbacks go stale.
    live_peer: Option<Uuid>,
    peer: Option<Box<dyn PeerHandle>>,
    queue: SignalQueue,
    local_media: Option<LocalMedia>,
    media_pending: bool,
    /// A start-search intent arrived while media acquisition was pending;
    /// honor it when acquisition resolves.
    search_deferred: bool,
    cooldown_until: Option<Instant>,
}

impl Controller {
    pub fn new(
        mode: ChatMode,
        config: Config,
        transport: Arc<dyn SignalingChannel>,
        connector: Arc<dyn PeerConnector>,
        media: Arc<dyn MediaSource>,
        store: Arc<dyn SessionStore>,
        events: mpsc::UnboundedSender<ControllerEvent>,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let queue = SignalQueue::new(config.dedup_capacity);
        Self {
            mode,
            config,
            transport,
            connector,
            media,
            store,
            events,
            peer_tx,
            peer_rx: Some(peer_rx),
            media_tx,
            media_rx: Some(media_rx),
            state: ConnectionState::Idle,
            room: None,
            role: None,
            peer_info: None,
            live_peer: None,
            peer: None,
            queue,
            local_media: None,
            media_pending: false,
            search_deferred: false,
            cooldown_until: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drive the controller until `Shutdown` or until the intent channel
    /// closes. This is the single logical actor: every transition happens
    /// inside this loop.
    pub async fn run(
        mut self,
        mut intents: mpsc::UnboundedReceiver<Intent>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let Some(mut peer_rx) = self.peer_rx.take() else {
            warn!("controller run() called twice");
            return;
        };
        let Some(mut media_rx) = self.media_rx.take() else {
            warn!("controller run() called twice");
            return;
        };
        let mut keepalive_tick = tokio::time::interval_at(
            Instant::now() + self.config.keepalive_interval,
            self.config.keepalive_interval,
        );

        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(intent) => {
                        if let LoopControl::Stop = self.handle_intent(intent) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = transport_rx.recv() => self.handle_transport_event(event),
                Some((id, event)) = peer_rx.recv() => self.handle_peer_event(id, event),
                Some(result) = media_rx.recv() => self.handle_media_result(result),
                _ = keepalive_tick.tick() => self.send_peer_keepalive(),
            }
        }
        self.shutdown();
    }

    // ── Intents ─────────────────────────────────────────────

    fn handle_intent(&mut self, intent: Intent) -> LoopControl {
        trace!(?intent, state = ?self.state, "intent");
        match intent {
            Intent::StartSearch => self.intent_start_search(),
            Intent::Cancel => self.intent_cancel(),
            Intent::Next => self.intent_next(),
            Intent::Leave => self.intent_leave(),
            Intent::SendMessage(text) => self.intent_send_message(text),
            Intent::VisibilityChanged(foreground) => self.visibility_changed(foreground),
            Intent::Shutdown => return LoopControl::Stop,
        }
        LoopControl::Continue
    }

    fn intent_start_search(&mut self) {
        match self.state {
            ConnectionState::Idle | ConnectionState::Disconnected => {}
            other => {
                debug!(state = ?other, "ignoring start-search in this state");
                return;
            }
        }
        if self.mode.wants_media() && self.local_media.is_none() {
            // Defer rather than drop: the search starts the moment media
            // resolves, or surfaces the error if it fails.
            self.search_deferred = true;
            if !self.media_pending {
                self.start_media_acquisition();
            }
            return;
        }
        self.begin_search();
    }

    fn intent_cancel(&mut self) {
        if self.state != ConnectionState::Searching {
            debug!(state = ?self.state, "ignoring cancel outside of searching");
            return;
        }
        if self.cooldown_active() {
            return;
        }
        self.transport.send(ClientMessage::Cancel);
        // Synchronously leaving `searching` makes any in-flight match event
        // stale: matches are only accepted while searching.
        self.set_state(ConnectionState::Idle);
    }

    fn intent_next(&mut self) {
        // Next is a re-search from anywhere but idle: in `searching` it
        // re-issues the find, mid-session it vacates the room first.
        if self.state == ConnectionState::Idle {
            debug!("ignoring next while idle");
            return;
        }
        if self.cooldown_active() {
            debug!("next intent within cooldown window, ignored");
            return;
        }
        self.teardown_peer();
        if let Some(room) = self.vacate_room() {
            self.transport.send(ClientMessage::Next { room });
        }
        self.set_state(ConnectionState::Disconnected);
        self.begin_search();
    }

    fn intent_leave(&mut self) {
        self.teardown_peer();
        if let Some(room) = self.vacate_room() {
            self.transport.send(ClientMessage::Leave { room });
        }
        if self.mode == ChatMode::Voice {
            self.store.set_last_voice_room(None);
        }
        self.set_state(ConnectionState::Idle);
    }

    fn intent_send_message(&mut self, text: String) {
        if self.state != ConnectionState::Connected {
            debug!("dropping outbound chat message: not connected");
            return;
        }
        let Some(peer) = self.peer.as_ref() else {
            return;
        };
        match serde_json::to_vec(&DataMessage::Chat { text }) {
            Ok(bytes) => peer.send_data(&bytes),
            Err(err) => warn!(%err, "failed to encode chat message"),
        }
    }

    fn visibility_changed(&mut self, foreground: bool) {
        if !foreground {
            return;
        }
        // Re-validate transport connectivity after the suspension.
        self.transport.resume();

        // A connection still negotiating is allowed to look dead; only an
        // established session that stopped reporting connected is restarted.
        let peer_alive = self.peer.as_ref().is_some_and(|p| p.is_connected());
        if self.state == ConnectionState::Connected && self.room.is_some() && !peer_alive {
            info!("peer dead after foregrounding, restarting search");
            self.teardown_peer();
            if let Some(room) = self.vacate_room() {
                self.transport.send(ClientMessage::Next { room });
            }
            self.set_state(ConnectionState::Disconnected);
            self.begin_search();
        }
    }

    // ── Media ───────────────────────────────────────────────

    fn start_media_acquisition(&mut self) {
        self.media_pending = true;
        let media = self.media.clone();
        let mode = self.mode;
        let tx = self.media_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(media.acquire(mode).await);
        });
    }

    fn handle_media_result(&mut self, result: Result<LocalMedia, MediaError>) {
        self.media_pending = false;
        match result {
            Ok(stream) => {
                debug!(label = stream.label(), "local media acquired");
                self.local_media = Some(stream);
                if self.search_deferred {
                    self.search_deferred = false;
                    self.begin_search();
                }
            }
            Err(error) => {
                self.search_deferred = false;
                warn!(%error, "media acquisition failed");
                self.notice(Notice::MediaFailed {
                    error: error.clone(),
                });
                self.error(DriftError::Media(error));
                self.set_state(ConnectionState::Idle);
            }
        }
    }

    // ── Transport events ────────────────────────────────────

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.notice(Notice::TransportOnline);
                self.release_stale_voice_room();
                // The server lost our queue position along with the socket.
                if self.state == ConnectionState::Searching {
                    self.transport.send(ClientMessage::Find);
                }
            }
            TransportEvent::Disconnected { reason } => {
                self.notice(Notice::TransportOffline { reason });
                // An established peer session is direct and may outlive the
                // rendezvous socket; only an in-progress negotiation dies
                // with it.
                if self.state == ConnectionState::Connecting {
                    self.teardown_peer();
                    self.vacate_room();
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                trace!(attempt, ?delay, "transport reconnecting");
            }
            TransportEvent::ReconnectFailed { error } => {
                self.error(DriftError::Transport(error));
            }
            TransportEvent::BannedClosed { message } => {
                self.teardown_peer();
                self.vacate_room();
                self.set_state(ConnectionState::Idle);
                self.notice(Notice::Banned {
                    message: message.clone(),
                });
                self.error(DriftError::Banned(message));
            }
            TransportEvent::Message(msg) => self.handle_server_message(msg),
        }
    }

    fn handle_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Match {
                room,
                role,
                peer_info,
            } => self.handle_match(room, role, peer_info),
            ServerMessage::Signal { room, payload } => self.handle_signal(room, payload),
            ServerMessage::Leave { room } => self.handle_partner_leave(room),
            ServerMessage::NoMatch { message } => {
                if self.state == ConnectionState::Searching {
                    self.set_state(ConnectionState::Idle);
                    self.notice(Notice::NoMatch { message });
                }
            }
            ServerMessage::SearchCancelled { message } => {
                // Normally confirms our own cancel, which already left
                // `searching` synchronously; the notice cannot be gated on
                // the state or it would never surface.
                if self.state == ConnectionState::Searching {
                    self.set_state(ConnectionState::Idle);
                }
                self.notice(Notice::SearchCancelled { message });
            }
            ServerMessage::NoUsersOnline { message } => {
                if self.state == ConnectionState::Searching {
                    self.set_state(ConnectionState::Idle);
                    self.notice(Notice::NoUsersOnline { message });
                }
            }
            ServerMessage::PartnerBanned { message } => {
                if self.room.is_some() {
                    self.notice(Notice::PartnerBanned { message });
                    self.partner_gone(None);
                }
            }
            ServerMessage::SessionIssued { session_id } => {
                // Already persisted by the transport; nothing to do here.
                trace!(%session_id, "session issued");
            }
            // The websocket layer terminates on these before forwarding;
            // alternate transports may deliver them as plain messages.
            ServerMessage::Banned { message } | ServerMessage::DuplicateConnection { message } => {
                self.handle_transport_event(TransportEvent::BannedClosed { message });
            }
            ServerMessage::Pong => {}
        }
    }

    fn handle_match(&mut self, room: String, role: Role, peer_info: Option<PeerInfo>) {
        if self.room.as_deref() == Some(room.as_str()) {
            // Duplicate delivery of the match we already hold.
            debug!(%room, "ignoring duplicate match event");
            return;
        }
        if self.state != ConnectionState::Searching && self.room.is_none() {
            // Covers cancellation: once the state left `searching` with no
            // room held, every in-flight match is stale.
            debug!(%room, state = ?self.state, "ignoring match outside of searching");
            return;
        }

        // Single-active-room invariant: if a room is still active this match
        // supersedes it, and the previous peer is fully gone before the new
        // room is adopted.
        self.teardown_peer();
        self.vacate_room();
        self.queue.clear();

        self.room = Some(room.clone());
        self.role = Some(role);
        self.peer_info = peer_info;
        if self.mode == ChatMode::Voice {
            self.store.set_last_voice_room(Some(&room));
        }
        self.set_state(ConnectionState::Connecting);

        let connection_id = Uuid::new_v4();
        self.live_peer = Some(connection_id);
        let setup = PeerSetup {
            connection_id,
            room,
            role,
            local_media: self.local_media.clone(),
            ice_servers: self.config.ice_servers.clone(),
            events: self.peer_tx.clone(),
        };
        if let Err(err) = self.connector.connect(setup) {
            warn!(%err, "peer connector refused to start");
            self.error(err);
            self.partner_gone(None);
        }
    }

    fn handle_signal(&mut self, room: String, payload: serde_json::Value) {
        if self.room.as_deref() != Some(room.as_str()) {
            // Stale signal from a superseded room; must not touch the queue
            // or the dedup set.
            trace!(%room, "dropping signal for stale room");
            return;
        }
        match self.queue.accept(&payload, self.peer.is_some()) {
            SignalDisposition::Apply => {
                if let Some(peer) = self.peer.as_ref() {
                    peer.apply_signal(&payload);
                }
            }
            SignalDisposition::Queued => {
                trace!(pending = self.queue.pending_len(), "signal queued before peer ready");
            }
            SignalDisposition::Duplicate => {
                trace!("dropping duplicate signal");
            }
        }
    }

    fn handle_partner_leave(&mut self, room: String) {
        if self.room.as_deref() != Some(room.as_str()) {
            trace!(%room, "ignoring leave for stale room");
            return;
        }
        // Server-initiated leave is authoritative; tearing down here clears
        // the live id so the peer's own close callback arrives stale.
        self.notice(Notice::PartnerLeft {
            message: "your partner left".to_string(),
        });
        self.partner_gone(None);
    }

    // ── Peer events ─────────────────────────────────────────

    fn handle_peer_event(&mut self, id: Uuid, event: PeerEvent) {
        if self.live_peer != Some(id) {
            // Stale callback from a torn-down or superseded connection.
            if let PeerEvent::Ready(mut handle) = event {
                handle.teardown();
            } else {
                trace!(%id, "dropping stale peer event");
            }
            return;
        }
        match event {
            PeerEvent::Ready(handle) => {
                self.peer = Some(handle);
                // Strictly in arrival order; signals arriving from here on
                // apply immediately and cannot interleave ahead.
                let pending = self.queue.drain();
                if !pending.is_empty() {
                    debug!(count = pending.len(), "draining queued signals into peer");
                }
                if let Some(peer) = self.peer.as_ref() {
                    for payload in &pending {
                        peer.apply_signal(payload);
                    }
                }
            }
            PeerEvent::Connected => {
                if self.state == ConnectionState::Connecting {
                    self.set_state(ConnectionState::Connected);
                    self.notice(Notice::Connected {
                        peer_info: self.peer_info.clone(),
                    });
                }
            }
            PeerEvent::SignalReady(payload) => {
                if let Some(room) = self.room.clone() {
                    self.transport.send(ClientMessage::Signal { room, payload });
                }
            }
            PeerEvent::Data(bytes) => match keepalive::decode_data(&bytes) {
                Some(DataMessage::Chat { text }) => {
                    let _ = self.events.send(ControllerEvent::PeerMessage(text));
                }
                Some(DataMessage::Keepalive) => trace!("peer keepalive"),
                None => trace!("ignoring undecodable data frame"),
            },
            PeerEvent::Closed { error } => {
                // Not self-initiated (those are stale-dropped above): the
                // partner or the network went away.
                self.notice(Notice::PartnerLeft {
                    message: match &error {
                        Some(err) => format!("connection to partner lost: {}", err),
                        None => "your partner disconnected".to_string(),
                    },
                });
                self.partner_gone(error);
            }
        }
    }

    /// Remote-initiated end of session: tear down, then immediately search
    /// again.
    fn partner_gone(&mut self, error: Option<String>) {
        if let Some(err) = error {
            debug!(%err, "peer connection ended with error");
        }
        self.teardown_peer();
        self.vacate_room();
        self.set_state(ConnectionState::Disconnected);
        self.begin_search();
    }

    // ── Shared helpers ──────────────────────────────────────

    fn begin_search(&mut self) {
        self.set_state(ConnectionState::Searching);
        self.notice(Notice::Searching);
        self.transport.send(ClientMessage::Find);
    }

    /// Idempotent: the live id is cleared first, so a second call (or any
    /// callback the old peer still fires) is a no-op.
    fn teardown_peer(&mut self) {
        self.live_peer = None;
        if let Some(mut peer) = self.peer.take() {
            peer.teardown();
        }
    }

    fn vacate_room(&mut self) -> Option<String> {
        self.role = None;
        self.peer_info = None;
        self.queue.clear();
        self.room.take()
    }

    /// A voice room persisted by a previous run (the process died or the
    /// page reloaded while paired) left the partner hanging; vacate it as
    /// soon as the transport is up. The room currently held is never stale.
    fn release_stale_voice_room(&mut self) {
        if self.mode != ChatMode::Voice {
            return;
        }
        let Some(stale) = self.store.last_voice_room() else {
            return;
        };
        if self.room.as_deref() == Some(stale.as_str()) {
            return;
        }
        info!(room = %stale, "vacating voice room left over from a previous session");
        self.transport.send(ClientMessage::Leave { room: stale });
        self.store.set_last_voice_room(None);
    }

    fn send_peer_keepalive(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if let Some(peer) = self.peer.as_ref() {
            // Failures are the peer implementation's to log; they never
            // drive teardown.
            peer.send_data(&keepalive::liveness_payload());
        }
    }

    /// True while inside the debounce window. An accepted intent opens a new
    /// window; ignored intents do not extend it.
    fn cooldown_active(&mut self) -> bool {
        let now = Instant::now();
        if let Some(until) = self.cooldown_until {
            if now < until {
                return true;
            }
        }
        self.cooldown_until = Some(now + self.config.intent_cooldown);
        false
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
        let _ = self.events.send(ControllerEvent::StateChanged(next));
    }

    fn notice(&self, notice: Notice) {
        let _ = self.events.send(ControllerEvent::Notice(notice));
    }

    fn error(&self, error: DriftError) {
        let _ = self.events.send(ControllerEvent::Error(error));
    }

    fn shutdown(&mut self) {
        self.teardown_peer();
        if let Some(room) = self.vacate_room() {
            self.transport.send(ClientMessage::Leave { room });
        }
        // The stream was held for the whole page-level session; release it
        // only now, on navigation away.
        self.local_media = None;
        self.transport.shutdown();
        self.set_state(ConnectionState::Idle);
    }
}
