//! Reconnecting websocket implementation of the transport channel.
//!
//! One spawned task owns the socket for the channel's whole life: it dials,
//! authenticates with the persisted session id, bridges frames onto the
//! event channel, and on unexpected disconnects retries forever with capped
//! exponential backoff, unless the server bans this identity, which latches
//! the channel closed permanently.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use drift_proto::{ChatMode, ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};

use super::{SignalingChannel, TransportEvent, backoff_delay};
use crate::config::Config;
use crate::storage::SessionStore;

/// Close code the server uses when dropping a banned client at the websocket
/// layer instead of (or in addition to) the `banned` message.
const CLOSE_CODE_BANNED: u16 = 4403;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why the connected loop ended.
enum SessionEnd {
    /// Socket dropped or errored; reconnect.
    Dropped(String),
    /// Ban latch; never reconnect.
    Banned,
    /// Caller shut the channel down.
    Shutdown,
}

pub struct WebSocketChannel {
    out_tx: mpsc::UnboundedSender<ClientMessage>,
    connected: Arc<AtomicBool>,
    banned: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    /// Wakes the backoff sleep early (page foregrounded) and unblocks
    /// shutdown.
    wake: Arc<Notify>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WebSocketChannel {
    /// Spawn the channel task for one chat mode. Events flow to `events`
    /// until shutdown or a ban.
    pub fn spawn(
        config: &Config,
        mode: ChatMode,
        store: Arc<dyn SessionStore>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            out_tx,
            connected: Arc::new(AtomicBool::new(false)),
            banned: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            task: parking_lot::Mutex::new(None),
        });

        let url = format!(
            "{}/ws/{}",
            config.server_url.trim_end_matches('/'),
            mode.namespace()
        );
        let runner = Runner {
            url,
            store,
            events,
            keepalive: config.keepalive_interval,
            reconnect_initial: config.reconnect_initial,
            reconnect_max: config.reconnect_max,
            connected: channel.connected.clone(),
            banned: channel.banned.clone(),
            shutdown: channel.shutdown.clone(),
            wake: channel.wake.clone(),
        };
        let handle = tokio::spawn(runner.run(out_rx));
        *channel.task.lock() = Some(handle);
        channel
    }
}

impl SignalingChannel for WebSocketChannel {
    fn send(&self, msg: ClientMessage) {
        if self.banned.load(Ordering::SeqCst) || !self.connected.load(Ordering::SeqCst) {
            debug!(?msg, "dropping outbound message: channel not connected");
            return;
        }
        // Receiver only goes away on shutdown.
        let _ = self.out_tx.send(msg);
    }

    fn resume(&self) {
        self.wake.notify_waiters();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

struct Runner {
    url: String,
    store: Arc<dyn SessionStore>,
    events: mpsc::UnboundedSender<TransportEvent>,
    keepalive: std::time::Duration,
    reconnect_initial: std::time::Duration,
    reconnect_max: std::time::Duration,
    connected: Arc<AtomicBool>,
    banned: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Runner {
    async fn run(self, mut out_rx: mpsc::UnboundedReceiver<ClientMessage>) {
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.load(Ordering::SeqCst) || self.banned.load(Ordering::SeqCst) {
                return;
            }

            match connect_async(&self.url).await {
                Ok((ws, _response)) => {
                    attempt = 0;
                    let end = self.run_session(ws, &mut out_rx).await;
                    self.connected.store(false, Ordering::SeqCst);
                    match end {
                        SessionEnd::Dropped(reason) => {
                            let _ = self.events.send(TransportEvent::Disconnected { reason });
                        }
                        SessionEnd::Banned => {
                            self.banned.store(true, Ordering::SeqCst);
                            return;
                        }
                        SessionEnd::Shutdown => return,
                    }
                }
                Err(err) => {
                    let _ = self.events.send(TransportEvent::ReconnectFailed {
                        error: err.to_string(),
                    });
                }
            }

            let delay = backoff_delay(attempt, self.reconnect_initial, self.reconnect_max);
            attempt = attempt.saturating_add(1);
            let _ = self.events.send(TransportEvent::Reconnecting { attempt, delay });
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.wake.notified() => {
                    trace!("backoff sleep interrupted, retrying now");
                }
            }
        }
    }

    /// Drive one connected session until the socket drops, the server bans
    /// us, or the caller shuts down.
    async fn run_session(
        &self,
        ws: WsStream,
        out_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        // Authenticate before anything else so the server can recognize a
        // returning client.
        let auth = ClientMessage::Auth {
            session_id: self.store.session_id(),
        };
        if let Err(err) = send_json(&mut sink, &auth).await {
            return SessionEnd::Dropped(format!("auth send failed: {}", err));
        }

        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Connected);

        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.keepalive,
            self.keepalive,
        );

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }

            tokio::select! {
                out = out_rx.recv() => match out {
                    Some(msg) => {
                        if let Err(err) = send_json(&mut sink, &msg).await {
                            return SessionEnd::Dropped(format!("send failed: {}", err));
                        }
                    }
                    None => return SessionEnd::Shutdown,
                },
                _ = ping.tick() => {
                    if let Err(err) = send_json(&mut sink, &ClientMessage::Ping).await {
                        return SessionEnd::Dropped(format!("ping failed: {}", err));
                    }
                }
                _ = self.wake.notified() => {
                    // Nothing to do while connected; loop re-checks shutdown.
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(end) = self.handle_text(&text) {
                            return end;
                        }
                    }
                    Some(Ok(Message::Close(close))) => {
                        if let Some(ref frame) = close {
                            if u16::from(frame.code) == CLOSE_CODE_BANNED {
                                let _ = self.events.send(TransportEvent::BannedClosed {
                                    message: frame.reason.to_string(),
                                });
                                return SessionEnd::Banned;
                            }
                        }
                        let reason = close
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by server".to_string());
                        return SessionEnd::Dropped(reason);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(other)) => {
                        trace!(?other, "ignoring non-text frame");
                    }
                    Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
                    None => return SessionEnd::Dropped("stream ended".to_string()),
                },
            }
        }
    }

    /// Returns `Some` when the message terminates the session.
    fn handle_text(&self, text: &str) -> Option<SessionEnd> {
        let msg: ServerMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, "dropping unparseable server message");
                return None;
            }
        };

        match msg {
            ServerMessage::SessionIssued { ref session_id } => {
                // Persist before forwarding so a crash right after still
                // resumes with the fresh id.
                self.store.set_session_id(session_id);
                let _ = self.events.send(TransportEvent::Message(msg));
                None
            }
            ServerMessage::Banned { message } | ServerMessage::DuplicateConnection { message } => {
                let _ = self.events.send(TransportEvent::BannedClosed { message });
                Some(SessionEnd::Banned)
            }
            ServerMessage::Pong => None,
            other => {
                let _ = self.events.send(TransportEvent::Message(other));
                None
            }
        }
    }
}

async fn send_json<S>(sink: &mut S, msg: &ClientMessage) -> Result<(), String>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}
