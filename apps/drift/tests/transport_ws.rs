//! Websocket transport tests against a real in-process server socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use drift_client_core::config::Config;
use drift_client_core::storage::{MemorySessionStore, SessionStore};
use drift_client_core::transport::{SignalingChannel, TransportEvent, WebSocketChannel};
use drift_proto::{ChatMode, ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

fn test_config(addr: std::net::SocketAddr) -> Config {
    Config {
        server_url: format!("ws://{}", addr),
        reconnect_initial: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
        ..Config::default()
    }
}

async fn bind() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Read frames until a text one arrives and parse it as a client message.
async fn read_client_message(ws: &mut WebSocketStream<TcpStream>) -> ClientMessage {
    loop {
        match ws.next().await.expect("socket closed early").unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

async fn send_server_message(ws: &mut WebSocketStream<TcpStream>, msg: &ServerMessage) {
    let json = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

/// Wait for an event matching `pred`, failing the test after two seconds.
async fn expect_event<F>(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    pred: F,
) -> TransportEvent
where
    F: Fn(&TransportEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for transport event")
}

#[tokio::test]
async fn auth_is_the_first_frame_and_the_issued_id_is_persisted() {
    let (listener, addr) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let first = read_client_message(&mut ws).await;
        send_server_message(
            &mut ws,
            &ServerMessage::SessionIssued {
                session_id: "sess-42".into(),
            },
        )
        .await;
        // Hold the socket open until the client shuts down.
        while ws.next().await.is_some() {}
        first
    });

    let store = Arc::new(MemorySessionStore::default());
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = WebSocketChannel::spawn(
        &test_config(addr),
        ChatMode::Text,
        store.clone(),
        events_tx,
    );

    expect_event(&mut events, |e| matches!(e, TransportEvent::Connected)).await;
    expect_event(&mut events, |e| {
        matches!(
            e,
            TransportEvent::Message(ServerMessage::SessionIssued { .. })
        )
    })
    .await;
    assert_eq!(store.session_id(), Some("sess-42".to_string()));
    assert!(channel.is_connected());

    channel.shutdown();
    let first = server.await.unwrap();
    assert_eq!(first, ClientMessage::Auth { session_id: None });
}

#[tokio::test]
async fn reconnect_resumes_with_the_persisted_session_id() {
    let (listener, addr) = bind().await;
    let server = tokio::spawn(async move {
        // First connection: issue an id, then drop the socket.
        let mut ws = accept_ws(&listener).await;
        let first_auth = read_client_message(&mut ws).await;
        send_server_message(
            &mut ws,
            &ServerMessage::SessionIssued {
                session_id: "sess-42".into(),
            },
        )
        .await;
        drop(ws);

        // Second connection: the client should present the issued id.
        let mut ws = accept_ws(&listener).await;
        let second_auth = read_client_message(&mut ws).await;
        while ws.next().await.is_some() {}
        (first_auth, second_auth)
    });

    let store = Arc::new(MemorySessionStore::default());
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = WebSocketChannel::spawn(
        &test_config(addr),
        ChatMode::Text,
        store.clone(),
        events_tx,
    );

    expect_event(&mut events, |e| matches!(e, TransportEvent::Connected)).await;
    expect_event(&mut events, |e| {
        matches!(e, TransportEvent::Disconnected { .. })
    })
    .await;
    expect_event(&mut events, |e| {
        matches!(e, TransportEvent::Reconnecting { .. })
    })
    .await;
    expect_event(&mut events, |e| matches!(e, TransportEvent::Connected)).await;

    channel.shutdown();
    let (first_auth, second_auth) = server.await.unwrap();
    assert_eq!(first_auth, ClientMessage::Auth { session_id: None });
    assert_eq!(
        second_auth,
        ClientMessage::Auth {
            session_id: Some("sess-42".to_string()),
        }
    );
}

#[tokio::test]
async fn a_ban_latches_the_channel_closed_with_no_reconnect() {
    let (listener, addr) = bind().await;
    let connections = Arc::new(AtomicU32::new(0));
    let server_connections = connections.clone();
    tokio::spawn(async move {
        loop {
            let mut ws = accept_ws(&listener).await;
            server_connections.fetch_add(1, Ordering::SeqCst);
            let _auth = read_client_message(&mut ws).await;
            send_server_message(
                &mut ws,
                &ServerMessage::Banned {
                    message: "you are banned".into(),
                },
            )
            .await;
            while ws.next().await.is_some() {}
        }
    });

    let store = Arc::new(MemorySessionStore::default());
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel =
        WebSocketChannel::spawn(&test_config(addr), ChatMode::Text, store, events_tx);

    let banned = expect_event(&mut events, |e| {
        matches!(e, TransportEvent::BannedClosed { .. })
    })
    .await;
    match banned {
        TransportEvent::BannedClosed { message } => assert_eq!(message, "you are banned"),
        other => panic!("unexpected event: {:?}", other),
    }

    // Several backoff windows pass; a non-banned client would have redialed.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert!(!channel.is_connected());
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, TransportEvent::Connected),
            "banned channel reconnected: {:?}",
            event
        );
    }
}

#[tokio::test]
async fn outbound_messages_reach_the_server_verbatim() {
    let (listener, addr) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let _auth = read_client_message(&mut ws).await;
        read_client_message(&mut ws).await
    });

    let store = Arc::new(MemorySessionStore::default());
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel =
        WebSocketChannel::spawn(&test_config(addr), ChatMode::Text, store, events_tx);

    expect_event(&mut events, |e| matches!(e, TransportEvent::Connected)).await;
    channel.send(ClientMessage::Find);

    let received = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, ClientMessage::Find);
    channel.shutdown();
}
