//! Wire protocol between a drift client and the rendezvous server.
//!
//! Each chat mode (text, voice, video) uses its own logical channel; the
//! message vocabulary is identical across modes. Signaling payloads are
//! opaque `serde_json::Value`s; the server relays them without inspection.

use serde::{Deserialize, Serialize};

/// Chat modes. Each mode gets an isolated server-side namespace so state in
/// one mode cannot leak into another.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    Text,
    Voice,
    Video,
}

impl ChatMode {
    /// Path segment of the per-mode websocket endpoint (`/ws/<segment>`).
    pub fn namespace(&self) -> &'static str {
        match self {
            ChatMode::Text => "text",
            ChatMode::Voice => "voice",
            ChatMode::Video => "video",
        }
    }

    pub fn wants_media(&self) -> bool {
        !matches!(self, ChatMode::Text)
    }
}

impl std::fmt::Display for ChatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.namespace())
    }
}

impl std::str::FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ChatMode::Text),
            "voice" => Ok(ChatMode::Voice),
            "video" => Ok(ChatMode::Video),
            other => Err(format!("unknown chat mode '{}'", other)),
        }
    }
}

/// Which side creates the initial negotiation offer. Fixed for the lifetime
/// of a room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn is_initiator(&self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// Partner metadata attached to a match. Opaque to the negotiation core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PeerInfo {
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// Messages sent from the client to the rendezvous server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame after every (re)connect. Presents the previously issued
    /// session id, if any, for server-side identity continuity.
    Auth {
        session_id: Option<String>,
    },
    /// Request a partner.
    Find,
    /// Abandon a pending search.
    Cancel,
    /// Vacate the room and immediately search again.
    Next {
        room: String,
    },
    /// Vacate the room without searching again.
    Leave {
        room: String,
    },
    /// Relay an opaque signaling payload to the partner in `room`.
    Signal {
        room: String,
        payload: serde_json::Value,
    },
    /// Transport-level liveness ping.
    Ping,
}

/// Messages received from the rendezvous server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Server-issued identity, persisted client-side across reloads.
    SessionIssued {
        session_id: String,
    },
    /// A partner was found.
    Match {
        room: String,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_info: Option<PeerInfo>,
    },
    NoMatch {
        message: String,
    },
    SearchCancelled {
        message: String,
    },
    NoUsersOnline {
        message: String,
    },
    /// Opaque signaling payload relayed from the partner.
    Signal {
        room: String,
        payload: serde_json::Value,
    },
    /// The partner vacated `room`.
    Leave {
        room: String,
    },
    /// This identity is banned. Terminal: the client must stop reconnecting.
    Banned {
        message: String,
    },
    /// The partner was banned mid-session.
    PartnerBanned {
        message: String,
    },
    /// Another connection is already using this session id.
    DuplicateConnection {
        message: String,
    },
    Pong,
}

/// Messages exchanged directly between paired clients over the peer data
/// channel, once negotiation is complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataMessage {
    /// A chat line typed by the partner.
    Chat { text: String },
    /// Peer-level liveness payload, distinct from protocol signaling.
    Keepalive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_wire_shape() {
        let msg = ClientMessage::Signal {
            room: "r1".into(),
            payload: serde_json::json!({"kind": "offer", "sdp": "v=0"}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"signal\""));
        assert!(json.contains("\"room\":\"r1\""));
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn auth_without_session_id() {
        let json = serde_json::to_string(&ClientMessage::Auth { session_id: None }).unwrap();
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ClientMessage::Auth { session_id: None });
    }

    #[test]
    fn match_roundtrip_with_and_without_peer_info() {
        let with = ServerMessage::Match {
            room: "abc".into(),
            role: Role::Initiator,
            peer_info: Some(PeerInfo {
                id: Some("p2".into()),
                country: None,
            }),
        };
        let without = ServerMessage::Match {
            room: "abc".into(),
            role: Role::Responder,
            peer_info: None,
        };
        for msg in [with, without] {
            let json = serde_json::to_string(&msg).unwrap();
            let back: ServerMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn role_is_snake_case_on_the_wire() {
        assert_eq!(serde_json::to_string(&Role::Initiator).unwrap(), "\"initiator\"");
        assert_eq!(serde_json::to_string(&Role::Responder).unwrap(), "\"responder\"");
    }

    #[test]
    fn unknown_server_message_is_an_error_not_a_panic() {
        let err = serde_json::from_str::<ServerMessage>(r#"{"type":"confetti"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn mode_namespaces_are_distinct() {
        assert_eq!(ChatMode::Text.namespace(), "text");
        assert_eq!(ChatMode::Voice.namespace(), "voice");
        assert_eq!(ChatMode::Video.namespace(), "video");
        assert!(!ChatMode::Text.wants_media());
        assert!(ChatMode::Video.wants_media());
    }

    #[test]
    fn data_message_keepalive_is_flat() {
        assert_eq!(
            serde_json::to_string(&DataMessage::Keepalive).unwrap(),
            r#"{"kind":"keepalive"}"#
        );
        let chat: DataMessage = serde_json::from_str(r#"{"kind":"chat","text":"hi"}"#).unwrap();
        assert_eq!(chat, DataMessage::Chat { text: "hi".into() });
    }

    #[test]
    fn mode_parses_from_cli_string() {
        assert_eq!("voice".parse::<ChatMode>().unwrap(), ChatMode::Voice);
        assert!("carrier-pigeon".parse::<ChatMode>().is_err());
    }
}
