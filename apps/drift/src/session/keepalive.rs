//! Peer-level liveness payloads.
//!
//! While a session is connected, a small keepalive message rides the peer
//! data channel on the same interval as the transport ping. It exists to
//! flush out half-open connections that neither side's error callbacks
//! notice; a failure to *send* one is logged and ignored, since teardown is
//! always driven by the peer object's own close/error events.

use drift_proto::DataMessage;

/// Serialized liveness payload for the data channel.
pub fn liveness_payload() -> Vec<u8> {
    // DataMessage::Keepalive has no dynamic fields; serialization cannot
    // fail.
    serde_json::to_vec(&DataMessage::Keepalive).unwrap_or_default()
}

/// Decode an inbound data-channel frame. `None` for frames that are not
/// valid `DataMessage`s (tolerated: the channel is best-effort).
pub fn decode_data(bytes: &[u8]) -> Option<DataMessage> {
    serde_json::from_slice(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_roundtrip() {
        assert_eq!(
            decode_data(&liveness_payload()),
            Some(DataMessage::Keepalive)
        );
    }

    #[test]
    fn garbage_decodes_to_none() {
        assert_eq!(decode_data(b"\xff\xfe"), None);
        assert_eq!(decode_data(b"{}"), None);
    }
}
