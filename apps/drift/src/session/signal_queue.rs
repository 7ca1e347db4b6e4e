//! Buffering and deduplication of inbound signaling payloads.
//!
//! Two transport realities drive this module: the partner may start sending
//! signaling data before our peer object exists, and the server may deliver
//! the same payload more than once. Payloads are deduplicated by content
//! digest in a bounded insertion-ordered set, and payloads that arrive early
//! are queued FIFO until the peer object shows up.
//!
//! Room matching is the caller's job: a payload for a stale room must be
//! dropped *before* it reaches this queue so that it mutates neither the
//! dedup set nor the buffer.

use std::collections::{HashSet, VecDeque};

use serde_json::Value;
use sha2::{Digest, Sha256};

type PayloadDigest = [u8; 16];

/// What to do with an accepted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    /// Already seen; drop silently.
    Duplicate,
    /// Peer object exists; apply now.
    Apply,
    /// No peer object yet; buffered, will come out of `drain`.
    Queued,
}

pub struct SignalQueue {
    seen: HashSet<PayloadDigest>,
    seen_order: VecDeque<PayloadDigest>,
    pending: VecDeque<Value>,
    capacity: usize,
}

impl SignalQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            pending: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a payload for the *current* room. `peer_ready` says whether a
    /// peer object exists to apply it to.
    pub fn accept(&mut self, payload: &Value, peer_ready: bool) -> SignalDisposition {
        let digest = digest_of(payload);
        if self.seen.contains(&digest) {
            return SignalDisposition::Duplicate;
        }
        if self.seen_order.len() == self.capacity {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(digest);
        self.seen_order.push_back(digest);

        if peer_ready {
            SignalDisposition::Apply
        } else {
            self.pending.push_back(payload.clone());
            SignalDisposition::Queued
        }
    }

    /// Take every buffered payload in arrival order. Called exactly once
    /// per peer object, when it becomes available.
    pub fn drain(&mut self) -> Vec<Value> {
        self.pending.drain(..).collect()
    }

    /// Reset both structures. Called on every room change so neither grows
    /// across a long session.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.seen_order.clear();
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn digest_of(payload: &Value) -> PayloadDigest {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let full = Sha256::digest(&bytes);
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&full[..16]);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplicate_payload_applied_once() {
        let mut q = SignalQueue::new(16);
        let payload = json!({"kind": "offer", "sdp": "v=0"});
        assert_eq!(q.accept(&payload, true), SignalDisposition::Apply);
        assert_eq!(q.accept(&payload, true), SignalDisposition::Duplicate);
    }

    #[test]
    fn early_signals_drain_in_arrival_order() {
        let mut q = SignalQueue::new(16);
        let a = json!({"kind": "ice", "c": "a"});
        let b = json!({"kind": "ice", "c": "b"});
        let c = json!({"kind": "ice", "c": "c"});
        for p in [&a, &b, &c] {
            assert_eq!(q.accept(p, false), SignalDisposition::Queued);
        }
        assert_eq!(q.drain(), vec![a, b, c]);
        assert_eq!(q.pending_len(), 0);

        // A signal arriving after the peer exists applies immediately and
        // never re-enters the buffer.
        let d = json!({"kind": "ice", "c": "d"});
        assert_eq!(q.accept(&d, true), SignalDisposition::Apply);
        assert!(q.drain().is_empty());
    }

    #[test]
    fn duplicate_of_queued_payload_is_not_queued_twice() {
        let mut q = SignalQueue::new(16);
        let a = json!({"kind": "ice", "c": "a"});
        assert_eq!(q.accept(&a, false), SignalDisposition::Queued);
        assert_eq!(q.accept(&a, false), SignalDisposition::Duplicate);
        assert_eq!(q.drain().len(), 1);
    }

    #[test]
    fn clear_forgets_digests_and_buffer() {
        let mut q = SignalQueue::new(16);
        let a = json!({"kind": "offer"});
        assert_eq!(q.accept(&a, false), SignalDisposition::Queued);
        q.clear();
        assert_eq!(q.pending_len(), 0);
        // Same content is fresh again in the new room.
        assert_eq!(q.accept(&a, true), SignalDisposition::Apply);
    }

    #[test]
    fn dedup_set_is_bounded() {
        let mut q = SignalQueue::new(4);
        for i in 0..5 {
            q.accept(&json!({ "i": i }), true);
        }
        // Oldest digest was evicted, so payload 0 reads as new again.
        assert_eq!(q.accept(&json!({"i": 0}), true), SignalDisposition::Apply);
        // A recent one is still remembered.
        assert_eq!(
            q.accept(&json!({"i": 4}), true),
            SignalDisposition::Duplicate
        );
    }
}
