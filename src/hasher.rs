//! Frame hashing and desync detection.
//!
//! After each *confirmed* frame (never a predicted one), the engine computes
//! an 8-byte digest of the environment's canonical state and exchanges it
//! with its peers. A mismatch for the same confirmed frame means the
//! simulations have diverged — a determinism bug, not a network condition —
//! and is recorded as a [`DesyncEvent`].
//!
//! # Canonical form
//!
//! Digests must be comparable across runtimes, so the hashed serialization is
//! normalized before hashing:
//!
//! - object keys are sorted,
//! - floats are rounded to 10 decimal places (different math libraries
//!   disagree in the last ulps; 10 digits is far beyond any legitimate
//!   simulation difference),
//! - the primary RNG stream state is appended, so two states that agree on
//!   the environment but diverge in randomness still hash differently.
//!
//! Environment states that are not JSON are hashed as raw bytes; the
//! determinism contract then falls entirely on the collaborator's
//! serializer.
//!
//! The digest is the first 8 bytes of a SHA-256 over the canonical bytes.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use sha2::{Digest, Sha256};

use crate::{Digest8, Frame, ParticipantIndex};

/// How the engine responds to a detected desync.
///
/// Chosen at session creation. The default is to log and continue: for
/// research fidelity a diverged-but-complete episode with a marked divergence
/// point is worth more than an aborted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DesyncPolicy {
    /// Record the event, keep simulating.
    #[default]
    LogOnly,
    /// Record the event and request a state transfer from the peer with the
    /// lower participant index.
    RequestStateTransfer,
}

/// A recorded divergence between local and peer state digests.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DesyncEvent {
    /// The confirmed frame at which digests disagreed.
    pub frame: Frame,
    /// Our digest.
    pub local: Digest8,
    /// The peer's digest.
    pub peer: Digest8,
    /// Which peer disagreed.
    pub peer_index: ParticipantIndex,
    /// Unix timestamp in milliseconds at detection.
    pub timestamp_ms: u128,
    /// Local canonical state at the divergence point, when the engine was
    /// configured to capture dumps.
    pub state_dump: Option<Vec<u8>>,
}

/// Result of feeding a peer digest into the hasher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOutcome {
    /// Digests agree; the verified watermark advanced (or stayed put).
    Verified {
        /// The frame that was verified.
        frame: Frame,
    },
    /// Digests disagree; a [`DesyncEvent`] was recorded if this is a new
    /// divergence point.
    Mismatch {
        /// The event, present only for the first mismatch of a divergence.
        event: Option<DesyncEvent>,
    },
    /// The local hash for that frame does not exist yet; the peer digest was
    /// buffered and will be retried when the local hash is produced.
    Buffered,
}

/// Computes the canonical digest of an environment state.
#[must_use]
pub fn digest_state(env_state: &[u8], rng_state: u32) -> Digest8 {
    let mut hasher = Sha256::new();
    match serde_json::from_slice::<serde_json::Value>(env_state) {
        Ok(value) => {
            let mut canonical = String::new();
            write_canonical(&value, &mut canonical);
            hasher.update(canonical.as_bytes());
        },
        Err(_) => hasher.update(env_state),
    }
    hasher.update(b"|rng:");
    hasher.update(rng_state.to_be_bytes());

    let full = hasher.finalize();
    let mut first8 = [0u8; 8];
    first8.copy_from_slice(&full[..8]);
    Digest8(first8)
}

/// Writes `value` in canonical form: sorted keys, floats rounded to 10
/// decimal places.
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use std::fmt::Write as _;
    match value {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let _ = write!(out, "{i}");
            } else if let Some(u) = n.as_u64() {
                let _ = write!(out, "{u}");
            } else {
                let rounded = round10(n.as_f64().unwrap_or(0.0));
                let _ = write!(out, "{rounded}");
            }
        },
        serde_json::Value::String(s) => {
            // serde_json's string escaping is deterministic.
            match serde_json::to_string(s) {
                Ok(escaped) => out.push_str(&escaped),
                Err(_) => out.push_str("\"\""),
            }
        },
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, &serde_json::Value> = map.iter().collect();
            out.push('{');
            for (i, (key, item)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                match serde_json::to_string(key) {
                    Ok(escaped) => out.push_str(&escaped),
                    Err(_) => out.push_str("\"\""),
                }
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        },
    }
}

/// Rounds to 10 decimal places.
fn round10(x: f64) -> f64 {
    (x * 1e10).round() / 1e10
}

/// Per-session hash bookkeeping: local digests, buffered peer digests, the
/// verified watermark and recorded desyncs.
#[derive(Debug, Default)]
pub struct FrameHasher {
    local: BTreeMap<Frame, Digest8>,
    pending_peer: BTreeMap<Frame, Vec<(ParticipantIndex, Digest8)>>,
    outbound: VecDeque<(Frame, Digest8)>,
    verified: Option<Frame>,
    desyncs: Vec<DesyncEvent>,
    /// True while inside a divergence run; suppresses duplicate events until
    /// a frame verifies again.
    diverged: bool,
    policy: DesyncPolicy,
}

impl FrameHasher {
    /// Creates a hasher with the given desync policy.
    #[must_use]
    pub fn new(policy: DesyncPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// The configured desync response policy.
    #[must_use]
    pub fn policy(&self) -> DesyncPolicy {
        self.policy
    }

    /// Records the local digest for a newly confirmed frame, queues it for
    /// transmission, and resolves any buffered peer digests for that frame.
    ///
    /// Returns the outcomes of resolved peer digests (empty when none were
    /// buffered).
    pub fn record_local(&mut self, frame: Frame, digest: Digest8) -> Vec<HashOutcome> {
        self.local.insert(frame, digest);
        self.outbound.push_back((frame, digest));

        let mut outcomes = Vec::new();
        if let Some(buffered) = self.pending_peer.remove(&frame) {
            for (peer_index, peer_digest) in buffered {
                outcomes.push(self.compare(frame, peer_index, peer_digest));
            }
        }
        outcomes
    }

    /// Feeds a peer digest: compares when the local hash exists, otherwise
    /// buffers for retry.
    pub fn on_peer_digest(
        &mut self,
        frame: Frame,
        peer_index: ParticipantIndex,
        digest: Digest8,
    ) -> HashOutcome {
        if self.local.contains_key(&frame) {
            self.compare(frame, peer_index, digest)
        } else {
            self.pending_peer
                .entry(frame)
                .or_default()
                .push((peer_index, digest));
            HashOutcome::Buffered
        }
    }

    fn compare(
        &mut self,
        frame: Frame,
        peer_index: ParticipantIndex,
        peer_digest: Digest8,
    ) -> HashOutcome {
        let local = match self.local.get(&frame) {
            Some(digest) => *digest,
            None => return HashOutcome::Buffered,
        };
        if local == peer_digest {
            self.diverged = false;
            self.verified = Some(match self.verified {
                Some(previous) => previous.max(frame),
                None => frame,
            });
            HashOutcome::Verified { frame }
        } else {
            let event = if self.diverged {
                // Still inside the same divergence; one event per divergence
                // point is enough.
                None
            } else {
                self.diverged = true;
                let event = DesyncEvent {
                    frame,
                    local,
                    peer: peer_digest,
                    peer_index,
                    timestamp_ms: now_ms(),
                    state_dump: None,
                };
                self.desyncs.push(event.clone());
                tracing::error!(
                    frame = %frame,
                    local = %local,
                    peer = %peer_digest,
                    "desync detected"
                );
                Some(event)
            };
            HashOutcome::Mismatch { event }
        }
    }

    /// Drains digests queued for transmission to peers.
    pub fn take_outbound(&mut self) -> Vec<(Frame, Digest8)> {
        self.outbound.drain(..).collect()
    }

    /// Drops local hashes (and queued outbound digests) with
    /// `frame >= target`. Called on entry to rollback; peers will receive
    /// the recomputed digests after replay confirms.
    pub fn invalidate_from(&mut self, target: Frame) {
        self.local.retain(|frame, _| *frame < target);
        self.outbound.retain(|(frame, _)| *frame < target);
    }

    /// The largest frame at which peer hashes agreed.
    #[must_use]
    pub fn verified_frame(&self) -> Option<Frame> {
        self.verified
    }

    /// Returns the local digest recorded for `frame`.
    #[must_use]
    pub fn local_digest(&self, frame: Frame) -> Option<Digest8> {
        self.local.get(&frame).copied()
    }

    /// All recorded desync events, in detection order.
    #[must_use]
    pub fn desync_events(&self) -> &[DesyncEvent] {
        &self.desyncs
    }

    /// Clears all state at an episode boundary.
    pub fn clear(&mut self) {
        self.local.clear();
        self.pending_peer.clear();
        self.outbound.clear();
        self.verified = None;
        self.desyncs.clear();
        self.diverged = false;
    }
}

fn now_ms() -> u128 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_for_identical_state() {
        let state = br#"{"a": 1, "b": [1.5, 2.25]}"#;
        assert_eq!(digest_state(state, 7), digest_state(state, 7));
    }

    #[test]
    fn digest_ignores_key_order() {
        let left = br#"{"a": 1, "b": 2}"#;
        let right = br#"{"b": 2, "a": 1}"#;
        assert_eq!(digest_state(left, 0), digest_state(right, 0));
    }

    #[test]
    fn digest_rounds_floats_to_ten_places() {
        let left = br#"{"x": 0.12345678901}"#;
        let right = br#"{"x": 0.12345678899}"#;
        assert_eq!(digest_state(left, 0), digest_state(right, 0));

        let far = br#"{"x": 0.12345679}"#;
        assert_ne!(digest_state(left, 0), digest_state(far, 0));
    }

    #[test]
    fn digest_includes_rng_stream() {
        let state = br#"{"a": 1}"#;
        assert_ne!(digest_state(state, 1), digest_state(state, 2));
    }

    #[test]
    fn non_json_state_hashes_raw_bytes() {
        let left = [0u8, 1, 2, 3];
        let right = [0u8, 1, 2, 4];
        assert_ne!(digest_state(&left, 0), digest_state(&right, 0));
        assert_eq!(digest_state(&left, 0), digest_state(&left, 0));
    }

    #[test]
    fn peer_digest_before_local_is_buffered_then_resolved() {
        let mut hasher = FrameHasher::new(DesyncPolicy::LogOnly);
        let digest = digest_state(b"{}", 0);

        let outcome = hasher.on_peer_digest(Frame::new(0), ParticipantIndex::new(1), digest);
        assert_eq!(outcome, HashOutcome::Buffered);

        let outcomes = hasher.record_local(Frame::new(0), digest);
        assert_eq!(
            outcomes,
            vec![HashOutcome::Verified {
                frame: Frame::new(0)
            }]
        );
        assert_eq!(hasher.verified_frame(), Some(Frame::new(0)));
    }

    #[test]
    fn mismatch_records_one_event_per_divergence() {
        let mut hasher = FrameHasher::new(DesyncPolicy::LogOnly);
        let ours = digest_state(b"{\"x\": 1}", 0);
        let theirs = digest_state(b"{\"x\": 2}", 0);

        hasher.record_local(Frame::new(0), ours);
        hasher.record_local(Frame::new(1), ours);

        let first = hasher.on_peer_digest(Frame::new(0), ParticipantIndex::new(1), theirs);
        assert!(matches!(first, HashOutcome::Mismatch { event: Some(_) }));

        // Second mismatch in the same divergence run: suppressed.
        let second = hasher.on_peer_digest(Frame::new(1), ParticipantIndex::new(1), theirs);
        assert!(matches!(second, HashOutcome::Mismatch { event: None }));
        assert_eq!(hasher.desync_events().len(), 1);
    }

    #[test]
    fn verification_resets_divergence_tracking() {
        let mut hasher = FrameHasher::new(DesyncPolicy::LogOnly);
        let ours = digest_state(b"{\"x\": 1}", 0);
        let theirs = digest_state(b"{\"x\": 2}", 0);

        hasher.record_local(Frame::new(0), ours);
        hasher.on_peer_digest(Frame::new(0), ParticipantIndex::new(1), theirs);

        hasher.record_local(Frame::new(1), ours);
        let outcome = hasher.on_peer_digest(Frame::new(1), ParticipantIndex::new(1), ours);
        assert!(matches!(outcome, HashOutcome::Verified { .. }));

        // A later mismatch is a fresh divergence point.
        hasher.record_local(Frame::new(2), ours);
        let outcome = hasher.on_peer_digest(Frame::new(2), ParticipantIndex::new(1), theirs);
        assert!(matches!(outcome, HashOutcome::Mismatch { event: Some(_) }));
        assert_eq!(hasher.desync_events().len(), 2);
    }

    #[test]
    fn invalidate_from_drops_local_and_outbound() {
        let mut hasher = FrameHasher::new(DesyncPolicy::LogOnly);
        let digest = digest_state(b"{}", 0);
        for frame in 0..5 {
            hasher.record_local(Frame::new(frame), digest);
        }
        hasher.invalidate_from(Frame::new(2));

        assert!(hasher.local_digest(Frame::new(1)).is_some());
        assert!(hasher.local_digest(Frame::new(2)).is_none());
        let outbound = hasher.take_outbound();
        assert_eq!(outbound.len(), 2);
    }
}
