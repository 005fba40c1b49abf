//! Client-side view of the signaling relay.
//!
//! The signaling server carries session formation (player assignment, SDP
//! and ICE exchange, probe orchestration) and a low-rate fallback path for
//! inputs and digests while the P2P channel is down. It is *not* simulation
//! transport: when the relay carries a `PlayerAction`, that is an explicit
//! degradation, surfaced through the `socket_fallback` telemetry counter.
//!
//! Only the event surface is specified here — the server itself is another
//! process. [`SignalingRelay`] is the seam a deployment implements over its
//! WebSocket (or whatever else reaches the server); [`MemoryRelayPair`]
//! wires two clients directly together for tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::TerminationReason;
use crate::{Action, Digest8, Frame, ParticipantId, ParticipantIndex, SessionId};

/// Identifier of an in-flight P2P probe.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ProbeId(pub u64);

impl std::fmt::Display for ProbeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "probe-{}", self.0)
    }
}

/// Events crossing the signaling relay, in both directions.
///
/// Names are illustrative; the contracts matter. Opaque payloads
/// (SDP/ICE) pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum SignalingEvent {
    /// C→S: a participant asks to join a scene's waitroom.
    JoinGame {
        /// Scene being joined.
        scene: String,
        /// The joining participant.
        participant: ParticipantId,
    },
    /// S→C: the participant has been matched and assigned a player slot.
    PlayerAssigned {
        /// The created session.
        session: SessionId,
        /// Assigned in-game slot.
        index: ParticipantIndex,
        /// Session seed for the deterministic RNG and environment.
        seed: u32,
    },
    /// C↔C (via S): opaque SDP offer/answer or ICE candidate.
    WebrtcSignal {
        /// Session the signal belongs to.
        session: SessionId,
        /// Which peer should receive it.
        target: ParticipantIndex,
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// C→S→C: the sender finished resetting and is ready to start the
    /// episode. Session formation traffic belongs on the relay: it must
    /// work before (and regardless of whether) the P2P channel is up, and
    /// it must not inherit the P2P path's latency.
    EpisodeReady {
        /// Session being started.
        session: SessionId,
        /// The ready participant's slot.
        index: ParticipantIndex,
        /// Seed the sender reset with, as a consistency check.
        seed: u32,
    },
    /// C→S→C fallback: an input frame routed around a down P2P channel.
    PlayerAction {
        /// Session the action belongs to.
        session: SessionId,
        /// Acting participant slot.
        index: ParticipantIndex,
        /// Frame the action applies at.
        frame: Frame,
        /// The action value.
        action: Action,
    },
    /// C→S→C fallback: a frame digest routed around a down P2P channel.
    FrameDigest {
        /// Session the digest belongs to.
        session: SessionId,
        /// Reporting participant slot.
        index: ParticipantIndex,
        /// The confirmed frame.
        frame: Frame,
        /// The digest.
        digest: Digest8,
    },
    /// S→C: the partner's socket or channel dropped; pause bilaterally.
    PartnerDisconnected {
        /// Affected session.
        session: SessionId,
        /// The disconnected slot.
        index: ParticipantIndex,
    },
    /// S↔C: the session is over.
    EndGame {
        /// Affected session.
        session: SessionId,
        /// Why it ended.
        reason: TerminationReason,
    },
    /// S→C: prepare a throwaway probe connection with these candidates.
    ProbePrepare {
        /// Probe being prepared.
        probe: ProbeId,
        /// The candidates to be measured.
        candidates: Vec<ParticipantId>,
    },
    /// C→S: this client finished preparing the probe channel.
    ProbeReady {
        /// Probe that is ready.
        probe: ProbeId,
        /// The reporting participant.
        participant: ParticipantId,
    },
    /// S→C: both sides are ready; start pinging.
    ProbeStart {
        /// Probe to start.
        probe: ProbeId,
    },
    /// C→S: measured median RTT, or `None` on timeout/failure.
    ProbeResult {
        /// Probe that finished.
        probe: ProbeId,
        /// Median RTT in milliseconds, if the probe succeeded.
        rtt_ms: Option<u64>,
    },
}

/// Errors raised while encoding or decoding relay frames.
#[derive(Debug)]
pub enum RelayCodecError {
    /// The event could not be serialized.
    Encode(String),
    /// The frame could not be deserialized.
    Decode(String),
}

impl std::fmt::Display for RelayCodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(detail) => write!(f, "relay frame encoding failed: {detail}"),
            Self::Decode(detail) => write!(f, "relay frame decoding failed: {detail}"),
        }
    }
}

impl std::error::Error for RelayCodecError {}

// Fixed-int encoding keeps relay frames byte-stable across releases; the
// relay is low-rate, so size is not a concern.
fn codec_config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Encodes a relay event for the wire (WebSocket binary frame).
pub fn encode_event(event: &SignalingEvent) -> Result<Vec<u8>, RelayCodecError> {
    bincode::serde::encode_to_vec(event, codec_config())
        .map_err(|err| RelayCodecError::Encode(err.to_string()))
}

/// Decodes a relay frame.
pub fn decode_event(bytes: &[u8]) -> Result<SignalingEvent, RelayCodecError> {
    bincode::serde::decode_from_slice(bytes, codec_config())
        .map(|(event, _)| event)
        .map_err(|err| RelayCodecError::Decode(err.to_string()))
}

/// The client's handle on the signaling channel.
pub trait SignalingRelay {
    /// Sends an event toward the server.
    fn send(&mut self, event: SignalingEvent);

    /// Returns all events delivered since the last call.
    fn drain(&mut self) -> Vec<SignalingEvent>;
}

type EventQueue = Arc<Mutex<VecDeque<SignalingEvent>>>;

/// An in-process relay wiring two clients directly together, standing in for
/// the server in tests.
///
/// Client-to-client events (`PlayerAction`, `FrameDigest`, `WebrtcSignal`,
/// `EndGame`) are forwarded to the partner; everything else is dropped, as
/// it would terminate at the server.
#[derive(Debug)]
pub struct MemoryRelayPair {
    inbound: EventQueue,
    peer_inbound: EventQueue,
}

impl MemoryRelayPair {
    /// Creates a connected pair of relay endpoints.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let a: EventQueue = Arc::new(Mutex::new(VecDeque::new()));
        let b: EventQueue = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                inbound: a.clone(),
                peer_inbound: b.clone(),
            },
            Self {
                inbound: b,
                peer_inbound: a,
            },
        )
    }

    /// Injects an event as if the server had pushed it to this client.
    pub fn inject(&self, event: SignalingEvent) {
        self.inbound.lock().push_back(event);
    }
}

impl SignalingRelay for MemoryRelayPair {
    fn send(&mut self, event: SignalingEvent) {
        match &event {
            SignalingEvent::EpisodeReady { .. }
            | SignalingEvent::PlayerAction { .. }
            | SignalingEvent::FrameDigest { .. }
            | SignalingEvent::WebrtcSignal { .. }
            | SignalingEvent::EndGame { .. } => {
                self.peer_inbound.lock().push_back(event);
            },
            _ => {
                // Server-terminated event; nothing to forward in-process.
                tracing::trace!(?event, "relay event terminated at memory server");
            },
        }
    }

    fn drain(&mut self) -> Vec<SignalingEvent> {
        self.inbound.lock().drain(..).collect()
    }
}
