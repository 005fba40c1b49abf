//! Peer-to-peer message types.
//!
//! These are the only payloads that cross the unreliable datagram channel.
//! Simulation data never does: the channel carries inputs, liveness probes
//! and digests, and the environments on both ends re-derive everything else
//! deterministically.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Action, Digest8, Frame, ParticipantIndex};

/// One participant's action for one frame, as carried in an input bundle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrame {
    /// The frame the action applies at.
    pub frame: Frame,
    /// The acting participant slot.
    pub index: ParticipantIndex,
    /// The action value.
    pub action: Action,
}

/// The redundancy window carried by one bundle. Sized for the default
/// redundancy count so ordinary bundles never touch the heap.
pub type InputBundle = SmallVec<[InputFrame; 8]>;

/// A message on the peer datagram channel.
///
/// Bundles are redundant: each send repeats the last `redundancy_count`
/// local inputs, so individual packet loss is absorbed without retransmit
/// machinery. Re-delivery is idempotent because the input buffer
/// deduplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Redundant bundle of recent local inputs.
    InputBundle(InputBundle),
    /// Liveness/RTT probe, sent at 1 Hz.
    Ping {
        /// Sender timestamp in milliseconds; echoed back in the pong.
        timestamp_ms: u64,
    },
    /// Echo of a [`PeerMessage::Ping`].
    Pong {
        /// The original ping timestamp.
        timestamp_ms: u64,
    },
    /// Sent when nothing else has been sent recently, so silence is
    /// distinguishable from loss.
    Keepalive,
    /// The sender's episode reached its final frame.
    EpisodeEnd {
        /// The sender's final frame.
        final_frame: Frame,
    },
    /// The sender finished resetting and is ready to start the episode.
    EpisodeReady {
        /// Session seed the sender reset with, as a consistency check.
        seed: u32,
        /// First frame of the episode (0 unless resuming).
        start_frame: Frame,
    },
    /// State digest for a confirmed frame.
    FrameDigest {
        /// The confirmed frame.
        frame: Frame,
        /// First 8 bytes of the canonical state SHA-256.
        digest: Digest8,
    },
}

impl PeerMessage {
    /// Short name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InputBundle(_) => "input_bundle",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Keepalive => "keepalive",
            Self::EpisodeEnd { .. } => "episode_end",
            Self::EpisodeReady { .. } => "episode_ready",
            Self::FrameDigest { .. } => "frame_digest",
        }
    }
}
