//! # Tandem
//!
//! Tandem is the real-time multiplayer synchronization core used to run
//! deterministic reinforcement-learning environments as interactive,
//! multi-participant experiments. Two (or more) participants each run the
//! same environment locally; Tandem keeps their simulations bit-identical in
//! the face of network latency, packet loss, transient tab backgrounding and
//! partial disconnects, while preserving local-feeling input responsiveness
//! and producing byte-identical per-frame data exports on every participant.
//!
//! The crate is composed of four tightly coupled subsystems:
//!
//! 1. a GGPO-style rollback/prediction engine driving a deterministic step
//!    loop ([`engine`]),
//! 2. a dual-buffer data-recording layer that guarantees export parity under
//!    rollbacks and fast-forwards ([`recorder`]),
//! 3. a frame-hash exchange and desync-detection layer running over an
//!    unreliable peer channel ([`hasher`], [`network`]),
//! 4. a latency-aware matchmaker and P2P probe gate that forms sessions
//!    ([`server`]).
//!
//! The environment itself is an external collaborator: anything that
//! implements [`Environment`] (a `reset`/`step`/`get_state`/`set_state`
//! contract) can be driven by the engine. Environments must be deterministic
//! given a seed and an input sequence.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use serde::{Deserialize, Serialize};

pub use engine::{
    BotPolicy, BotReplay, EngineBuilder, EngineConfig, EngineEvent, EngineState, RollbackEngine,
};
pub use env::{EnvError, Environment, RenderMode, ResetOutput, StepOutput};
pub use error::{TandemError, TerminationReason};
pub use hasher::{DesyncEvent, DesyncPolicy, FrameHasher};
pub use network::chaos_socket::{ChaosConfig, ChaosSocket};
pub use network::messages::{InputFrame, PeerMessage};
pub use network::socket::{DatagramSocket, MemoryPairSocket, UdpDatagramSocket};
pub use network::stats::NetworkStats;
pub use recorder::{DualBufferRecorder, RollbackEventRecord, StepRecord};
pub use rng::Mulberry32;

pub mod engine;
pub mod env;
pub mod error;
pub mod export;
pub mod hasher;
pub mod input_buffer;
pub mod recorder;
pub mod rng;
pub mod server;
pub mod snapshot;
pub mod telemetry;

/// Network-facing modules: wire codec, message types, socket abstractions,
/// the peer transport state machine and the signaling-relay client view.
pub mod network {
    pub mod chaos_socket;
    pub mod messages;
    pub mod signaling;
    pub mod socket;
    pub mod stats;
    pub mod transport;
    pub mod wire;
}

// #############
// # CONSTANTS #
// #############

/// Default simulation rate, in frames per second.
pub const DEFAULT_FPS: u32 = 60;

/// A frame is a single step of environment execution within an episode.
///
/// Frames are the fundamental unit of time in the synchronization core. Each
/// frame represents one discrete step of the simulation. Frame numbers start
/// at 0 on episode start and increment sequentially; the counter resets at
/// each episode boundary.
///
/// `Frame` is a newtype wrapper around `u32`: frames are never negative, and
/// "no frame yet" is expressed as `Option<Frame>` rather than a sentinel.
///
/// # Examples
///
/// ```
/// use tandem::Frame;
///
/// let frame = Frame::new(0);
/// let next = frame + 1;
/// assert_eq!(next.as_u32(), 1);
/// assert!(next > frame);
/// ```
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Frame(u32);

impl Frame {
    /// The first frame of every episode.
    pub const ZERO: Frame = Frame(0);

    /// Creates a new `Frame` from a `u32` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: u32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `u32` value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the underlying value as a `usize`, for indexing.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Subtracts `rhs` from this frame, saturating at [`Frame::ZERO`].
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: u32) -> Frame {
        Frame(self.0.saturating_sub(rhs))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<u32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = u32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl std::ops::Rem<u32> for Frame {
    type Output = u32;

    #[inline]
    fn rem(self, rhs: u32) -> Self::Output {
        self.0 % rhs
    }
}

impl From<u32> for Frame {
    #[inline]
    fn from(value: u32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for u32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<u32> for Frame {
    #[inline]
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<u32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// The in-game player slot assigned to a participant for the duration of a
/// session.
///
/// Indices `0..num_participants` identify the humans (and bots) feeding
/// actions into the environment. The index doubles as the peer address for
/// the in-memory transport and as the key of all per-participant columns in
/// the episode export.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ParticipantIndex(u16);

impl ParticipantIndex {
    /// Creates a new `ParticipantIndex`.
    #[inline]
    #[must_use]
    pub const fn new(index: u16) -> Self {
        ParticipantIndex(index)
    }

    /// Returns the underlying `u16` value.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the underlying value as a `usize`, for indexing.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ParticipantIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for ParticipantIndex {
    #[inline]
    fn from(value: u16) -> Self {
        ParticipantIndex(value)
    }
}

/// An action chosen by one participant for one frame.
///
/// Actions are opaque to the core: the engine never interprets them, it only
/// stores, transmits and replays them. They must be bit-comparable —
/// re-delivery of the same `(frame, index)` pair with a *different* action is
/// a protocol violation. Gym-style discrete action spaces map directly onto
/// the `u32` payload.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Action(pub u32);

impl Action {
    /// Returns the underlying `u32` value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a participant across sessions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Creates a new `ParticipantId` from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        ParticipantId(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier of a session. Sessions are destroyed on end, never
/// reused, so a `SessionId` observed twice refers to the same game.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Creates a new `SessionId` from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The first 8 bytes of a SHA-256 digest over the canonicalized environment
/// state at a confirmed frame.
///
/// Digests are exchanged peer-to-peer in a fixed 13-byte wire frame (1-byte
/// tag, 4-byte big-endian frame number, 8 digest bytes) and compared to
/// detect divergence.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Digest8(pub [u8; 8]);

impl Digest8 {
    /// Returns the digest bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl std::fmt::Display for Digest8 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_arithmetic() {
        let frame = Frame::new(10);
        assert_eq!(frame + 5, Frame::new(15));
        assert_eq!((frame + 5) - frame, 5);
        assert_eq!(frame % 4, 2);
        assert_eq!(Frame::new(3).saturating_sub(10), Frame::ZERO);
    }

    #[test]
    fn frame_ordering_and_display() {
        assert!(Frame::new(2) > Frame::new(1));
        assert!(Frame::new(2) > 1);
        assert_eq!(Frame::new(7).to_string(), "7");
    }

    #[test]
    fn digest_display_is_lowercase_hex() {
        let digest = Digest8([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02, 0x03]);
        assert_eq!(digest.to_string(), "deadbeef00010203");
    }

    #[test]
    fn participant_index_roundtrip() {
        let index = ParticipantIndex::new(3);
        assert_eq!(index.as_u16(), 3);
        assert_eq!(index.as_usize(), 3);
        assert_eq!(ParticipantIndex::from(3u16), index);
    }
}
