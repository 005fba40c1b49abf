//! The environment collaborator interface.
//!
//! The synchronization core is polymorphic over exactly one seam: the
//! [`Environment`] trait, a narrow capability interface over the embedded
//! scripting runtime that hosts the gym environment. The engine drives it
//! through `reset`/`step` and relies on `get_state`/`set_state` for rollback.
//!
//! Environments must be **deterministic** given seed + input sequence, and
//! must implement state serialization for sync validity. An environment that
//! cannot serialize its state is detected at session start and surfaces
//! [`EnvError::StateSupportMissing`] to the researcher instead of silently
//! desyncing later.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use crate::{Action, ParticipantIndex};

/// Rendering mode requested by the renderer collaborator. Opaque to the
/// engine, which never calls `render` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RenderMode {
    /// Structured render payload for the browser canvas layer.
    Canvas,
    /// Human-readable text rendering, used by debugging tools.
    Text,
}

/// Output of [`Environment::reset`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResetOutput {
    /// Initial observation per participant slot. Opaque to the engine.
    pub observations: serde_json::Value,
    /// Initial info payload. Opaque to the engine; recorded per frame.
    pub info: serde_json::Value,
}

/// Output of [`Environment::step`] for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Observation per participant slot. Opaque to the engine.
    pub observations: serde_json::Value,
    /// Reward earned this frame, per participant slot.
    pub rewards: BTreeMap<ParticipantIndex, f64>,
    /// Termination flag per participant slot. The episode ends when every
    /// flag is set.
    pub terminateds: BTreeMap<ParticipantIndex, bool>,
    /// Truncation flag per participant slot.
    pub truncateds: BTreeMap<ParticipantIndex, bool>,
    /// Auxiliary info payload. Opaque to the engine; recorded per frame.
    pub info: serde_json::Value,
}

impl StepOutput {
    /// Returns `true` when every participant's termination flag is set.
    #[must_use]
    pub fn all_terminated(&self) -> bool {
        !self.terminateds.is_empty() && self.terminateds.values().all(|flag| *flag)
    }

    /// Returns `true` when every participant's truncation flag is set.
    #[must_use]
    pub fn all_truncated(&self) -> bool {
        !self.truncateds.is_empty() && self.truncateds.values().all(|flag| *flag)
    }
}

/// Errors surfaced by an environment collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EnvError {
    /// `reset` faulted.
    ResetFault {
        /// Collaborator-provided detail.
        detail: String,
    },
    /// `step` faulted. This terminates the session with reason
    /// `environment_error`; no export is produced.
    StepFault {
        /// Collaborator-provided detail.
        detail: String,
    },
    /// The environment does not implement `get_state`/`set_state`. Detected
    /// at session start.
    StateSupportMissing,
    /// `set_state` was handed bytes it could not decode.
    StateDecode {
        /// Collaborator-provided detail.
        detail: String,
    },
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResetFault { detail } => write!(f, "environment reset faulted: {detail}"),
            Self::StepFault { detail } => write!(f, "environment step faulted: {detail}"),
            Self::StateSupportMissing => f.write_str(
                "environment does not implement state serialization \
                 (get_state/set_state), which multiplayer sync requires",
            ),
            Self::StateDecode { detail } => {
                write!(f, "environment state could not be decoded: {detail}")
            },
        }
    }
}

impl Error for EnvError {}

/// The capability interface every synchronized environment implements.
///
/// The engine owns its environment exclusively; it is never shared across
/// core instances. All methods are infallible in the happy path and return
/// typed [`EnvError`]s when the collaborator faults.
pub trait Environment {
    /// Resets the environment to the start of an episode.
    ///
    /// The seed is delivered by the server at session start; implementations
    /// must seed their own numeric libraries from it so that both peers
    /// produce identical trajectories.
    fn reset(&mut self, seed: u32) -> Result<ResetOutput, EnvError>;

    /// Advances the simulation by one frame with the given action per
    /// participant slot.
    fn step(&mut self, actions: &BTreeMap<ParticipantIndex, Action>)
        -> Result<StepOutput, EnvError>;

    /// Serializes the complete environment state. The bytes must be
    /// deterministic: two environments in identical states produce identical
    /// bytes.
    fn get_state(&self) -> Result<Vec<u8>, EnvError>;

    /// Restores a state previously captured with
    /// [`get_state`](Self::get_state).
    fn set_state(&mut self, state: &[u8]) -> Result<(), EnvError>;

    /// Renders the current state. Consumed by the renderer collaborator only;
    /// the engine never calls this.
    fn render(&self, mode: RenderMode) -> Option<serde_json::Value>;

    /// Whether this environment implements state serialization. The engine
    /// checks this at session start and refuses to run environments that
    /// cannot roll back.
    fn supports_state_sync(&self) -> bool {
        true
    }
}
