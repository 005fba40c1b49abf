//! Error types for the synchronization core.
//!
//! The error types follow a few rules:
//!
//! - **Structured over stringly**: variants carry typed context fields
//!   (frames, indices, actions) instead of pre-formatted strings, so callers
//!   can match on specific cases and hot paths construct errors without
//!   allocating.
//! - **Kinds, not layers**: the taxonomy mirrors how failures are handled,
//!   not where they originate. Transient transport loss never surfaces here
//!   at all — it is absorbed by input redundancy.
//! - **Module-local where local**: the wire codec ([`WireError`]), the
//!   environment boundary ([`EnvError`]) and the exporter
//!   ([`ExportError`]) define their own error enums and convert into
//!   [`TandemError`] at the engine boundary.
//!
//! [`WireError`]: crate::network::wire::WireError
//! [`EnvError`]: crate::env::EnvError
//! [`ExportError`]: crate::export::ExportError

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::env::EnvError;
use crate::{Action, Frame, ParticipantIndex, SessionId};

/// The reason a session was terminated. Every exit path maps onto exactly one
/// of these codes; collaborators render them as user-facing overlays while
/// the core only ever exposes the code plus structured context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TerminationReason {
    /// The episode ran to completion and exports were flushed.
    GameComplete,
    /// The peer connection was lost and did not recover within the
    /// reconnection timeout.
    PeerDisconnected,
    /// A peer sent conflicting data (e.g. two different actions for the same
    /// `(frame, index)` slot) or an unknown message tag.
    ProtocolViolation,
    /// The environment collaborator faulted during `reset`, `step` or state
    /// transfer. No export is produced.
    EnvironmentError,
    /// Restoring a snapshot failed mid-rollback; the simulation can no longer
    /// be trusted.
    RollbackRestoreFailed,
    /// The P2P validation phase (probe or channel establishment) failed.
    ValidationFailed,
    /// A participant was excluded mid-game by the experimenter.
    Excluded,
    /// The participant's socket to the signaling server disconnected.
    SocketDisconnected,
    /// The server is shutting down.
    ServerShutdown,
}

impl TerminationReason {
    /// Returns the snake_case reason code used in exports and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::GameComplete => "game_complete",
            Self::PeerDisconnected => "peer_disconnected",
            Self::ProtocolViolation => "protocol_violation",
            Self::EnvironmentError => "environment_error",
            Self::RollbackRestoreFailed => "rollback_restore_failed",
            Self::ValidationFailed => "validation_failed",
            Self::Excluded => "excluded",
            Self::SocketDisconnected => "socket_disconnected",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the synchronization core.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TandemError {
    /// A peer re-delivered an input for an already-filled `(frame, index)`
    /// slot with a different action. Idempotent re-delivery of the *same*
    /// action is a no-op and never reaches this error.
    ConflictingInput {
        /// Frame of the offending input.
        frame: Frame,
        /// Participant slot of the offending input.
        index: ParticipantIndex,
        /// The action already stored in the buffer.
        existing: Action,
        /// The conflicting action that was re-delivered.
        incoming: Action,
    },
    /// `prune(upto)` was asked to discard frames that are not yet confirmed.
    PruneBeyondConfirmed {
        /// The requested prune watermark.
        requested: Frame,
        /// The current confirmed frame, if any frame is confirmed at all.
        confirmed: Option<Frame>,
    },
    /// The environment collaborator faulted.
    Environment(EnvError),
    /// A snapshot restore failed during rollback; carries the frame of the
    /// snapshot that could not be restored.
    SnapshotRestoreFailed {
        /// Frame label of the snapshot that failed to restore.
        frame: Frame,
    },
    /// A rollback was requested to a frame older than the snapshot ring can
    /// reach.
    RollbackBeyondReach {
        /// The rollback target.
        target: Frame,
        /// The oldest snapshot available, if any.
        oldest_snapshot: Option<Frame>,
    },
    /// An operation was invoked in an engine state that does not permit it
    /// (e.g. `tick` before `start_episode`).
    InvalidEngineState {
        /// Short description of the attempted operation.
        operation: &'static str,
    },
    /// A configuration constraint was violated at construction time.
    InvalidConfiguration {
        /// Human-readable description of the constraint.
        info: String,
    },
    /// The session referenced by an operation does not exist (already
    /// destroyed, or never created).
    UnknownSession {
        /// The session id that failed to resolve.
        session: SessionId,
    },
    /// Episode export failed.
    Export {
        /// Human-readable description of the failure.
        info: String,
    },
}

impl Display for TandemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConflictingInput {
                frame,
                index,
                existing,
                incoming,
            } => write!(
                f,
                "conflicting input for frame {frame} index {index}: \
                 already have action {existing}, received {incoming}"
            ),
            Self::PruneBeyondConfirmed {
                requested,
                confirmed,
            } => match confirmed {
                Some(confirmed) => write!(
                    f,
                    "cannot prune up to frame {requested}: confirmed frame is {confirmed}"
                ),
                None => write!(
                    f,
                    "cannot prune up to frame {requested}: no frame is confirmed yet"
                ),
            },
            Self::Environment(err) => write!(f, "environment fault: {err}"),
            Self::SnapshotRestoreFailed { frame } => {
                write!(f, "failed to restore snapshot for frame {frame}")
            },
            Self::RollbackBeyondReach {
                target,
                oldest_snapshot,
            } => match oldest_snapshot {
                Some(oldest) => write!(
                    f,
                    "rollback target {target} is beyond snapshot reach (oldest: {oldest})"
                ),
                None => write!(f, "rollback target {target} requested before any snapshot"),
            },
            Self::InvalidEngineState { operation } => {
                write!(f, "operation `{operation}` is not valid in the current engine state")
            },
            Self::InvalidConfiguration { info } => write!(f, "invalid configuration: {info}"),
            Self::UnknownSession { session } => write!(f, "unknown session {session}"),
            Self::Export { info } => write!(f, "episode export failed: {info}"),
        }
    }
}

impl Error for TandemError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Environment(err) => Some(err),
            _ => None,
        }
    }
}

impl From<EnvError> for TandemError {
    fn from(err: EnvError) -> Self {
        Self::Environment(err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn termination_reason_codes_are_snake_case() {
        assert_eq!(TerminationReason::GameComplete.as_str(), "game_complete");
        assert_eq!(
            TerminationReason::RollbackRestoreFailed.as_str(),
            "rollback_restore_failed"
        );
        assert_eq!(
            TerminationReason::PeerDisconnected.to_string(),
            "peer_disconnected"
        );
    }

    #[test]
    fn conflicting_input_display_includes_both_actions() {
        let err = TandemError::ConflictingInput {
            frame: Frame::new(12),
            index: ParticipantIndex::new(1),
            existing: Action(2),
            incoming: Action(3),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("frame 12"));
        assert!(rendered.contains("action 2"));
        assert!(rendered.contains("received 3"));
    }

    #[test]
    fn prune_error_mentions_confirmed_frame() {
        let err = TandemError::PruneBeyondConfirmed {
            requested: Frame::new(40),
            confirmed: Some(Frame::new(10)),
        };
        assert!(err.to_string().contains("confirmed frame is 10"));

        let err = TandemError::PruneBeyondConfirmed {
            requested: Frame::new(40),
            confirmed: None,
        };
        assert!(err.to_string().contains("no frame is confirmed"));
    }
}
