//! Session objects and their lifecycle.
//!
//! A session is created by the matchmaker, owns its participants'
//! player-index assignments, and is destroyed — never reused — when it
//! ends. The phase machine moves in one direction only:
//!
//! ```text
//! WAITING → MATCHED → VALIDATING → PLAYING → ENDED
//! ```
//!
//! Invalid transitions are logged and dropped, never raised: a second
//! `end_game` for a session that already ended is an ordinary race, not a
//! bug worth crashing a server over.
//!
//! Cleanup is idempotent and runs the same ordered steps on *every* exit
//! path — game complete, reconnection timeout, validation failure, mid-game
//! exclusion, socket disconnect, server shutdown.

use web_time::Instant;

use crate::error::TerminationReason;
use crate::server::matchmaker::WaitRoom;
use crate::server::tracker::{ParticipantState, ParticipantTracker};
use crate::{ParticipantId, ParticipantIndex, SessionId};

/// Phase of a session's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    /// Created, not yet populated.
    Waiting,
    /// Participants assigned.
    Matched,
    /// P2P validation (probe / channel establishment) in progress.
    Validating,
    /// The game is running.
    Playing,
    /// Over. The object is retained only until cleanup finishes.
    Ended,
}

fn phase_rank(phase: SessionPhase) -> u8 {
    match phase {
        SessionPhase::Waiting => 0,
        SessionPhase::Matched => 1,
        SessionPhase::Validating => 2,
        SessionPhase::Playing => 3,
        SessionPhase::Ended => 4,
    }
}

/// One participant's membership in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParticipant {
    /// Stable participant identifier.
    pub id: ParticipantId,
    /// Assigned in-game slot.
    pub index: ParticipantIndex,
}

/// Hooks invoked by session cleanup, in order. The server wires these to
/// its engine runners and exporters; tests record the call order.
pub trait CleanupHooks {
    /// Step 1: tell every participant the session is over.
    fn notify_participants(&self, session: &SessionId, reason: TerminationReason);
    /// Step 2: flush any pending episode exports.
    fn flush_exports(&self, session: &SessionId);
    /// Step 3: stop the engine runners.
    fn stop_runners(&self, session: &SessionId);
    /// Step 4: release simulation resources (environments, channels).
    fn release_resources(&self, session: &SessionId);
}

/// Hooks that do nothing; useful for tests of the ordering machinery.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl CleanupHooks for NoopHooks {
    fn notify_participants(&self, _session: &SessionId, _reason: TerminationReason) {}
    fn flush_exports(&self, _session: &SessionId) {}
    fn stop_runners(&self, _session: &SessionId) {}
    fn release_resources(&self, _session: &SessionId) {}
}

/// Everything cleanup needs a handle on.
pub struct SessionServices<'a> {
    /// The process-wide participant registry.
    pub tracker: &'a ParticipantTracker,
    /// The matchmaker queue, so departed participants are dequeued.
    pub waitroom: &'a WaitRoom,
    /// The cleanup hooks.
    pub hooks: &'a dyn CleanupHooks,
}

/// A server-owned session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    participants: Vec<SessionParticipant>,
    phase: SessionPhase,
    seed: u32,
    created_at: Instant,
    ended_at: Option<Instant>,
    probe_rtt_ms: Option<u64>,
    termination: Option<TerminationReason>,
    destroyed: bool,
}

impl Session {
    /// Creates a session in [`SessionPhase::Waiting`].
    #[must_use]
    pub fn new(id: SessionId, seed: u32) -> Self {
        Self {
            id,
            participants: Vec::new(),
            phase: SessionPhase::Waiting,
            seed,
            created_at: Instant::now(),
            ended_at: None,
            probe_rtt_ms: None,
            termination: None,
            destroyed: false,
        }
    }

    /// The session id.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The session seed.
    #[must_use]
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Participants with their assigned indices.
    #[must_use]
    pub fn participants(&self) -> &[SessionParticipant] {
        &self.participants
    }

    /// When the session was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the session ended, if it has.
    #[must_use]
    pub fn ended_at(&self) -> Option<Instant> {
        self.ended_at
    }

    /// The probe-measured P2P RTT, if a probe ran.
    #[must_use]
    pub fn probe_rtt_ms(&self) -> Option<u64> {
        self.probe_rtt_ms
    }

    /// Why the session ended, if it has.
    #[must_use]
    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    /// `true` once cleanup has fully run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Assigns participants and their in-game indices. Index assignment is
    /// deterministic: candidates sorted by participant id, so every server
    /// replica and every client derives the same mapping (and the smaller
    /// id becomes the connection initiator).
    pub fn assign_participants(&mut self, mut ids: Vec<ParticipantId>) {
        ids.sort_unstable();
        self.participants = ids
            .into_iter()
            .enumerate()
            .map(|(position, id)| SessionParticipant {
                id,
                index: ParticipantIndex::new(position as u16),
            })
            .collect();
        self.transition(SessionPhase::Matched);
    }

    /// Records the probe verdict for observability.
    pub fn record_probe_rtt(&mut self, rtt_ms: u64) {
        self.probe_rtt_ms = Some(rtt_ms);
    }

    /// Attempts a phase transition. Transitions are single-direction;
    /// anything else is logged and dropped.
    pub fn transition(&mut self, to: SessionPhase) -> bool {
        if phase_rank(to) <= phase_rank(self.phase) {
            tracing::warn!(
                session = %self.id,
                from = ?self.phase,
                ?to,
                "invalid session transition dropped"
            );
            return false;
        }
        tracing::debug!(session = %self.id, from = ?self.phase, ?to, "session transition");
        self.phase = to;
        true
    }

    /// Runs the ordered cleanup steps. Idempotent: calling it N times has
    /// the same visible effect as calling it once.
    ///
    /// Order, regardless of success of the individual steps:
    /// 1. notify participants of termination,
    /// 2. flush exports,
    /// 3. stop runners,
    /// 4. release simulation resources,
    /// 5. update the participant tracker for every participant,
    /// 6. remove participants from the matchmaker queue,
    /// 7. mark the session destroyed (no reuse).
    pub fn cleanup(&mut self, reason: TerminationReason, services: &SessionServices<'_>) {
        if self.destroyed {
            tracing::debug!(session = %self.id, "cleanup already ran; ignoring");
            return;
        }
        tracing::info!(session = %self.id, %reason, "session cleanup");

        services.hooks.notify_participants(&self.id, reason);
        services.hooks.flush_exports(&self.id);
        services.hooks.stop_runners(&self.id);
        services.hooks.release_resources(&self.id);

        for participant in &self.participants {
            // Whatever state the participant is in, walk them back to Idle.
            // Invalid intermediate hops are dropped by the tracker, so the
            // walk is safe on every exit path.
            if services.tracker.state_of(&participant.id) == Some(ParticipantState::InGame) {
                services
                    .tracker
                    .transition(&participant.id, ParticipantState::GameEnded);
            }
            services
                .tracker
                .transition(&participant.id, ParticipantState::Idle);
            services.waitroom.remove(&participant.id);
        }

        self.termination = Some(reason);
        self.ended_at = Some(Instant::now());
        self.phase = SessionPhase::Ended;
        self.destroyed = true;
    }
}
