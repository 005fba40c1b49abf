//! Server-side services: matchmaking, probing, session lifecycle and the
//! participant registry.
//!
//! There are no ambient globals here. A server process constructs one
//! [`GameCoordinator`] at boot and passes it by reference wherever session
//! formation is driven; the coordinator owns the matchmaker queue, the
//! participant tracker, the probe table and the session registry, forming
//! one directed ownership tree that cleanup flows down.

pub mod matchmaker;
pub mod probe;
pub mod session;
pub mod tracker;

pub use matchmaker::{
    FifoMatchmaker, LatencyAwareMatchmaker, MatchCandidate, Matchmaker, MatchmakerConfig, WaitRoom,
};
pub use probe::{ProbeConfig, ProbeCoordinator, ProbeOutcome, ProbePhase};
pub use session::{CleanupHooks, NoopHooks, Session, SessionPhase, SessionServices};
pub use tracker::{ParticipantState, ParticipantTracker};

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use web_time::{Duration, Instant};

use crate::error::{TandemError, TerminationReason};
use crate::network::signaling::ProbeId;
use crate::rng::Mulberry32;
use crate::{ParticipantId, SessionId};

/// One finished (or running) group, for the append-only history log.
#[derive(Debug, Clone)]
pub struct GroupRecord {
    /// The session.
    pub session: SessionId,
    /// Its participants.
    pub participants: Vec<ParticipantId>,
    /// When the group was formed.
    pub created_at: Instant,
    /// Termination, once ended.
    pub termination: Option<TerminationReason>,
}

/// Append-only log of formed groups, behind one coarse lock.
#[derive(Debug, Default)]
pub struct GroupHistory {
    records: Mutex<Vec<GroupRecord>>,
}

impl GroupHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a newly formed group.
    pub fn record_created(&self, session: &SessionId, participants: Vec<ParticipantId>) {
        self.records.lock().push(GroupRecord {
            session: session.clone(),
            participants,
            created_at: Instant::now(),
            termination: None,
        });
    }

    /// Marks a group's termination.
    pub fn record_ended(&self, session: &SessionId, reason: TerminationReason) {
        let mut records = self.records.lock();
        if let Some(record) = records
            .iter_mut()
            .rev()
            .find(|record| record.session == *session)
        {
            record.termination = Some(reason);
        }
    }

    /// A copy of the log.
    #[must_use]
    pub fn entries(&self) -> Vec<GroupRecord> {
        self.records.lock().clone()
    }
}

/// Notifications drained from the coordinator by the serving layer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoordinatorEvent {
    /// A probe should be prepared between these candidates (send
    /// `probe_prepare` over the relay).
    ProbeRequested {
        /// The probe to prepare.
        probe: ProbeId,
        /// Its candidates.
        candidates: Vec<ParticipantId>,
    },
    /// Every probe candidate is ready (send `probe_start`).
    ProbeStarted {
        /// The probe to start.
        probe: ProbeId,
    },
    /// A session was created (send `player_assigned` to each participant).
    SessionCreated {
        /// The new session.
        session: SessionId,
        /// Its seed.
        seed: u32,
    },
    /// A proposed match was rejected; candidates returned to the waitroom.
    MatchRejected {
        /// The candidates that went back.
        participants: Vec<ParticipantId>,
    },
    /// A session ended and cleanup ran.
    SessionEnded {
        /// The ended session.
        session: SessionId,
        /// The reason code.
        reason: TerminationReason,
    },
    /// A candidate waited past the waitroom timeout and was evicted.
    WaitroomTimeout {
        /// The evicted participant.
        participant: ParticipantId,
    },
}

/// The server's session-formation service.
///
/// Owns the waitroom, tracker, probe table, group history and session
/// registry; everything cross-session lives behind its own lock here and
/// nowhere else.
pub struct GameCoordinator {
    config: MatchmakerConfig,
    matchmaker: Box<dyn Matchmaker>,
    /// The matchmaker queue.
    pub waitroom: WaitRoom,
    /// The participant registry.
    pub tracker: ParticipantTracker,
    /// The probe table.
    pub probes: ProbeCoordinator,
    /// The append-only group log.
    pub history: GroupHistory,
    sessions: Mutex<BTreeMap<SessionId, Session>>,
    probe_groups: Mutex<BTreeMap<ProbeId, Vec<MatchCandidate>>>,
    pending_cleanups: Mutex<Vec<(SessionId, TerminationReason, Instant)>>,
    seed_rng: Mutex<Mulberry32>,
    next_session: Mutex<u64>,
    hooks: Box<dyn CleanupHooks>,
    events: Mutex<Vec<CoordinatorEvent>>,
}

impl GameCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        config: MatchmakerConfig,
        matchmaker: Box<dyn Matchmaker>,
        hooks: Box<dyn CleanupHooks>,
        server_seed: u32,
    ) -> Self {
        let probe_config = ProbeConfig {
            pings: config.probe_pings,
            ping_interval: Duration::from_millis(config.probe_interval_ms),
            ..ProbeConfig::default()
        };
        Self {
            config,
            matchmaker,
            waitroom: WaitRoom::new(),
            tracker: ParticipantTracker::new(),
            probes: ProbeCoordinator::with_config(probe_config),
            history: GroupHistory::new(),
            sessions: Mutex::new(BTreeMap::new()),
            probe_groups: Mutex::new(BTreeMap::new()),
            pending_cleanups: Mutex::new(Vec::new()),
            seed_rng: Mutex::new(Mulberry32::new(server_seed)),
            next_session: Mutex::new(0),
            hooks,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Drains notifications produced since the last call.
    pub fn drain_events(&self) -> Vec<CoordinatorEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push_event(&self, event: CoordinatorEvent) {
        self.events.lock().push(event);
    }

    /// The matchmaker configuration.
    #[must_use]
    pub fn config(&self) -> MatchmakerConfig {
        self.config
    }

    /// Registers a participant connection.
    pub fn connect(&self, participant: &ParticipantId) {
        self.tracker.register(participant);
    }

    /// Handles a `join_game`: gates on the tracker, then enqueues.
    pub fn join_waitroom(&self, participant: &ParticipantId) -> Result<(), TandemError> {
        if !self.tracker.can_join_waitroom(participant) {
            return Err(TandemError::InvalidConfiguration {
                info: format!(
                    "participant {participant} cannot join the waitroom in state {:?}",
                    self.tracker.state_of(participant)
                ),
            });
        }
        self.tracker
            .transition(participant, ParticipantState::InWaitroom);
        let rtt = self.tracker.server_rtt(participant);
        self.waitroom.enqueue(MatchCandidate::new(participant.clone(), rtt));
        Ok(())
    }

    /// Handles a participant's socket closing: dequeue, end any session
    /// they are in, drop the registry entry.
    pub fn disconnect(&self, participant: &ParticipantId, now: Instant) {
        self.waitroom.remove(participant);
        if let Some(session) = self.tracker.session_of(participant) {
            self.end_session(&session, TerminationReason::SocketDisconnected, Duration::ZERO, now);
        }
        self.tracker.unregister(participant);
    }

    /// One pass of the formation loop: waitroom timeouts, probe verdicts,
    /// delayed cleanups, then a matchmaking attempt.
    pub fn pump(&self, now: Instant) {
        // Waitroom timeouts.
        if let Some(timeout_ms) = self.config.waitroom_timeout_ms {
            for evicted in self
                .waitroom
                .sweep_timeouts(now, Duration::from_millis(timeout_ms))
            {
                self.tracker
                    .transition(&evicted.participant, ParticipantState::Idle);
                self.push_event(CoordinatorEvent::WaitroomTimeout {
                    participant: evicted.participant,
                });
            }
        }

        // Delayed cleanups that came due.
        let due: Vec<(SessionId, TerminationReason)> = {
            let mut pending = self.pending_cleanups.lock();
            let (ready, not_ready): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|(_, _, due_at)| *due_at <= now);
            *pending = not_ready;
            ready.into_iter().map(|(id, reason, _)| (id, reason)).collect()
        };
        for (session, reason) in due {
            self.run_cleanup(&session, reason);
        }

        // Matchmaking, then probe verdicts. Verdicts run last so a match
        // rejected this pass waits in the waitroom until the next one
        // instead of being instantly re-proposed.
        self.matchmaking_pass(now);
        for (probe, outcome) in self.probes.poll(now) {
            self.handle_probe_outcome(probe, outcome, now);
        }
    }

    fn matchmaking_pass(&self, now: Instant) {
        let candidates = self.waitroom.take_all();
        if candidates.is_empty() {
            return;
        }
        let (matched, remaining) = self.matchmaker.find_match(candidates);
        self.waitroom.restore(remaining);
        if matched.is_empty() {
            return;
        }

        for candidate in &matched {
            self.tracker
                .transition(&candidate.participant, ParticipantState::ValidatingP2p);
        }
        if self.config.max_p2p_rtt_ms.is_some() {
            // Gate the match on a real P2P measurement.
            let ids: Vec<ParticipantId> =
                matched.iter().map(|c| c.participant.clone()).collect();
            let probe = self.probes.begin(ids.clone(), now);
            self.probe_groups.lock().insert(probe, matched);
            self.push_event(CoordinatorEvent::ProbeRequested {
                probe,
                candidates: ids,
            });
        } else {
            self.create_session(matched, None);
        }
    }

    /// Relay entrypoint: a candidate reported `probe_ready`.
    pub fn probe_ready(&self, probe: ProbeId, participant: &ParticipantId, now: Instant) {
        if self.probes.on_ready(probe, participant, now) {
            self.push_event(CoordinatorEvent::ProbeStarted { probe });
        }
    }

    /// Relay entrypoint: a client reported its aggregated `probe_result`.
    pub fn probe_result(&self, probe: ProbeId, rtt_ms: Option<u64>, now: Instant) {
        if let Some(outcome) = self.probes.on_result(probe, rtt_ms) {
            self.handle_probe_outcome(probe, outcome, now);
        }
    }

    fn handle_probe_outcome(&self, probe: ProbeId, outcome: ProbeOutcome, _now: Instant) {
        let Some(group) = self.probe_groups.lock().remove(&probe) else {
            return;
        };
        self.probes.finish(probe);

        let within_budget = match (outcome, self.config.max_p2p_rtt_ms) {
            (ProbeOutcome::Measured(rtt), Some(budget)) => rtt <= budget,
            (ProbeOutcome::Measured(_), None) => true,
            (ProbeOutcome::Failed, _) => false,
        };
        if within_budget {
            let rtt = match outcome {
                ProbeOutcome::Measured(rtt) => Some(rtt),
                ProbeOutcome::Failed => None,
            };
            self.create_session(group, rtt);
        } else {
            // Safety over throughput: back to the waitroom, refreshed.
            tracing::info!(%probe, ?outcome, "probe rejected the proposed match");
            let participants: Vec<ParticipantId> =
                group.iter().map(|c| c.participant.clone()).collect();
            for candidate in group {
                self.tracker
                    .transition(&candidate.participant, ParticipantState::InWaitroom);
                self.waitroom.enqueue(candidate);
            }
            self.push_event(CoordinatorEvent::MatchRejected { participants });
        }
    }

    fn create_session(&self, group: Vec<MatchCandidate>, probe_rtt_ms: Option<u64>) {
        let id = {
            let mut next = self.next_session.lock();
            *next += 1;
            SessionId::new(format!("session-{}", *next))
        };
        let seed = self.seed_rng.lock().next_u32();
        let ids: Vec<ParticipantId> = group.iter().map(|c| c.participant.clone()).collect();

        let mut session = Session::new(id.clone(), seed);
        session.assign_participants(ids.clone());
        session.transition(SessionPhase::Validating);
        if let Some(rtt) = probe_rtt_ms {
            session.record_probe_rtt(rtt);
        }
        session.transition(SessionPhase::Playing);

        for participant in &ids {
            self.tracker.transition(participant, ParticipantState::InGame);
            self.tracker.bind_session(participant, &id);
        }
        self.history.record_created(&id, ids);
        tracing::info!(session = %id, seed, ?probe_rtt_ms, "session created");
        self.sessions.lock().insert(id.clone(), session);
        self.push_event(CoordinatorEvent::SessionCreated { session: id, seed });
    }

    /// Ends a session, scheduling cleanup after `delay` (zero = now).
    /// Idempotent on every exit path.
    pub fn end_session(
        &self,
        session: &SessionId,
        reason: TerminationReason,
        delay: Duration,
        now: Instant,
    ) {
        if delay.is_zero() {
            self.run_cleanup(session, reason);
        } else {
            self.pending_cleanups
                .lock()
                .push((session.clone(), reason, now + delay));
        }
    }

    fn run_cleanup(&self, session_id: &SessionId, reason: TerminationReason) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            tracing::debug!(session = %session_id, "cleanup for unknown session ignored");
            return;
        };
        if session.is_destroyed() {
            return;
        }
        let services = SessionServices {
            tracker: &self.tracker,
            waitroom: &self.waitroom,
            hooks: self.hooks.as_ref(),
        };
        session.cleanup(reason, &services);
        self.history.record_ended(session_id, reason);
        self.push_event(CoordinatorEvent::SessionEnded {
            session: session_id.clone(),
            reason,
        });
    }

    /// The sessions that are still alive (not destroyed).
    #[must_use]
    pub fn live_sessions(&self) -> BTreeSet<SessionId> {
        self.sessions
            .lock()
            .values()
            .filter(|session| !session.is_destroyed())
            .map(|session| session.id().clone())
            .collect()
    }

    /// Looks up a session's phase.
    #[must_use]
    pub fn session_phase(&self, session: &SessionId) -> Option<SessionPhase> {
        self.sessions.lock().get(session).map(Session::phase)
    }

    /// Looks up a session's seed.
    #[must_use]
    pub fn session_seed(&self, session: &SessionId) -> Option<u32> {
        self.sessions.lock().get(session).map(Session::seed)
    }

    /// Self-heals orphaned tracker entries against the live session set.
    pub fn heal_orphans(&self) -> usize {
        let live = self.live_sessions();
        self.tracker.clean_orphans(&live)
    }

    /// Ends every live session with `server_shutdown` and heals the
    /// tracker.
    pub fn shutdown(&self, now: Instant) {
        let live = self.live_sessions();
        for session in live {
            self.end_session(
                &session,
                TerminationReason::ServerShutdown,
                Duration::ZERO,
                now,
            );
        }
        self.heal_orphans();
    }
}
