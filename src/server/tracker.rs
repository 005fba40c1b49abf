//! Global registry of participant states.
//!
//! One tracker exists per server process, created at boot and torn down at
//! shutdown. It is the single source of truth for "what is this participant
//! doing right now", and the gate that prevents a participant from joining
//! a waitroom while a game entry still exists for them.
//!
//! Single-writer discipline: every mutation goes through the internal mutex,
//! and lifecycle faults (an entry pointing at a session that no longer
//! exists) self-heal with a logged warning instead of raising.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use crate::{ParticipantId, SessionId};

/// Lifecycle state of a participant across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    /// Connected, doing nothing.
    Idle,
    /// Queued for matchmaking.
    InWaitroom,
    /// In a P2P probe / channel validation.
    ValidatingP2p,
    /// Playing in a session.
    InGame,
    /// The game ended; exports are flushing.
    GameEnded,
}

/// Allowed transitions. Everything may fall back to `Idle` (cleanup paths),
/// otherwise the machine moves strictly forward.
fn transition_allowed(from: ParticipantState, to: ParticipantState) -> bool {
    use ParticipantState::{GameEnded, Idle, InGame, InWaitroom, ValidatingP2p};
    matches!(
        (from, to),
        (Idle, InWaitroom)
            | (InWaitroom, ValidatingP2p)
            | (InWaitroom, Idle)
            | (ValidatingP2p, InGame)
            | (ValidatingP2p, InWaitroom)
            | (ValidatingP2p, Idle)
            | (InGame, GameEnded)
            | (InGame, Idle)
            | (GameEnded, Idle)
    )
}

/// One tracked participant.
#[derive(Debug, Clone)]
pub struct ParticipantEntry {
    /// Current lifecycle state.
    pub state: ParticipantState,
    /// The session the participant is in, when any.
    pub session: Option<SessionId>,
    /// Last observed server RTT, fed to the latency-aware matchmaker.
    pub server_rtt_ms: Option<u64>,
    /// Free-form attributes (device class, browser class).
    pub attributes: BTreeMap<String, String>,
}

impl Default for ParticipantEntry {
    fn default() -> Self {
        Self {
            state: ParticipantState::Idle,
            session: None,
            server_rtt_ms: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// The process-wide participant registry.
#[derive(Debug, Default)]
pub struct ParticipantTracker {
    inner: Mutex<BTreeMap<ParticipantId, ParticipantEntry>>,
}

impl ParticipantTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a participant (idempotent).
    pub fn register(&self, id: &ParticipantId) {
        self.inner.lock().entry(id.clone()).or_default();
    }

    /// Removes a participant entirely (socket closed).
    pub fn unregister(&self, id: &ParticipantId) {
        self.inner.lock().remove(id);
    }

    /// Current state, if registered.
    #[must_use]
    pub fn state_of(&self, id: &ParticipantId) -> Option<ParticipantState> {
        self.inner.lock().get(id).map(|entry| entry.state)
    }

    /// The session a participant is currently bound to.
    #[must_use]
    pub fn session_of(&self, id: &ParticipantId) -> Option<SessionId> {
        self.inner.lock().get(id).and_then(|entry| entry.session.clone())
    }

    /// Whether the participant may enter a waitroom: registered, and no
    /// in-game entry exists.
    #[must_use]
    pub fn can_join_waitroom(&self, id: &ParticipantId) -> bool {
        match self.inner.lock().get(id) {
            Some(entry) => matches!(entry.state, ParticipantState::Idle),
            None => false,
        }
    }

    /// Attempts a state transition. Invalid transitions are logged and
    /// dropped, never raised.
    pub fn transition(&self, id: &ParticipantId, to: ParticipantState) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(id) else {
            tracing::warn!(participant = %id, ?to, "transition for unknown participant dropped");
            return false;
        };
        if !transition_allowed(entry.state, to) {
            tracing::warn!(
                participant = %id,
                from = ?entry.state,
                ?to,
                "invalid participant transition dropped"
            );
            return false;
        }
        entry.state = to;
        if to == ParticipantState::Idle {
            entry.session = None;
        }
        true
    }

    /// Binds a participant to a session.
    pub fn bind_session(&self, id: &ParticipantId, session: &SessionId) {
        if let Some(entry) = self.inner.lock().get_mut(id) {
            entry.session = Some(session.clone());
        }
    }

    /// Records a server RTT observation.
    pub fn record_server_rtt(&self, id: &ParticipantId, rtt_ms: u64) {
        if let Some(entry) = self.inner.lock().get_mut(id) {
            entry.server_rtt_ms = Some(rtt_ms);
        }
    }

    /// Last observed server RTT.
    #[must_use]
    pub fn server_rtt(&self, id: &ParticipantId) -> Option<u64> {
        self.inner.lock().get(id).and_then(|entry| entry.server_rtt_ms)
    }

    /// Sets a free-form attribute.
    pub fn set_attribute(&self, id: &ParticipantId, key: &str, value: &str) {
        if let Some(entry) = self.inner.lock().get_mut(id) {
            entry.attributes.insert(key.to_owned(), value.to_owned());
        }
    }

    /// Self-heals entries that reference sessions no longer alive. Returns
    /// the number of healed entries.
    pub fn clean_orphans(&self, live_sessions: &BTreeSet<SessionId>) -> usize {
        let mut healed = 0;
        let mut inner = self.inner.lock();
        for (id, entry) in inner.iter_mut() {
            let orphaned = matches!(
                entry.state,
                ParticipantState::ValidatingP2p
                    | ParticipantState::InGame
                    | ParticipantState::GameEnded
            ) && entry
                .session
                .as_ref()
                .map_or(true, |session| !live_sessions.contains(session));
            if orphaned {
                tracing::warn!(
                    participant = %id,
                    state = ?entry.state,
                    session = ?entry.session,
                    "orphaned tracker entry healed to idle"
                );
                entry.state = ParticipantState::Idle;
                entry.session = None;
                healed += 1;
            }
        }
        healed
    }

    /// Number of registered participants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// `true` when no participants are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn alice() -> ParticipantId {
        ParticipantId::new("alice")
    }

    #[test]
    fn full_lifecycle_walk() {
        let tracker = ParticipantTracker::new();
        tracker.register(&alice());
        assert_eq!(tracker.state_of(&alice()), Some(ParticipantState::Idle));
        assert!(tracker.can_join_waitroom(&alice()));

        assert!(tracker.transition(&alice(), ParticipantState::InWaitroom));
        assert!(!tracker.can_join_waitroom(&alice()));
        assert!(tracker.transition(&alice(), ParticipantState::ValidatingP2p));
        assert!(tracker.transition(&alice(), ParticipantState::InGame));
        assert!(tracker.transition(&alice(), ParticipantState::GameEnded));
        assert!(tracker.transition(&alice(), ParticipantState::Idle));
        assert!(tracker.can_join_waitroom(&alice()));
    }

    #[test]
    fn invalid_transitions_are_dropped_not_raised() {
        let tracker = ParticipantTracker::new();
        tracker.register(&alice());
        assert!(!tracker.transition(&alice(), ParticipantState::InGame));
        assert_eq!(tracker.state_of(&alice()), Some(ParticipantState::Idle));

        // Unknown participant: dropped.
        assert!(!tracker.transition(&ParticipantId::new("ghost"), ParticipantState::InWaitroom));
    }

    #[test]
    fn probe_failure_returns_to_waitroom() {
        let tracker = ParticipantTracker::new();
        tracker.register(&alice());
        tracker.transition(&alice(), ParticipantState::InWaitroom);
        tracker.transition(&alice(), ParticipantState::ValidatingP2p);
        assert!(tracker.transition(&alice(), ParticipantState::InWaitroom));
        assert_eq!(
            tracker.state_of(&alice()),
            Some(ParticipantState::InWaitroom)
        );
    }

    #[test]
    fn orphans_self_heal() {
        let tracker = ParticipantTracker::new();
        tracker.register(&alice());
        tracker.transition(&alice(), ParticipantState::InWaitroom);
        tracker.transition(&alice(), ParticipantState::ValidatingP2p);
        tracker.transition(&alice(), ParticipantState::InGame);
        tracker.bind_session(&alice(), &SessionId::new("dead-session"));

        let healed = tracker.clean_orphans(&BTreeSet::new());
        assert_eq!(healed, 1);
        assert_eq!(tracker.state_of(&alice()), Some(ParticipantState::Idle));
        assert_eq!(tracker.session_of(&alice()), None);
    }

    #[test]
    fn live_sessions_are_not_healed() {
        let tracker = ParticipantTracker::new();
        tracker.register(&alice());
        tracker.transition(&alice(), ParticipantState::InWaitroom);
        tracker.transition(&alice(), ParticipantState::ValidatingP2p);
        tracker.transition(&alice(), ParticipantState::InGame);
        let session = SessionId::new("live");
        tracker.bind_session(&alice(), &session);

        let live = BTreeSet::from([session]);
        assert_eq!(tracker.clean_orphans(&live), 0);
        assert_eq!(tracker.state_of(&alice()), Some(ParticipantState::InGame));
    }

    #[test]
    fn rtt_and_attributes_round_trip() {
        let tracker = ParticipantTracker::new();
        tracker.register(&alice());
        tracker.record_server_rtt(&alice(), 42);
        tracker.set_attribute(&alice(), "browser", "firefox");
        assert_eq!(tracker.server_rtt(&alice()), Some(42));
    }
}
