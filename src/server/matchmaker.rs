//! Waitroom and matchmaking strategies.
//!
//! The matchmaker is a pluggable strategy over a queue of candidates:
//! `find_match(candidates) → (matched, remaining)`. The baseline groups the
//! oldest N candidates FIFO; the latency-aware variant additionally filters
//! on pairwise server-RTT sums. Candidates without RTT data are *not*
//! excluded — missing telemetry must degrade gracefully, not strand a
//! participant in the waitroom.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use web_time::{Duration, Instant};

use crate::ParticipantId;

/// Matchmaker configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchmakerConfig {
    /// Players per session.
    pub required_players: usize,
    /// Reject pairings whose server-RTT sum exceeds this, when known.
    pub max_server_rtt_ms: Option<u64>,
    /// Reject matches whose probe-measured P2P RTT exceeds this.
    pub max_p2p_rtt_ms: Option<u64>,
    /// Pings per probe.
    pub probe_pings: usize,
    /// Interval between probe pings.
    pub probe_interval_ms: u64,
    /// Evict candidates who waited longer than this.
    pub waitroom_timeout_ms: Option<u64>,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            required_players: 2,
            max_server_rtt_ms: None,
            max_p2p_rtt_ms: None,
            probe_pings: 5,
            probe_interval_ms: 100,
            waitroom_timeout_ms: None,
        }
    }
}

/// One queued participant.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    /// Who is waiting.
    pub participant: ParticipantId,
    /// When they joined the waitroom.
    pub enqueued_at: Instant,
    /// Last observed server RTT, if any.
    pub server_rtt_ms: Option<u64>,
    /// Free-form attributes (device class, browser class).
    pub attributes: BTreeMap<String, String>,
}

impl MatchCandidate {
    /// Creates a candidate enqueued now.
    #[must_use]
    pub fn new(participant: ParticipantId, server_rtt_ms: Option<u64>) -> Self {
        Self {
            participant,
            enqueued_at: Instant::now(),
            server_rtt_ms,
            attributes: BTreeMap::new(),
        }
    }
}

/// A matchmaking strategy.
pub trait Matchmaker: Send + Sync {
    /// Splits the queue into one matched group (possibly empty) and the
    /// remaining candidates. Candidates are handed over in FIFO order.
    fn find_match(
        &self,
        candidates: Vec<MatchCandidate>,
    ) -> (Vec<MatchCandidate>, Vec<MatchCandidate>);
}

/// Baseline strategy: group the oldest `required_players` candidates.
#[derive(Debug, Clone, Copy)]
pub struct FifoMatchmaker {
    /// Players per session.
    pub required_players: usize,
}

impl Matchmaker for FifoMatchmaker {
    fn find_match(
        &self,
        mut candidates: Vec<MatchCandidate>,
    ) -> (Vec<MatchCandidate>, Vec<MatchCandidate>) {
        if candidates.len() < self.required_players || self.required_players == 0 {
            return (Vec::new(), candidates);
        }
        let remaining = candidates.split_off(self.required_players);
        (candidates, remaining)
    }
}

/// Latency-aware strategy: FIFO, but every pair in the group must satisfy
/// `rtt_a + rtt_b <= max_server_rtt_ms` when both RTTs are known.
///
/// A candidate without RTT data passes every check — graceful fallback over
/// exclusion.
#[derive(Debug, Clone, Copy)]
pub struct LatencyAwareMatchmaker {
    /// Players per session.
    pub required_players: usize,
    /// Pairwise server-RTT-sum ceiling.
    pub max_server_rtt_ms: u64,
}

impl LatencyAwareMatchmaker {
    fn compatible(&self, a: &MatchCandidate, b: &MatchCandidate) -> bool {
        match (a.server_rtt_ms, b.server_rtt_ms) {
            (Some(rtt_a), Some(rtt_b)) => rtt_a + rtt_b <= self.max_server_rtt_ms,
            _ => true,
        }
    }
}

impl Matchmaker for LatencyAwareMatchmaker {
    fn find_match(
        &self,
        candidates: Vec<MatchCandidate>,
    ) -> (Vec<MatchCandidate>, Vec<MatchCandidate>) {
        if candidates.len() < self.required_players || self.required_players == 0 {
            return (Vec::new(), candidates);
        }

        // Anchor on each candidate in FIFO order and greedily fill the
        // group with compatible later candidates.
        for anchor in 0..candidates.len() {
            let mut group = vec![anchor];
            for other in (anchor + 1)..candidates.len() {
                if group.len() == self.required_players {
                    break;
                }
                let fits = group
                    .iter()
                    .all(|&member| self.compatible(&candidates[member], &candidates[other]));
                if fits {
                    group.push(other);
                }
            }
            if group.len() == self.required_players {
                let mut matched = Vec::with_capacity(group.len());
                let mut remaining = Vec::with_capacity(candidates.len() - group.len());
                for (position, candidate) in candidates.into_iter().enumerate() {
                    if group.contains(&position) {
                        matched.push(candidate);
                    } else {
                        remaining.push(candidate);
                    }
                }
                return (matched, remaining);
            }
        }
        (Vec::new(), candidates)
    }
}

/// The shared waitroom queue, guarded by a mutex (cross-session state).
#[derive(Debug, Default)]
pub struct WaitRoom {
    queue: Mutex<Vec<MatchCandidate>>,
}

impl WaitRoom {
    /// Creates an empty waitroom.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a candidate; re-joining refreshes the existing entry instead of
    /// duplicating it.
    pub fn enqueue(&self, candidate: MatchCandidate) {
        let mut queue = self.queue.lock();
        if let Some(existing) = queue
            .iter_mut()
            .find(|queued| queued.participant == candidate.participant)
        {
            *existing = candidate;
        } else {
            queue.push(candidate);
        }
    }

    /// Removes a candidate (socket closed, excluded).
    pub fn remove(&self, participant: &ParticipantId) {
        self.queue.lock().retain(|queued| queued.participant != *participant);
    }

    /// `true` when the participant is queued.
    #[must_use]
    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.queue
            .lock()
            .iter()
            .any(|queued| queued.participant == *participant)
    }

    /// Number of queued candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// `true` when no candidates are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Takes the whole queue (for a matchmaking pass).
    pub fn take_all(&self) -> Vec<MatchCandidate> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Puts unmatched candidates back, preserving their original order at
    /// the front of the queue.
    pub fn restore(&self, mut candidates: Vec<MatchCandidate>) {
        let mut queue = self.queue.lock();
        candidates.append(&mut queue);
        *queue = candidates;
    }

    /// Evicts candidates who waited past the timeout. Returns the evicted.
    pub fn sweep_timeouts(&self, now: Instant, timeout: Duration) -> Vec<MatchCandidate> {
        let mut queue = self.queue.lock();
        let (evicted, kept): (Vec<_>, Vec<_>) = queue
            .drain(..)
            .partition(|candidate| now.saturating_duration_since(candidate.enqueued_at) >= timeout);
        *queue = kept;
        evicted
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn candidate(name: &str, rtt: Option<u64>) -> MatchCandidate {
        MatchCandidate::new(ParticipantId::new(name), rtt)
    }

    #[test]
    fn fifo_groups_oldest_first() {
        let matchmaker = FifoMatchmaker {
            required_players: 2,
        };
        let (matched, remaining) = matchmaker.find_match(vec![
            candidate("a", None),
            candidate("b", None),
            candidate("c", None),
        ]);
        let names: Vec<&str> = matched.iter().map(|c| c.participant.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn fifo_needs_enough_candidates() {
        let matchmaker = FifoMatchmaker {
            required_players: 3,
        };
        let (matched, remaining) = matchmaker.find_match(vec![candidate("a", None)]);
        assert!(matched.is_empty());
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn latency_aware_filters_on_pairwise_sum() {
        let matchmaker = LatencyAwareMatchmaker {
            required_players: 2,
            max_server_rtt_ms: 100,
        };
        // a+b = 160 > 100, a+c = 90 <= 100.
        let (matched, remaining) = matchmaker.find_match(vec![
            candidate("a", Some(80)),
            candidate("b", Some(80)),
            candidate("c", Some(10)),
        ]);
        let names: Vec<&str> = matched.iter().map(|c| c.participant.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        let leftover: Vec<&str> = remaining.iter().map(|c| c.participant.as_str()).collect();
        assert_eq!(leftover, vec!["b"]);
    }

    #[test]
    fn latency_aware_never_excludes_unknown_rtt() {
        let matchmaker = LatencyAwareMatchmaker {
            required_players: 2,
            max_server_rtt_ms: 50,
        };
        let (matched, _) =
            matchmaker.find_match(vec![candidate("a", Some(200)), candidate("b", None)]);
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn waitroom_enqueue_is_idempotent_per_participant() {
        let waitroom = WaitRoom::new();
        waitroom.enqueue(candidate("a", Some(10)));
        waitroom.enqueue(candidate("a", Some(20)));
        assert_eq!(waitroom.len(), 1);
    }

    #[test]
    fn waitroom_restore_preserves_fifo_order() {
        let waitroom = WaitRoom::new();
        waitroom.enqueue(candidate("late", None));
        waitroom.restore(vec![candidate("early-1", None), candidate("early-2", None)]);
        let drained = waitroom.take_all();
        let names: Vec<&str> = drained.iter().map(|c| c.participant.as_str()).collect();
        assert_eq!(names, vec!["early-1", "early-2", "late"]);
    }

    #[test]
    fn waitroom_sweeps_timeouts() {
        let waitroom = WaitRoom::new();
        let mut old = candidate("old", None);
        old.enqueued_at = Instant::now() - Duration::from_secs(120);
        waitroom.enqueue(old);
        waitroom.enqueue(candidate("fresh", None));

        let evicted = waitroom.sweep_timeouts(Instant::now(), Duration::from_secs(60));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].participant.as_str(), "old");
        assert_eq!(waitroom.len(), 1);
    }
}
