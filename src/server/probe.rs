//! P2P probe coordination.
//!
//! Before committing candidates to a session, the server has them open a
//! throwaway peer connection and measure true end-to-end RTT with the same
//! ping/pong frames the game transport uses. The coordinator tracks each
//! in-flight probe through its two-phase handshake
//! (`prepare → ready → start`), collects the samples the clients report,
//! and renders a verdict.
//!
//! Safety over throughput: any probe that cannot produce a measurement
//! (timeout, signaling race, missing samples) *rejects* the proposed match
//! and returns the candidates to the waitroom. A session that starts on an
//! unmeasured link risks an unusable experiment; a few extra seconds of
//! waitroom does not.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use web_time::{Duration, Instant};

use crate::network::signaling::ProbeId;
use crate::ParticipantId;

/// Probe timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Pings per probe.
    pub pings: usize,
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Per-ping reply timeout.
    pub ping_timeout: Duration,
    /// Client-side channel-open timeout.
    pub open_timeout: Duration,
    /// Overall probe timeout.
    pub overall_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            pings: 5,
            ping_interval: Duration::from_millis(100),
            ping_timeout: Duration::from_secs(2),
            open_timeout: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(15),
        }
    }
}

/// Phase of one in-flight probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    /// `probe_prepare` sent; waiting for every candidate's `probe_ready`.
    Preparing,
    /// All ready; `probe_start` sent; pings in flight.
    Pinging,
    /// Verdict rendered; awaiting removal.
    Done,
}

/// Verdict of a finished probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Median RTT in milliseconds.
    Measured(u64),
    /// No measurement could be produced; the match must be rejected.
    Failed,
}

#[derive(Debug)]
struct ProbeState {
    candidates: Vec<ParticipantId>,
    phase: ProbePhase,
    ready: BTreeSet<ParticipantId>,
    samples: Vec<u64>,
    started_at: Instant,
    pinging_since: Option<Instant>,
}

/// Keyed table of in-flight probes. Independent of session lifecycle: a
/// probe may outlive the matchmaking pass that started it and a failed probe
/// never takes a session down with it.
#[derive(Debug, Default)]
pub struct ProbeCoordinator {
    probes: Mutex<BTreeMap<ProbeId, ProbeState>>,
    next_id: Mutex<u64>,
    config: ProbeConfig,
}

impl ProbeCoordinator {
    /// Creates a coordinator with default timing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a coordinator with custom timing.
    #[must_use]
    pub fn with_config(config: ProbeConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// The timing configuration.
    #[must_use]
    pub fn config(&self) -> ProbeConfig {
        self.config
    }

    /// Starts tracking a probe between `candidates`. The caller sends
    /// `probe_prepare` to each candidate over the relay.
    pub fn begin(&self, candidates: Vec<ParticipantId>, now: Instant) -> ProbeId {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            ProbeId(*next)
        };
        tracing::debug!(probe = %id, ?candidates, "probe started");
        self.probes.lock().insert(
            id,
            ProbeState {
                candidates,
                phase: ProbePhase::Preparing,
                ready: BTreeSet::new(),
                samples: Vec::new(),
                started_at: now,
                pinging_since: None,
            },
        );
        id
    }

    /// The candidates of a probe.
    #[must_use]
    pub fn candidates(&self, id: ProbeId) -> Option<Vec<ParticipantId>> {
        self.probes.lock().get(&id).map(|probe| probe.candidates.clone())
    }

    /// Current phase of a probe.
    #[must_use]
    pub fn phase(&self, id: ProbeId) -> Option<ProbePhase> {
        self.probes.lock().get(&id).map(|probe| probe.phase)
    }

    /// Records a candidate's `probe_ready`. Returns `true` when everyone is
    /// ready — the caller then sends `probe_start`.
    pub fn on_ready(&self, id: ProbeId, participant: &ParticipantId, now: Instant) -> bool {
        let mut probes = self.probes.lock();
        let Some(probe) = probes.get_mut(&id) else {
            tracing::warn!(probe = %id, "ready for unknown probe dropped");
            return false;
        };
        if probe.phase != ProbePhase::Preparing {
            return false;
        }
        if !probe.candidates.contains(participant) {
            tracing::warn!(probe = %id, %participant, "ready from non-candidate dropped");
            return false;
        }
        probe.ready.insert(participant.clone());
        let all_ready = probe.ready.len() == probe.candidates.len();
        if all_ready {
            probe.phase = ProbePhase::Pinging;
            probe.pinging_since = Some(now);
        }
        all_ready
    }

    /// Records one RTT sample reported by a probing client.
    pub fn on_sample(&self, id: ProbeId, rtt_ms: u64) {
        let mut probes = self.probes.lock();
        if let Some(probe) = probes.get_mut(&id) {
            if probe.phase == ProbePhase::Pinging {
                probe.samples.push(rtt_ms);
            }
        }
    }

    /// Records the client-side aggregated result (`probe_result`). A `None`
    /// RTT finishes the probe as failed immediately.
    pub fn on_result(&self, id: ProbeId, rtt_ms: Option<u64>) -> Option<ProbeOutcome> {
        let mut probes = self.probes.lock();
        let probe = probes.get_mut(&id)?;
        if probe.phase == ProbePhase::Done {
            return None;
        }
        probe.phase = ProbePhase::Done;
        let outcome = match rtt_ms {
            Some(rtt) => ProbeOutcome::Measured(rtt),
            None => ProbeOutcome::Failed,
        };
        tracing::debug!(probe = %id, ?outcome, "probe result reported");
        Some(outcome)
    }

    /// Advances timers: a probe that outlived its phase timeout or its
    /// overall budget is finished as [`ProbeOutcome::Failed`]. Returns every
    /// probe that reached a verdict this pass.
    pub fn poll(&self, now: Instant) -> Vec<(ProbeId, ProbeOutcome)> {
        let mut verdicts = Vec::new();
        let mut probes = self.probes.lock();
        for (&id, probe) in probes.iter_mut() {
            if probe.phase == ProbePhase::Done {
                continue;
            }
            let elapsed = now.saturating_duration_since(probe.started_at);
            let timed_out = match probe.phase {
                ProbePhase::Preparing => elapsed >= self.config.open_timeout,
                ProbePhase::Pinging => {
                    let ping_window = self.config.ping_interval * probe.samples.len().max(1) as u32
                        + self.config.ping_timeout;
                    let pinging_elapsed = probe
                        .pinging_since
                        .map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
                    pinging_elapsed >= ping_window && probe.samples.len() < self.config.pings
                },
                ProbePhase::Done => false,
            } || elapsed >= self.config.overall_timeout;

            if timed_out {
                tracing::warn!(probe = %id, phase = ?probe.phase, "probe timed out");
                probe.phase = ProbePhase::Done;
                verdicts.push((id, ProbeOutcome::Failed));
                continue;
            }

            // Enough samples: render the median.
            if probe.phase == ProbePhase::Pinging && probe.samples.len() >= self.config.pings {
                probe.phase = ProbePhase::Done;
                let mut sorted = probe.samples.clone();
                sorted.sort_unstable();
                let median = sorted[sorted.len() / 2];
                verdicts.push((id, ProbeOutcome::Measured(median)));
            }
        }
        verdicts
    }

    /// Removes a finished probe from the table.
    pub fn finish(&self, id: ProbeId) {
        self.probes.lock().remove(&id);
    }

    /// Number of probes currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.probes.lock().len()
    }

    /// `true` when no probes are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.probes.lock().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pair() -> Vec<ParticipantId> {
        vec![ParticipantId::new("a"), ParticipantId::new("b")]
    }

    #[test]
    fn two_phase_handshake_reaches_pinging() {
        let coordinator = ProbeCoordinator::new();
        let now = Instant::now();
        let id = coordinator.begin(pair(), now);
        assert_eq!(coordinator.phase(id), Some(ProbePhase::Preparing));

        assert!(!coordinator.on_ready(id, &ParticipantId::new("a"), now));
        assert!(coordinator.on_ready(id, &ParticipantId::new("b"), now));
        assert_eq!(coordinator.phase(id), Some(ProbePhase::Pinging));
    }

    #[test]
    fn median_of_samples_is_reported() {
        let coordinator = ProbeCoordinator::new();
        let now = Instant::now();
        let id = coordinator.begin(pair(), now);
        coordinator.on_ready(id, &ParticipantId::new("a"), now);
        coordinator.on_ready(id, &ParticipantId::new("b"), now);

        for sample in [80, 100, 90, 120, 85] {
            coordinator.on_sample(id, sample);
        }
        let verdicts = coordinator.poll(now);
        assert_eq!(verdicts, vec![(id, ProbeOutcome::Measured(90))]);
    }

    #[test]
    fn none_result_fails_the_probe() {
        let coordinator = ProbeCoordinator::new();
        let now = Instant::now();
        let id = coordinator.begin(pair(), now);
        assert_eq!(coordinator.on_result(id, None), Some(ProbeOutcome::Failed));
        // Second report is ignored.
        assert_eq!(coordinator.on_result(id, Some(50)), None);
    }

    #[test]
    fn preparing_times_out_as_failed() {
        let coordinator = ProbeCoordinator::new();
        let start = Instant::now();
        let id = coordinator.begin(pair(), start);

        let later = start + Duration::from_secs(11);
        let verdicts = coordinator.poll(later);
        assert_eq!(verdicts, vec![(id, ProbeOutcome::Failed)]);
    }

    #[test]
    fn overall_timeout_fails_even_while_pinging() {
        let coordinator = ProbeCoordinator::new();
        let start = Instant::now();
        let id = coordinator.begin(pair(), start);
        coordinator.on_ready(id, &ParticipantId::new("a"), start);
        coordinator.on_ready(id, &ParticipantId::new("b"), start);
        coordinator.on_sample(id, 50);

        let later = start + Duration::from_secs(16);
        let verdicts = coordinator.poll(later);
        assert_eq!(verdicts, vec![(id, ProbeOutcome::Failed)]);
    }

    #[test]
    fn ready_from_stranger_is_dropped() {
        let coordinator = ProbeCoordinator::new();
        let now = Instant::now();
        let id = coordinator.begin(pair(), now);
        assert!(!coordinator.on_ready(id, &ParticipantId::new("mallory"), now));
        assert_eq!(coordinator.phase(id), Some(ProbePhase::Preparing));
    }

    #[test]
    fn finish_removes_the_probe() {
        let coordinator = ProbeCoordinator::new();
        let id = coordinator.begin(pair(), Instant::now());
        assert_eq!(coordinator.len(), 1);
        coordinator.finish(id);
        assert!(coordinator.is_empty());
    }
}
