//! The rollback engine: a deterministic step loop with prediction, replay
//! and confirmation.
//!
//! One engine instance runs per participant per session. It exclusively owns
//! its environment, input buffer, snapshot ring, recorder, hasher and frame
//! counter; collaborators interact with it only through method calls and the
//! drained [`EngineEvent`] stream.
//!
//! # The per-tick algorithm
//!
//! Every tick from the worker timer drives one pass:
//!
//! 1. **Drain inbound.** Pull buffered input frames from the transport and
//!    any fallback inputs the signaling relay delivered. Contradictions with
//!    previously used predictions flag a rollback.
//! 2. **Rollback, if flagged.** Restore the nearest snapshot at or before
//!    the smallest flagged frame, discard invalidated snapshots, records and
//!    hashes, and replay forward — confirmed inputs where present,
//!    re-predictions where still missing.
//! 3. **Collect local input.** The action collected now applies at
//!    `frame + input_delay`; a backgrounded participant contributes the
//!    default action instead.
//! 4. **Predict missing remotes.** Last confirmed action per participant,
//!    recorded in the prediction ledger.
//! 5. **Step** the environment and write the speculative record.
//! 6. **Send outbound**: a redundant bundle of recent local inputs.
//! 7. **Snapshot** at the configured interval.
//! 8. **Advance the confirmed frame**: resolve ledger entries, hash and
//!    promote every newly confirmed frame.
//! 9. **Exchange hashes** with peers.
//! 10. **Advance the frame counter.**
//!
//! The engine is single-threaded cooperative: ticks are processed one at a
//! time, in order, and no frame N+1 side effect is observable before frame
//! N's.

pub mod config;
pub mod focus;
pub mod ticker;

pub use config::{BotReplay, EngineConfig};
pub use ticker::{TickMessage, WorkerTicker};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use web_time::Instant;

use crate::env::Environment;
use crate::error::{TandemError, TerminationReason};
use crate::export::EpisodeData;
use crate::hasher::{digest_state, DesyncPolicy, FrameHasher, HashOutcome};
use crate::input_buffer::{InputBuffer, PutOutcome};
use crate::network::messages::{InputBundle, InputFrame};
use crate::network::signaling::{SignalingEvent, SignalingRelay};
use crate::network::socket::DatagramSocket;
use crate::network::transport::{
    ChannelCondition, PeerTransport, TransportConfig, TransportEvent,
};
use crate::recorder::{DualBufferRecorder, RollbackEventRecord, StepRecord};
use crate::rng::Mulberry32;
use crate::snapshot::{Snapshot, SnapshotRing};
use crate::telemetry::{Telemetry, ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Action, Frame, ParticipantId, ParticipantIndex, SessionId};

use focus::FocusManager;

/// Deterministic action source for a bot (non-human) participant.
///
/// The engine hands the policy a per-frame derived random stream, so the
/// same `(seed, frame, index)` always samples the same action — on both
/// peers, and on any replay of the frame.
pub trait BotPolicy {
    /// Chooses the bot's action for `frame`.
    fn act(&mut self, frame: Frame, rng: &mut Mulberry32) -> Action;
}

impl<F> BotPolicy for F
where
    F: FnMut(Frame, &mut Mulberry32) -> Action,
{
    fn act(&mut self, frame: Frame, rng: &mut Mulberry32) -> Action {
        self(frame, rng)
    }
}

/// Lifecycle state of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed or between episodes; not simulating.
    Idle,
    /// Episode reset done; waiting for every peer's episode-ready.
    AwaitingPeers,
    /// Simulating.
    Running,
    /// Bilaterally paused during a connection interruption.
    Paused,
    /// The final frame was reached; waiting for confirmation of every frame
    /// at or before it.
    EndGate,
    /// The export was emitted; waiting for the collaborator to acknowledge.
    AwaitingExportAck,
    /// Terminal. The session is over and the instance will be destroyed.
    Ended,
}

/// Notifications drained from the engine by its collaborators.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineEvent {
    /// An episode was reset and the ready gate entered.
    EpisodeStarted {
        /// Episode number, starting at 0.
        episode: u32,
    },
    /// Every peer reported ready; stepping begins.
    AllPeersReady,
    /// The episode completed and its export is ready. Call
    /// [`RollbackEngine::acknowledge_export`] once it is persisted.
    EpisodeComplete {
        /// The atomic export payload.
        data: Box<EpisodeData>,
    },
    /// Local and peer digests disagreed.
    DesyncDetected(crate::hasher::DesyncEvent),
    /// Under [`DesyncPolicy::RequestStateTransfer`]: ask this peer for a
    /// state transfer (it has the lower participant index).
    StateTransferRequested {
        /// The peer to request from.
        from: ParticipantIndex,
    },
    /// A remote input arrived beyond the snapshot ring's reach; simulation
    /// continued without rollback and the hasher will surface any
    /// divergence.
    DeepDrift {
        /// The unreachable rollback target.
        frame: Frame,
    },
    /// The step loop paused (connection interruption, here or at the
    /// partner).
    Paused {
        /// The peer whose connection caused the pause.
        peer: ParticipantIndex,
    },
    /// The step loop resumed after an interruption.
    Resumed {
        /// The recovered peer.
        peer: ParticipantIndex,
    },
    /// A refocus catch-up completed.
    FastForwarded {
        /// Frames replayed during the catch-up.
        frames: u32,
    },
    /// The session ended.
    Ended {
        /// The reason code.
        reason: TerminationReason,
    },
}

/// End-of-frame state capture, kept until the frame confirms and is hashed.
#[derive(Debug, Clone)]
struct StateCapture {
    env_state: Vec<u8>,
    rng_state: u32,
}

/// An in-progress rollback replay.
#[derive(Debug, Clone, Copy)]
struct ReplayPlan {
    /// Next frame to re-execute.
    next: Frame,
    /// One past the last frame to re-execute.
    until: Frame,
    /// The rollback this replay serves.
    event: RollbackEventRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepMode {
    /// First execution of this frame.
    Fresh,
    /// Re-execution during rollback or fast-forward replay.
    Replay,
}

/// The synchronization core of one participant in one session.
///
/// Generic over the environment, the peer address type and the datagram
/// socket; everything else is concrete.
pub struct RollbackEngine<E, A, S>
where
    E: Environment,
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug,
    S: DatagramSocket<A>,
{
    config: EngineConfig,
    session: SessionId,
    seed: u32,
    local_id: ParticipantId,
    local_index: ParticipantIndex,
    human_indices: Vec<ParticipantIndex>,
    bot_indices: Vec<ParticipantIndex>,
    remote_indices: Vec<ParticipantIndex>,

    env: E,
    rng: Mulberry32,
    state: EngineState,
    episode: u32,
    /// The next frame to execute.
    current_frame: Frame,

    inputs: InputBuffer,
    /// Predictions in use: `frame → (index → predicted action)`.
    ledger: BTreeMap<Frame, BTreeMap<ParticipantIndex, Action>>,
    /// Frames that were ever stepped with at least one predicted input.
    ever_predicted: BTreeSet<Frame>,
    /// Smallest frame whose prediction was contradicted, if any.
    rollback_flag: Option<Frame>,
    pending_replay: Option<ReplayPlan>,
    fast_forward_catchup: bool,
    fast_forward_frames: u32,

    snapshots: SnapshotRing,
    /// End-of-frame states awaiting confirmation hashing.
    state_cache: BTreeMap<Frame, StateCapture>,
    recorder: DualBufferRecorder,
    hasher: FrameHasher,
    transport: PeerTransport<A, S>,
    relay: Box<dyn SignalingRelay>,
    focus: FocusManager,
    telemetry: Telemetry,

    /// The redundancy window of recently collected local inputs.
    local_history: VecDeque<InputFrame>,
    local_source: Box<dyn FnMut(Frame) -> Action>,
    bot_policy: Option<Box<dyn BotPolicy>>,

    /// Highest frame promoted into the canonical buffer.
    promoted_upto: Option<Frame>,
    peers_ready: BTreeSet<ParticipantIndex>,
    peer_final_frames: BTreeMap<ParticipantIndex, Frame>,
    paused_peers: BTreeSet<ParticipantIndex>,
    /// Local episode-end detection: the final frame, once reached.
    local_terminal_frame: Option<Frame>,
    gate_since: Option<Instant>,
    gate_final_frame: Option<Frame>,

    events: VecDeque<EngineEvent>,
}

impl<E, A, S> RollbackEngine<E, A, S>
where
    E: Environment,
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug,
    S: DatagramSocket<A>,
{
    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder<E, A, S> {
        EngineBuilder::new()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The next frame to execute.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// The confirmed-inputs watermark.
    #[must_use]
    pub fn confirmed_frame(&self) -> Option<Frame> {
        self.inputs.confirmed_frame()
    }

    /// The verified-hash watermark.
    #[must_use]
    pub fn verified_frame(&self) -> Option<Frame> {
        self.hasher.verified_frame()
    }

    /// Telemetry counters for the running episode.
    #[must_use]
    pub fn counters(&self) -> crate::telemetry::Counters {
        self.telemetry.counters
    }

    /// Mutable access to the transport, for wiring channel-condition reports.
    pub fn transport_mut(&mut self) -> &mut PeerTransport<A, S> {
        &mut self.transport
    }

    /// Drains pending notifications.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    /// Records a focus transition from the host page.
    pub fn set_focused(&mut self, focused: bool) {
        if focused {
            self.focus.on_refocus();
        } else {
            self.focus.on_background();
        }
    }

    // ------------------------------------------------------------------
    // Episode lifecycle
    // ------------------------------------------------------------------

    /// Resets the environment and enters the episode-ready gate.
    ///
    /// The engine refuses to start when the environment cannot serialize
    /// state — multiplayer sync would silently desync without rollback
    /// support.
    pub fn start_episode(&mut self) -> Result<(), TandemError> {
        if self.state != EngineState::Idle {
            return Err(TandemError::InvalidEngineState {
                operation: "start_episode",
            });
        }
        if !self.env.supports_state_sync() {
            self.end_session(TerminationReason::EnvironmentError);
            return Err(TandemError::Environment(
                crate::env::EnvError::StateSupportMissing,
            ));
        }

        self.rng = Mulberry32::new(self.seed);
        if let Err(err) = self.env.reset(self.seed) {
            self.end_session(TerminationReason::EnvironmentError);
            return Err(TandemError::Environment(err));
        }

        self.inputs = InputBuffer::new(self.human_indices.clone());
        self.ledger.clear();
        self.ever_predicted.clear();
        self.rollback_flag = None;
        self.pending_replay = None;
        self.fast_forward_catchup = false;
        self.fast_forward_frames = 0;
        self.snapshots = SnapshotRing::new(self.config.max_snapshots, self.config.snapshot_interval);
        self.state_cache.clear();
        self.recorder.clear();
        self.hasher.clear();
        self.telemetry.reset_counters();
        self.local_history.clear();
        self.promoted_upto = None;
        self.peer_final_frames.clear();
        self.local_terminal_frame = None;
        self.gate_since = None;
        self.gate_final_frame = None;
        self.current_frame = Frame::ZERO;

        // Every participant runs the default action for the first
        // `input_delay` frames; both peers pre-fill so those frames confirm
        // without any network round trip.
        for offset in 0..self.config.input_delay {
            for &index in &self.human_indices.clone() {
                let _ = self
                    .inputs
                    .put(Frame::new(offset), index, self.config.default_action);
            }
        }

        // Genesis snapshot: the state entering frame 0.
        match self.env.get_state() {
            Ok(env_state) => self.snapshots.save(Snapshot {
                frame: Frame::ZERO,
                env_state,
                rng_state: self.rng.state(),
            }),
            Err(err) => {
                self.end_session(TerminationReason::EnvironmentError);
                return Err(TandemError::Environment(err));
            },
        }

        self.state = if self.remote_indices.is_empty() {
            EngineState::Running
        } else {
            // Readiness is session formation: announce it on the relay
            // (reliable, works before the P2P channel is up) and on the
            // channel itself.
            self.relay.send(SignalingEvent::EpisodeReady {
                session: self.session.clone(),
                index: self.local_index,
                seed: self.seed,
            });
            for peer in self.remote_indices.clone() {
                let _ = self.transport.send_episode_ready(peer, self.seed, Frame::ZERO);
            }
            EngineState::AwaitingPeers
        };
        tracing::info!(session = %self.session, episode = self.episode, seed = self.seed, "episode started");
        self.events.push_back(EngineEvent::EpisodeStarted {
            episode: self.episode,
        });
        Ok(())
    }

    /// Acknowledges receipt of an emitted export; clears the export buffer
    /// and returns the engine to [`EngineState::Idle`] for the next episode.
    pub fn acknowledge_export(&mut self) {
        if self.state == EngineState::AwaitingExportAck {
            self.recorder.clear();
            self.peers_ready.clear();
            self.episode += 1;
            self.state = EngineState::Idle;
        }
    }

    /// Ends the session from the outside (server shutdown, exclusion).
    pub fn terminate(&mut self, reason: TerminationReason) {
        self.end_session(reason);
    }

    // ------------------------------------------------------------------
    // Tick processing
    // ------------------------------------------------------------------

    /// Drains the worker ticker and processes each tick in order.
    pub fn drive(&mut self, ticker: &WorkerTicker) {
        for _tick in ticker.drain() {
            self.tick(Instant::now());
        }
    }

    /// Processes one tick.
    pub fn tick(&mut self, now: Instant) {
        if self.state == EngineState::Ended {
            return;
        }
        self.drain_inbound(now);
        match self.state {
            EngineState::Idle | EngineState::AwaitingExportAck | EngineState::Paused => {},
            EngineState::AwaitingPeers => self.tick_awaiting_peers(),
            EngineState::Running => self.tick_running(now),
            EngineState::EndGate => self.tick_end_gate(now),
            EngineState::Ended => {},
        }
    }

    fn tick_awaiting_peers(&mut self) {
        // Resent every tick until the gate opens: the ready message is tiny
        // and the channel may eat any individual copy.
        for peer in self.remote_indices.clone() {
            let _ = self.transport.send_episode_ready(peer, self.seed, Frame::ZERO);
        }
        let all_ready = self
            .remote_indices
            .iter()
            .all(|peer| self.peers_ready.contains(peer));
        if all_ready {
            self.state = EngineState::Running;
            self.events.push_back(EngineEvent::AllPeersReady);
            tracing::debug!(session = %self.session, "all peers ready; stepping begins");
        }
    }

    fn tick_running(&mut self, now: Instant) {
        // Refocus: drain the side queue and enter catch-up mode.
        if self.focus.take_pending_fast_forward() {
            let buffered = self.focus.take_buffered();
            self.telemetry.counters.fast_forwards += 1;
            self.fast_forward_catchup = true;
            self.fast_forward_frames = 0;
            self.apply_remote_inputs(buffered);
        }
        if self.is_terminal() {
            return;
        }

        // Continue an unfinished bounded replay before anything else.
        if self.pending_replay.is_some() {
            self.continue_replay();
            if self.pending_replay.is_some() || self.is_terminal() {
                return;
            }
        }

        // Rollback, if flagged.
        if let Some(target) = self.rollback_flag.take() {
            self.begin_rollback(target);
            if self.pending_replay.is_some() || self.is_terminal() {
                return;
            }
        }

        if self.fast_forward_catchup {
            self.fast_forward_catchup = false;
            let frames = self.fast_forward_frames;
            tracing::debug!(frames, "fast-forward caught up");
            self.events.push_back(EngineEvent::FastForwarded { frames });
        }
        if self.state != EngineState::Running {
            return;
        }

        self.step_pipeline(now);
    }

    /// Steps the current frame through the full per-tick pipeline.
    fn step_pipeline(&mut self, now: Instant) {
        let frame = self.current_frame;

        // Collect local input, delayed by `input_delay`.
        let apply_at = frame + self.config.input_delay;
        let action = if self.focus.is_focused() {
            (self.local_source)(apply_at)
        } else {
            self.config.default_action
        };
        match self.inputs.put(apply_at, self.local_index, action) {
            Ok(_) => {
                self.local_history.push_back(InputFrame {
                    frame: apply_at,
                    index: self.local_index,
                    action,
                });
                while self.local_history.len() > self.config.redundancy_count {
                    self.local_history.pop_front();
                }
            },
            Err(err) => {
                // Collecting twice for the same frame would be an engine bug.
                self.telemetry.report(
                    ViolationSeverity::Error,
                    ViolationKind::InputBuffer,
                    Some(apply_at),
                    format!("local input collection conflict: {err}"),
                );
            },
        }

        // Predict, step, record, snapshot.
        if !self.execute_frame(frame, StepMode::Fresh) {
            return;
        }
        self.current_frame = frame + 1;

        // Send the redundant bundle.
        self.send_local_bundle();

        // Advance confirmation: resolve ledger, hash, promote.
        self.advance_confirmation();
        self.flush_digests();

        if let Some(final_frame) = self.local_terminal_frame {
            self.enter_end_gate(final_frame, now);
        }
    }

    // ------------------------------------------------------------------
    // Inbound processing
    // ------------------------------------------------------------------

    fn drain_inbound(&mut self, now: Instant) {
        let transport_events = self.transport.poll(now);
        for event in transport_events {
            if self.state == EngineState::Ended {
                return;
            }
            self.handle_transport_event(event);
        }
        let relay_events = self.relay.drain();
        for event in relay_events {
            if self.state == EngineState::Ended {
                return;
            }
            self.handle_relay_event(event);
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Inputs { from, inputs } => {
                // A peer that is sending inputs is necessarily past its own
                // ready gate, even if its ready message was lost.
                self.peers_ready.insert(from);
                if self.focus.is_focused() {
                    self.apply_remote_inputs(inputs);
                } else {
                    self.focus.buffer_remote(inputs);
                }
            },
            TransportEvent::PeerDigest { from, frame, digest } => {
                let outcome = self.hasher.on_peer_digest(frame, from, digest);
                self.process_hash_outcomes(vec![outcome]);
            },
            TransportEvent::EpisodeReady { from, seed, .. } => {
                if seed != self.seed {
                    self.telemetry.report(
                        ViolationSeverity::Critical,
                        ViolationKind::NetworkProtocol,
                        None,
                        format!("peer {from} reset with seed {seed}, expected {}", self.seed),
                    );
                    self.end_session(TerminationReason::ProtocolViolation);
                    return;
                }
                self.peers_ready.insert(from);
            },
            TransportEvent::EpisodeEnd { from, final_frame } => {
                self.peer_final_frames.insert(from, final_frame);
                if let Some(local_final) = self.gate_final_frame {
                    if local_final != final_frame {
                        self.telemetry.report(
                            ViolationSeverity::Error,
                            ViolationKind::DesyncDetected,
                            Some(final_frame),
                            format!(
                                "peer {from} ended at frame {final_frame}, local end is {local_final}"
                            ),
                        );
                    }
                }
            },
            TransportEvent::Malformed { from, error } => {
                self.telemetry.report(
                    ViolationSeverity::Critical,
                    ViolationKind::NetworkProtocol,
                    None,
                    format!("malformed datagram from peer {from}: {error}"),
                );
                self.end_session(TerminationReason::ProtocolViolation);
            },
            TransportEvent::Interrupted { peer } => self.pause_for(peer),
            TransportEvent::Resumed { peer } => self.resume_for(peer),
            TransportEvent::Lost { .. } => {
                self.end_session(TerminationReason::PeerDisconnected);
            },
        }
    }

    fn handle_relay_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::EpisodeReady {
                session,
                index,
                seed,
            } => {
                if session != self.session {
                    return;
                }
                if seed != self.seed {
                    self.telemetry.report(
                        ViolationSeverity::Critical,
                        ViolationKind::NetworkProtocol,
                        None,
                        format!("peer {index} reset with seed {seed}, expected {}", self.seed),
                    );
                    self.end_session(TerminationReason::ProtocolViolation);
                    return;
                }
                self.peers_ready.insert(index);
            },
            SignalingEvent::PlayerAction {
                session,
                index,
                frame,
                action,
            } => {
                if session != self.session {
                    return;
                }
                let input = InputFrame {
                    frame,
                    index,
                    action,
                };
                if self.focus.is_focused() {
                    self.apply_remote_inputs([input]);
                } else {
                    self.focus.buffer_remote([input]);
                }
            },
            SignalingEvent::FrameDigest {
                session,
                index,
                frame,
                digest,
            } => {
                if session != self.session {
                    return;
                }
                let outcome = self.hasher.on_peer_digest(frame, index, digest);
                self.process_hash_outcomes(vec![outcome]);
            },
            SignalingEvent::PartnerDisconnected { session, index } => {
                if session == self.session {
                    self.pause_for(index);
                }
            },
            SignalingEvent::EndGame { session, reason } => {
                if session == self.session {
                    self.end_session(reason);
                }
            },
            other => {
                tracing::trace!(?other, "relay event handled outside the engine");
            },
        }
    }

    fn apply_remote_inputs(&mut self, inputs: impl IntoIterator<Item = InputFrame>) {
        for input in inputs {
            match self.inputs.put(input.frame, input.index, input.action) {
                Ok(PutOutcome::Inserted) => {
                    let mut resolved = false;
                    if let Some(frame_ledger) = self.ledger.get_mut(&input.frame) {
                        if let Some(&predicted) = frame_ledger.get(&input.index) {
                            if predicted == input.action {
                                frame_ledger.remove(&input.index);
                                resolved = frame_ledger.is_empty();
                            } else {
                                tracing::debug!(
                                    frame = %input.frame,
                                    index = %input.index,
                                    %predicted,
                                    actual = %input.action,
                                    "prediction contradicted; rollback flagged"
                                );
                                self.rollback_flag = Some(match self.rollback_flag {
                                    Some(existing) => existing.min(input.frame),
                                    None => input.frame,
                                });
                            }
                        }
                    }
                    if resolved {
                        self.ledger.remove(&input.frame);
                    }
                },
                Ok(_) => {},
                Err(err) => {
                    self.telemetry.report(
                        ViolationSeverity::Critical,
                        ViolationKind::InputBuffer,
                        Some(input.frame),
                        err.to_string(),
                    );
                    self.end_session(TerminationReason::ProtocolViolation);
                    return;
                },
            }
        }
    }

    fn pause_for(&mut self, peer: ParticipantIndex) {
        self.paused_peers.insert(peer);
        if self.state == EngineState::Running {
            self.state = EngineState::Paused;
            tracing::info!(%peer, "step loop paused");
            self.events.push_back(EngineEvent::Paused { peer });
        }
    }

    fn resume_for(&mut self, peer: ParticipantIndex) {
        self.paused_peers.remove(&peer);
        if self.state == EngineState::Paused && self.paused_peers.is_empty() {
            self.state = EngineState::Running;
            tracing::info!(%peer, "step loop resumed");
            self.events.push_back(EngineEvent::Resumed { peer });
        }
    }

    // ------------------------------------------------------------------
    // Rollback & replay
    // ------------------------------------------------------------------

    fn begin_rollback(&mut self, target: Frame) {
        let snapshot = match self.snapshots.nearest_at_or_before(target) {
            Some(snapshot) => snapshot.clone(),
            None => {
                // Beyond the ring's reach: log, count, continue. The frame
                // hasher will surface any divergence downstream.
                self.telemetry.counters.deep_drift_events += 1;
                self.telemetry.report(
                    ViolationSeverity::Error,
                    ViolationKind::Rollback,
                    Some(target),
                    format!(
                        "rollback target {target} beyond snapshot reach (oldest: {:?})",
                        self.snapshots.oldest_frame()
                    ),
                );
                self.events.push_back(EngineEvent::DeepDrift { frame: target });
                return;
            },
        };

        if let Err(err) = self.env.set_state(&snapshot.env_state) {
            self.telemetry.report(
                ViolationSeverity::Critical,
                ViolationKind::StateManagement,
                Some(snapshot.frame),
                format!("snapshot restore failed: {err}"),
            );
            self.end_session(TerminationReason::RollbackRestoreFailed);
            return;
        }
        self.rng.restore(snapshot.rng_state);

        // States entering frames past the target were computed from the
        // contradicted prediction; drop everything derived from them.
        self.snapshots.invalidate_from(target + 1);
        self.recorder.invalidate_from(target);
        self.hasher.invalidate_from(target);
        self.ledger.retain(|frame, _| *frame < target);
        self.state_cache.retain(|frame, _| *frame < target);

        let event = RollbackEventRecord {
            detected_at: self.current_frame,
            target,
            depth: self.current_frame - target,
        };
        self.telemetry.counters.rollbacks += 1;
        tracing::debug!(
            target = %target,
            from = %snapshot.frame,
            depth = event.depth,
            "rollback replay"
        );

        self.pending_replay = Some(ReplayPlan {
            next: snapshot.frame,
            until: self.current_frame,
            event,
        });
        self.continue_replay();
    }

    fn continue_replay(&mut self) {
        let Some(mut plan) = self.pending_replay.take() else {
            return;
        };
        let started = Instant::now();
        let mut replayed_this_pass: u32 = 0;

        while plan.next < plan.until {
            if self.fast_forward_catchup {
                let over_frames = replayed_this_pass >= self.config.max_fast_forward_frames;
                let over_time = started.elapsed().as_millis() as u64
                    >= self.config.max_fast_forward_millis;
                if over_frames || over_time {
                    // Bound reached: subsequent ticks continue gradually.
                    tracing::debug!(
                        replayed = replayed_this_pass,
                        remaining = plan.until - plan.next,
                        "fast-forward bound reached"
                    );
                    break;
                }
            }
            let frame = plan.next;
            if !self.execute_replay_frame(frame, plan.event) {
                return;
            }
            plan.next += 1;
            replayed_this_pass += 1;
            if self.fast_forward_catchup {
                self.fast_forward_frames += 1;
            }
        }

        if plan.next < plan.until {
            self.pending_replay = Some(plan);
        }
    }

    fn execute_replay_frame(&mut self, frame: Frame, event: RollbackEventRecord) -> bool {
        let affected = frame >= event.target;
        self.execute_frame_inner(frame, StepMode::Replay, affected.then_some(event))
    }

    fn execute_frame(&mut self, frame: Frame, mode: StepMode) -> bool {
        self.execute_frame_inner(frame, mode, None)
    }

    /// Executes one frame: assemble actions, step, record, capture.
    /// Returns `false` when the session ended (environment fault).
    fn execute_frame_inner(
        &mut self,
        frame: Frame,
        mode: StepMode,
        rollback: Option<RollbackEventRecord>,
    ) -> bool {
        // One entropy draw per executed frame. Replay restores the RNG from
        // the snapshot, so the draw sequence is replay-stable, and both
        // peers see the same value at the same frame.
        let frame_entropy = self.rng.next_u32();

        let mut actions: BTreeMap<ParticipantIndex, Action> = BTreeMap::new();
        let mut predicted = false;
        for &index in &self.human_indices.clone() {
            if let Some(action) = self.inputs.get(frame, index) {
                actions.insert(index, action);
                continue;
            }
            // Last-known prediction: reuse the most recent arrived action.
            let guess = self
                .inputs
                .last_action_at_or_before(frame, index)
                .unwrap_or(self.config.default_action);
            self.ledger.entry(frame).or_default().insert(index, guess);
            self.ever_predicted.insert(frame);
            predicted = true;
            actions.insert(index, guess);
        }
        for &index in &self.bot_indices.clone() {
            let cached = self.inputs.get(frame, index);
            let action = match (cached, self.config.bot_replay) {
                (Some(action), BotReplay::CachedLastAction) => action,
                _ => {
                    let mut bot_rng =
                        Mulberry32::new(frame_entropy ^ u32::from(index.as_u16()).rotate_left(16));
                    let action = match self.bot_policy.as_mut() {
                        Some(policy) => policy.act(frame, &mut bot_rng),
                        None => self.config.default_action,
                    };
                    let _ = self.inputs.put(frame, index, action);
                    action
                },
            };
            actions.insert(index, action);
        }
        if predicted && mode == StepMode::Fresh {
            self.telemetry.counters.predicted_frames += 1;
        }

        let output = match self.env.step(&actions) {
            Ok(output) => output,
            Err(err) => {
                self.telemetry.report(
                    ViolationSeverity::Critical,
                    ViolationKind::StateManagement,
                    Some(frame),
                    format!("environment step faulted: {err}"),
                );
                self.end_session(TerminationReason::EnvironmentError);
                return false;
            },
        };

        // Episode end detection, re-derived on every execution so a replay
        // that corrects a speculative termination also corrects the end.
        let max_steps_reached = self
            .config
            .max_steps
            .is_some_and(|max| frame.as_u32() + 1 >= max);
        if output.all_terminated() || max_steps_reached {
            self.local_terminal_frame = Some(match self.local_terminal_frame {
                Some(existing) => existing.min(frame),
                None => frame,
            });
        } else if self.local_terminal_frame == Some(frame) {
            self.local_terminal_frame = None;
        }

        let mut rollback_events = self
            .recorder
            .speculative(frame)
            .map(|record| record.rollback_events.clone())
            .unwrap_or_default();
        if let Some(event) = rollback {
            rollback_events.push(event);
        }
        self.recorder.write(StepRecord {
            frame,
            actions,
            rewards: output.rewards,
            terminateds: output.terminateds,
            truncateds: output.truncateds,
            info: output.info,
            was_speculative: self.ever_predicted.contains(&frame),
            rollback_events,
        });

        // End-of-frame capture for confirmation hashing, plus the periodic
        // snapshot. Both are skipped during fast-forward catch-up.
        if !self.fast_forward_catchup {
            match self.env.get_state() {
                Ok(env_state) => {
                    let rng_state = self.rng.state();
                    if self.snapshots.is_due(frame + 1) {
                        self.snapshots.save(Snapshot {
                            frame: frame + 1,
                            env_state: env_state.clone(),
                            rng_state,
                        });
                    }
                    self.state_cache.insert(frame, StateCapture { env_state, rng_state });
                },
                Err(err) => {
                    self.telemetry.report(
                        ViolationSeverity::Error,
                        ViolationKind::StateManagement,
                        Some(frame),
                        format!("state capture failed: {err}"),
                    );
                },
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Confirmation, hashing, promotion
    // ------------------------------------------------------------------

    fn advance_confirmation(&mut self) {
        let Some(confirmed) = self.inputs.confirmed_frame() else {
            return;
        };
        if self.current_frame == Frame::ZERO {
            return;
        }
        let last_executed = self.current_frame.saturating_sub(1);
        let limit = confirmed.min(last_executed);

        let mut next = match self.promoted_upto {
            Some(frame) => frame + 1,
            None => Frame::ZERO,
        };
        while next <= limit {
            self.ledger.remove(&next);
            if let Some(capture) = self.state_cache.remove(&next) {
                let digest = digest_state(&capture.env_state, capture.rng_state);
                let outcomes = self.hasher.record_local(next, digest);
                self.process_hash_outcomes(outcomes);
            }
            self.recorder.promote(next, Some(confirmed));
            self.promoted_upto = Some(next);
            next += 1;
        }

        // Housekeeping: confirmed inputs older than the snapshot ring's
        // reach can never be replayed again.
        if let (Some(promoted), Some(oldest)) = (self.promoted_upto, self.snapshots.oldest_frame())
        {
            if promoted.as_u32() >= 240 && promoted % 120 == 0 {
                let cutoff = promoted.saturating_sub(240).min(oldest.saturating_sub(1));
                if cutoff > Frame::ZERO {
                    let _ = self.inputs.prune(cutoff);
                }
            }
        }
    }

    fn process_hash_outcomes(&mut self, outcomes: Vec<HashOutcome>) {
        for outcome in outcomes {
            if let HashOutcome::Mismatch { event: Some(event) } = outcome {
                self.telemetry.report(
                    ViolationSeverity::Error,
                    ViolationKind::DesyncDetected,
                    Some(event.frame),
                    format!(
                        "state digest mismatch at frame {}: local {} peer {}",
                        event.frame, event.local, event.peer
                    ),
                );
                if self.hasher.policy() == DesyncPolicy::RequestStateTransfer
                    && event.peer_index < self.local_index
                {
                    self.events.push_back(EngineEvent::StateTransferRequested {
                        from: event.peer_index,
                    });
                }
                self.events.push_back(EngineEvent::DesyncDetected(event));
            }
        }
    }

    fn send_local_bundle(&mut self) {
        if self.local_history.is_empty() {
            return;
        }
        let bundle: InputBundle = self.local_history.iter().copied().collect();
        for peer in self.remote_indices.clone() {
            if !self.transport.send_inputs(peer, bundle.clone()) {
                // Channel down: fall back to the relay at reduced rate (the
                // relay is not simulation transport and must not carry
                // 60 Hz bundles).
                if self.current_frame % 3 == 0 {
                    if let Some(newest) = bundle.last() {
                        self.relay.send(SignalingEvent::PlayerAction {
                            session: self.session.clone(),
                            index: newest.index,
                            frame: newest.frame,
                            action: newest.action,
                        });
                        self.telemetry.counters.socket_fallback += 1;
                    }
                }
            }
        }
    }

    fn flush_digests(&mut self) {
        for (frame, digest) in self.hasher.take_outbound() {
            for peer in self.remote_indices.clone() {
                if !self.transport.send_digest(peer, frame, digest) {
                    self.relay.send(SignalingEvent::FrameDigest {
                        session: self.session.clone(),
                        index: self.local_index,
                        frame,
                        digest,
                    });
                    self.telemetry.counters.socket_fallback += 1;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Episode boundary
    // ------------------------------------------------------------------

    fn enter_end_gate(&mut self, final_frame: Frame, now: Instant) {
        if self.state == EngineState::EndGate {
            return;
        }
        self.state = EngineState::EndGate;
        self.gate_since = Some(now);
        self.gate_final_frame = Some(final_frame);
        tracing::info!(final_frame = %final_frame, "episode end reached; confirmation gate entered");
        for peer in self.remote_indices.clone() {
            let _ = self.transport.send_episode_end(peer, final_frame);
        }
    }

    fn tick_end_gate(&mut self, now: Instant) {
        // Late inputs can still contradict predictions near the end; the
        // gate replays them like any other tick so canonical data is right.
        if self.pending_replay.is_some() {
            self.continue_replay();
            if self.pending_replay.is_some() || self.is_terminal() {
                return;
            }
        }
        if let Some(target) = self.rollback_flag.take() {
            self.begin_rollback(target);
            if self.pending_replay.is_some() || self.is_terminal() {
                return;
            }
        }
        let Some(final_frame) = self.gate_final_frame else {
            // A replay corrected the speculative termination; resume.
            self.state = EngineState::Running;
            self.gate_since = None;
            return;
        };

        // Keep the partner fed: resend the marker and the last bundle until
        // the gate closes.
        self.send_local_bundle();
        for peer in self.remote_indices.clone() {
            let _ = self.transport.send_episode_end(peer, final_frame);
        }

        self.advance_confirmation();
        self.flush_digests();

        let confirmed_through_final = self
            .inputs
            .confirmed_frame()
            .is_some_and(|confirmed| confirmed >= final_frame);
        let promoted_through_final = self
            .promoted_upto
            .is_some_and(|promoted| promoted >= final_frame);
        if confirmed_through_final && promoted_through_final {
            self.finish_episode(false);
            return;
        }

        let timed_out = self
            .gate_since
            .is_some_and(|since| now.saturating_duration_since(since) >= self.config.confirmation_timeout);
        if timed_out {
            for frame in self.recorder.unpromoted_upto(final_frame) {
                self.recorder.force_promote(frame);
            }
            self.telemetry.counters.force_promotions = self.recorder.force_promotions();
            self.finish_episode(false);
        }
    }

    fn finish_episode(&mut self, partial: bool) {
        let data = self.build_export(TerminationReason::GameComplete, partial);
        self.state = EngineState::AwaitingExportAck;
        tracing::info!(
            session = %self.session,
            episode = self.episode,
            records = data.records.len(),
            "episode export emitted"
        );
        self.events.push_back(EngineEvent::EpisodeComplete {
            data: Box::new(data),
        });
    }

    fn end_session(&mut self, reason: TerminationReason) {
        if self.state == EngineState::Ended {
            return;
        }
        // A lost peer still deserves the confirmed prefix of the data;
        // environment faults produce no export at all.
        let export_partial = reason == TerminationReason::PeerDisconnected
            && self.recorder.canonical_len() > 0;
        if export_partial {
            let data = self.build_export(reason, true);
            self.events.push_back(EngineEvent::EpisodeComplete {
                data: Box::new(data),
            });
        }
        self.state = EngineState::Ended;
        for peer in self.remote_indices.clone() {
            self.transport.close(peer);
        }
        tracing::info!(session = %self.session, %reason, "session ended");
        self.events.push_back(EngineEvent::Ended { reason });
    }

    fn build_export(&mut self, termination: TerminationReason, partial: bool) -> EpisodeData {
        self.telemetry.counters.force_promotions = self.recorder.force_promotions();
        let mut indices: Vec<ParticipantIndex> = self
            .human_indices
            .iter()
            .chain(self.bot_indices.iter())
            .copied()
            .collect();
        indices.sort_unstable();
        let rtt = self
            .remote_indices
            .iter()
            .map(|&peer| {
                (
                    peer,
                    self.transport.stats(peer).and_then(|stats| stats.rtt_summary()),
                )
            })
            .collect();
        EpisodeData {
            session: self.session.clone(),
            participant: self.local_id.clone(),
            participant_index: self.local_index,
            episode: self.episode,
            seed: self.seed,
            indices,
            records: self.recorder.export_episode(),
            counters: self.telemetry.counters,
            rtt,
            desyncs: self.hasher.desync_events().to_vec(),
            termination,
            partial,
        }
    }

    fn is_terminal(&self) -> bool {
        self.state == EngineState::Ended
    }
}

// ----------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------

/// Builder for [`RollbackEngine`].
///
/// # Example
///
/// ```ignore
/// let (socket, _peer_socket) = MemoryPairSocket::pair(ParticipantIndex::new(0), ParticipantIndex::new(1));
/// let (relay, _peer_relay) = MemoryRelayPair::pair();
/// let engine = EngineBuilder::new()
///     .with_session(SessionId::new("session-1"), 12345)
///     .with_local(ParticipantId::new("alice"), ParticipantIndex::new(0))
///     .with_remote(ParticipantIndex::new(1), ParticipantIndex::new(1))
///     .with_env(my_environment)
///     .with_socket(socket)
///     .with_relay(Box::new(relay))
///     .with_local_input(|frame| Action(frame.as_u32() % 3))
///     .build()?;
/// ```
pub struct EngineBuilder<E, A, S>
where
    E: Environment,
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug,
    S: DatagramSocket<A>,
{
    config: EngineConfig,
    transport_config: TransportConfig,
    session: Option<SessionId>,
    seed: u32,
    local_id: Option<ParticipantId>,
    local_index: Option<ParticipantIndex>,
    remotes: Vec<(ParticipantIndex, A)>,
    bots: Vec<ParticipantIndex>,
    env: Option<E>,
    socket: Option<S>,
    relay: Option<Box<dyn SignalingRelay>>,
    local_source: Option<Box<dyn FnMut(Frame) -> Action>>,
    bot_policy: Option<Box<dyn BotPolicy>>,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl<E, A, S> Default for EngineBuilder<E, A, S>
where
    E: Environment,
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug,
    S: DatagramSocket<A>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, A, S> EngineBuilder<E, A, S>
where
    E: Environment,
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug,
    S: DatagramSocket<A>,
{
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            transport_config: TransportConfig::default(),
            session: None,
            seed: 0,
            local_id: None,
            local_index: None,
            remotes: Vec::new(),
            bots: Vec::new(),
            env: None,
            socket: None,
            relay: None,
            local_source: None,
            bot_policy: None,
            observer: None,
        }
    }

    /// Sets the session id and its server-delivered seed.
    #[must_use]
    pub fn with_session(mut self, session: SessionId, seed: u32) -> Self {
        self.session = Some(session);
        self.seed = seed;
        self
    }

    /// Sets the local participant.
    #[must_use]
    pub fn with_local(mut self, id: ParticipantId, index: ParticipantIndex) -> Self {
        self.local_id = Some(id);
        self.local_index = Some(index);
        self
    }

    /// Registers a remote human participant and its transport address.
    #[must_use]
    pub fn with_remote(mut self, index: ParticipantIndex, addr: A) -> Self {
        self.remotes.push((index, addr));
        self
    }

    /// Registers a bot slot, whose actions are derived locally on every
    /// peer from the shared random stream.
    #[must_use]
    pub fn with_bot(mut self, index: ParticipantIndex) -> Self {
        self.bots.push(index);
        self
    }

    /// Sets the environment collaborator.
    #[must_use]
    pub fn with_env(mut self, env: E) -> Self {
        self.env = Some(env);
        self
    }

    /// Sets the datagram socket.
    #[must_use]
    pub fn with_socket(mut self, socket: S) -> Self {
        self.socket = Some(socket);
        self
    }

    /// Sets the signaling relay.
    #[must_use]
    pub fn with_relay(mut self, relay: Box<dyn SignalingRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Sets the local input source: called once per tick with the frame the
    /// action will apply at.
    #[must_use]
    pub fn with_local_input(mut self, source: impl FnMut(Frame) -> Action + 'static) -> Self {
        self.local_source = Some(Box::new(source));
        self
    }

    /// Sets the bot policy shared by all bot slots.
    #[must_use]
    pub fn with_bot_policy(mut self, policy: impl BotPolicy + 'static) -> Self {
        self.bot_policy = Some(Box::new(policy));
        self
    }

    /// Overrides the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the transport timing configuration.
    #[must_use]
    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// Installs a custom violation observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> Result<RollbackEngine<E, A, S>, TandemError> {
        let session = self.session.ok_or(TandemError::InvalidConfiguration {
            info: "session id and seed are required".to_owned(),
        })?;
        let local_id = self.local_id.ok_or(TandemError::InvalidConfiguration {
            info: "local participant is required".to_owned(),
        })?;
        let local_index = self.local_index.ok_or(TandemError::InvalidConfiguration {
            info: "local participant is required".to_owned(),
        })?;
        let env = self.env.ok_or(TandemError::InvalidConfiguration {
            info: "environment is required".to_owned(),
        })?;
        let socket = self.socket.ok_or(TandemError::InvalidConfiguration {
            info: "datagram socket is required".to_owned(),
        })?;
        let relay = self.relay.ok_or(TandemError::InvalidConfiguration {
            info: "signaling relay is required".to_owned(),
        })?;
        let local_source = self.local_source.ok_or(TandemError::InvalidConfiguration {
            info: "local input source is required".to_owned(),
        })?;
        if self.config.input_delay == 0 {
            return Err(TandemError::InvalidConfiguration {
                info: "input_delay must be at least 1".to_owned(),
            });
        }
        if self
            .remotes
            .iter()
            .any(|(index, _)| *index == local_index)
            || self.bots.contains(&local_index)
        {
            return Err(TandemError::InvalidConfiguration {
                info: "local index also registered as remote or bot".to_owned(),
            });
        }

        let mut human_indices: Vec<ParticipantIndex> = self
            .remotes
            .iter()
            .map(|(index, _)| *index)
            .chain(std::iter::once(local_index))
            .collect();
        human_indices.sort_unstable();
        human_indices.dedup();
        let mut bot_indices = self.bots;
        bot_indices.sort_unstable();
        bot_indices.dedup();
        let remote_indices: Vec<ParticipantIndex> = human_indices
            .iter()
            .copied()
            .filter(|index| *index != local_index)
            .collect();

        let mut transport = PeerTransport::new(socket, self.transport_config);
        for (index, addr) in self.remotes {
            transport.add_peer(index, addr);
        }

        let telemetry = match self.observer {
            Some(observer) => Telemetry::with_observer(observer),
            None => Telemetry::default(),
        };

        Ok(RollbackEngine {
            inputs: InputBuffer::new(human_indices.clone()),
            snapshots: SnapshotRing::new(self.config.max_snapshots, self.config.snapshot_interval),
            hasher: FrameHasher::new(self.config.desync_policy),
            config: self.config,
            session,
            seed: self.seed,
            local_id,
            local_index,
            human_indices,
            bot_indices,
            remote_indices,
            env,
            rng: Mulberry32::new(self.seed),
            state: EngineState::Idle,
            episode: 0,
            current_frame: Frame::ZERO,
            ledger: BTreeMap::new(),
            ever_predicted: BTreeSet::new(),
            rollback_flag: None,
            pending_replay: None,
            fast_forward_catchup: false,
            fast_forward_frames: 0,
            state_cache: BTreeMap::new(),
            recorder: DualBufferRecorder::new(),
            transport,
            relay,
            focus: FocusManager::new(),
            telemetry,
            local_history: VecDeque::new(),
            local_source,
            bot_policy: self.bot_policy,
            promoted_upto: None,
            peers_ready: BTreeSet::new(),
            peer_final_frames: BTreeMap::new(),
            paused_peers: BTreeSet::new(),
            local_terminal_frame: None,
            gate_since: None,
            gate_final_frame: None,
            events: VecDeque::new(),
        })
    }
}

/// Convenience for tests and single-machine demos: marks every peer channel
/// as connected.
impl<E, A, S> RollbackEngine<E, A, S>
where
    E: Environment,
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug,
    S: DatagramSocket<A>,
{
    /// Reports every registered peer channel as connected.
    pub fn open_all_channels(&mut self) {
        let now = Instant::now();
        for peer in self.transport.peer_indices() {
            let events = self
                .transport
                .channel_state_changed(peer, ChannelCondition::Connected, now);
            for event in events {
                self.handle_transport_event(event);
            }
        }
    }

    /// Reports a channel condition change (from the WebRTC/ICE layer).
    pub fn report_channel_condition(&mut self, peer: ParticipantIndex, condition: ChannelCondition) {
        let events = self
            .transport
            .channel_state_changed(peer, condition, Instant::now());
        for event in events {
            self.handle_transport_event(event);
        }
    }
}
