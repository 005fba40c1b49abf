//! Shared test fixtures: a deterministic stub environment and a two-engine
//! harness over in-memory sockets with optional fault injection.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tandem::engine::EngineBuilder;
use tandem::network::chaos_socket::{ChaosConfig, ChaosSocket};
use tandem::network::signaling::MemoryRelayPair;
use tandem::{
    Action, EngineConfig, EngineEvent, EngineState, EnvError, Environment, MemoryPairSocket,
    Mulberry32, ParticipantId, ParticipantIndex, RenderMode, ResetOutput, RollbackEngine,
    SessionId, StepOutput,
};
use web_time::Instant;

/// Internal state of [`CounterEnv`], serialized as JSON for state sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CounterState {
    tick: u32,
    totals: BTreeMap<u16, i64>,
    drift: f64,
    rng: Mulberry32,
}

/// A deterministic stub environment: every participant's actions accumulate
/// into per-slot totals, a float drifts by an RNG draw each step, and the
/// whole state (including the RNG) round-trips through `get_state` /
/// `set_state`.
#[derive(Debug, Clone)]
pub struct CounterEnv {
    participants: Vec<ParticipantIndex>,
    state: Option<CounterState>,
}

impl CounterEnv {
    pub fn new(participants: Vec<ParticipantIndex>) -> Self {
        Self {
            participants,
            state: None,
        }
    }

    pub fn tick(&self) -> u32 {
        self.state.as_ref().map_or(0, |state| state.tick)
    }
}

impl Environment for CounterEnv {
    fn reset(&mut self, seed: u32) -> Result<ResetOutput, EnvError> {
        self.state = Some(CounterState {
            tick: 0,
            totals: self
                .participants
                .iter()
                .map(|index| (index.as_u16(), 0))
                .collect(),
            drift: 0.0,
            rng: Mulberry32::new(seed),
        });
        Ok(ResetOutput {
            observations: serde_json::Value::Null,
            info: serde_json::Value::Null,
        })
    }

    fn step(
        &mut self,
        actions: &BTreeMap<ParticipantIndex, Action>,
    ) -> Result<StepOutput, EnvError> {
        let state = self.state.as_mut().ok_or(EnvError::StepFault {
            detail: "step before reset".to_owned(),
        })?;
        state.tick += 1;
        let mut rewards = BTreeMap::new();
        let mut terminateds = BTreeMap::new();
        let mut truncateds = BTreeMap::new();
        for (&index, &action) in actions {
            *state.totals.entry(index.as_u16()).or_insert(0) += i64::from(action.as_u32());
            rewards.insert(index, f64::from(action.as_u32()) * 0.25);
            terminateds.insert(index, false);
            truncateds.insert(index, false);
        }
        state.drift += state.rng.next_f64();
        Ok(StepOutput {
            observations: serde_json::Value::Null,
            rewards,
            terminateds,
            truncateds,
            info: serde_json::Value::Null,
        })
    }

    fn get_state(&self) -> Result<Vec<u8>, EnvError> {
        let state = self.state.as_ref().ok_or(EnvError::StateDecode {
            detail: "no state before reset".to_owned(),
        })?;
        serde_json::to_vec(state).map_err(|err| EnvError::StateDecode {
            detail: err.to_string(),
        })
    }

    fn set_state(&mut self, bytes: &[u8]) -> Result<(), EnvError> {
        let state: CounterState =
            serde_json::from_slice(bytes).map_err(|err| EnvError::StateDecode {
                detail: err.to_string(),
            })?;
        self.state = Some(state);
        Ok(())
    }

    fn render(&self, _mode: RenderMode) -> Option<serde_json::Value> {
        None
    }
}

/// An environment without state-sync support, for the detection test.
#[derive(Debug, Clone)]
pub struct OpaqueEnv(pub CounterEnv);

impl Environment for OpaqueEnv {
    fn reset(&mut self, seed: u32) -> Result<ResetOutput, EnvError> {
        self.0.reset(seed)
    }
    fn step(
        &mut self,
        actions: &BTreeMap<ParticipantIndex, Action>,
    ) -> Result<StepOutput, EnvError> {
        self.0.step(actions)
    }
    fn get_state(&self) -> Result<Vec<u8>, EnvError> {
        Err(EnvError::StateSupportMissing)
    }
    fn set_state(&mut self, _bytes: &[u8]) -> Result<(), EnvError> {
        Err(EnvError::StateSupportMissing)
    }
    fn render(&self, _mode: RenderMode) -> Option<serde_json::Value> {
        None
    }
    fn supports_state_sync(&self) -> bool {
        false
    }
}

pub type TestSocket = ChaosSocket<ParticipantIndex, MemoryPairSocket>;
pub type TestEngine = RollbackEngine<CounterEnv, ParticipantIndex, TestSocket>;

pub const INDEX_A: ParticipantIndex = ParticipantIndex::new(0);
pub const INDEX_B: ParticipantIndex = ParticipantIndex::new(1);

/// Builds a connected two-engine pair. `chaos_a` shapes what engine A
/// *receives* (its inbound latency/loss), `chaos_b` likewise for B.
pub fn build_pair(
    seed: u32,
    config: EngineConfig,
    chaos_a: ChaosConfig,
    chaos_b: ChaosConfig,
) -> (TestEngine, TestEngine) {
    build_pair_with_inputs(
        seed,
        config,
        chaos_a,
        chaos_b,
        |frame| Action(frame.as_u32() % 3),
        |frame| Action(frame.as_u32() % 3),
    )
}

/// Builds a pair with distinct input schedules per engine.
pub fn build_pair_with_inputs(
    seed: u32,
    config: EngineConfig,
    chaos_a: ChaosConfig,
    chaos_b: ChaosConfig,
    input_a: impl FnMut(tandem::Frame) -> Action + 'static,
    input_b: impl FnMut(tandem::Frame) -> Action + 'static,
) -> (TestEngine, TestEngine) {
    let (sock_a, sock_b) = MemoryPairSocket::pair(INDEX_A, INDEX_B);
    let (relay_a, relay_b) = MemoryRelayPair::pair();
    let session = SessionId::new("test-session");

    let mut engine_a = EngineBuilder::new()
        .with_session(session.clone(), seed)
        .with_local(ParticipantId::new("alice"), INDEX_A)
        .with_remote(INDEX_B, INDEX_B)
        .with_env(CounterEnv::new(vec![INDEX_A, INDEX_B]))
        .with_socket(ChaosSocket::new(sock_a, chaos_a))
        .with_relay(Box::new(relay_a))
        .with_local_input(input_a)
        .with_config(config)
        .build()
        .expect("engine A builds");
    let mut engine_b = EngineBuilder::new()
        .with_session(session, seed)
        .with_local(ParticipantId::new("bob"), INDEX_B)
        .with_remote(INDEX_A, INDEX_A)
        .with_env(CounterEnv::new(vec![INDEX_A, INDEX_B]))
        .with_socket(ChaosSocket::new(sock_b, chaos_b))
        .with_relay(Box::new(relay_b))
        .with_local_input(input_b)
        .with_config(config)
        .build()
        .expect("engine B builds");

    engine_a.open_all_channels();
    engine_b.open_all_channels();
    (engine_a, engine_b)
}

/// Ticks both engines alternately until both have emitted their episode
/// export (or the iteration budget runs out). Returns the drained events of
/// each engine.
pub fn run_to_completion(
    engine_a: &mut TestEngine,
    engine_b: &mut TestEngine,
    max_ticks: usize,
) -> (Vec<EngineEvent>, Vec<EngineEvent>) {
    engine_a.start_episode().expect("episode A starts");
    engine_b.start_episode().expect("episode B starts");

    let mut events_a = Vec::new();
    let mut events_b = Vec::new();
    for _ in 0..max_ticks {
        let now = Instant::now();
        engine_a.tick(now);
        engine_b.tick(now);
        events_a.extend(engine_a.drain_events());
        events_b.extend(engine_b.drain_events());
        if done(engine_a) && done(engine_b) {
            break;
        }
    }
    assert!(
        done(engine_a) && done(engine_b),
        "engines did not complete within {max_ticks} ticks \
         (a: {:?} frame {}, b: {:?} frame {})",
        engine_a.state(),
        engine_a.current_frame(),
        engine_b.state(),
        engine_b.current_frame(),
    );
    (events_a, events_b)
}

fn done(engine: &TestEngine) -> bool {
    matches!(
        engine.state(),
        EngineState::AwaitingExportAck | EngineState::Ended
    )
}

/// Pulls the episode export out of a drained event list.
pub fn export_of(events: &[EngineEvent]) -> tandem::export::EpisodeData {
    events
        .iter()
        .find_map(|event| match event {
            EngineEvent::EpisodeComplete { data } => Some((**data).clone()),
            _ => None,
        })
        .expect("episode export emitted")
}
