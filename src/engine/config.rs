//! Rollback engine configuration.

use web_time::Duration;

use crate::hasher::DesyncPolicy;
use crate::{Action, DEFAULT_FPS};

/// How bot (non-human) actions are produced when a fast-forward replays
/// frames the bot already acted in.
///
/// Both strategies produce identical actions — bot sampling draws from a
/// per-frame derived stream, so re-derivation cannot diverge from the cache.
/// The choice is purely a cost/bookkeeping one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BotReplay {
    /// Replay the action recorded at first execution. Skips policy sampling
    /// during catch-up.
    #[default]
    CachedLastAction,
    /// Run the policy again during replay.
    Rederive,
}

/// Tunables of the rollback engine. Construct with struct-update syntax from
/// [`EngineConfig::default()`] or one of the presets.
///
/// # Example
///
/// ```
/// use tandem::EngineConfig;
///
/// let config = EngineConfig {
///     max_steps: Some(600),
///     ..EngineConfig::default()
/// };
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Simulation rate in frames per second. Drives the worker ticker and
    /// the poll-to-millisecond conversions.
    ///
    /// Default: 60
    pub fps: u32,
    /// Local input delay D: an action collected at frame F applies at
    /// F + D. A small constant delay hides one-way latency without
    /// prediction.
    ///
    /// Default: 2
    pub input_delay: u32,
    /// Snapshot every this many frames.
    ///
    /// Default: 10
    pub snapshot_interval: u32,
    /// Snapshot ring capacity. `max_snapshots x snapshot_interval` bounds
    /// the deepest recoverable rollback.
    ///
    /// Default: 64 (~10.6 s of reach at 60 fps with the default interval)
    pub max_snapshots: usize,
    /// Number of recent local inputs repeated in every outbound bundle.
    /// Redundancy is the only loss-recovery mechanism on the input path.
    ///
    /// Default: 5
    pub redundancy_count: usize,
    /// Hard episode length cap, in frames. `None` means the environment's
    /// termination flags are the only ending.
    ///
    /// Default: `None`
    pub max_steps: Option<u32>,
    /// Fast-forward bound: frames replayed per catch-up pass.
    ///
    /// Default: 300
    pub max_fast_forward_frames: u32,
    /// Fast-forward bound: wall-clock budget per catch-up pass, in
    /// milliseconds.
    ///
    /// Default: 1000
    pub max_fast_forward_millis: u64,
    /// How long the episode-end gate waits for every frame at or before the
    /// final frame to confirm before force-promoting. Generous by design:
    /// 200 ms+ RTT with loss must fit comfortably.
    ///
    /// Default: 30 s
    pub confirmation_timeout: Duration,
    /// Action substituted for the local participant while backgrounded, and
    /// used as the prediction basis before any input has been confirmed.
    ///
    /// Default: `Action(0)`
    pub default_action: Action,
    /// Response to a detected desync.
    ///
    /// Default: [`DesyncPolicy::LogOnly`]
    pub desync_policy: DesyncPolicy,
    /// Bot action sourcing during fast-forward.
    ///
    /// Default: [`BotReplay::CachedLastAction`]
    pub bot_replay: BotReplay,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            input_delay: 2,
            snapshot_interval: 10,
            max_snapshots: 64,
            redundancy_count: 5,
            max_steps: None,
            max_fast_forward_frames: 300,
            max_fast_forward_millis: 1000,
            confirmation_timeout: Duration::from_secs(30),
            default_action: Action(0),
            desync_policy: DesyncPolicy::LogOnly,
            bot_replay: BotReplay::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for high-latency links (150-250 ms RTT): a deeper input delay
    /// and more redundancy.
    #[must_use]
    pub fn high_latency() -> Self {
        Self {
            input_delay: 3,
            redundancy_count: 8,
            ..Self::default()
        }
    }

    /// Preset for lossy links (5-15 % loss): maximum redundancy, denser
    /// snapshots.
    #[must_use]
    pub fn lossy() -> Self {
        Self {
            redundancy_count: 10,
            snapshot_interval: 5,
            max_snapshots: 128,
            ..Self::default()
        }
    }

    /// The deepest frame distance a rollback can recover.
    #[must_use]
    pub fn rollback_reach_frames(&self) -> u32 {
        self.snapshot_interval * self.max_snapshots as u32
    }

    /// Duration of one frame at the configured rate.
    #[must_use]
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.fps.max(1)))
    }
}
