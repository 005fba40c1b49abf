//! Bounded ring of full environment snapshots.
//!
//! A snapshot labeled `F` captures the state *entering* frame `F` (the
//! environment bytes plus the PRNG state at the start of that frame).
//! Rollback to target `T` restores `nearest_at_or_before(T)` and replays
//! forward.
//!
//! The ring keeps the last `max_snapshots` snapshots taken at every
//! `snapshot_interval` frames. The cap is a hard memory/perf budget:
//! `max_snapshots x snapshot_interval` bounds the deepest recoverable
//! rollback. Exceeding that bound is not a crash — the engine logs a deep
//! drift event and continues; the resulting data divergence will surface via
//! the frame hasher.

use std::collections::VecDeque;

use crate::Frame;

/// One full environment snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// The frame this snapshot enters: restoring it positions the simulation
    /// immediately before executing `frame`.
    pub frame: Frame,
    /// Byte-serialized environment state from the collaborator.
    pub env_state: Vec<u8>,
    /// PRNG state at the start of `frame`.
    pub rng_state: u32,
}

/// Bounded ring of snapshots ordered by frame.
#[derive(Debug, Clone)]
pub struct SnapshotRing {
    slots: VecDeque<Snapshot>,
    max_snapshots: usize,
    snapshot_interval: u32,
}

impl SnapshotRing {
    /// Creates an empty ring.
    ///
    /// `max_snapshots` must be at least 1 and `snapshot_interval` at least 1;
    /// degenerate values are clamped.
    #[must_use]
    pub fn new(max_snapshots: usize, snapshot_interval: u32) -> Self {
        Self {
            slots: VecDeque::with_capacity(max_snapshots.max(1)),
            max_snapshots: max_snapshots.max(1),
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    /// The configured interval between snapshots, in frames.
    #[must_use]
    pub fn snapshot_interval(&self) -> u32 {
        self.snapshot_interval
    }

    /// Returns `true` when a snapshot is due entering `frame`.
    #[must_use]
    pub fn is_due(&self, frame: Frame) -> bool {
        frame % self.snapshot_interval == 0
    }

    /// Number of snapshots currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` when the ring holds no snapshots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Saves a snapshot, evicting the oldest when the ring is full.
    ///
    /// Saving an already-present frame replaces that entry (this happens when
    /// rollback replay re-takes snapshots along the replayed range).
    pub fn save(&mut self, snapshot: Snapshot) {
        if let Some(existing) = self
            .slots
            .iter_mut()
            .find(|slot| slot.frame == snapshot.frame)
        {
            *existing = snapshot;
            return;
        }
        // Keep the deque sorted by frame; out-of-order saves only occur
        // during replay, which re-takes strictly increasing frames after
        // invalidate_from, so a back-push is always correct here.
        self.slots.push_back(snapshot);
        while self.slots.len() > self.max_snapshots {
            if let Some(evicted) = self.slots.pop_front() {
                tracing::trace!(frame = %evicted.frame, "snapshot evicted");
            }
        }
    }

    /// The restore primitive: the newest snapshot with `frame <= target`.
    #[must_use]
    pub fn nearest_at_or_before(&self, target: Frame) -> Option<&Snapshot> {
        self.slots
            .iter()
            .rev()
            .find(|snapshot| snapshot.frame <= target)
    }

    /// Frame of the oldest snapshot currently held.
    #[must_use]
    pub fn oldest_frame(&self) -> Option<Frame> {
        self.slots.front().map(|snapshot| snapshot.frame)
    }

    /// Frame of the newest snapshot currently held.
    #[must_use]
    pub fn newest_frame(&self) -> Option<Frame> {
        self.slots.back().map(|snapshot| snapshot.frame)
    }

    /// Drops entries with `frame >= target`. Used on forced rewinds: states
    /// entering frames at or past the rewind point were computed from
    /// contradicted predictions.
    pub fn invalidate_from(&mut self, target: Frame) {
        self.slots.retain(|snapshot| snapshot.frame < target);
    }
}
