//! Dual-buffer per-frame data recorder.
//!
//! Every environment step writes a [`StepRecord`] into the *speculative*
//! buffer — whether the inputs were confirmed or predicted. A record is
//! *promoted* into the *canonical* buffer only once its frame is confirmed
//! and no rollback has invalidated it since. Only canonical records are
//! eligible for export, which is how two peers with entirely different
//! prediction histories still emit byte-identical episode data.
//!
//! The promoter is idempotent; a rollback discards both buffers from the
//! rewind point before replay overwrites them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Action, Frame, ParticipantIndex};

/// A rollback that affected a recorded frame, kept for researcher
/// validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEventRecord {
    /// The frame the engine was executing when the contradiction surfaced.
    pub detected_at: Frame,
    /// The first frame replayed.
    pub target: Frame,
    /// `detected_at - target`, the replay depth in frames.
    pub depth: u32,
}

/// Per-frame record of everything the researcher exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Frame this record belongs to.
    pub frame: Frame,
    /// Action fed to the environment, per participant slot.
    pub actions: BTreeMap<ParticipantIndex, Action>,
    /// Reward earned, per participant slot.
    pub rewards: BTreeMap<ParticipantIndex, f64>,
    /// Termination flags, per participant slot.
    pub terminateds: BTreeMap<ParticipantIndex, bool>,
    /// Truncation flags, per participant slot.
    pub truncateds: BTreeMap<ParticipantIndex, bool>,
    /// Opaque info payload from the environment.
    pub info: serde_json::Value,
    /// `true` when this frame was ever stepped with at least one predicted
    /// input (even if a later replay ran it with full confirmation).
    pub was_speculative: bool,
    /// Rollbacks whose replay range covered this frame.
    pub rollback_events: Vec<RollbackEventRecord>,
}

/// The dual buffer: speculative writes, canonical promotions.
#[derive(Debug, Clone, Default)]
pub struct DualBufferRecorder {
    speculative: BTreeMap<Frame, StepRecord>,
    canonical: BTreeMap<Frame, StepRecord>,
    force_promotions: u64,
}

impl DualBufferRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a record into the speculative buffer, overwriting any previous
    /// record for the frame (replay does exactly this).
    pub fn write(&mut self, record: StepRecord) {
        self.speculative.insert(record.frame, record);
    }

    /// Promotes the speculative record for `frame` into the canonical buffer.
    ///
    /// A no-op (returning `false`) when the frame is beyond the confirmed
    /// watermark, has no speculative record (invalidated by an in-flight
    /// rollback), or was already promoted.
    pub fn promote(&mut self, frame: Frame, confirmed: Option<Frame>) -> bool {
        match confirmed {
            Some(watermark) if frame <= watermark => {},
            _ => return false,
        }
        if self.canonical.contains_key(&frame) {
            return false;
        }
        match self.speculative.remove(&frame) {
            Some(record) => {
                self.canonical.insert(frame, record);
                true
            },
            None => false,
        }
    }

    /// Promotes a still-speculative record without confirmation. Used only by
    /// the episode-end gate after its confirmation timeout expires; each call
    /// logs a warning.
    pub fn force_promote(&mut self, frame: Frame) -> bool {
        if self.canonical.contains_key(&frame) {
            return false;
        }
        match self.speculative.remove(&frame) {
            Some(record) => {
                tracing::warn!(frame = %frame, "force-promoting unconfirmed record at episode end");
                self.force_promotions += 1;
                self.canonical.insert(frame, record);
                true
            },
            None => false,
        }
    }

    /// Drops both speculative and canonical entries with `frame >= target`.
    pub fn invalidate_from(&mut self, target: Frame) {
        self.speculative.retain(|frame, _| *frame < target);
        self.canonical.retain(|frame, _| *frame < target);
    }

    /// Returns the canonical record for `frame`, if promoted.
    #[must_use]
    pub fn canonical(&self, frame: Frame) -> Option<&StepRecord> {
        self.canonical.get(&frame)
    }

    /// Returns the speculative record for `frame`, if present.
    #[must_use]
    pub fn speculative(&self, frame: Frame) -> Option<&StepRecord> {
        self.speculative.get(&frame)
    }

    /// Frames still awaiting promotion at or before `upto`.
    #[must_use]
    pub fn unpromoted_upto(&self, upto: Frame) -> Vec<Frame> {
        self.speculative
            .range(..=upto)
            .map(|(frame, _)| *frame)
            .collect()
    }

    /// Number of canonical records held.
    #[must_use]
    pub fn canonical_len(&self) -> usize {
        self.canonical.len()
    }

    /// Number of force-promotions performed this episode.
    #[must_use]
    pub fn force_promotions(&self) -> u64 {
        self.force_promotions
    }

    /// Returns the canonical history sorted by frame. The atomic emission at
    /// an episode boundary; callers clear the buffer only after the
    /// collaborator acknowledges receipt.
    #[must_use]
    pub fn export_episode(&self) -> Vec<StepRecord> {
        self.canonical.values().cloned().collect()
    }

    /// Clears both buffers (after an acknowledged export, or on episode
    /// reset).
    pub fn clear(&mut self) {
        self.speculative.clear();
        self.canonical.clear();
        self.force_promotions = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(frame: u32, speculative: bool) -> StepRecord {
        let index = ParticipantIndex::new(0);
        StepRecord {
            frame: Frame::new(frame),
            actions: BTreeMap::from([(index, Action(frame))]),
            rewards: BTreeMap::from([(index, f64::from(frame))]),
            terminateds: BTreeMap::from([(index, false)]),
            truncateds: BTreeMap::from([(index, false)]),
            info: serde_json::Value::Null,
            was_speculative: speculative,
            rollback_events: Vec::new(),
        }
    }

    #[test]
    fn write_goes_to_speculative_only() {
        let mut recorder = DualBufferRecorder::new();
        recorder.write(record(0, false));
        assert!(recorder.speculative(Frame::new(0)).is_some());
        assert!(recorder.canonical(Frame::new(0)).is_none());
    }

    #[test]
    fn promote_requires_confirmation() {
        let mut recorder = DualBufferRecorder::new();
        recorder.write(record(5, false));

        assert!(!recorder.promote(Frame::new(5), None));
        assert!(!recorder.promote(Frame::new(5), Some(Frame::new(4))));
        assert!(recorder.promote(Frame::new(5), Some(Frame::new(5))));
        assert!(recorder.canonical(Frame::new(5)).is_some());
    }

    #[test]
    fn promote_is_idempotent() {
        let mut recorder = DualBufferRecorder::new();
        recorder.write(record(0, false));
        assert!(recorder.promote(Frame::new(0), Some(Frame::new(0))));
        assert!(!recorder.promote(Frame::new(0), Some(Frame::new(0))));
        assert_eq!(recorder.canonical_len(), 1);
    }

    #[test]
    fn invalidate_from_discards_both_buffers() {
        let mut recorder = DualBufferRecorder::new();
        for frame in 0..6 {
            recorder.write(record(frame, false));
        }
        for frame in 0..3 {
            recorder.promote(Frame::new(frame), Some(Frame::new(2)));
        }
        recorder.invalidate_from(Frame::new(2));

        assert!(recorder.canonical(Frame::new(1)).is_some());
        assert!(recorder.canonical(Frame::new(2)).is_none());
        assert!(recorder.speculative(Frame::new(4)).is_none());
    }

    #[test]
    fn overwrite_replaces_speculative_record() {
        let mut recorder = DualBufferRecorder::new();
        recorder.write(record(3, true));
        let mut corrected = record(3, true);
        corrected.rewards.insert(ParticipantIndex::new(0), 42.0);
        recorder.write(corrected);

        recorder.promote(Frame::new(3), Some(Frame::new(3)));
        let promoted = recorder.canonical(Frame::new(3)).unwrap();
        assert_eq!(promoted.rewards[&ParticipantIndex::new(0)], 42.0);
    }

    #[test]
    fn force_promote_counts_and_promotes() {
        let mut recorder = DualBufferRecorder::new();
        recorder.write(record(9, true));
        assert!(recorder.force_promote(Frame::new(9)));
        assert!(!recorder.force_promote(Frame::new(9)));
        assert_eq!(recorder.force_promotions(), 1);
        assert!(recorder.canonical(Frame::new(9)).is_some());
    }

    #[test]
    fn export_is_sorted_by_frame() {
        let mut recorder = DualBufferRecorder::new();
        for frame in [4, 1, 3, 0, 2] {
            recorder.write(record(frame, false));
            recorder.promote(Frame::new(frame), Some(Frame::new(4)));
        }
        let exported = recorder.export_episode();
        let frames: Vec<u32> = exported.iter().map(|r| r.frame.as_u32()).collect();
        assert_eq!(frames, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn unpromoted_upto_lists_stragglers() {
        let mut recorder = DualBufferRecorder::new();
        for frame in 0..5 {
            recorder.write(record(frame, false));
        }
        recorder.promote(Frame::new(0), Some(Frame::new(0)));
        recorder.promote(Frame::new(1), Some(Frame::new(1)));
        let stragglers = recorder.unpromoted_upto(Frame::new(3));
        assert_eq!(
            stragglers,
            vec![Frame::new(2), Frame::new(3)]
        );
    }
}
