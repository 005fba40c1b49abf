//! Frame-indexed store of every participant's inputs.
//!
//! The buffer is the engine's single source of truth for which actions have
//! actually arrived. It is deliberately dumb: it stores, deduplicates and
//! confirms, and nothing else. Prediction, rollback flags and the ledger of
//! guesses live in the engine; the buffer only ever holds *real* inputs.
//!
//! A frame is *complete* when every required (human) participant index has
//! an action stored for it. `confirmed_frame` is the largest frame K such
//! that every frame `<= K` is complete; it advances incrementally as gaps
//! fill in and is never lowered — not even by rollback, which rewinds the
//! verified-hash watermark but leaves confirmed inputs untouched.

use std::collections::BTreeMap;

use crate::error::TandemError;
use crate::{Action, Frame, ParticipantIndex};

/// Outcome of a [`put`](InputBuffer::put).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The action was stored; this is the first delivery for the slot.
    Inserted,
    /// The identical action was already stored; redundant re-delivery is a
    /// no-op by design.
    Duplicate,
    /// The frame was already confirmed and pruned; a late redundant bundle
    /// re-delivered it. Ignored.
    Stale,
}

/// Mapping `frame → (participant index → action)` with an incrementally
/// maintained confirmed-frame watermark.
#[derive(Debug, Clone)]
pub struct InputBuffer {
    entries: BTreeMap<Frame, BTreeMap<ParticipantIndex, Action>>,
    /// The participant indices whose inputs are required for completeness.
    /// Bot slots are excluded: their actions are derived locally from the
    /// shared random stream, not delivered over the network.
    required: Vec<ParticipantIndex>,
    confirmed: Option<Frame>,
    /// Frames at or below this watermark have been pruned.
    pruned_upto: Option<Frame>,
}

impl InputBuffer {
    /// Creates a buffer requiring inputs from the given participant indices.
    #[must_use]
    pub fn new(required: Vec<ParticipantIndex>) -> Self {
        Self {
            entries: BTreeMap::new(),
            required,
            confirmed: None,
            pruned_upto: None,
        }
    }

    /// The participant indices required for a frame to be complete.
    #[must_use]
    pub fn required_indices(&self) -> &[ParticipantIndex] {
        &self.required
    }

    /// Stores an action for a `(frame, index)` slot.
    ///
    /// Idempotent: re-delivery of the same action is a no-op. Re-delivery
    /// with a *different* action is a protocol violation and fails with
    /// [`TandemError::ConflictingInput`]; the buffer keeps the original.
    pub fn put(
        &mut self,
        frame: Frame,
        index: ParticipantIndex,
        action: Action,
    ) -> Result<PutOutcome, TandemError> {
        if let Some(pruned) = self.pruned_upto {
            if frame <= pruned {
                return Ok(PutOutcome::Stale);
            }
        }
        let slot = self.entries.entry(frame).or_default();
        match slot.get(&index) {
            Some(existing) if *existing == action => Ok(PutOutcome::Duplicate),
            Some(existing) => Err(TandemError::ConflictingInput {
                frame,
                index,
                existing: *existing,
                incoming: action,
            }),
            None => {
                slot.insert(index, action);
                self.advance_confirmed();
                Ok(PutOutcome::Inserted)
            },
        }
    }

    /// Returns the stored action for a slot, if any.
    #[must_use]
    pub fn get(&self, frame: Frame, index: ParticipantIndex) -> Option<Action> {
        self.entries.get(&frame)?.get(&index).copied()
    }

    /// Returns `true` when all required indices have an action for `frame`.
    #[must_use]
    pub fn has_all_for(&self, frame: Frame) -> bool {
        if let Some(pruned) = self.pruned_upto {
            // Pruned frames were complete by definition (prune is gated on
            // the confirmed watermark).
            if frame <= pruned {
                return true;
            }
        }
        match self.entries.get(&frame) {
            Some(slot) => self.required.iter().all(|index| slot.contains_key(index)),
            None => self.required.is_empty(),
        }
    }

    /// The largest frame K such that every frame `<= K` is complete.
    #[must_use]
    pub fn confirmed_frame(&self) -> Option<Frame> {
        self.confirmed
    }

    /// Removes entries with `frame <= upto`.
    ///
    /// Rejected when `upto` exceeds the confirmed frame: unconfirmed inputs
    /// are still needed for rollback replay and must never be dropped.
    pub fn prune(&mut self, upto: Frame) -> Result<(), TandemError> {
        match self.confirmed {
            Some(confirmed) if upto <= confirmed => {
                self.entries = self.entries.split_off(&(upto + 1));
                self.pruned_upto = Some(match self.pruned_upto {
                    Some(previous) => previous.max(upto),
                    None => upto,
                });
                Ok(())
            },
            confirmed => Err(TandemError::PruneBeyondConfirmed {
                requested: upto,
                confirmed,
            }),
        }
    }

    /// Advances the confirmed watermark past newly completed frames.
    fn advance_confirmed(&mut self) {
        let mut next = match self.confirmed {
            Some(frame) => frame + 1,
            None => Frame::ZERO,
        };
        while self.has_all_for_unpruned(next) {
            self.confirmed = Some(next);
            next += 1;
        }
    }

    fn has_all_for_unpruned(&self, frame: Frame) -> bool {
        match self.entries.get(&frame) {
            Some(slot) => self.required.iter().all(|index| slot.contains_key(index)),
            // No entry at all: not complete. This also keeps the watermark
            // loop finite when the required set is empty.
            None => false,
        }
    }

    /// Returns the most recent *confirmed-range* action for a participant at
    /// or before `frame` — the basis for last-known prediction.
    #[must_use]
    pub fn last_action_at_or_before(
        &self,
        frame: Frame,
        index: ParticipantIndex,
    ) -> Option<Action> {
        self.entries
            .range(..=frame)
            .rev()
            .find_map(|(_, slot)| slot.get(&index).copied())
    }
}
