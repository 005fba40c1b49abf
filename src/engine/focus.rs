//! Foreground/background tracking and the refocus fast-forward trigger.
//!
//! While a participant's tab is backgrounded the engine keeps being ticked
//! by the worker timer, but two things change:
//!
//! - the local input is substituted with the configured default action (a
//!   backgrounded participant never injects arbitrary inputs), and
//! - remote input packets are buffered in a side queue instead of being fed
//!   to the input buffer. Feeding them would trigger a rollback per packet
//!   against the increasingly stale local simulation — a rollback storm.
//!
//! On refocus the side queue is drained into the input buffer in one batch
//! and the engine performs a single bounded catch-up replay.

use crate::network::messages::InputFrame;

/// Focus state and the remote-input side queue.
#[derive(Debug, Default)]
pub struct FocusManager {
    backgrounded: bool,
    side_queue: Vec<InputFrame>,
    pending_fast_forward: bool,
}

impl FocusManager {
    /// Creates a foregrounded manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` while the participant is in the foreground.
    #[must_use]
    pub fn is_focused(&self) -> bool {
        !self.backgrounded
    }

    /// Records a background transition. Idempotent.
    pub fn on_background(&mut self) {
        if !self.backgrounded {
            tracing::debug!("participant backgrounded; side-queueing remote inputs");
            self.backgrounded = true;
        }
    }

    /// Records a foreground transition. Sets the fast-forward flag when a
    /// background period actually elapsed.
    pub fn on_refocus(&mut self) {
        if self.backgrounded {
            tracing::debug!(
                buffered = self.side_queue.len(),
                "participant refocused; fast-forward pending"
            );
            self.backgrounded = false;
            self.pending_fast_forward = true;
        }
    }

    /// Buffers remote inputs that arrived while backgrounded.
    pub fn buffer_remote(&mut self, inputs: impl IntoIterator<Item = InputFrame>) {
        self.side_queue.extend(inputs);
    }

    /// Number of side-queued inputs.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.side_queue.len()
    }

    /// Takes the side queue for draining into the input buffer.
    pub fn take_buffered(&mut self) -> Vec<InputFrame> {
        std::mem::take(&mut self.side_queue)
    }

    /// Consumes the pending fast-forward flag.
    pub fn take_pending_fast_forward(&mut self) -> bool {
        std::mem::take(&mut self.pending_fast_forward)
    }
}
