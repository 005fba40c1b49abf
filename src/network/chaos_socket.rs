//! Deterministic network fault injection.
//!
//! [`ChaosSocket`] wraps any [`DatagramSocket`] and injects latency, jitter,
//! loss and duplication. It exists for one purpose: reproducing adverse
//! network conditions in tests, byte-for-byte identically on every run.
//!
//! Two design choices follow from that purpose:
//!
//! - **Time is measured in polls, not milliseconds.** The engine polls its
//!   socket exactly once per tick, so "6 polls of latency" is "100 ms at
//!   60 fps" — without any dependence on wall-clock scheduling. Tests remain
//!   deterministic on loaded CI machines.
//! - **Randomness is seeded.** Loss and jitter draw from a [`Mulberry32`]
//!   stream owned by the wrapper, so a failing schedule can be replayed
//!   exactly by seed.
//!
//! # Example
//!
//! ```
//! use tandem::network::chaos_socket::{ChaosConfig, ChaosSocket};
//! use tandem::{MemoryPairSocket, ParticipantIndex};
//!
//! let (a, _b) = MemoryPairSocket::pair(ParticipantIndex::new(0), ParticipantIndex::new(1));
//! // ~100ms latency at 60fps with 15% inbound loss, reproducible by seed.
//! let config = ChaosConfig {
//!     latency_polls: 6,
//!     receive_loss_rate: 0.15,
//!     seed: 42,
//!     ..ChaosConfig::default()
//! };
//! let chaotic = ChaosSocket::new(a, config);
//! ```

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;

use crate::network::socket::DatagramSocket;
use crate::rng::Mulberry32;

/// Configuration for fault injection. All rates default to 0.0 and all
/// delays to 0 (passthrough).
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use = "ChaosConfig has no effect unless passed to ChaosSocket::new()"]
pub struct ChaosConfig {
    /// Base delivery delay, in receive polls. One poll is one engine tick.
    pub latency_polls: u32,
    /// Maximum extra random delay, uniform in `[0, jitter_polls]`.
    pub jitter_polls: u32,
    /// Probability of dropping an outgoing datagram.
    pub send_loss_rate: f64,
    /// Probability of dropping an incoming datagram.
    pub receive_loss_rate: f64,
    /// Probability of duplicating an incoming datagram.
    pub duplication_rate: f64,
    /// Seed for the fault schedule.
    pub seed: u32,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            latency_polls: 0,
            jitter_polls: 0,
            send_loss_rate: 0.0,
            receive_loss_rate: 0.0,
            duplication_rate: 0.0,
            seed: 0,
        }
    }
}

impl ChaosConfig {
    /// No faults at all.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Constant one-way latency, no loss.
    pub fn latency(polls: u32) -> Self {
        Self {
            latency_polls: polls,
            ..Self::default()
        }
    }

    /// Symmetric loss with a small latency floor, seeded.
    pub fn lossy(rate: f64, seed: u32) -> Self {
        Self {
            latency_polls: 1,
            send_loss_rate: rate,
            receive_loss_rate: rate,
            seed,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct DelayedDatagram<A> {
    due_poll: u64,
    source: A,
    payload: Vec<u8>,
}

/// A [`DatagramSocket`] wrapper injecting deterministic faults.
#[derive(Debug)]
pub struct ChaosSocket<A, S> {
    inner: S,
    config: ChaosConfig,
    rng: Mulberry32,
    poll_count: u64,
    delayed: VecDeque<DelayedDatagram<A>>,
    dropped_sends: u64,
    dropped_receives: u64,
}

impl<A, S> ChaosSocket<A, S>
where
    A: Clone + PartialEq + Eq + Hash + Debug,
    S: DatagramSocket<A>,
{
    /// Wraps `inner` with the given fault configuration.
    #[must_use]
    pub fn new(inner: S, config: ChaosConfig) -> Self {
        Self {
            inner,
            rng: Mulberry32::new(config.seed),
            config,
            poll_count: 0,
            delayed: VecDeque::new(),
            dropped_sends: 0,
            dropped_receives: 0,
        }
    }

    /// Datagrams dropped on the send side so far.
    #[must_use]
    pub fn dropped_sends(&self) -> u64 {
        self.dropped_sends
    }

    /// Datagrams dropped on the receive side so far.
    #[must_use]
    pub fn dropped_receives(&self) -> u64 {
        self.dropped_receives
    }

    /// A reference to the wrapped socket.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn chance(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.next_f64() < rate
    }

    fn delivery_poll(&mut self) -> u64 {
        let jitter = if self.config.jitter_polls == 0 {
            0
        } else {
            self.rng.next_int(0, i64::from(self.config.jitter_polls) + 1) as u64
        };
        self.poll_count + u64::from(self.config.latency_polls) + jitter
    }
}

impl<A, S> DatagramSocket<A> for ChaosSocket<A, S>
where
    A: Clone + PartialEq + Eq + Hash + Debug,
    S: DatagramSocket<A>,
{
    fn send_to(&mut self, payload: &[u8], addr: &A) {
        if self.chance(self.config.send_loss_rate) {
            self.dropped_sends += 1;
            return;
        }
        self.inner.send_to(payload, addr);
    }

    fn receive_all(&mut self) -> Vec<(A, Vec<u8>)> {
        self.poll_count += 1;

        for (source, payload) in self.inner.receive_all() {
            if self.chance(self.config.receive_loss_rate) {
                self.dropped_receives += 1;
                continue;
            }
            let due_poll = self.delivery_poll();
            if self.chance(self.config.duplication_rate) {
                self.delayed.push_back(DelayedDatagram {
                    due_poll,
                    source: source.clone(),
                    payload: payload.clone(),
                });
            }
            self.delayed.push_back(DelayedDatagram {
                due_poll,
                source,
                payload,
            });
        }

        // Release everything due. The queue is not sorted by due time (jitter
        // can reorder), which is exactly the unordered delivery the protocol
        // must tolerate.
        let mut released = Vec::new();
        let mut still_delayed = VecDeque::with_capacity(self.delayed.len());
        for entry in self.delayed.drain(..) {
            if entry.due_poll <= self.poll_count {
                released.push((entry.source, entry.payload));
            } else {
                still_delayed.push_back(entry);
            }
        }
        self.delayed = still_delayed;
        released
    }
}
