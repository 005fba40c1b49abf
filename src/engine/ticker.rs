//! Worker-driven tick source.
//!
//! Browsers throttle `setInterval` on background tabs, but worker threads
//! keep running — which is why the step loop is clocked by a dedicated
//! thread posting tick messages into a bounded channel rather than by the
//! host UI loop. The engine drains the channel and processes ticks strictly
//! in order; if it falls behind (heavy rollback, backgrounded tab being
//! ticked anyway), the backlog is bounded and the ticker counts what it had
//! to drop.
//!
//! The ticker corrects for drift: each tick is scheduled at
//! `start + n * period`, not `previous + period`, so a slow wakeup doesn't
//! permanently shift the cadence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use web_time::{Duration, Instant};

/// One tick posted by the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickMessage {
    /// Sequence number, starting at 0.
    pub sequence: u64,
}

/// Channel capacity: ten seconds of backlog at 60 fps. A consumer that far
/// behind is not coming back; dropping older ticks is the right call.
const TICK_CHANNEL_CAPACITY: usize = 600;

/// A thread emitting tick messages at a fixed rate on a bounded channel.
#[derive(Debug)]
pub struct WorkerTicker {
    receiver: Receiver<TickMessage>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerTicker {
    /// Spawns the ticker thread at `fps` ticks per second.
    #[must_use]
    pub fn spawn(fps: u32) -> Self {
        let (sender, receiver) = std::sync::mpsc::sync_channel(TICK_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let thread_stop = stop.clone();
        let thread_dropped = dropped.clone();
        let period = Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1)));
        let handle = std::thread::Builder::new()
            .name("tandem-ticker".to_owned())
            .spawn(move || run_ticker(&sender, &thread_stop, &thread_dropped, period))
            .ok();

        Self {
            receiver,
            stop,
            dropped,
            handle,
        }
    }

    /// Returns all ticks accumulated since the last drain, in order.
    #[must_use]
    pub fn drain(&self) -> Vec<TickMessage> {
        let mut ticks = Vec::new();
        while let Ok(tick) = self.receiver.try_recv() {
            ticks.push(tick);
        }
        ticks
    }

    /// Blocks until the next tick (or the ticker stops). Test helper; the
    /// engine normally drains.
    #[must_use]
    pub fn recv(&self) -> Option<TickMessage> {
        self.receiver.recv().ok()
    }

    /// Number of ticks dropped because the channel backlog was full.
    #[must_use]
    pub fn dropped_ticks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops the ticker thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_ticker(
    sender: &SyncSender<TickMessage>,
    stop: &AtomicBool,
    dropped: &AtomicU64,
    period: Duration,
) {
    let start = Instant::now();
    let mut sequence: u64 = 0;
    while !stop.load(Ordering::Relaxed) {
        let due = start + period * (sequence as u32 + 1);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due.saturating_duration_since(now).min(period));
            continue;
        }
        match sender.try_send(TickMessage { sequence }) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => {
                dropped.fetch_add(1, Ordering::Relaxed);
            },
            Err(TrySendError::Disconnected(_)) => return,
        }
        sequence += 1;
    }
}
