//! Per-peer network health statistics.
//!
//! The transport pings each peer at 1 Hz and records round-trip samples
//! here. The summary (min/median/mean/max) is exported at episode end next
//! to the researcher's data — latency context matters when interpreting
//! speculative-frame counts.

use serde::Serialize;

/// Summary of RTT samples collected over a connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RttSummary {
    /// Smallest observed round trip, in milliseconds.
    pub min_ms: u64,
    /// Median round trip, in milliseconds.
    pub median_ms: u64,
    /// Mean round trip, in milliseconds.
    pub mean_ms: f64,
    /// Largest observed round trip, in milliseconds.
    pub max_ms: u64,
    /// Number of samples behind the summary.
    pub samples: usize,
}

/// Counters and samples for one peer connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkStats {
    /// Messages sent to this peer.
    pub messages_sent: u64,
    /// Messages received from this peer.
    pub messages_received: u64,
    /// Pings sent.
    pub pings_sent: u64,
    /// Pongs received (each carries one RTT sample).
    pub pongs_received: u64,
    /// Keepalives sent.
    pub keepalives_sent: u64,
    rtt_samples_ms: Vec<u64>,
}

impl NetworkStats {
    /// Creates empty stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one round-trip sample.
    pub fn record_rtt(&mut self, rtt_ms: u64) {
        self.pongs_received += 1;
        self.rtt_samples_ms.push(rtt_ms);
    }

    /// The raw RTT samples, in arrival order.
    #[must_use]
    pub fn rtt_samples(&self) -> &[u64] {
        &self.rtt_samples_ms
    }

    /// Median of the collected samples, if any.
    #[must_use]
    pub fn median_rtt_ms(&self) -> Option<u64> {
        if self.rtt_samples_ms.is_empty() {
            return None;
        }
        let mut sorted = self.rtt_samples_ms.clone();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }

    /// Full summary over the collected samples, if any.
    #[must_use]
    pub fn rtt_summary(&self) -> Option<RttSummary> {
        if self.rtt_samples_ms.is_empty() {
            return None;
        }
        let mut sorted = self.rtt_samples_ms.clone();
        sorted.sort_unstable();
        let min_ms = sorted[0];
        let max_ms = sorted[sorted.len() - 1];
        let median_ms = sorted[sorted.len() / 2];
        let mean_ms = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        Some(RttSummary {
            min_ms,
            median_ms,
            mean_ms,
            max_ms,
            samples: sorted.len(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats_have_no_summary() {
        assert!(NetworkStats::new().rtt_summary().is_none());
        assert!(NetworkStats::new().median_rtt_ms().is_none());
    }

    #[test]
    fn summary_reports_min_median_mean_max() {
        let mut stats = NetworkStats::new();
        for sample in [30, 10, 50, 20, 40] {
            stats.record_rtt(sample);
        }
        let summary = stats.rtt_summary().unwrap();
        assert_eq!(summary.min_ms, 10);
        assert_eq!(summary.median_ms, 30);
        assert_eq!(summary.max_ms, 50);
        assert!((summary.mean_ms - 30.0).abs() < f64::EPSILON);
        assert_eq!(summary.samples, 5);
        assert_eq!(stats.pongs_received, 5);
    }
}
