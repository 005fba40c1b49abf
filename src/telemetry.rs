//! Structured telemetry for violations and health counters.
//!
//! Instead of only logging with `tracing::warn!`, notable conditions are
//! structured data that can be:
//!
//! - logged via tracing (default behavior),
//! - collected programmatically for tests,
//! - sent to custom observers (metrics, alerting).
//!
//! Two kinds of signals flow through here:
//!
//! - **Violations** — contract breaches that were survived (a conflicting
//!   input, a forced promotion, a rollback target beyond the snapshot ring).
//! - **Counters** — monotonic health counters a researcher reads after an
//!   episode (`socket_fallback`, `rollbacks`, `force_promotions`,
//!   `deep_drift_events`, `predicted_frames`).

use parking_lot::Mutex;
use std::sync::Arc;

use crate::Frame;

/// Severity of a reported violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; the operation continued with a fallback.
    Warning,
    /// Serious issue; behavior may be degraded.
    Error,
    /// Critical invariant broken; simulation state may be corrupted.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for log labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a reported violation, mapped to the subsystem that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Input buffer contract breach (conflicting input, bad prune).
    InputBuffer,
    /// Snapshot ring / state restore issue.
    StateManagement,
    /// Rollback or fast-forward bookkeeping issue.
    Rollback,
    /// Peer protocol issue (unknown tag, malformed frame).
    NetworkProtocol,
    /// Local and peer digests disagreed.
    DesyncDetected,
    /// Session or participant lifecycle inconsistency (orphaned tracker
    /// entry, invalid transition).
    Lifecycle,
    /// Configuration constraint violated at runtime.
    Configuration,
}

/// A structured record of a survived contract breach.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Violation {
    /// How bad it was.
    pub severity: ViolationSeverity,
    /// Which subsystem raised it.
    pub kind: ViolationKind,
    /// Frame the violation is associated with, when one applies.
    pub frame: Option<Frame>,
    /// Human-readable description.
    pub message: String,
}

/// Observer for violations. The engine holds one observer; the default logs
/// through `tracing`, tests usually install a [`CollectingObserver`].
pub trait ViolationObserver: Send + Sync {
    /// Called once per reported violation.
    fn on_violation(&self, violation: &Violation);
}

/// Default observer: routes violations to `tracing` at a level matching the
/// severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &Violation) {
        match violation.severity {
            ViolationSeverity::Warning => tracing::warn!(
                kind = ?violation.kind,
                frame = ?violation.frame,
                "{}",
                violation.message
            ),
            ViolationSeverity::Error | ViolationSeverity::Critical => tracing::error!(
                kind = ?violation.kind,
                frame = ?violation.frame,
                "{}",
                violation.message
            ),
        }
    }
}

/// Observer that stores every violation for later inspection. Intended for
/// tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<Violation>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().clone()
    }

    /// Drops everything collected so far.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &Violation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Monotonic health counters accumulated over an episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Counters {
    /// Inputs routed through the signaling relay because the P2P channel was
    /// not open.
    pub socket_fallback: u64,
    /// Rollback replays performed.
    pub rollbacks: u64,
    /// Frames stepped with at least one predicted input.
    pub predicted_frames: u64,
    /// Speculative records promoted without confirmation at the episode gate.
    pub force_promotions: u64,
    /// Remote inputs that arrived beyond the snapshot ring's reach.
    pub deep_drift_events: u64,
    /// Fast-forward catch-up passes triggered by refocus.
    pub fast_forwards: u64,
}

/// Telemetry sink owned by each engine: counters plus a violation observer.
#[derive(Clone)]
pub struct Telemetry {
    /// Monotonic counters, reset at episode start.
    pub counters: Counters,
    observer: Arc<dyn ViolationObserver>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            counters: Counters::default(),
            observer: Arc::new(TracingObserver),
        }
    }
}

impl Telemetry {
    /// Creates a telemetry sink with the given observer.
    #[must_use]
    pub fn with_observer(observer: Arc<dyn ViolationObserver>) -> Self {
        Self {
            counters: Counters::default(),
            observer,
        }
    }

    /// Reports a violation to the observer.
    pub fn report(
        &self,
        severity: ViolationSeverity,
        kind: ViolationKind,
        frame: Option<Frame>,
        message: impl Into<String>,
    ) {
        let violation = Violation {
            severity,
            kind,
            frame,
            message: message.into(),
        };
        self.observer.on_violation(&violation);
    }

    /// Resets the counters at an episode boundary.
    pub fn reset_counters(&mut self) {
        self.counters = Counters::default();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn collecting_observer_records_reports() {
        let observer = Arc::new(CollectingObserver::new());
        let telemetry = Telemetry::with_observer(observer.clone());

        telemetry.report(
            ViolationSeverity::Warning,
            ViolationKind::InputBuffer,
            Some(Frame::new(3)),
            "test violation",
        );

        let collected = observer.violations();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].severity, ViolationSeverity::Warning);
        assert_eq!(collected[0].kind, ViolationKind::InputBuffer);
        assert_eq!(collected[0].frame, Some(Frame::new(3)));
        assert_eq!(collected[0].message, "test violation");

        observer.clear();
        assert!(observer.violations().is_empty());
    }

    #[test]
    fn counters_reset_at_episode_boundary() {
        let mut telemetry = Telemetry::default();
        telemetry.counters.rollbacks += 2;
        telemetry.counters.socket_fallback += 1;
        telemetry.reset_counters();
        assert_eq!(telemetry.counters, Counters::default());
    }

    #[test]
    fn severity_ordering_matches_escalation() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }
}
