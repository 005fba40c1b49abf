//! Property laws: determinism, rollback correctness and export parity over
//! arbitrary delivery schedules.
//!
//! The reference run is a zero-latency session: with interleaved ticks and
//! the input delay, every input is confirmed before execution, so its
//! canonical records are exactly what an offline simulation with all inputs
//! known up front would produce. Every other schedule (latency, jitter,
//! loss) must converge to byte-identical canonical data.

mod common;

use common::{build_pair, export_of, run_to_completion};
use proptest::prelude::*;
use tandem::network::chaos_socket::ChaosConfig;
use tandem::recorder::StepRecord;
use tandem::EngineConfig;

fn config() -> EngineConfig {
    EngineConfig {
        max_steps: Some(48),
        // Lossy schedules below need deep redundancy to guarantee delivery.
        redundancy_count: 10,
        ..EngineConfig::default()
    }
}

/// Canonical content that must be schedule-independent. Rewards are compared
/// through their shortest-roundtrip decimal form, the same rendering the CSV
/// export uses.
fn canonical_view(records: &[StepRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let actions: Vec<String> = record
                .actions
                .iter()
                .map(|(index, action)| format!("{index}={action}"))
                .collect();
            let rewards: Vec<String> = record
                .rewards
                .iter()
                .map(|(index, reward)| format!("{index}={reward}"))
                .collect();
            let terminated = record.terminateds.values().map(|b| *b as u8).sum::<u8>();
            let truncated = record.truncateds.values().map(|b| *b as u8).sum::<u8>();
            format!(
                "f{} a[{}] r[{}] t{} c{}",
                record.frame,
                actions.join(","),
                rewards.join(","),
                terminated,
                truncated
            )
        })
        .collect()
}

fn run_schedule(seed: u32, chaos_a: ChaosConfig, chaos_b: ChaosConfig) -> (Vec<String>, Vec<String>) {
    let (mut a, mut b) = build_pair(seed, config(), chaos_a, chaos_b);
    let (events_a, events_b) = run_to_completion(&mut a, &mut b, 6000);
    let export_a = export_of(&events_a);
    let export_b = export_of(&events_b);
    (
        canonical_view(&export_a.records),
        canonical_view(&export_b.records),
    )
}

#[test]
fn identical_runs_are_bit_identical() {
    let first = run_schedule(1234, ChaosConfig::latency(5), ChaosConfig::latency(2));
    let second = run_schedule(1234, ChaosConfig::latency(5), ChaosConfig::latency(2));
    assert_eq!(first, second);
}

#[test]
fn rollback_run_matches_offline_run() {
    // Offline reference: no latency, no prediction, no rollback.
    let (reference, reference_peer) =
        run_schedule(42, ChaosConfig::passthrough(), ChaosConfig::passthrough());
    assert_eq!(reference, reference_peer);

    // Heavy speculation: every prediction is eventually corrected, so the
    // canonical records must be identical to the offline run.
    let (speculated, speculated_peer) =
        run_schedule(42, ChaosConfig::latency(8), ChaosConfig::latency(8));
    assert_eq!(speculated, speculated_peer);
    assert_eq!(reference, speculated);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Determinism over delivery schedules: any interleaving that preserves
    /// per-frame completeness produces the reference canonical records on
    /// both participants.
    #[test]
    fn export_parity_over_arbitrary_schedules(
        seed in 1u32..5000,
        latency_a in 0u32..8,
        latency_b in 0u32..8,
        jitter in 0u32..3,
        loss_millis in 0u32..12,
        chaos_seed in 1u32..1000,
    ) {
        let loss = f64::from(loss_millis) / 100.0;
        let chaos_a = ChaosConfig {
            latency_polls: latency_a,
            jitter_polls: jitter,
            receive_loss_rate: loss,
            seed: chaos_seed,
            ..ChaosConfig::default()
        };
        let chaos_b = ChaosConfig {
            latency_polls: latency_b,
            jitter_polls: jitter,
            receive_loss_rate: loss,
            seed: chaos_seed.wrapping_add(1),
            ..ChaosConfig::default()
        };

        let (reference, _) = run_schedule(seed, ChaosConfig::passthrough(), ChaosConfig::passthrough());
        let (ours, theirs) = run_schedule(seed, chaos_a, chaos_b);
        prop_assert_eq!(&ours, &theirs, "peers diverged");
        prop_assert_eq!(&ours, &reference, "schedule changed canonical data");
    }
}
