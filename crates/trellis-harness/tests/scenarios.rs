//! # Scenario suite: model connection through the simulated network
//!
//! Runs every scenario kind end to end against the model endpoints — the
//! postconditions (path counts, address tuples, CID sequences, byte
//! distribution, completion budgets) are checked inside `run_scenario`
//! itself, so a returned report means the scenario converged correctly.
//!
//! No real time and no I/O beyond the event-log files: the whole universe
//! runs on the virtual clock.

use trellis_harness::endpoint::{ConnectionState, Stepper, VariantFlags};
use trellis_harness::model::{standard_transfer, SimWorld, WorldConfig, CLIENT_ADDR_2, SERVER_ADDR};
use trellis_harness::pathlog::compare_text_files;
use trellis_harness::poller::{run_until, wait_for};
use trellis_harness::{
    run_migration, run_scenario, HarnessError, MigrationConfig, PathIdVariant, PollBounds,
    ScenarioConfig, ScenarioKind, ScenarioReport, WaitError,
};
use trellis_netsim::{LinkTuning, NEVER};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn run(kind: ScenarioKind) -> ScenarioReport {
    run_scenario(&ScenarioConfig::new(kind, PathIdVariant::Cid))
        .unwrap_or_else(|e| panic!("{kind:?} failed: {e}"))
}

fn run_variant(kind: ScenarioKind, variant: PathIdVariant) -> ScenarioReport {
    run_scenario(&ScenarioConfig::new(kind, variant))
        .unwrap_or_else(|e| panic!("{kind:?}/{variant:?} failed: {e}"))
}

// ─── Scenario catalogue, CID variant ────────────────────────────────────────

#[test]
fn basic() {
    let report = run(ScenarioKind::Basic);
    assert_eq!(report.client_paths.len(), 2);
    assert_eq!(report.server_paths.len(), 2);
}

#[test]
fn drop_first() {
    run(ScenarioKind::DropFirst);
}

#[test]
fn drop_second() {
    run(ScenarioKind::DropSecond);
}

#[test]
fn sat_plus() {
    // Long transfer over 1 Mbps landline plus satellite; both paths must
    // carry real traffic for this to fit the budget.
    let report = run(ScenarioKind::SatPlus);
    assert!(report.server_paths.iter().all(|p| p.delivered > 0));
}

#[test]
fn perf() {
    run(ScenarioKind::Perf);
}

#[test]
fn renew() {
    run(ScenarioKind::Renew);
}

#[test]
fn nat_rebind() {
    run(ScenarioKind::Nat);
}

#[test]
fn break1() {
    let report = run(ScenarioKind::Break1);
    assert_eq!(report.client_paths.len(), 1);
}

#[test]
fn break2() {
    run(ScenarioKind::Break2);
}

#[test]
fn back1() {
    let report = run(ScenarioKind::Back1);
    assert_eq!(report.client_paths.len(), 2);
}

#[test]
fn standby() {
    let report = run(ScenarioKind::Standby);
    assert!(report.server_paths[1].is_standby);
}

#[test]
fn standup() {
    run(ScenarioKind::Standup);
}

#[test]
fn abandon() {
    run(ScenarioKind::Abandon);
}

#[test]
fn stream_affinity() {
    run(ScenarioKind::StreamAffinity);
}

#[test]
fn datagram() {
    let report = run(ScenarioKind::Datagram);
    let stats = report.datagrams.expect("datagram generator in report");
    stats.verify().unwrap();
}

#[test]
fn datagram_affinity() {
    run(ScenarioKind::DatagramAffinity);
}

#[test]
fn tunnel() {
    run(ScenarioKind::Tunnel);
}

#[test]
fn callback_writes_event_log() {
    let report = run(ScenarioKind::Callback);
    let path = report.event_log.expect("event log path in report");
    let body = std::fs::read_to_string(&path).unwrap();
    assert!(body.contains("path_created"));
    std::fs::remove_file(path).ok();
}

// ─── Variant coverage ───────────────────────────────────────────────────────

#[test]
fn basic_simple_variant() {
    run_variant(ScenarioKind::Basic, PathIdVariant::Simple);
}

#[test]
fn basic_unique_variant() {
    let report = run_variant(ScenarioKind::Basic, PathIdVariant::Unique);
    let ids: Vec<u64> = report.client_paths.iter().map(|p| p.unique_path_id).collect();
    assert_eq!(ids, vec![0, 1]);
}

#[test]
fn drop_first_unique_variant() {
    run_variant(ScenarioKind::DropFirst, PathIdVariant::Unique);
}

#[test]
fn abandon_simple_variant() {
    run_variant(ScenarioKind::Abandon, PathIdVariant::Simple);
}

// ─── Loss masks ─────────────────────────────────────────────────────────────

#[test]
fn basic_with_sparse_loss() {
    // Every 32nd packet dropped on both pairs; retransmission has to
    // absorb it within the same budget.
    let mut config = ScenarioConfig::new(ScenarioKind::Basic, PathIdVariant::Cid);
    config.loss_mask = 0x0000_0001_0000_0001;
    run_scenario(&config).unwrap();
}

#[test]
fn renew_with_sparse_loss() {
    let mut config = ScenarioConfig::new(ScenarioKind::Renew, PathIdVariant::Cid);
    config.loss_mask = 0x0000_0000_0001_0000;
    run_scenario(&config).unwrap();
}

// ─── Migration ──────────────────────────────────────────────────────────────

#[test]
fn migration() {
    let report = run_migration(&MigrationConfig::default()).unwrap();
    assert_eq!(report.client_paths.len(), 1);
    assert_eq!(report.client_paths[0].addrs.local, CLIENT_ADDR_2);
}

#[test]
fn migration_with_shrunk_mtu() {
    let config = MigrationConfig {
        shrink_mtu: true,
        ..Default::default()
    };
    run_migration(&config).unwrap();
}

#[test]
fn migration_with_sparse_loss() {
    let config = MigrationConfig {
        loss_mask: 0x0000_0001_0000_0000,
        ..Default::default()
    };
    run_migration(&config).unwrap();
}

// ─── Negotiation ────────────────────────────────────────────────────────────

#[test]
fn negotiation_yields_empty_intersection() {
    // Client asks for per-path numbering, server only supports unique
    // path ids: the handshake completes but no multipath flavor is live.
    let mut world = SimWorld::new(WorldConfig {
        client_flags: VariantFlags {
            multipath: true,
            ..Default::default()
        },
        server_flags: VariantFlags {
            unique_path_id: true,
            ..Default::default()
        },
        ..Default::default()
    });
    wait_for(
        &mut world,
        PollBounds::MIGRATION,
        |_| NEVER,
        |w| {
            w.client().state() == ConnectionState::Ready
                && w.server().state() == ConnectionState::Ready
        },
    )
    .unwrap();
    assert!(!world.client().negotiated().any());
    assert!(!world.server().negotiated().any());
}

#[test]
fn scenario_rejects_unserved_variant() {
    // The server only offers unique path ids; a per-path-numbering
    // scenario must surface the mismatch instead of limping along
    // single-path.
    let mut config = ScenarioConfig::new(ScenarioKind::Basic, PathIdVariant::Cid);
    config.server_flags = VariantFlags {
        unique_path_id: true,
        ..Default::default()
    };
    let err = run_scenario(&config).unwrap_err();
    assert!(matches!(err, HarnessError::NegotiationMismatch { .. }));
    assert!(err.to_string().contains("negotiation"));
}

// ─── Bounded convergence ────────────────────────────────────────────────────

#[test]
fn dead_link_wait_is_bounded() {
    // Kill the only pair before the handshake: the wait must fail on the
    // inactivity bound, not spin forever.
    let mut world = SimWorld::new(WorldConfig::default());
    world.pair0_mut().kill();
    let result = wait_for(
        &mut world,
        PollBounds::MIGRATION,
        |_| NEVER,
        |w| w.client().state() == ConnectionState::Ready,
    );
    assert!(matches!(result, Err(WaitError::Stalled { .. })));
}

// ─── Live reconfiguration ───────────────────────────────────────────────────

#[test]
fn reconfigure_pair_mid_transfer() {
    // Squeeze the primary pair down to 1 Mbps halfway through; queued
    // packets keep their old schedule, new ones pace at the new rate, and
    // the transfer still completes.
    let mut world = SimWorld::new(WorldConfig {
        client_flags: VariantFlags {
            multipath: true,
            ..Default::default()
        },
        ..Default::default()
    });
    wait_for(
        &mut world,
        PollBounds::MIGRATION,
        |_| NEVER,
        |w| {
            w.client().state() == ConnectionState::Ready
                && w.server().state() == ConnectionState::Ready
        },
    )
    .unwrap();
    world.init_transfer(&standard_transfer());
    world.add_secondary_pair(LinkTuning::default());
    world.probe_new_path(SERVER_ADDR, CLIENT_ADDR_2).unwrap();

    let target = world.now() + 200_000;
    run_until(&mut world, target).unwrap();
    let slow = LinkTuning::megabit();
    world.reconfigure_pair(0, slow.latency_micros, slow.picosec_per_byte, slow.queue_delay_max);

    wait_for(
        &mut world,
        PollBounds::transfer(20_000_000),
        |_| NEVER,
        |w| w.transfer_complete() && w.backlog_empty(),
    )
    .unwrap();
}

// ─── Determinism ────────────────────────────────────────────────────────────

#[test]
fn identical_seeds_produce_identical_runs() {
    let dir = std::env::temp_dir();
    let log_a = dir.join("trellis-determinism-a.csv");
    let log_b = dir.join("trellis-determinism-b.csv");

    let mut config = ScenarioConfig::new(ScenarioKind::Callback, PathIdVariant::Cid);
    config.event_log = Some(log_a.clone());
    let first = run_scenario(&config).unwrap();
    config.event_log = Some(log_b.clone());
    let second = run_scenario(&config).unwrap();

    assert_eq!(first.completion_micros, second.completion_micros);
    compare_text_files(&log_a, &log_b).unwrap();
    std::fs::remove_file(log_a).ok();
    std::fs::remove_file(log_b).ok();
}

#[test]
fn distinct_seeds_still_converge() {
    for seed in [1u64, 0xdead_beef, 0x5eed_0002] {
        let mut config = ScenarioConfig::new(ScenarioKind::Basic, PathIdVariant::Cid);
        config.seed = seed;
        run_scenario(&config).unwrap_or_else(|e| panic!("seed {seed:#x} failed: {e}"));
    }
}
