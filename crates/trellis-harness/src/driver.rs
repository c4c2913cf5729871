//! Scenario orchestration.
//!
//! Each scenario kind maps to a [`ScenarioPlan`]: link tunings, the
//! transfer to run, an optional fault trigger fired after a soak period,
//! an optional recovery step, and the completion budget. [`run_scenario`]
//! walks one plan end to end — setup, negotiation check, multipath
//! establishment, fault injection, completion wait — and hands the final
//! state to the verifier. [`run_migration`] drives the single-path
//! migration flow, which probes a new path without any multipath flavor
//! negotiated.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::datagram::{DatagramMode, DatagramTrafficGenerator};
use crate::endpoint::{ConnectionState, PathSnapshot, PathStatus, Role, Stepper, VariantFlags};
use crate::error::HarnessError;
use crate::model::{
    long_transfer, standard_transfer, SimWorld, WorldConfig, CLIENT_ADDR_2, SERVER_ADDR,
};
use crate::pathlog::PathEventLog;
use crate::poller::{run_until, wait_for, PollBounds, WaitStats};
use trellis_netsim::{LinkTuning, Micros, NEVER};

/// Virtual time a scenario runs before its fault trigger fires.
const SOAK_BEFORE_TRIGGER: Micros = 640_000;
/// Back-from-break scenarios restore the killed pair after this long.
const BREAK_RECOVERY_DELAY: Micros = 1_000_000;
/// Tunnel scenarios keep both pairs dead this long before restoring.
const TUNNEL_OUTAGE: Micros = 5_000_000;
/// Extra settling time after a path abandonment, so both sides converge
/// on the surviving path before the final transfer push.
const ABANDON_SETTLE: Micros = 1_100_000;

// ─── Variants and kinds ─────────────────────────────────────────────────────

/// Which multipath flavor the client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathIdVariant {
    /// Per-path packet numbering keyed by connection ID.
    Cid,
    /// Single shared numbering space.
    Simple,
    /// Explicit unique path identifiers.
    Unique,
}

impl PathIdVariant {
    pub fn requested_flags(self) -> VariantFlags {
        match self {
            PathIdVariant::Cid => VariantFlags {
                multipath: true,
                ..Default::default()
            },
            PathIdVariant::Simple => VariantFlags {
                simple_multipath: true,
                ..Default::default()
            },
            PathIdVariant::Unique => VariantFlags {
                unique_path_id: true,
                ..Default::default()
            },
        }
    }
}

/// The scenario catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioKind {
    /// Two symmetric paths, plain transfer.
    Basic,
    /// Kill the primary pair mid-transfer.
    DropFirst,
    /// Kill the secondary pair mid-transfer.
    DropSecond,
    /// Satellite secondary over a 1 Mbps landline, long transfer.
    SatPlus,
    /// Wi-Fi plus LTE, long transfer.
    Perf,
    /// Renew the CID on the secondary path mid-transfer.
    Renew,
    /// NAT rebinding of the client's primary address mid-transfer.
    Nat,
    /// Kill the secondary pair; the broken path must be detected and
    /// removed on both sides.
    Break1,
    /// Same, but via "destination unreachable" socket errors.
    Break2,
    /// Kill the secondary pair, restore it after a second; both paths
    /// must survive to the end.
    Back1,
    /// Mark the secondary path standby and verify it stays quiet.
    Standby,
    /// Mark the secondary path standby, then kill the primary: the
    /// standby path must take over.
    Standup,
    /// Client abandons the primary path explicitly.
    Abandon,
    /// Pin one stream to the primary path.
    StreamAffinity,
    /// Balanced datagram traffic on both paths.
    Datagram,
    /// Datagram traffic pinned to the primary path.
    DatagramAffinity,
    /// Kill both pairs for five seconds, then restore: the connection
    /// must tunnel through the outage.
    Tunnel,
    /// Subscribe to path events and write the event log.
    Callback,
}

/// What a scenario does to the network after the soak period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    None,
    KillPair0,
    KillPair1,
    UnreachablePair1,
    KillBoth,
    RenewCid,
    NatRebind,
    AbandonPath0,
}

/// Everything that distinguishes one scenario kind from another.
#[derive(Debug, Clone, Copy)]
struct ScenarioPlan {
    primary_tuning: LinkTuning,
    secondary_tuning: LinkTuning,
    long_transfer: bool,
    datagram_mode: Option<DatagramMode>,
    with_event_log: bool,
    trigger: Trigger,
    /// Delay after the trigger before restoring, and whether the primary
    /// pair is restored along with the secondary.
    recovery: Option<(Micros, bool)>,
    settle: Option<Micros>,
    /// Virtual-time budget the completed transfer is checked against.
    pub completion_budget: Micros,
}

impl ScenarioKind {
    fn plan(self) -> ScenarioPlan {
        let base = ScenarioPlan {
            primary_tuning: LinkTuning::default(),
            secondary_tuning: LinkTuning::default(),
            long_transfer: false,
            datagram_mode: None,
            with_event_log: false,
            trigger: Trigger::None,
            recovery: None,
            settle: None,
            completion_budget: 3_000_000,
        };
        match self {
            ScenarioKind::Basic => ScenarioPlan {
                completion_budget: 1_200_000,
                ..base
            },
            ScenarioKind::DropFirst => ScenarioPlan {
                trigger: Trigger::KillPair0,
                completion_budget: 1_600_000,
                ..base
            },
            ScenarioKind::DropSecond => ScenarioPlan {
                trigger: Trigger::KillPair1,
                completion_budget: 1_400_000,
                ..base
            },
            ScenarioKind::SatPlus => ScenarioPlan {
                primary_tuning: LinkTuning::megabit(),
                secondary_tuning: LinkTuning::satellite(),
                long_transfer: true,
                completion_budget: 10_000_000,
                ..base
            },
            ScenarioKind::Perf => ScenarioPlan {
                primary_tuning: LinkTuning::wifi(),
                secondary_tuning: LinkTuning::lte(),
                long_transfer: true,
                completion_budget: 1_800_000,
                ..base
            },
            ScenarioKind::Renew => ScenarioPlan {
                trigger: Trigger::RenewCid,
                ..base
            },
            ScenarioKind::Nat => ScenarioPlan {
                trigger: Trigger::NatRebind,
                ..base
            },
            ScenarioKind::Break1 => ScenarioPlan {
                primary_tuning: LinkTuning::megabit(),
                trigger: Trigger::KillPair1,
                completion_budget: 10_800_000,
                ..base
            },
            ScenarioKind::Break2 => ScenarioPlan {
                primary_tuning: LinkTuning::megabit(),
                trigger: Trigger::UnreachablePair1,
                completion_budget: 10_900_000,
                ..base
            },
            ScenarioKind::Back1 => ScenarioPlan {
                primary_tuning: LinkTuning::megabit(),
                trigger: Trigger::KillPair1,
                recovery: Some((BREAK_RECOVERY_DELAY, false)),
                completion_budget: 5_000_000,
                ..base
            },
            ScenarioKind::Standby => ScenarioPlan {
                completion_budget: 2_500_000,
                ..base
            },
            // The standby path only takes over once break detection has
            // retired the primary, so the budget covers that idle window.
            ScenarioKind::Standup => ScenarioPlan {
                trigger: Trigger::KillPair0,
                completion_budget: 4_000_000,
                ..base
            },
            ScenarioKind::Abandon => ScenarioPlan {
                trigger: Trigger::AbandonPath0,
                settle: Some(ABANDON_SETTLE),
                completion_budget: 3_800_000,
                ..base
            },
            ScenarioKind::StreamAffinity => ScenarioPlan {
                completion_budget: 1_600_000,
                ..base
            },
            ScenarioKind::Datagram => ScenarioPlan {
                datagram_mode: Some(DatagramMode::Balanced),
                completion_budget: 1_400_000,
                ..base
            },
            ScenarioKind::DatagramAffinity => ScenarioPlan {
                datagram_mode: Some(DatagramMode::Affinity),
                completion_budget: 1_400_000,
                ..base
            },
            ScenarioKind::Tunnel => ScenarioPlan {
                trigger: Trigger::KillBoth,
                recovery: Some((TUNNEL_OUTAGE, true)),
                completion_budget: 11_000_000,
                ..base
            },
            ScenarioKind::Callback => ScenarioPlan {
                with_event_log: true,
                completion_budget: 1_200_000,
                ..base
            },
        }
    }
}

// ─── Configuration and report ───────────────────────────────────────────────

/// One scenario invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub kind: ScenarioKind,
    pub variant: PathIdVariant,
    pub seed: u64,
    pub loss_mask: u64,
    /// Capability flags the server side offers. Scenarios normally leave
    /// every flavor enabled and let the client's variant pick; narrowing
    /// this forces a negotiation mismatch.
    pub server_flags: VariantFlags,
    /// Where to write the path event log, for kinds that produce one.
    /// Defaults to a per-invocation file under the system temp directory.
    pub event_log: Option<PathBuf>,
}

impl ScenarioConfig {
    pub fn new(kind: ScenarioKind, variant: PathIdVariant) -> Self {
        ScenarioConfig {
            kind,
            variant,
            seed: 0x1b11_c045,
            loss_mask: 0,
            server_flags: VariantFlags::all(),
            event_log: None,
        }
    }
}

/// What a completed scenario looked like at the end.
#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub kind: ScenarioKind,
    pub variant: PathIdVariant,
    pub completion_micros: Micros,
    pub completion_budget: Micros,
    pub transfer_wait: WaitStats,
    pub client_paths: Vec<PathSnapshot>,
    pub server_paths: Vec<PathSnapshot>,
    pub datagrams: Option<DatagramTrafficGenerator>,
    pub event_log: Option<PathBuf>,
}

// ─── Scenario run ───────────────────────────────────────────────────────────

fn wait_err(condition: &'static str) -> impl FnOnce(crate::poller::WaitError) -> HarnessError {
    move |source| HarnessError::Convergence { condition, source }
}

/// Both endpoints report an established connection.
fn connection_ready(world: &SimWorld) -> bool {
    world.client().state() == ConnectionState::Ready
        && world.server().state() == ConnectionState::Ready
}

/// Exactly two challenge-verified paths on both endpoints.
fn multipath_ready(world: &SimWorld) -> bool {
    for endpoint in [world.client(), world.server()] {
        if endpoint.path_count() != 2 {
            return false;
        }
        for idx in 0..2 {
            match endpoint.path(idx) {
                Some(path) if path.challenge_verified => {}
                _ => return false,
            }
        }
    }
    true
}

fn open_deadline(_: &SimWorld) -> Micros {
    NEVER
}

/// Run one multipath scenario end to end and verify its postconditions.
pub fn run_scenario(config: &ScenarioConfig) -> Result<ScenarioReport, HarnessError> {
    let plan = config.kind.plan();
    info!(kind = ?config.kind, variant = ?config.variant, "scenario start");

    let mut world = SimWorld::new(WorldConfig {
        seed: config.seed,
        loss_mask: config.loss_mask,
        client_flags: config.variant.requested_flags(),
        server_flags: config.server_flags,
        primary_tuning: plan.primary_tuning,
    });

    let mut event_log_path = None;
    if plan.with_event_log {
        let path = config.event_log.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!(
                "trellis-events-{:?}-{:?}-{}.csv",
                config.kind, config.variant, config.seed
            ))
        });
        let log = PathEventLog::create(&path, false)?;
        event_log_path = Some(path);
        world.attach_event_log(log);
    }

    // Handshake, then a strict negotiation check: the requested flavor and
    // nothing else must be live on both sides.
    wait_for(&mut world, PollBounds::MIGRATION, open_deadline, connection_ready)
        .map_err(wait_err("connection ready"))?;
    let expected = config.variant.requested_flags();
    if world.client().negotiated() != expected || world.server().negotiated() != expected {
        return Err(HarnessError::NegotiationMismatch {
            client: world.client().negotiated(),
            server: world.server().negotiated(),
        });
    }

    let streams = if plan.long_transfer {
        long_transfer()
    } else {
        standard_transfer()
    };
    world.init_transfer(&streams);

    // Bring up the second path.
    world.add_secondary_pair(plan.secondary_tuning);
    world.probe_new_path(SERVER_ADDR, CLIENT_ADDR_2)?;
    wait_for(&mut world, PollBounds::MULTIPATH_READY, open_deadline, multipath_ready)
        .map_err(wait_err("multipath ready"))?;

    match config.kind {
        ScenarioKind::StreamAffinity => {
            world.set_stream_path_affinity(Role::Server, streams[0].stream, 0);
        }
        ScenarioKind::Standby | ScenarioKind::Standup => {
            world.set_path_status(Role::Client, 1, PathStatus::Standby)?;
        }
        _ => {}
    }

    // Fault injection after the soak period.
    if plan.trigger != Trigger::None {
        let soak_end = world.now() + SOAK_BEFORE_TRIGGER;
        run_until(&mut world, soak_end).map_err(wait_err("pre-trigger soak"))?;
        debug!(trigger = ?plan.trigger, now = world.now(), "firing trigger");
        match plan.trigger {
            Trigger::None => {}
            Trigger::KillPair0 => world.pair0_mut().kill(),
            Trigger::KillPair1 => {
                if let Some(pair) = world.pair1_mut() {
                    pair.kill();
                }
            }
            Trigger::UnreachablePair1 => {
                if let Some(pair) = world.pair1_mut() {
                    pair.set_unreachable();
                }
            }
            Trigger::KillBoth => {
                world.pair0_mut().kill();
                if let Some(pair) = world.pair1_mut() {
                    pair.kill();
                }
            }
            Trigger::RenewCid => world.renew_cid(Role::Client, 1)?,
            Trigger::NatRebind => world.enable_client_nat(),
            Trigger::AbandonPath0 => world.abandon_path(Role::Client, 0, 0)?,
        }
    }

    if let Some((delay, restore_primary)) = plan.recovery {
        let restore_at = world.now() + delay;
        run_until(&mut world, restore_at).map_err(wait_err("outage wait"))?;
        let now = world.now();
        if restore_primary {
            world.pair0_mut().restore(now);
        }
        if let Some(pair) = world.pair1_mut() {
            pair.restore(now);
        }
    }

    if let Some(delay) = plan.settle {
        let settle_end = world.now() + delay;
        run_until(&mut world, settle_end).map_err(wait_err("post-abandon settle"))?;
    }

    // Datagram traffic rides alongside the tail of the transfer.
    if let Some(mode) = plan.datagram_mode {
        world.attach_datagrams(DatagramTrafficGenerator::new(mode));
        match mode {
            DatagramMode::Balanced => {
                world.mark_datagram_ready(Role::Client);
                world.mark_datagram_ready(Role::Server);
            }
            DatagramMode::Affinity => {
                world.mark_datagram_ready_path(Role::Client, 0);
                world.mark_datagram_ready_path(Role::Server, 0);
            }
        }
    }

    // Final push to completion.
    let bounds = if plan.datagram_mode.is_some() {
        PollBounds::DATAGRAM
    } else {
        PollBounds::transfer(2 * plan.completion_budget)
    };
    let transfer_wait = wait_for(
        &mut world,
        bounds,
        |w| {
            w.datagrams()
                .map(DatagramTrafficGenerator::next_time_ready)
                .unwrap_or(NEVER)
        },
        |w| {
            w.transfer_complete()
                && w.backlog_empty()
                && w.datagrams().is_none_or(DatagramTrafficGenerator::all_sent)
        },
    )
    .map_err(wait_err("transfer complete"))?;

    let report = ScenarioReport {
        kind: config.kind,
        variant: config.variant,
        completion_micros: world.now(),
        completion_budget: plan.completion_budget,
        transfer_wait,
        client_paths: world.client().paths(),
        server_paths: world.server().paths(),
        datagrams: world.datagrams().cloned(),
        event_log: None,
    };
    crate::verify::verify_scenario(&report)?;

    let event_log = world.finish_event_log().or(event_log_path);
    info!(kind = ?config.kind, completion = report.completion_micros, "scenario done");
    Ok(ScenarioReport { event_log, ..report })
}

// ─── Migration ──────────────────────────────────────────────────────────────

/// One migration invocation: no multipath flavor is negotiated, so probing
/// a second address migrates the connection instead of adding a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub seed: u64,
    pub loss_mask: u64,
    /// Shrink the new path's MTU before migrating.
    pub shrink_mtu: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            seed: 0x1b11_c045,
            loss_mask: 0,
            shrink_mtu: false,
        }
    }
}

/// Terminal state of a completed migration run.
#[derive(Debug, Serialize)]
pub struct MigrationReport {
    pub completion_micros: Micros,
    pub transfer_wait: WaitStats,
    /// Client path 0 address tuple before the probe.
    pub tuple_before: crate::endpoint::AddressTuple,
    pub client_paths: Vec<PathSnapshot>,
    pub server_paths: Vec<PathSnapshot>,
}

/// Both endpoints have converged on the new address tuple, with the
/// connection still ready.
fn migration_done(world: &SimWorld) -> bool {
    let client_moved = world
        .client()
        .path(0)
        .is_some_and(|p| p.addrs.local == CLIENT_ADDR_2 && p.challenge_verified);
    let server_moved = world
        .server()
        .path(0)
        .is_some_and(|p| p.addrs.peer == CLIENT_ADDR_2 && p.challenge_verified);
    client_moved
        && server_moved
        && world.client().path_count() == 1
        && world.server().path_count() == 1
        && connection_ready(world)
}

/// Drive a connection through address migration mid-transfer.
pub fn run_migration(config: &MigrationConfig) -> Result<MigrationReport, HarnessError> {
    info!(shrink_mtu = config.shrink_mtu, "migration start");
    let mut world = SimWorld::new(WorldConfig {
        seed: config.seed,
        loss_mask: config.loss_mask,
        client_flags: VariantFlags::default(),
        primary_tuning: LinkTuning::default(),
        ..Default::default()
    });

    wait_for(&mut world, PollBounds::MIGRATION, open_deadline, connection_ready)
        .map_err(wait_err("connection ready"))?;
    // Nothing multipath may have been negotiated.
    if world.client().negotiated().any() || world.server().negotiated().any() {
        return Err(HarnessError::NegotiationMismatch {
            client: world.client().negotiated(),
            server: world.server().negotiated(),
        });
    }

    world.init_transfer(&standard_transfer());
    world.add_secondary_pair(LinkTuning::default());
    if config.shrink_mtu {
        if let Some(pair) = world.pair1_mut() {
            pair.shrink_mtu();
        }
    }

    // Let some data flow on the original path first.
    let soak_end = world.now() + SOAK_BEFORE_TRIGGER / 2;
    run_until(&mut world, soak_end).map_err(wait_err("pre-migration soak"))?;
    let before = world
        .client()
        .path(0)
        .map(|p| p.addrs)
        .ok_or_else(|| HarnessError::Config("client has no path".into()))?;

    world.probe_new_path(SERVER_ADDR, CLIENT_ADDR_2)?;
    wait_for(&mut world, PollBounds::MIGRATION, open_deadline, migration_done)
        .map_err(wait_err("migration done"))?;

    let transfer_wait = wait_for(
        &mut world,
        PollBounds::transfer(6_000_000),
        open_deadline,
        |w| w.transfer_complete() && w.backlog_empty(),
    )
    .map_err(wait_err("transfer complete"))?;

    let report = MigrationReport {
        completion_micros: world.now(),
        transfer_wait,
        tuple_before: before,
        client_paths: world.client().paths(),
        server_paths: world.server().paths(),
    };
    crate::verify::verify_migration(&report)?;
    Ok(report)
}
