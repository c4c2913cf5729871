//! Terminal-state verification.
//!
//! Runs after a scenario's final wait converges: the transfer finished, so
//! everything here is about whether it finished the right way — path
//! counts, address tuples, CID sequences, byte distribution, completion
//! time. Every check reports expected vs. actual through
//! [`HarnessError::Postcondition`].

use crate::driver::{MigrationReport, PathIdVariant, ScenarioKind, ScenarioReport};
use crate::endpoint::PathSnapshot;
use crate::error::HarnessError;
use crate::model::{CLIENT_ADDR_2, CLIENT_ADDR_NATTED};

/// CID sequences start here; a renewal must move past it.
const INITIAL_CID_SEQUENCE: u64 = 1;

fn check_path_count(
    side: &'static str,
    paths: &[PathSnapshot],
    expected: usize,
) -> Result<(), HarnessError> {
    if paths.len() != expected {
        return Err(HarnessError::postcondition(
            "surviving path count",
            format!("{expected} on {side}"),
            paths.len(),
        ));
    }
    Ok(())
}

/// Unique-path-id variant: every client path id must be below 64 and never
/// reused, tracked through a bitmask.
fn check_unique_path_ids(paths: &[PathSnapshot]) -> Result<(), HarnessError> {
    let mut mask = 0u64;
    for path in paths {
        if path.unique_path_id > 63 {
            return Err(HarnessError::postcondition(
                "unique path id range",
                "id <= 63",
                path.unique_path_id,
            ));
        }
        let bit = 1u64 << path.unique_path_id;
        if mask & bit != 0 {
            return Err(HarnessError::postcondition(
                "unique path id reuse",
                "each id used once",
                path.unique_path_id,
            ));
        }
        mask |= bit;
    }
    Ok(())
}

/// Scenario-specific and variant-specific postconditions.
pub fn verify_scenario(report: &ScenarioReport) -> Result<(), HarnessError> {
    if report.completion_micros > report.completion_budget {
        return Err(HarnessError::postcondition(
            "completion time",
            format!("<= {}us", report.completion_budget),
            format!("{}us", report.completion_micros),
        ));
    }

    match report.kind {
        ScenarioKind::Break1 | ScenarioKind::Break2 | ScenarioKind::Abandon => {
            check_path_count("client", &report.client_paths, 1)?;
            check_path_count("server", &report.server_paths, 1)?;
        }
        ScenarioKind::Back1 => {
            check_path_count("client", &report.client_paths, 2)?;
            check_path_count("server", &report.server_paths, 2)?;
        }
        ScenarioKind::StreamAffinity => {
            check_path_count("client", &report.client_paths, 2)?;
            check_path_count("server", &report.server_paths, 2)?;
            // The pinned stream plus its share of the free one.
            if report.server_paths[0].delivered < 1_400_000 {
                return Err(HarnessError::postcondition(
                    "affinity path delivery",
                    ">= 1400000 bytes on server path 0",
                    report.server_paths[0].delivered,
                ));
            }
            if report.server_paths[1].delivered > 600_000 {
                return Err(HarnessError::postcondition(
                    "off-affinity path delivery",
                    "<= 600000 bytes on server path 1",
                    report.server_paths[1].delivered,
                ));
            }
        }
        ScenarioKind::Standby => {
            check_path_count("server", &report.server_paths, 2)?;
            if !report.server_paths[1].is_standby {
                return Err(HarnessError::postcondition(
                    "standby flag",
                    "server path 1 marked standby",
                    report.server_paths[1].is_standby,
                ));
            }
            if report.server_paths[1].delivered > 50_000 {
                return Err(HarnessError::postcondition(
                    "standby path delivery",
                    "<= 50000 bytes on server path 1",
                    report.server_paths[1].delivered,
                ));
            }
        }
        ScenarioKind::Nat => {
            check_path_count("client", &report.client_paths, 2)?;
            check_path_count("server", &report.server_paths, 2)?;
            let peer = report.server_paths[0].addrs.peer;
            if peer != CLIENT_ADDR_NATTED {
                return Err(HarnessError::postcondition(
                    "NAT rebinding",
                    format!("server path 0 peer == {CLIENT_ADDR_NATTED}"),
                    peer,
                ));
            }
            if report.server_paths[0].unique_path_id != 0
                || report.client_paths[0].unique_path_id != 0
            {
                return Err(HarnessError::postcondition(
                    "NAT path identity",
                    "path id 0 still the primary on both sides",
                    format!(
                        "client={}, server={}",
                        report.client_paths[0].unique_path_id,
                        report.server_paths[0].unique_path_id
                    ),
                ));
            }
        }
        ScenarioKind::Renew => {
            check_path_count("client", &report.client_paths, 2)?;
            check_path_count("server", &report.server_paths, 2)?;
            if report.client_paths[1].remote_cid_sequence == INITIAL_CID_SEQUENCE {
                return Err(HarnessError::postcondition(
                    "client remote CID renewal",
                    format!("sequence != {INITIAL_CID_SEQUENCE} on client path 1"),
                    report.client_paths[1].remote_cid_sequence,
                ));
            }
            if report.server_paths[1].remote_cid_sequence == INITIAL_CID_SEQUENCE {
                return Err(HarnessError::postcondition(
                    "server remote CID renewal",
                    format!("sequence != {INITIAL_CID_SEQUENCE} on server path 1"),
                    report.server_paths[1].remote_cid_sequence,
                ));
            }
            if report.server_paths[1].local_cid_sequence == INITIAL_CID_SEQUENCE {
                return Err(HarnessError::postcondition(
                    "server local CID renewal",
                    format!("sequence != {INITIAL_CID_SEQUENCE} on server path 1"),
                    report.server_paths[1].local_cid_sequence,
                ));
            }
        }
        ScenarioKind::Datagram | ScenarioKind::DatagramAffinity => {
            match &report.datagrams {
                Some(generator) => generator.verify()?,
                None => {
                    return Err(HarnessError::postcondition(
                        "datagram accounting",
                        "generator attached",
                        "missing",
                    ))
                }
            }
        }
        _ => {}
    }

    if report.variant == PathIdVariant::Unique {
        check_unique_path_ids(&report.client_paths)?;
    }
    Ok(())
}

/// Migration postconditions: the tuple moved on both sides, one path each,
/// and the new client address is in place.
pub fn verify_migration(report: &MigrationReport) -> Result<(), HarnessError> {
    check_path_count("client", &report.client_paths, 1)?;
    check_path_count("server", &report.server_paths, 1)?;

    let after = report.client_paths[0].addrs;
    if after == report.tuple_before {
        return Err(HarnessError::postcondition(
            "migration tuple change",
            format!("client path 0 tuple != {:?}", report.tuple_before),
            format!("{after:?}"),
        ));
    }
    if after.local != CLIENT_ADDR_2 {
        return Err(HarnessError::postcondition(
            "migrated client address",
            format!("client path 0 local == {CLIENT_ADDR_2}"),
            after.local,
        ));
    }
    let server_peer = report.server_paths[0].addrs.peer;
    if server_peer != CLIENT_ADDR_2 {
        return Err(HarnessError::postcondition(
            "migrated server view",
            format!("server path 0 peer == {CLIENT_ADDR_2}"),
            server_peer,
        ));
    }
    Ok(())
}
