//! Datagram traffic scheduling and distribution verification.
//!
//! Each endpoint sends a fixed target of datagrams, paced by a virtual-time
//! send delay, either on any path (balanced mode) or pinned to path 0
//! (affinity mode). Receipts are counted per endpoint and split between
//! path 0 and the rest, which is what the distribution checks run on:
//! balanced traffic must actually use both paths, pinned traffic must never
//! leave its path.

use serde::{Deserialize, Serialize};

use crate::endpoint::Role;
use crate::error::HarnessError;
use trellis_netsim::Micros;

/// Datagrams each endpoint tries to send.
pub const DEFAULT_TARGET: u64 = 100;

/// Spacing between an endpoint's consecutive sends.
pub const SEND_DELAY: Micros = 3_000;

/// Traffic shape under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatagramMode {
    /// Send on whichever path the scheduler picks.
    Balanced,
    /// Pin every datagram to path 0.
    Affinity,
}

/// Per-endpoint schedule and receive accounting. Indexing is by
/// [`Role::index`]: 0 = client, 1 = server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatagramTrafficGenerator {
    pub mode: DatagramMode,
    target: [u64; 2],
    sent: [u64; 2],
    recv: [u64; 2],
    recv_path0: [u64; 2],
    recv_other: [u64; 2],
    next_ready: [Micros; 2],
}

impl DatagramTrafficGenerator {
    pub fn new(mode: DatagramMode) -> Self {
        DatagramTrafficGenerator {
            mode,
            target: [DEFAULT_TARGET; 2],
            sent: [0; 2],
            recv: [0; 2],
            recv_path0: [0; 2],
            recv_other: [0; 2],
            next_ready: [0; 2],
        }
    }

    /// Whether `role` may send its next datagram at `now`.
    pub fn check_ready(&self, role: Role, now: Micros) -> bool {
        let i = role.index();
        self.sent[i] < self.target[i] && now >= self.next_ready[i]
    }

    /// Earliest future send slot across both endpoints, used as the
    /// poller's per-step deadline so the loop wakes exactly on schedule.
    pub fn next_time_ready(&self) -> Micros {
        let mut next = trellis_netsim::NEVER;
        for i in 0..2 {
            if self.sent[i] < self.target[i] {
                next = next.min(self.next_ready[i]);
            }
        }
        next
    }

    /// Record a send and rearm the endpoint's pacing timer.
    pub fn record_sent(&mut self, role: Role, now: Micros) {
        let i = role.index();
        self.sent[i] += 1;
        self.next_ready[i] = now + SEND_DELAY;
    }

    /// Record a receipt at `role`, noting which path it arrived on.
    pub fn record_received(&mut self, role: Role, on_path_zero: bool) {
        let i = role.index();
        self.recv[i] += 1;
        if on_path_zero {
            self.recv_path0[i] += 1;
        } else {
            self.recv_other[i] += 1;
        }
    }

    /// All targets have been sent.
    pub fn all_sent(&self) -> bool {
        self.sent[0] >= self.target[0] && self.sent[1] >= self.target[1]
    }

    pub fn sent(&self, role: Role) -> u64 {
        self.sent[role.index()]
    }

    pub fn received(&self, role: Role) -> u64 {
        self.recv[role.index()]
    }

    // ─── Verification ───────────────────────────────────────────────────────

    /// Receipts must reach at least 3/4 of the peer's target; simulated
    /// loss may eat the rest.
    pub fn verify_received(&self) -> Result<(), HarnessError> {
        for role in [Role::Client, Role::Server] {
            let got = self.recv[role.index()];
            let want = self.target[role.peer().index()];
            if 4 * got < 3 * want {
                return Err(HarnessError::postcondition(
                    "datagrams received",
                    format!("{role:?} >= 3/4 of {want}"),
                    got,
                ));
            }
        }
        Ok(())
    }

    /// Balanced mode: each endpoint must see at least 1/8 of its receipts
    /// on each of the two paths — both paths must carry real load.
    pub fn verify_balanced(&self) -> Result<(), HarnessError> {
        for role in [Role::Client, Role::Server] {
            let i = role.index();
            let floor = self.recv[i] / 8;
            if self.recv_path0[i] < floor || self.recv_other[i] < floor {
                return Err(HarnessError::postcondition(
                    "datagram balance",
                    format!("{role:?} >= {floor} on each path"),
                    format!(
                        "path0={}, other={}",
                        self.recv_path0[i], self.recv_other[i]
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Affinity mode: nothing may arrive off the pinned path.
    pub fn verify_affinity(&self) -> Result<(), HarnessError> {
        for role in [Role::Client, Role::Server] {
            let off_path = self.recv_other[role.index()];
            if off_path > 0 {
                return Err(HarnessError::postcondition(
                    "datagram affinity",
                    format!("{role:?} 0 off-path datagrams"),
                    off_path,
                ));
            }
        }
        Ok(())
    }

    /// Mode-appropriate full verification.
    pub fn verify(&self) -> Result<(), HarnessError> {
        self.verify_received()?;
        match self.mode {
            DatagramMode::Balanced => self.verify_balanced(),
            DatagramMode::Affinity => self.verify_affinity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(gen: &mut DatagramTrafficGenerator, role: Role, count: u64, alternate: bool) {
        let mut now = 0;
        for n in 0..count {
            assert!(gen.check_ready(role, now));
            gen.record_sent(role, now);
            let on_zero = !alternate || n % 2 == 0;
            gen.record_received(role.peer(), on_zero);
            now += SEND_DELAY;
        }
    }

    #[test]
    fn pacing_blocks_until_send_delay_elapses() {
        let mut gen = DatagramTrafficGenerator::new(DatagramMode::Balanced);
        assert!(gen.check_ready(Role::Client, 0));
        gen.record_sent(Role::Client, 0);
        assert!(!gen.check_ready(Role::Client, SEND_DELAY - 1));
        assert!(gen.check_ready(Role::Client, SEND_DELAY));
        // The earliest slot spans both endpoints: the server has not sent
        // yet, so it is ready immediately.
        assert_eq!(gen.next_time_ready(), 0);
        gen.record_sent(Role::Server, 0);
        assert_eq!(gen.next_time_ready(), SEND_DELAY);
    }

    #[test]
    fn ready_stops_at_target() {
        let mut gen = DatagramTrafficGenerator::new(DatagramMode::Balanced);
        drive(&mut gen, Role::Client, DEFAULT_TARGET, true);
        assert!(!gen.check_ready(Role::Client, trellis_netsim::NEVER - 1));
        assert!(!gen.all_sent());
        drive(&mut gen, Role::Server, DEFAULT_TARGET, true);
        assert!(gen.all_sent());
    }

    #[test]
    fn balanced_split_passes_verification() {
        let mut gen = DatagramTrafficGenerator::new(DatagramMode::Balanced);
        drive(&mut gen, Role::Client, DEFAULT_TARGET, true);
        drive(&mut gen, Role::Server, DEFAULT_TARGET, true);
        gen.verify().unwrap();
    }

    #[test]
    fn starved_path_fails_balance_check() {
        let mut gen = DatagramTrafficGenerator::new(DatagramMode::Balanced);
        // Everything lands on path 0.
        drive(&mut gen, Role::Client, DEFAULT_TARGET, false);
        drive(&mut gen, Role::Server, DEFAULT_TARGET, false);
        assert!(matches!(
            gen.verify(),
            Err(HarnessError::Postcondition { check: "datagram balance", .. })
        ));
    }

    #[test]
    fn affinity_rejects_any_off_path_receipt() {
        let mut gen = DatagramTrafficGenerator::new(DatagramMode::Affinity);
        drive(&mut gen, Role::Client, DEFAULT_TARGET, false);
        drive(&mut gen, Role::Server, DEFAULT_TARGET, false);
        gen.verify().unwrap();

        gen.record_received(Role::Client, false);
        assert!(matches!(
            gen.verify(),
            Err(HarnessError::Postcondition { check: "datagram affinity", .. })
        ));
    }

    #[test]
    fn three_quarters_floor_tolerates_loss() {
        let mut gen = DatagramTrafficGenerator::new(DatagramMode::Balanced);
        for _ in 0..DEFAULT_TARGET {
            gen.record_sent(Role::Client, 0);
            gen.record_sent(Role::Server, 0);
        }
        // 75 of 100 received each way, alternating paths.
        for n in 0..75 {
            gen.record_received(Role::Client, n % 2 == 0);
            gen.record_received(Role::Server, n % 2 == 0);
        }
        gen.verify().unwrap();
    }
}
