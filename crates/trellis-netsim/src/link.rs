//! Simulated one-directional links and bidirectional link pairs.
//!
//! A [`SimLink`] models a wire: packets submitted to it are scheduled for
//! delivery after a serialization delay (per-byte cost), a queueing delay
//! (capped, excess is dropped), and a propagation latency. Fault injection
//! covers a hard switch-off (nothing is ever scheduled again until the link
//! is restored) and an "unreachable" mode that surfaces an error on the
//! next submission, modeling a transient OS-level routing failure rather
//! than a dead wire.
//!
//! Fault injection is never retroactive: deliveries already scheduled keep
//! the timestamps they were computed with (switch-off being the exception —
//! it discards the pending queue entirely).

use std::collections::VecDeque;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::loss::SharedLossMask;
use crate::{Micros, NEVER};

/// Anything a link can carry. `wire_len` feeds serialization delay and MTU
/// enforcement; the link never looks inside the payload.
pub trait Payload {
    fn wire_len(&self) -> usize;
}

// ─── Tuning ─────────────────────────────────────────────────────────────────

/// Conservative initial MTU (IPv4), used as the floor when shrinking.
pub const INITIAL_MTU: usize = 1252;

/// Default link MTU.
pub const DEFAULT_MTU: usize = 1536;

/// Static parameters of one link direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTuning {
    /// One-way propagation delay.
    pub latency_micros: Micros,
    /// Inverse bandwidth: picoseconds to serialize one byte.
    pub picosec_per_byte: u64,
    /// Maximum queueing delay before the link drops the packet.
    pub queue_delay_max: Micros,
    /// Largest payload the link will carry.
    pub path_mtu: usize,
}

impl Default for LinkTuning {
    /// 10 ms one way at 10 Mbit/s with a 20 ms queue cap.
    fn default() -> Self {
        LinkTuning {
            latency_micros: 10_000,
            picosec_per_byte: 800_000,
            queue_delay_max: 20_000,
            path_mtu: DEFAULT_MTU,
        }
    }
}

impl LinkTuning {
    /// Geostationary satellite hop: 300 ms one way, deep queue.
    pub fn satellite() -> Self {
        LinkTuning {
            latency_micros: 300_000,
            queue_delay_max: 600_000,
            ..Default::default()
        }
    }

    /// Low-bandwidth terrestrial link: 1 Mbit/s.
    pub fn megabit() -> Self {
        LinkTuning {
            picosec_per_byte: 8_000_000,
            ..Default::default()
        }
    }

    /// Typical home Wi-Fi: 15 ms one way at 50 Mbit/s.
    pub fn wifi() -> Self {
        LinkTuning {
            latency_micros: 15_000,
            picosec_per_byte: 8_000_000 / 50,
            queue_delay_max: 30_000,
            ..Default::default()
        }
    }

    /// LTE uplink: 30 ms one way at 40 Mbit/s.
    pub fn lte() -> Self {
        LinkTuning {
            latency_micros: 30_000,
            picosec_per_byte: 8_000_000 / 40,
            queue_delay_max: 60_000,
            ..Default::default()
        }
    }
}

// ─── SimLink ────────────────────────────────────────────────────────────────

/// A packet scheduled for delivery.
#[derive(Debug, Clone)]
pub struct Delivery<P> {
    /// Virtual time at which the consumer may dequeue this packet.
    pub arrival: Micros,
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub payload: P,
}

/// What happened to a submitted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Scheduled for delivery at the given time.
    Queued(Micros),
    /// Link is switched off; the packet vanished silently.
    Suppressed,
    /// Dropped by the link itself (counted, not an error).
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Loss mask consumed a set bit.
    Loss,
    /// Payload larger than the path MTU.
    MtuExceeded,
    /// Queueing delay would exceed the configured cap.
    QueueFull,
}

/// Errors surfaced to the submitter.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The unreachable flag is set: the "socket call" fails. The flag is
    /// caller-controlled and never clears itself; see [`SimLink::restore`].
    #[error("destination unreachable")]
    Unreachable,
}

/// One-directional virtual wire.
#[derive(Debug)]
pub struct SimLink<P> {
    tuning: LinkTuning,
    /// Earliest time the next submission can start serializing. `NEVER`
    /// while switched off, as a secondary guard against scheduling.
    next_send_time: Micros,
    is_switched_off: bool,
    is_unreachable: bool,
    loss: SharedLossMask,
    pending: VecDeque<Delivery<P>>,
    /// Packets dropped by the link (loss, MTU, queue overflow).
    pub dropped: u64,
    /// Packets handed to the consumer.
    pub delivered: u64,
}

impl<P: Payload> SimLink<P> {
    pub fn new(tuning: LinkTuning, loss: SharedLossMask, now: Micros) -> Self {
        SimLink {
            tuning,
            next_send_time: now,
            is_switched_off: false,
            is_unreachable: false,
            loss,
            pending: VecDeque::new(),
            dropped: 0,
            delivered: 0,
        }
    }

    /// Submit a packet for transmission at virtual time `now`.
    pub fn submit(
        &mut self,
        from: SocketAddr,
        to: SocketAddr,
        payload: P,
        now: Micros,
    ) -> Result<SubmitOutcome, LinkError> {
        if self.is_unreachable {
            return Err(LinkError::Unreachable);
        }
        if self.is_switched_off {
            return Ok(SubmitOutcome::Suppressed);
        }
        let len = payload.wire_len();
        if len > self.tuning.path_mtu {
            self.dropped += 1;
            return Ok(SubmitOutcome::Dropped(DropReason::MtuExceeded));
        }
        if self.loss.borrow_mut().next_lost() {
            self.dropped += 1;
            return Ok(SubmitOutcome::Dropped(DropReason::Loss));
        }
        let start = self.next_send_time.max(now);
        let queue_delay = start - now;
        if queue_delay > self.tuning.queue_delay_max {
            self.dropped += 1;
            return Ok(SubmitOutcome::Dropped(DropReason::QueueFull));
        }
        let serialize = (len as u64).saturating_mul(self.tuning.picosec_per_byte) / 1_000_000;
        self.next_send_time = start + serialize;
        let arrival = self.next_send_time + self.tuning.latency_micros;
        self.pending.push_back(Delivery {
            arrival,
            from,
            to,
            payload,
        });
        Ok(SubmitOutcome::Queued(arrival))
    }

    /// Arrival time of the next pending delivery, if any.
    pub fn next_arrival(&self) -> Option<Micros> {
        self.pending.front().map(|d| d.arrival)
    }

    /// Dequeue the next delivery if it is due at `now`.
    pub fn deliver_due(&mut self, now: Micros) -> Option<Delivery<P>> {
        if self.pending.front().is_some_and(|d| d.arrival <= now) {
            self.delivered += 1;
            self.pending.pop_front()
        } else {
            None
        }
    }

    /// Hard fault: nothing may be scheduled or delivered on this link until
    /// it is restored. Pending deliveries are discarded — packets in flight
    /// on a dead wire never arrive. Idempotent.
    pub fn switch_off(&mut self) {
        self.is_switched_off = true;
        self.next_send_time = NEVER;
        let discarded = self.pending.len();
        self.pending.clear();
        debug!(discarded, "link switched off");
    }

    /// Transient fault: the next submission reports [`LinkError::Unreachable`]
    /// without touching any other link state. Does not self-clear.
    pub fn set_unreachable(&mut self) {
        self.is_unreachable = true;
    }

    /// Clear all fault flags and resume sending from `now`, so delivery
    /// restarts without a backlog burst. A never-faulted link is unaffected
    /// apart from the send-time reset.
    pub fn restore(&mut self, now: Micros) {
        self.is_switched_off = false;
        self.is_unreachable = false;
        self.next_send_time = now;
    }

    /// Live tuning update. Applies to packets submitted after the call;
    /// already-scheduled deliveries keep their timestamps.
    pub fn reconfigure(
        &mut self,
        latency_micros: Micros,
        picosec_per_byte: u64,
        queue_delay_max: Micros,
    ) {
        self.tuning.latency_micros = latency_micros;
        self.tuning.picosec_per_byte = picosec_per_byte;
        self.tuning.queue_delay_max = queue_delay_max;
    }

    /// Shrink the MTU halfway toward the conservative initial MTU.
    pub fn shrink_mtu(&mut self) {
        self.tuning.path_mtu = (INITIAL_MTU + self.tuning.path_mtu) / 2;
    }

    pub fn tuning(&self) -> &LinkTuning {
        &self.tuning
    }

    pub fn is_switched_off(&self) -> bool {
        self.is_switched_off
    }

    pub fn is_unreachable(&self) -> bool {
        self.is_unreachable
    }

    pub fn next_send_time(&self) -> Micros {
        self.next_send_time
    }
}

// ─── LinkPair ───────────────────────────────────────────────────────────────

/// Both directions of one network path, owned as a single value so fault
/// injection always hits the pair atomically.
#[derive(Debug)]
pub struct LinkPair<P> {
    /// Client → server direction.
    pub forward: SimLink<P>,
    /// Server → client direction.
    pub reverse: SimLink<P>,
}

impl<P: Payload> LinkPair<P> {
    pub fn new(tuning: LinkTuning, loss: SharedLossMask, now: Micros) -> Self {
        LinkPair {
            forward: SimLink::new(tuning, loss.clone(), now),
            reverse: SimLink::new(tuning, loss, now),
        }
    }

    /// Switch off both directions.
    pub fn kill(&mut self) {
        self.forward.switch_off();
        self.reverse.switch_off();
    }

    /// Mark both directions unreachable.
    pub fn set_unreachable(&mut self) {
        self.forward.set_unreachable();
        self.reverse.set_unreachable();
    }

    /// Restore both directions at the current virtual time.
    pub fn restore(&mut self, now: Micros) {
        self.forward.restore(now);
        self.reverse.restore(now);
    }

    /// Retune both directions.
    pub fn reconfigure(&mut self, latency_micros: Micros, picosec_per_byte: u64, queue_delay_max: Micros) {
        self.forward.reconfigure(latency_micros, picosec_per_byte, queue_delay_max);
        self.reverse.reconfigure(latency_micros, picosec_per_byte, queue_delay_max);
    }

    /// Shrink the MTU of both directions (migration MTU-drop scenario).
    pub fn shrink_mtu(&mut self) {
        self.forward.shrink_mtu();
        self.reverse.shrink_mtu();
    }

    /// Earliest pending arrival across both directions.
    pub fn next_arrival(&self) -> Option<Micros> {
        match (self.forward.next_arrival(), self.reverse.next_arrival()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss;

    #[derive(Debug, Clone)]
    struct Blob(usize);

    impl Payload for Blob {
        fn wire_len(&self) -> usize {
            self.0
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    fn link() -> SimLink<Blob> {
        SimLink::new(LinkTuning::default(), loss::shared(0), 0)
    }

    #[test]
    fn delivery_time_includes_serialization_and_latency() {
        let mut l = link();
        let out = l.submit(addr(1), addr(2), Blob(1000), 0).unwrap();
        // 1000 bytes * 800_000 ps = 800 µs serialize, + 10_000 µs latency.
        assert_eq!(out, SubmitOutcome::Queued(10_800));
        assert_eq!(l.next_arrival(), Some(10_800));
        assert!(l.deliver_due(10_799).is_none());
        assert!(l.deliver_due(10_800).is_some());
    }

    #[test]
    fn back_to_back_packets_queue_behind_each_other() {
        let mut l = link();
        l.submit(addr(1), addr(2), Blob(1000), 0).unwrap();
        let out = l.submit(addr(1), addr(2), Blob(1000), 0).unwrap();
        // Second packet starts serializing at 800 µs.
        assert_eq!(out, SubmitOutcome::Queued(11_600));
    }

    #[test]
    fn queue_delay_cap_drops_excess() {
        let mut l = link();
        // Each 1000-byte packet occupies 800 µs of wire time; the cap is
        // 20_000 µs, so packet 27 (queue delay 20_800) must drop.
        let mut dropped = false;
        for _ in 0..30 {
            if let SubmitOutcome::Dropped(DropReason::QueueFull) =
                l.submit(addr(1), addr(2), Blob(1000), 0).unwrap()
            {
                dropped = true;
                break;
            }
        }
        assert!(dropped);
        assert!(l.dropped > 0);
    }

    #[test]
    fn mtu_is_enforced() {
        let mut l = link();
        let out = l.submit(addr(1), addr(2), Blob(DEFAULT_MTU + 1), 0).unwrap();
        assert_eq!(out, SubmitOutcome::Dropped(DropReason::MtuExceeded));
    }

    #[test]
    fn loss_mask_drops_marked_packets() {
        let mask = loss::shared(0b10);
        let mut l = SimLink::new(LinkTuning::default(), mask, 0);
        assert!(matches!(
            l.submit(addr(1), addr(2), Blob(100), 0).unwrap(),
            SubmitOutcome::Queued(_)
        ));
        assert_eq!(
            l.submit(addr(1), addr(2), Blob(100), 0).unwrap(),
            SubmitOutcome::Dropped(DropReason::Loss)
        );
    }

    #[test]
    fn switch_off_suppresses_and_discards() {
        let mut l = link();
        l.submit(addr(1), addr(2), Blob(100), 0).unwrap();
        l.switch_off();
        assert_eq!(l.next_arrival(), None);
        assert_eq!(l.next_send_time(), NEVER);
        assert_eq!(
            l.submit(addr(1), addr(2), Blob(100), 0).unwrap(),
            SubmitOutcome::Suppressed
        );
    }

    #[test]
    fn unreachable_errors_until_restored() {
        let mut l = link();
        l.set_unreachable();
        assert_eq!(
            l.submit(addr(1), addr(2), Blob(100), 0),
            Err(LinkError::Unreachable)
        );
        // Still set: the flag never clears itself.
        assert_eq!(
            l.submit(addr(1), addr(2), Blob(100), 5_000),
            Err(LinkError::Unreachable)
        );
        l.restore(5_000);
        assert!(l.submit(addr(1), addr(2), Blob(100), 5_000).is_ok());
    }

    #[test]
    fn double_fault_then_restore_matches_pristine_link() {
        let now = 123_456;
        let mut faulted = link();
        faulted.switch_off();
        faulted.switch_off();
        faulted.restore(now);

        let mut pristine: SimLink<Blob> = SimLink::new(LinkTuning::default(), loss::shared(0), now);

        let a = faulted.submit(addr(1), addr(2), Blob(500), now).unwrap();
        let b = pristine.submit(addr(1), addr(2), Blob(500), now).unwrap();
        assert_eq!(a, b);
        assert_eq!(faulted.next_send_time(), pristine.next_send_time());
    }

    #[test]
    fn reconfigure_is_not_retroactive() {
        let mut l = link();
        l.submit(addr(1), addr(2), Blob(1000), 0).unwrap();
        l.reconfigure(1_000, 800_000, 20_000);
        // The in-flight packet keeps its original 10 ms latency.
        assert_eq!(l.next_arrival(), Some(10_800));
        let out = l.submit(addr(1), addr(2), Blob(1000), 800).unwrap();
        // New packet: starts at 800, serializes 800 µs, + 1 ms latency.
        assert_eq!(out, SubmitOutcome::Queued(2_600));
    }

    #[test]
    fn pair_kill_hits_both_directions() {
        let mut pair: LinkPair<Blob> = LinkPair::new(LinkTuning::default(), loss::shared(0), 0);
        pair.kill();
        assert!(pair.forward.is_switched_off());
        assert!(pair.reverse.is_switched_off());
        pair.restore(100);
        assert!(!pair.forward.is_switched_off());
        assert_eq!(pair.reverse.next_send_time(), 100);
    }

    #[test]
    fn shrink_mtu_halves_toward_initial() {
        let mut l = link();
        l.shrink_mtu();
        assert_eq!(l.tuning().path_mtu, (INITIAL_MTU + DEFAULT_MTU) / 2);
    }
}
