//! Deterministic reference collaborator for the harness.
//!
//! The scenarios need a connection to drive. This module provides the
//! smallest one that honors the observable surface in [`crate::endpoint`]:
//! a hello/accept handshake with capability intersection, challenge-based
//! path validation, per-path packet numbering with echo acks and loss
//! recovery,
//! in-order stream service over round-robin paths honoring standby status
//! and stream affinity,
//! idle-path break detection, migration promotion when no multipath flavor
//! is negotiated, NAT rebinding, path abandonment, and CID renewal.
//!
//! It is not a transport: no TLS, no AEAD, no congestion control, no real
//! packet encoding. Frames are typed enum values whose `wire_len` feeds
//! the link model.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use tracing::debug;

use crate::datagram::DatagramTrafficGenerator;
use crate::endpoint::{
    AddressTuple, ConnectionState, PathSnapshot, PathStatus, Role, StepError, Stepper, VariantFlags,
};
use crate::error::HarnessError;
use crate::pathlog::{PathEvent, PathEventLog};
use trellis_netsim::{
    loss, LinkError, LinkPair, LinkTuning, Micros, PacketId, PacketStore, PathQueue, Payload,
    SharedLossMask, SubmitOutcome, NEVER,
};

// ─── Addresses ──────────────────────────────────────────────────────────────

pub const SERVER_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 4433));
pub const CLIENT_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), 50_000));
/// Second client interface, used for the probed path.
pub const CLIENT_ADDR_2: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), 50_017));
/// Address the client appears as after the NAT rebinding trigger.
pub const CLIENT_ADDR_NATTED: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), 50_007));

// ─── Timers ─────────────────────────────────────────────────────────────────

const HELLO_RETRANSMIT: Micros = 30_000;
const CHALLENGE_RETRANSMIT: Micros = 250_000;
/// Retransmission timer floor; the effective timer is 2x the path's
/// smoothed RTT, so a satellite path does not thrash.
const RTO_MIN: Micros = 250_000;
/// Idle paths are pinged at this interval so a healthy standby path is
/// never mistaken for a broken one.
const KEEPALIVE_INTERVAL: Micros = 500_000;
/// Tick spacing while an endpoint has work to do.
const PACING_TICK: Micros = 1_000;
/// Tick spacing while idle.
const IDLE_TICK: Micros = 50_000;
/// A verified path this long without receipts, while work is pending, is
/// considered broken and demoted (never the last path).
const BREAK_TIMEOUT: Micros = 1_500_000;
/// Consecutive unreachable send errors before a path is demoted.
const MAX_SEND_ERRORS: u32 = 3;
/// Stream data bytes per packet. Sized under the shrunk-MTU floor so the
/// harness does not need to model PMTU discovery.
const SEGMENT: usize = 1_200;
const HEADER_LEN: usize = 40;

/// Interval between full-size data packets that exactly fills (and never
/// floods) a link with the given serialization cost.
fn pacing_interval(picosec_per_byte: u64) -> Micros {
    ((SEGMENT + HEADER_LEN) as u64).saturating_mul(picosec_per_byte) / 1_000_000 + 1
}

// ─── Frames ─────────────────────────────────────────────────────────────────

/// What travels on the simulated wire. The link only sees `wire_len`.
#[derive(Debug, Clone)]
pub enum Frame {
    Hello { flags: VariantFlags },
    Accept { flags: VariantFlags },
    Challenge { token: u64 },
    Response { token: u64 },
    Data {
        stream: u64,
        offset: u64,
        len: usize,
        fin: bool,
        packet_number: u64,
    },
    /// Echo of one received data packet's per-path number. Links are FIFO,
    /// so acks arrive in send order; a front-of-queue packet older than an
    /// acked one is known lost.
    Ack { packet_number: u64 },
    Datagram { sequence: u64 },
    Abandon { reason: u64 },
    CidRenew { sequence: u64 },
    StatusUpdate { status: PathStatus },
    Ping,
    Pong,
}

impl Payload for Frame {
    fn wire_len(&self) -> usize {
        match self {
            Frame::Data { len, .. } => len + HEADER_LEN,
            Frame::Datagram { .. } => 512,
            _ => 48,
        }
    }
}

// ─── Streams and chunks ─────────────────────────────────────────────────────

/// One request/response exchange: the client sends `request_len` bytes on
/// `stream`, the server answers with `response_len` bytes on the same
/// stream once the request is complete.
#[derive(Debug, Clone, Copy)]
pub struct StreamDesc {
    pub stream: u64,
    pub request_len: u64,
    pub response_len: u64,
}

impl StreamDesc {
    pub fn standard(stream: u64) -> Self {
        StreamDesc {
            stream,
            request_len: 257,
            response_len: 1_000_000,
        }
    }
}

/// The standard two-stream scenario transfer.
pub fn standard_transfer() -> Vec<StreamDesc> {
    vec![StreamDesc::standard(4), StreamDesc::standard(8)]
}

/// The long ten-stream transfer used by satellite/perf scenarios.
pub fn long_transfer() -> Vec<StreamDesc> {
    (1..=10).map(|n| StreamDesc::standard(4 * n)).collect()
}

#[derive(Debug, Clone, Copy)]
struct Chunk {
    stream: u64,
    offset: u64,
    len: usize,
    fin: bool,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    chunk: Chunk,
    sent_at: Micros,
}

#[derive(Debug)]
struct TxStream {
    id: u64,
    total: u64,
    sent: u64,
    acked: u64,
}

#[derive(Debug, Default)]
struct RxStream {
    received: u64,
    total: Option<u64>,
    chunks: HashSet<u64>,
}

impl RxStream {
    fn complete(&self) -> bool {
        self.total.is_some_and(|t| self.received >= t)
    }
}

// ─── Paths ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ModelPath {
    addrs: AddressTuple,
    challenge_verified: bool,
    is_standby: bool,
    unique_path_id: u64,
    local_cid_sequence: u64,
    remote_cid_sequence: u64,
    /// Sender-side in-flight FIFO and its metadata.
    queue: PathQueue,
    meta: HashMap<PacketId, InFlight>,
    next_packet_number: u64,
    /// Highest packet number accepted plus one; arrivals below it are
    /// duplicates, gaps above it are losses recovered by retransmission.
    expected_packet_number: u64,
    /// Bytes of stream data sent and acknowledged on this path.
    delivered: u64,
    last_recv_time: Micros,
    pending_challenge: Option<u64>,
    next_challenge_time: Micros,
    next_ping_time: Micros,
    srtt: Micros,
    /// Spacing between data packets, matched to the underlying link rate so
    /// the sender never floods the link's queue. Kept in sync by the world.
    pacing_micros: Micros,
    next_data_time: Micros,
    send_errors: u32,
}

impl ModelPath {
    fn new(addrs: AddressTuple, unique_path_id: u64, verified: bool, now: Micros) -> Self {
        ModelPath {
            addrs,
            challenge_verified: verified,
            is_standby: false,
            unique_path_id,
            local_cid_sequence: 1,
            remote_cid_sequence: 1,
            queue: PathQueue::new(),
            meta: HashMap::new(),
            next_packet_number: 0,
            expected_packet_number: 0,
            delivered: 0,
            last_recv_time: now,
            pending_challenge: None,
            next_challenge_time: now,
            next_ping_time: now + KEEPALIVE_INTERVAL,
            srtt: RTO_MIN,
            pacing_micros: PACING_TICK,
            next_data_time: now,
            send_errors: 0,
        }
    }

    fn retransmit_timeout(&self) -> Micros {
        (2 * self.srtt).max(RTO_MIN)
    }

    fn snapshot(&self) -> PathSnapshot {
        PathSnapshot {
            addrs: self.addrs,
            challenge_verified: self.challenge_verified,
            is_standby: self.is_standby,
            delivered: self.delivered,
            unique_path_id: self.unique_path_id,
            local_cid_sequence: self.local_cid_sequence,
            remote_cid_sequence: self.remote_cid_sequence,
        }
    }
}

// ─── Actions ────────────────────────────────────────────────────────────────

/// What an endpoint asks the world to do on its behalf.
#[derive(Debug)]
enum Action {
    Send { path_idx: usize, frame: Frame },
    PathEvent { path_id: u64, event: PathEvent },
    DatagramSent,
    DatagramReceived { on_path_zero: bool },
}

// ─── ModelEndpoint ──────────────────────────────────────────────────────────

/// One side of the model connection. Scenario code reads state through the
/// snapshot accessors; all mutation goes through [`SimWorld`].
#[derive(Debug)]
pub struct ModelEndpoint {
    role: Role,
    state: ConnectionState,
    local_flags: VariantFlags,
    negotiated: VariantFlags,
    paths: Vec<ModelPath>,
    store: PacketStore,
    tx: Vec<TxStream>,
    rx: HashMap<u64, RxStream>,
    /// Server side: responses owed once the keyed request completes.
    pending_responses: HashMap<u64, u64>,
    /// Chunks awaiting (re)transmission on any eligible path.
    retransmit: VecDeque<Chunk>,
    stream_affinity: HashMap<u64, usize>,
    datagram_armed: bool,
    datagram_pinned: Option<usize>,
    datagram_sequence: u64,
    next_unique_path_id: u64,
    rr_path: usize,
    next_wake: Micros,
    rng: StdRng,
}

impl ModelEndpoint {
    fn new(role: Role, local_flags: VariantFlags, seed: u64) -> Self {
        ModelEndpoint {
            role,
            state: ConnectionState::Connecting,
            local_flags,
            negotiated: VariantFlags::default(),
            paths: Vec::new(),
            store: PacketStore::new(),
            tx: Vec::new(),
            rx: HashMap::new(),
            pending_responses: HashMap::new(),
            retransmit: VecDeque::new(),
            stream_affinity: HashMap::new(),
            datagram_armed: false,
            datagram_pinned: None,
            datagram_sequence: 0,
            next_unique_path_id: 0,
            rr_path: 0,
            next_wake: 0,
            rng: StdRng::seed_from_u64(seed ^ role.index() as u64),
        }
    }

    // ── Read surface ────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn negotiated(&self) -> VariantFlags {
        self.negotiated
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    pub fn path(&self, idx: usize) -> Option<PathSnapshot> {
        self.paths.get(idx).map(ModelPath::snapshot)
    }

    pub fn paths(&self) -> Vec<PathSnapshot> {
        self.paths.iter().map(ModelPath::snapshot).collect()
    }

    /// All local transfers fully acknowledged.
    pub fn tx_complete(&self) -> bool {
        self.pending_responses.is_empty() && self.tx.iter().all(|s| s.acked >= s.total)
    }

    /// Nothing in flight, nothing queued for retransmission.
    pub fn backlog_empty(&self) -> bool {
        self.retransmit.is_empty() && self.paths.iter().all(|p| p.queue.is_empty())
    }

    fn has_pending_work(&self) -> bool {
        !self.tx_complete()
            || !self.backlog_empty()
            || self.rx.values().any(|s| !s.complete())
            || self.datagram_armed
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn path_index(&self, local: SocketAddr, peer: SocketAddr) -> Option<usize> {
        self.paths
            .iter()
            .position(|p| p.addrs.local == local && p.addrs.peer == peer)
    }

    fn create_path(&mut self, addrs: AddressTuple, verified: bool, now: Micros) -> usize {
        let id = self.next_unique_path_id;
        self.next_unique_path_id += 1;
        self.paths.push(ModelPath::new(addrs, id, verified, now));
        self.paths.len() - 1
    }

    /// Drop a path: in-flight data moves to the retransmission queue so a
    /// surviving path carries it. Refuses to drop the last path.
    fn remove_path(&mut self, idx: usize, out: &mut Vec<Action>) {
        if self.paths.len() <= 1 {
            return;
        }
        let mut path = self.paths.remove(idx);
        while let Some((id, _)) = self.store.front(&path.queue) {
            self.store.remove(&mut path.queue, id);
            if let Some(inflight) = path.meta.remove(&id) {
                self.retransmit.push_back(inflight.chunk);
            }
        }
        debug!(role = ?self.role, path_id = path.unique_path_id, "path removed");
        out.push(Action::PathEvent {
            path_id: path.unique_path_id,
            event: PathEvent::Deleted,
        });
    }

    /// Paths the scheduler may use: verified, preferring non-standby ones.
    /// A standby path is only used when nothing else is available.
    fn eligible_paths(&self) -> Vec<usize> {
        let verified: Vec<usize> = (0..self.paths.len())
            .filter(|&i| self.paths[i].challenge_verified)
            .collect();
        let active: Vec<usize> = verified
            .iter()
            .copied()
            .filter(|&i| !self.paths[i].is_standby)
            .collect();
        if active.is_empty() {
            verified
        } else {
            active
        }
    }

    /// Next chunk this path may carry. Streams are served strictly in
    /// order: the path choice follows the next stream's affinity, so a
    /// pinned stream never spills onto another path and other paths wait
    /// rather than skipping ahead in the stream queue.
    fn next_chunk_for(&mut self, path_idx: usize) -> Option<Chunk> {
        let allowed = |affinity: &HashMap<u64, usize>, stream: u64| {
            affinity.get(&stream).is_none_or(|&pinned| pinned == path_idx)
        };

        if let Some(pos) = self
            .retransmit
            .iter()
            .position(|c| allowed(&self.stream_affinity, c.stream))
        {
            return self.retransmit.remove(pos);
        }

        let i = self.tx.iter().position(|s| s.sent < s.total)?;
        let stream = &self.tx[i];
        if !allowed(&self.stream_affinity, stream.id) {
            return None;
        }
        let offset = stream.sent;
        let len = SEGMENT.min((stream.total - offset) as usize);
        let fin = offset + len as u64 >= stream.total;
        let chunk = Chunk {
            stream: stream.id,
            offset,
            len,
            fin,
        };
        self.tx[i].sent += len as u64;
        Some(chunk)
    }

    fn send_data(&mut self, path_idx: usize, chunk: Chunk, now: Micros, out: &mut Vec<Action>) {
        let path = &mut self.paths[path_idx];
        let packet_number = path.next_packet_number;
        path.next_packet_number += 1;
        let id = self.store.insert(
            &mut path.queue,
            packet_number,
            chunk.len + HEADER_LEN,
        );
        path.meta.insert(id, InFlight { chunk, sent_at: now });
        out.push(Action::Send {
            path_idx,
            frame: Frame::Data {
                stream: chunk.stream,
                offset: chunk.offset,
                len: chunk.len,
                fin: chunk.fin,
                packet_number,
            },
        });
    }

    /// Periodic wakeup: handshake, challenges, retransmission timers, break
    /// detection, data and datagram scheduling.
    fn tick(&mut self, now: Micros) -> Vec<Action> {
        let mut out = Vec::new();
        self.next_wake = now + IDLE_TICK;

        if self.role == Role::Client && self.state == ConnectionState::Connecting {
            out.push(Action::Send {
                path_idx: 0,
                frame: Frame::Hello {
                    flags: self.local_flags,
                },
            });
            self.next_wake = now + HELLO_RETRANSMIT;
            return out;
        }
        if self.state != ConnectionState::Ready {
            return out;
        }

        // Challenge retransmission.
        for i in 0..self.paths.len() {
            let path = &mut self.paths[i];
            if let Some(token) = path.pending_challenge {
                if now >= path.next_challenge_time {
                    path.next_challenge_time = now + CHALLENGE_RETRANSMIT;
                    out.push(Action::Send {
                        path_idx: i,
                        frame: Frame::Challenge { token },
                    });
                }
            }
        }

        // Keepalives: a verified path that has been quiet gets a ping, so
        // receipts keep flowing even on a standby path.
        for i in 0..self.paths.len() {
            let path = &mut self.paths[i];
            if path.challenge_verified && now >= path.next_ping_time {
                path.next_ping_time = now + KEEPALIVE_INTERVAL;
                out.push(Action::Send {
                    path_idx: i,
                    frame: Frame::Ping,
                });
            }
        }

        // Go-back retransmission: if a path's oldest in-flight packet has
        // aged past the retransmission timer, everything unacknowledged on
        // it is resent.
        for i in 0..self.paths.len() {
            let rto = self.paths[i].retransmit_timeout();
            let timed_out = self
                .store
                .front(&self.paths[i].queue)
                .and_then(|(id, _)| self.paths[i].meta.get(&id))
                .is_some_and(|inflight| inflight.sent_at + rto <= now);
            if timed_out {
                let path = &mut self.paths[i];
                while let Some((id, _)) = self.store.front(&path.queue) {
                    self.store.remove(&mut path.queue, id);
                    if let Some(inflight) = path.meta.remove(&id) {
                        self.retransmit.push_back(inflight.chunk);
                    }
                }
            }
        }

        // Break detection: a verified path that has gone silent while work
        // is pending is demoted. The last path is never removed.
        if self.paths.len() > 1 && self.has_pending_work() {
            for i in (0..self.paths.len()).rev() {
                if self.paths.len() > 1
                    && self.paths[i].challenge_verified
                    && now.saturating_sub(self.paths[i].last_recv_time) > BREAK_TIMEOUT
                {
                    self.remove_path(i, &mut out);
                }
            }
        }

        // Data scheduling: one packet per eligible path per pacing slot.
        let eligible = self.eligible_paths();
        if !eligible.is_empty() {
            let n = eligible.len();
            for step in 0..n {
                let path_idx = eligible[(self.rr_path + step) % n];
                if now < self.paths[path_idx].next_data_time {
                    continue;
                }
                if let Some(chunk) = self.next_chunk_for(path_idx) {
                    let pacing = self.paths[path_idx].pacing_micros;
                    self.paths[path_idx].next_data_time = now + pacing;
                    self.send_data(path_idx, chunk, now, &mut out);
                }
            }
            self.rr_path = (self.rr_path + 1) % n;

            // One datagram per tick while armed.
            if self.datagram_armed {
                let path_idx = self.datagram_pinned.unwrap_or(eligible[self.rr_path % n]);
                self.datagram_sequence += 1;
                out.push(Action::Send {
                    path_idx,
                    frame: Frame::Datagram {
                        sequence: self.datagram_sequence,
                    },
                });
                out.push(Action::DatagramSent);
                self.datagram_armed = false;
            }
        }

        if self.has_pending_work() {
            self.next_wake = now + PACING_TICK;
            // A fast path may have an earlier send slot than the tick
            // cadence. A slot in the past means the path had nothing to
            // send, not that the endpoint should spin: progress then comes
            // from arrivals, and the tick cadence is only a backstop.
            for i in 0..self.paths.len() {
                let slot = self.paths[i].next_data_time;
                if slot > now && slot < self.next_wake {
                    self.next_wake = slot;
                }
            }
        }
        out
    }

    /// Handle one delivered frame.
    fn receive(&mut self, frame: Frame, from: SocketAddr, to: SocketAddr, now: Micros) -> Vec<Action> {
        let mut out = Vec::new();

        let idx = match self.path_index(to, from) {
            Some(idx) => idx,
            None => match &frame {
                // First contact: the server learns the connection exists.
                Frame::Hello { .. } => {
                    let idx = self.create_path(
                        AddressTuple {
                            local: to,
                            peer: from,
                        },
                        true,
                        now,
                    );
                    self.state = ConnectionState::Ready;
                    idx
                }
                // A challenge from an address pair we have never seen:
                // the peer is probing a new path toward us.
                Frame::Challenge { .. } => {
                    let idx = self.create_path(
                        AddressTuple {
                            local: to,
                            peer: from,
                        },
                        false,
                        now,
                    );
                    let token = self.rng.random::<u64>();
                    let path = &mut self.paths[idx];
                    path.pending_challenge = Some(token);
                    path.next_challenge_time = now;
                    self.next_wake = self.next_wake.min(now);
                    out.push(Action::PathEvent {
                        path_id: path.unique_path_id,
                        event: PathEvent::Created,
                    });
                    idx
                }
                // Same local address, same peer IP, new port: NAT rebinding
                // of an existing path.
                _ => {
                    match self
                        .paths
                        .iter()
                        .position(|p| p.addrs.local == to && p.addrs.peer.ip() == from.ip())
                    {
                        Some(idx) => {
                            debug!(role = ?self.role, ?from, "NAT rebinding");
                            self.paths[idx].addrs.peer = from;
                            idx
                        }
                        None => return out,
                    }
                }
            },
        };

        self.paths[idx].last_recv_time = now;

        match frame {
            Frame::Hello { flags } => {
                // (Re)negotiate and confirm; duplicate hellos are re-acked.
                self.negotiated = self.local_flags.intersect(flags);
                out.push(Action::Send {
                    path_idx: idx,
                    frame: Frame::Accept {
                        flags: self.negotiated,
                    },
                });
            }
            Frame::Accept { flags } => {
                self.negotiated = flags;
                if self.state == ConnectionState::Connecting {
                    self.state = ConnectionState::Ready;
                    self.next_wake = now;
                }
            }
            Frame::Challenge { token } => {
                out.push(Action::Send {
                    path_idx: idx,
                    frame: Frame::Response { token },
                });
            }
            Frame::Response { token } => {
                if self.paths[idx].pending_challenge == Some(token) {
                    let path = &mut self.paths[idx];
                    path.pending_challenge = None;
                    path.challenge_verified = true;
                    // The challenge round-trip doubles as the first RTT
                    // sample, so a long-latency path starts with a sane
                    // retransmission timer.
                    let sent = path.next_challenge_time.saturating_sub(CHALLENGE_RETRANSMIT);
                    path.srtt = now.saturating_sub(sent).max(1);
                    out.push(Action::PathEvent {
                        path_id: path.unique_path_id,
                        event: PathEvent::Validated,
                    });
                    // Without a negotiated multipath flavor, a freshly
                    // validated path is a migration target: it becomes the
                    // default path and the old one is retired.
                    if !self.negotiated.any() && idx != 0 {
                        self.paths.swap(0, idx);
                        self.remove_path(idx, &mut out);
                    }
                }
            }
            Frame::Data {
                stream,
                offset,
                len,
                fin,
                packet_number,
            } => {
                // In-path delivery is FIFO: a number below the cursor is a
                // duplicate, anything else advances it. The gap left by a
                // skipped number is a loss; its chunk comes back later under
                // a fresh number, so chunk accounting stays exact.
                if packet_number >= self.paths[idx].expected_packet_number {
                    self.paths[idx].expected_packet_number = packet_number + 1;
                    let rx = self.rx.entry(stream).or_default();
                    if rx.chunks.insert(offset) {
                        rx.received += len as u64;
                    }
                    if fin {
                        rx.total = Some(offset + len as u64);
                    }
                    if self.rx[&stream].complete() {
                        if let Some(response_len) = self.pending_responses.remove(&stream) {
                            self.tx.push(TxStream {
                                id: stream,
                                total: response_len,
                                sent: 0,
                                acked: 0,
                            });
                            self.next_wake = now;
                        }
                    }
                }
                // Every data arrival is echoed, duplicates included.
                out.push(Action::Send {
                    path_idx: idx,
                    frame: Frame::Ack { packet_number },
                });
            }
            Frame::Ack { packet_number } => {
                let path = &mut self.paths[idx];
                while let Some((id, record)) = self.store.front(&path.queue) {
                    if record.path_packet_number > packet_number {
                        break;
                    }
                    let lost = record.path_packet_number < packet_number;
                    self.store.remove(&mut path.queue, id);
                    if let Some(inflight) = path.meta.remove(&id) {
                        if lost {
                            // Its ack should have arrived first: the packet
                            // (or its ack) was dropped, resend the chunk.
                            self.retransmit.push_back(inflight.chunk);
                        } else {
                            path.delivered += inflight.chunk.len as u64;
                            let sample = now.saturating_sub(inflight.sent_at);
                            path.srtt = (7 * path.srtt + sample) / 8;
                            if let Some(tx) =
                                self.tx.iter_mut().find(|s| s.id == inflight.chunk.stream)
                            {
                                tx.acked += inflight.chunk.len as u64;
                            }
                        }
                    }
                    if !lost {
                        break;
                    }
                }
            }
            Frame::Datagram { .. } => {
                out.push(Action::DatagramReceived {
                    on_path_zero: idx == 0,
                });
            }
            Frame::Abandon { .. } => {
                self.remove_path(idx, &mut out);
            }
            Frame::CidRenew { sequence } => {
                let path = &mut self.paths[idx];
                path.local_cid_sequence = sequence;
                path.remote_cid_sequence = sequence;
            }
            Frame::StatusUpdate { status } => {
                self.paths[idx].is_standby = status == PathStatus::Standby;
            }
            Frame::Ping => {
                out.push(Action::Send {
                    path_idx: idx,
                    frame: Frame::Pong,
                });
            }
            Frame::Pong => {}
        }
        out
    }

    /// A submission on this path failed at the "socket" layer.
    fn on_send_error(&mut self, path_idx: usize, out: &mut Vec<Action>) {
        if let Some(path) = self.paths.get_mut(path_idx) {
            path.send_errors += 1;
            if path.send_errors >= MAX_SEND_ERRORS {
                self.remove_path(path_idx, out);
            }
        }
    }
}

// ─── SimWorld ───────────────────────────────────────────────────────────────

/// Configuration for one model connection over simulated links.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    pub seed: u64,
    pub loss_mask: u64,
    /// Capability flags the client requests.
    pub client_flags: VariantFlags,
    /// Capability flags the server supports.
    pub server_flags: VariantFlags,
    pub primary_tuning: LinkTuning,
}

impl Default for WorldConfig {
    fn default() -> Self {
        WorldConfig {
            seed: 0x1b11_c045,
            loss_mask: 0,
            client_flags: VariantFlags::default(),
            server_flags: VariantFlags::all(),
            primary_tuning: LinkTuning::default(),
        }
    }
}

/// The whole simulated universe: virtual clock, both endpoints, one or two
/// link pairs, NAT rewrite, datagram hookup and event log. Implements
/// [`Stepper`], which is all the poller sees of it.
pub struct SimWorld {
    now: Micros,
    client: ModelEndpoint,
    server: ModelEndpoint,
    pair0: LinkPair<Frame>,
    pair1: Option<LinkPair<Frame>>,
    /// Data-packet pacing interval per pair, derived from the link rate.
    pair_pacing: [Micros; 2],
    loss: SharedLossMask,
    client_nat: Option<SocketAddr>,
    datagrams: Option<DatagramTrafficGenerator>,
    events: Option<PathEventLog>,
}

impl SimWorld {
    pub fn new(config: WorldConfig) -> Self {
        let loss = loss::shared(config.loss_mask);
        let pair0 = LinkPair::new(config.primary_tuning, loss.clone(), 0);
        let mut client = ModelEndpoint::new(Role::Client, config.client_flags, config.seed);
        let server = ModelEndpoint::new(Role::Server, config.server_flags, config.seed);
        client.create_path(
            AddressTuple {
                local: CLIENT_ADDR,
                peer: SERVER_ADDR,
            },
            true,
            0,
        );
        let pacing0 = pacing_interval(config.primary_tuning.picosec_per_byte);
        SimWorld {
            now: 0,
            client,
            server,
            pair0,
            pair1: None,
            pair_pacing: [pacing0, PACING_TICK],
            loss,
            client_nat: None,
            datagrams: None,
            events: None,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn client(&self) -> &ModelEndpoint {
        &self.client
    }

    pub fn server(&self) -> &ModelEndpoint {
        &self.server
    }

    pub fn endpoint(&self, role: Role) -> &ModelEndpoint {
        match role {
            Role::Client => &self.client,
            Role::Server => &self.server,
        }
    }

    pub fn pair0_mut(&mut self) -> &mut LinkPair<Frame> {
        &mut self.pair0
    }

    pub fn pair1_mut(&mut self) -> Option<&mut LinkPair<Frame>> {
        self.pair1.as_mut()
    }

    pub fn loss_mask(&self) -> &SharedLossMask {
        &self.loss
    }

    pub fn datagrams(&self) -> Option<&DatagramTrafficGenerator> {
        self.datagrams.as_ref()
    }

    /// Close and detach the event log, returning its file path.
    pub fn finish_event_log(&mut self) -> Option<std::path::PathBuf> {
        self.events.take().and_then(|log| log.finish().ok())
    }

    /// Both transfers fully acknowledged and all responses issued.
    pub fn transfer_complete(&self) -> bool {
        self.client.tx_complete() && self.server.tx_complete()
    }

    pub fn backlog_empty(&self) -> bool {
        self.client.backlog_empty() && self.server.backlog_empty()
    }

    // ── Setup entry points ──────────────────────────────────────────────────

    /// Add the secondary link pair used by the probed path.
    pub fn add_secondary_pair(&mut self, tuning: LinkTuning) {
        self.pair_pacing[1] = pacing_interval(tuning.picosec_per_byte);
        self.pair1 = Some(LinkPair::new(tuning, self.loss.clone(), self.now));
    }

    /// Retune a pair and the pacing that goes with it.
    pub fn reconfigure_pair(
        &mut self,
        pair_idx: usize,
        latency_micros: Micros,
        picosec_per_byte: u64,
        queue_delay_max: Micros,
    ) {
        let pair = if pair_idx == 0 {
            Some(&mut self.pair0)
        } else {
            self.pair1.as_mut()
        };
        if let Some(pair) = pair {
            pair.reconfigure(latency_micros, picosec_per_byte, queue_delay_max);
            self.pair_pacing[pair_idx.min(1)] = pacing_interval(picosec_per_byte);
        }
    }

    /// Configure the request/response transfer.
    pub fn init_transfer(&mut self, streams: &[StreamDesc]) {
        for desc in streams {
            self.client.tx.push(TxStream {
                id: desc.stream,
                total: desc.request_len,
                sent: 0,
                acked: 0,
            });
            self.server
                .pending_responses
                .insert(desc.stream, desc.response_len);
        }
        self.client.next_wake = self.now;
    }

    pub fn attach_datagrams(&mut self, generator: DatagramTrafficGenerator) {
        self.datagrams = Some(generator);
    }

    pub fn attach_event_log(&mut self, log: PathEventLog) {
        self.events = Some(log);
    }

    /// NAT rebinding: from now on the client's primary address appears to
    /// the server as [`CLIENT_ADDR_NATTED`].
    pub fn enable_client_nat(&mut self) {
        self.client_nat = Some(CLIENT_ADDR_NATTED);
    }

    // ── Mutating collaborator surface ───────────────────────────────────────

    /// Probe a new path from `local` toward `peer` (client side).
    pub fn probe_new_path(
        &mut self,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Result<(), HarnessError> {
        if self.client.path_index(local, peer).is_some() {
            return Err(HarnessError::Config(format!(
                "path {local} -> {peer} already exists"
            )));
        }
        let now = self.now;
        let idx = self
            .client
            .create_path(AddressTuple { local, peer }, false, now);
        let token = self.client.rng.random::<u64>();
        let path = &mut self.client.paths[idx];
        path.pending_challenge = Some(token);
        path.next_challenge_time = now;
        let path_id = path.unique_path_id;
        self.client.next_wake = now;
        let actions = vec![Action::PathEvent {
            path_id,
            event: PathEvent::Created,
        }];
        self.process_actions(Role::Client, actions)
            .map_err(|e| HarnessError::Config(e.to_string()))?;
        Ok(())
    }

    /// Request standby/available status for a path; the peer is notified.
    pub fn set_path_status(
        &mut self,
        role: Role,
        path_idx: usize,
        status: PathStatus,
    ) -> Result<(), HarnessError> {
        let endpoint = self.endpoint_mut(role);
        let path = endpoint
            .paths
            .get_mut(path_idx)
            .ok_or_else(|| HarnessError::Config(format!("no path {path_idx}")))?;
        path.is_standby = status == PathStatus::Standby;
        let path_id = path.unique_path_id;
        let actions = vec![
            Action::Send {
                path_idx,
                frame: Frame::StatusUpdate { status },
            },
            Action::PathEvent {
                path_id,
                event: match status {
                    PathStatus::Standby => PathEvent::Standby,
                    PathStatus::Available => PathEvent::Available,
                },
            },
        ];
        self.process_actions(role, actions)
            .map_err(|e| HarnessError::Config(e.to_string()))?;
        Ok(())
    }

    /// Abandon a path: the peer is told, then the path is dropped locally.
    pub fn abandon_path(
        &mut self,
        role: Role,
        path_idx: usize,
        reason: u64,
    ) -> Result<(), HarnessError> {
        if self.endpoint(role).paths.get(path_idx).is_none() {
            return Err(HarnessError::Config(format!("no path {path_idx}")));
        }
        let actions = vec![Action::Send {
            path_idx,
            frame: Frame::Abandon { reason },
        }];
        self.process_actions(role, actions)
            .map_err(|e| HarnessError::Config(e.to_string()))?;
        let mut more = Vec::new();
        self.endpoint_mut(role).remove_path(path_idx, &mut more);
        self.process_actions(role, more)
            .map_err(|e| HarnessError::Config(e.to_string()))?;
        Ok(())
    }

    /// Renew the CID in use on a path; both sides observe new sequences.
    pub fn renew_cid(&mut self, role: Role, path_idx: usize) -> Result<(), HarnessError> {
        let endpoint = self.endpoint_mut(role);
        let path = endpoint
            .paths
            .get_mut(path_idx)
            .ok_or_else(|| HarnessError::Config(format!("no path {path_idx}")))?;
        path.remote_cid_sequence += 1;
        let sequence = path.remote_cid_sequence;
        let actions = vec![Action::Send {
            path_idx,
            frame: Frame::CidRenew { sequence },
        }];
        self.process_actions(role, actions)
            .map_err(|e| HarnessError::Config(e.to_string()))?;
        Ok(())
    }

    /// Arm datagram sending on any eligible path.
    pub fn mark_datagram_ready(&mut self, role: Role) {
        let now = self.now;
        let endpoint = self.endpoint_mut(role);
        endpoint.datagram_armed = true;
        endpoint.datagram_pinned = None;
        endpoint.next_wake = endpoint.next_wake.min(now);
    }

    /// Arm datagram sending pinned to one path.
    pub fn mark_datagram_ready_path(&mut self, role: Role, path_idx: usize) {
        let now = self.now;
        let endpoint = self.endpoint_mut(role);
        endpoint.datagram_armed = true;
        endpoint.datagram_pinned = Some(path_idx);
        endpoint.next_wake = endpoint.next_wake.min(now);
    }

    /// Pin a stream's data to one path.
    pub fn set_stream_path_affinity(&mut self, role: Role, stream: u64, path_idx: usize) {
        self.endpoint_mut(role).stream_affinity.insert(stream, path_idx);
    }

    // ── Plumbing ────────────────────────────────────────────────────────────

    fn endpoint_mut(&mut self, role: Role) -> &mut ModelEndpoint {
        match role {
            Role::Client => &mut self.client,
            Role::Server => &mut self.server,
        }
    }

    /// Map a client-side address to its link pair index.
    fn pair_index(&self, client_side: SocketAddr) -> usize {
        if client_side == CLIENT_ADDR_2 {
            1
        } else {
            0
        }
    }

    /// Execute endpoint actions: submissions onto links, datagram stats,
    /// event-log rows. Returns whether anything observable happened.
    fn process_actions(&mut self, role: Role, actions: Vec<Action>) -> Result<bool, StepError> {
        let mut active = false;
        let mut queue: VecDeque<(Role, Action)> =
            actions.into_iter().map(|a| (role, a)).collect();

        while let Some((role, action)) = queue.pop_front() {
            match action {
                Action::Send { path_idx, frame } => {
                    let endpoint = self.endpoint(role);
                    let Some(path) = endpoint.paths.get(path_idx) else {
                        continue;
                    };
                    let (mut from, to) = (path.addrs.local, path.addrs.peer);
                    // NAT sits in front of the client's primary address.
                    if role == Role::Client && from == CLIENT_ADDR {
                        if let Some(natted) = self.client_nat {
                            from = natted;
                        }
                    }
                    let client_side = match role {
                        Role::Client => path.addrs.local,
                        Role::Server => to,
                    };
                    let pair_idx = self.pair_index(client_side);
                    let now = self.now;
                    let pair = if pair_idx == 0 {
                        Some(&mut self.pair0)
                    } else {
                        self.pair1.as_mut()
                    };
                    let Some(pair) = pair else {
                        continue;
                    };
                    let link = match role {
                        Role::Client => &mut pair.forward,
                        Role::Server => &mut pair.reverse,
                    };
                    match link.submit(from, to, frame, now) {
                        Ok(SubmitOutcome::Suppressed) => {}
                        Ok(_) => active = true,
                        Err(LinkError::Unreachable) => {
                            active = true;
                            let mut more = Vec::new();
                            self.endpoint_mut(role).on_send_error(path_idx, &mut more);
                            queue.extend(more.into_iter().map(|a| (role, a)));
                        }
                    }
                }
                Action::PathEvent { path_id, event } => {
                    // Only the client subscribes to path callbacks.
                    if role == Role::Client {
                        if let Some(log) = self.events.as_mut() {
                            log.record(self.now, path_id, event, None)
                                .map_err(|e| StepError(e.to_string()))?;
                        }
                    }
                }
                Action::DatagramSent => {
                    if let Some(generator) = self.datagrams.as_mut() {
                        generator.record_sent(role, self.now);
                    }
                    active = true;
                }
                Action::DatagramReceived { on_path_zero } => {
                    if let Some(generator) = self.datagrams.as_mut() {
                        generator.record_received(role, on_path_zero);
                    }
                }
            }
        }
        Ok(active)
    }

    /// Keep every path's pacing in step with its underlying link.
    fn sync_pacing(&mut self) {
        let pacing = self.pair_pacing;
        for role in [Role::Client, Role::Server] {
            let endpoint = self.endpoint_mut(role);
            for path in &mut endpoint.paths {
                let client_side = match role {
                    Role::Client => path.addrs.local,
                    Role::Server => path.addrs.peer,
                };
                let idx = if client_side == CLIENT_ADDR_2 { 1 } else { 0 };
                path.pacing_micros = pacing[idx];
            }
        }
    }

    /// Earliest scheduled moment: link arrival or endpoint wakeup.
    fn next_event_time(&self) -> Micros {
        let mut t = self.client.next_wake.min(self.server.next_wake);
        if let Some(arrival) = self.pair0.next_arrival() {
            t = t.min(arrival);
        }
        if let Some(arrival) = self.pair1.as_ref().and_then(LinkPair::next_arrival) {
            t = t.min(arrival);
        }
        t
    }

    /// Deliver the earliest due packet, if any.
    fn deliver_one(&mut self) -> Result<bool, StepError> {
        let now = self.now;
        let mut best: Option<(usize, bool, Micros)> = None; // (pair, forward?, arrival)
        let mut consider = |pair_idx: usize, forward: bool, arrival: Option<Micros>| {
            if let Some(arrival) = arrival {
                if arrival <= now && best.is_none_or(|(_, _, t)| arrival < t) {
                    best = Some((pair_idx, forward, arrival));
                }
            }
        };
        consider(0, true, self.pair0.forward.next_arrival());
        consider(0, false, self.pair0.reverse.next_arrival());
        if let Some(pair1) = &self.pair1 {
            consider(1, true, pair1.forward.next_arrival());
            consider(1, false, pair1.reverse.next_arrival());
        }

        let Some((pair_idx, forward, _)) = best else {
            return Ok(false);
        };
        let pair = if pair_idx == 0 {
            &mut self.pair0
        } else {
            match self.pair1.as_mut() {
                Some(p) => p,
                None => return Ok(false),
            }
        };
        let link = if forward { &mut pair.forward } else { &mut pair.reverse };
        let Some(delivery) = link.deliver_due(now) else {
            return Ok(false);
        };

        // Undo the NAT rewrite on the way into the client.
        let (role, to) = if forward {
            (Role::Server, delivery.to)
        } else if Some(delivery.to) == self.client_nat {
            (Role::Client, CLIENT_ADDR)
        } else {
            (Role::Client, delivery.to)
        };
        let actions = self
            .endpoint_mut(role)
            .receive(delivery.payload, delivery.from, to, now);
        self.process_actions(role, actions)?;
        Ok(true)
    }
}

impl Stepper for SimWorld {
    fn now(&self) -> Micros {
        self.now
    }

    fn step(&mut self, step_limit: Micros) -> Result<bool, StepError> {
        // Datagram pacing first: a deadline wake lands exactly on a send
        // slot, so the sender must be re-armed before the idle check below
        // or the slot would pass without scheduling anything.
        if self.datagrams.is_some() {
            for role in [Role::Client, Role::Server] {
                let ready = self
                    .datagrams
                    .as_ref()
                    .is_some_and(|g| g.check_ready(role, self.now));
                let armed = self.endpoint(role).datagram_armed;
                let pinned = self.endpoint(role).datagram_pinned;
                if ready && !armed {
                    match pinned {
                        Some(idx) => self.mark_datagram_ready_path(role, idx),
                        None => self.mark_datagram_ready(role),
                    }
                }
            }
        }

        // A limit at or before `now` means "process what is due, advance
        // nothing": deadlines are recomputed per step and may lag the clock.
        let step_limit = step_limit.max(self.now);
        let next = self.next_event_time();
        if next > step_limit {
            // Nothing due inside the window: just let time pass.
            if step_limit != NEVER {
                self.now = step_limit;
            }
            return Ok(false);
        }
        self.now = self.now.max(next);
        self.sync_pacing();
        let mut active = self.deliver_one()?;

        for role in [Role::Client, Role::Server] {
            if self.endpoint(role).next_wake <= self.now {
                let now = self.now;
                let actions = self.endpoint_mut(role).tick(now);
                if self.process_actions(role, actions)? {
                    active = true;
                }
            }
        }
        Ok(active)
    }
}
