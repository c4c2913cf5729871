//! Virtual-time network simulation primitives for the Trellis harness.
//!
//! Provides one-directional simulated links with configurable latency,
//! bandwidth, queueing and fault injection, a shared rotating loss mask,
//! and the arena-indexed per-path packet queue. Everything here runs on a
//! virtual microsecond clock: no sockets, no threads, no wall time.

pub mod link;
pub mod loss;
pub mod queue;

pub use link::{LinkError, LinkPair, LinkTuning, Payload, SimLink, SubmitOutcome};
pub use loss::{LossMask, SharedLossMask};
pub use queue::{PacketId, PacketRecord, PacketStore, PathQueue, QueueCorruption};

/// Virtual timestamps and durations, in microseconds.
pub type Micros = u64;

/// Sentinel for "never": a link with this `next_send_time` schedules nothing.
pub const NEVER: Micros = u64::MAX;
