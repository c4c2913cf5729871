//! The collaborator surface the harness consumes.
//!
//! The harness never implements a transport; it reads connection/path
//! state through these types and drives the mutating entry points exposed
//! by [`crate::model::ModelEndpoint`]. Anything a scenario inspects or
//! pokes must appear here — nothing else of the transport is visible.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use trellis_netsim::Micros;

/// Connection lifecycle state, as far as the harness cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Established and usable.
    Ready,
    /// Terminated.
    Closed,
}

/// Which endpoint of the connection, also used to index per-endpoint stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Client = 0,
    Server = 1,
}

impl Role {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Multipath capability flags, as negotiated during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantFlags {
    /// Per-path packet numbering keyed by connection ID.
    pub multipath: bool,
    /// Single shared numbering space.
    pub simple_multipath: bool,
    /// Explicit unique path identifiers.
    pub unique_path_id: bool,
}

impl VariantFlags {
    /// Every flavor enabled, the well-provisioned server default.
    pub const fn all() -> VariantFlags {
        VariantFlags {
            multipath: true,
            simple_multipath: true,
            unique_path_id: true,
        }
    }

    /// Element-wise intersection — what both sides support.
    pub fn intersect(self, other: VariantFlags) -> VariantFlags {
        VariantFlags {
            multipath: self.multipath && other.multipath,
            simple_multipath: self.simple_multipath && other.simple_multipath,
            unique_path_id: self.unique_path_id && other.unique_path_id,
        }
    }

    /// Whether any multipath flavor was negotiated. When false, probing a
    /// new path means migration, not an additional path.
    pub fn any(self) -> bool {
        self.multipath || self.simple_multipath || self.unique_path_id
    }
}

/// A path's (source, destination) address pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTuple {
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

/// Scheduling status a peer can request for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathStatus {
    Available,
    Standby,
}

/// Read-only view of one path, captured for postcondition checks and error
/// snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSnapshot {
    pub addrs: AddressTuple,
    pub challenge_verified: bool,
    pub is_standby: bool,
    /// Bytes of stream data sent and acknowledged on this path.
    pub delivered: u64,
    pub unique_path_id: u64,
    pub local_cid_sequence: u64,
    pub remote_cid_sequence: u64,
}

/// Seam to the external event stepper: advances the virtual clock by
/// processing the next due event, reporting whether anything was actually
/// delivered or produced.
pub trait Stepper {
    /// Current virtual time.
    fn now(&self) -> Micros;

    /// Process the next due event, but never advance past `step_limit`.
    /// Returns true when the step delivered or produced something.
    fn step(&mut self, step_limit: Micros) -> Result<bool, StepError>;
}

/// An event-stepper failure, fatal to the scenario.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("event stepper failed: {0}")]
pub struct StepError(pub String);
