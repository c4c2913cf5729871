//! Deterministic scenario harness for multipath transport connections.
//!
//! Drives a connection through scripted network conditions — latency and
//! bandwidth changes, loss, link failure, address change, MTU shrink — on
//! simulated links, and polls connection/path state under strict
//! time/trial/inactivity bounds until each scenario's target condition is
//! reached or definitively failed.
//!
//! The transport itself is a collaborator, consumed through the surface in
//! [`endpoint`]; [`model`] ships the deterministic reference implementation
//! of that surface the scenarios run against.

pub mod datagram;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod model;
pub mod pathlog;
pub mod poller;
pub mod verify;

pub use driver::{
    run_migration, run_scenario, MigrationConfig, MigrationReport, PathIdVariant, ScenarioConfig,
    ScenarioKind, ScenarioReport,
};
pub use error::HarnessError;
pub use poller::{PollBounds, WaitError};
