//! Harness error taxonomy.
//!
//! Every failure is terminal for its scenario — nothing here is retried.
//! The variants separate the five failure classes a scenario can hit, so a
//! failing test names what went wrong without log spelunking.

use thiserror::Error;

use crate::endpoint::VariantFlags;
use crate::poller::WaitError;
use trellis_netsim::QueueCorruption;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Invalid scenario/variant combination or link setup failure.
    #[error("scenario configuration invalid: {0}")]
    Config(String),

    /// The capability variant requested was not reflected in both
    /// endpoints' negotiated flags.
    #[error("capability negotiation mismatch (client={client:?}, server={server:?})")]
    NegotiationMismatch {
        client: VariantFlags,
        server: VariantFlags,
    },

    /// A convergence wait exhausted one of its bounds.
    #[error("waiting for {condition} failed: {source}")]
    Convergence {
        condition: &'static str,
        #[source]
        source: WaitError,
    },

    /// The scenario completed but a terminal invariant did not hold.
    #[error("postcondition {check} failed: expected {expected}, got {actual}")]
    Postcondition {
        check: &'static str,
        expected: String,
        actual: String,
    },

    /// Packet queue structure is corrupt. Always a logic bug.
    #[error("packet queue corrupted: {0}")]
    Queue(#[from] QueueCorruption),

    /// Log file handling or reference comparison failed.
    #[error("path event log: {0}")]
    PathLog(#[from] anyhow::Error),
}

impl HarnessError {
    pub(crate) fn postcondition(
        check: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        HarnessError::Postcondition {
            check,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
