//! Errors surfaced to the controller harness.
//!
//! Only failures the work queue should retry become an [`Error`]; generation
//! and validation failures are folded into the parent conditions instead and
//! requeued on a fixed back-off.

use crate::store::StoreError;
use thiserror::Error;

/// Hard reconciliation failures
#[derive(Debug, Error)]
pub enum Error {
    /// A read or write against the object store failed past its retry budget
    #[error("object store error: {0}")]
    Store(#[from] StoreError),

    /// An object lacked a metadata field the reconciler depends on
    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),

    /// A desired child collides with a live object controlled by someone else
    #[error("application {0} is already controlled by another owner")]
    ForeignOwner(String),

    /// Acknowledging a requested refresh failed
    #[error("failed to clear the refresh annotation: {0}")]
    RefreshAnnotation(#[source] StoreError),

    /// An ordered teardown stopped making progress
    #[error("application {name} has been terminating for {elapsed_seconds}s without being removed")]
    TeardownStalled {
        /// Child application that is stuck
        name: String,
        /// How long it has carried a deletion timestamp
        elapsed_seconds: i64,
    },

    /// A panic was caught at the reconciler boundary
    #[error("reconciler panicked: {0}")]
    Panicked(String),
}

/// Convenience alias over [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;
