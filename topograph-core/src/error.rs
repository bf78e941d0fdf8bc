use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by the discovery protocol.
///
/// Only [`DiscoveryError::Configuration`] is fatal, and only at startup.
/// Everything else is recovered locally by retrying on the next scheduled
/// tick; a prolonged `is_current = false` view is the externally visible
/// failure signal, not an error value.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Underlying record-store failure (conflict or unavailability).
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
    /// Invalid configuration detected at startup.
    #[error("discovery configuration error: {0}")]
    Configuration(String),
    /// Another live process is writing heartbeats under our instance id.
    #[error(
        "duplicate instance id {instance_id}: record owned by runtime {other_runtime_id}, local runtime is {local_runtime_id}"
    )]
    DuplicateInstanceId {
        /// The contested instance identifier.
        instance_id: String,
        /// Runtime id of the local process.
        local_runtime_id: String,
        /// Runtime id found in the store record.
        other_runtime_id: String,
    },
    /// A record failed to encode or decode.
    #[error("record serialization error: {0}")]
    Serialization(String),
}

impl DiscoveryError {
    /// True when the error indicates an optimistic-concurrency conflict that
    /// the next cycle will resolve by re-reading.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::Conflict { .. }))
    }
}
