//! Store key layout and typed record access helpers.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DiscoveryError;
use crate::store::{Precondition, RecordStore};

/// Prefix under which per-instance heartbeat records live.
pub const INSTANCES_PREFIX: &str = "instances/";
/// Prefix under which open voting records live.
pub const VOTINGS_PREFIX: &str = "votings/";
/// Key of the agreed (established) view record.
pub const ESTABLISHED_KEY: &str = "established/current";

/// Store key of an instance's heartbeat record.
#[must_use]
pub fn instance_key(instance_id: &str) -> String {
    format!("{INSTANCES_PREFIX}{instance_id}")
}

/// Store key of a voting record.
#[must_use]
pub fn voting_key(voting_id: &str) -> String {
    format!("{VOTINGS_PREFIX}{voting_id}")
}

/// Reads and decodes a typed record, returning its store version alongside.
pub fn read_record<T: DeserializeOwned>(
    store: &dyn RecordStore,
    key: &str,
) -> Result<Option<(T, u64)>, DiscoveryError> {
    match store.get(key)? {
        None => Ok(None),
        Some(versioned) => {
            let record = serde_json::from_value(versioned.value).map_err(|err| {
                DiscoveryError::Serialization(format!("cannot decode record {key}: {err}"))
            })?;
            Ok(Some((record, versioned.version)))
        }
    }
}

/// Encodes and writes a typed record under the given precondition.
pub fn write_record<T: Serialize>(
    store: &dyn RecordStore,
    key: &str,
    record: &T,
    precondition: Precondition,
) -> Result<u64, DiscoveryError> {
    let value = serde_json::to_value(record).map_err(|err| {
        DiscoveryError::Serialization(format!("cannot encode record {key}: {err}"))
    })?;
    Ok(store.put(key, value, precondition)?)
}
