use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DiscoveryError;
use crate::keys;
use crate::store::{Precondition, RecordStore, StoreError};
use crate::types::{InstanceRecord, UnixMillis};

/// Periodically writes the local instance's liveness record.
///
/// Every write is a read-modify-write against the shared store with bounded
/// conflict retries. A failed write is not fatal: it is retried on the next
/// cycle, and a missed heartbeat merely brings the instance closer to being
/// classified as timed out by its peers.
pub struct HeartbeatWriter {
    store: Arc<dyn RecordStore>,
    instance_id: String,
    leader_election_id: String,
    runtime_id: String,
    retry_limit: u32,
    has_written: bool,
}

impl HeartbeatWriter {
    /// Creates a writer for the given instance. The runtime id is generated
    /// per process and used to detect duplicate instance ids.
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        instance_id: String,
        leader_election_id: String,
        retry_limit: u32,
    ) -> Self {
        Self {
            store,
            instance_id,
            leader_election_id,
            runtime_id: Uuid::new_v4().to_string(),
            retry_limit,
            has_written: false,
        }
    }

    /// The leader-election id this writer advertises.
    #[must_use]
    pub fn leader_election_id(&self) -> &str {
        &self.leader_election_id
    }

    /// The per-process runtime id.
    #[must_use]
    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// Writes or updates the local instance record with the given timestamp
    /// and properties.
    ///
    /// Safe to call repeatedly: the record is updated in place, never
    /// duplicated. After the first successful write, a record carrying a
    /// foreign runtime id means another live process is heartbeating under
    /// our instance id, which is surfaced as
    /// [`DiscoveryError::DuplicateInstanceId`].
    pub fn issue_heartbeat(
        &mut self,
        now: UnixMillis,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), DiscoveryError> {
        let key = keys::instance_key(&self.instance_id);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let precondition = match keys::read_record::<InstanceRecord>(&*self.store, &key) {
                Ok(None) => Precondition::Absent,
                Ok(Some((existing, version))) => {
                    if self.has_written && existing.runtime_id != self.runtime_id {
                        return Err(DiscoveryError::DuplicateInstanceId {
                            instance_id: self.instance_id.clone(),
                            local_runtime_id: self.runtime_id.clone(),
                            other_runtime_id: existing.runtime_id,
                        });
                    }
                    Precondition::MatchesVersion(version)
                }
                Err(DiscoveryError::Serialization(reason)) => {
                    // Undecodable leftovers are overwritten rather than kept.
                    warn!(%key, %reason, "replacing undecodable instance record");
                    Precondition::Any
                }
                Err(err) => return Err(err),
            };

            let record = InstanceRecord {
                instance_id: self.instance_id.clone(),
                leader_election_id: self.leader_election_id.clone(),
                runtime_id: self.runtime_id.clone(),
                last_heartbeat_at: now,
                properties: properties.clone(),
            };
            match keys::write_record(&*self.store, &key, &record, precondition) {
                Ok(_) => {
                    if !self.has_written {
                        info!(
                            instance_id = %self.instance_id,
                            runtime_id = %self.runtime_id,
                            "first heartbeat written"
                        );
                    }
                    self.has_written = true;
                    debug!(instance_id = %self.instance_id, now, "heartbeat written");
                    return Ok(());
                }
                Err(DiscoveryError::Store(StoreError::Conflict { .. }))
                    if attempts <= self.retry_limit =>
                {
                    debug!(
                        instance_id = %self.instance_id,
                        attempts, "heartbeat write conflicted; re-reading"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Removes the local instance record on clean shutdown. Peers observe
    /// the departure as one more timeout; this only improves promptness.
    pub fn remove_record(&self) -> Result<(), DiscoveryError> {
        self.store
            .remove(&keys::instance_key(&self.instance_id))
            .map_err(DiscoveryError::from)
    }
}

/// Builds the leader-election id for a process started at `started_at`.
///
/// The zero-padded start timestamp sorts earlier-started instances first, so
/// a restarted instance queues behind incumbents instead of immediately
/// reclaiming leadership. Stable for the process lifetime.
#[must_use]
pub fn generate_leader_election_id(started_at: UnixMillis, instance_id: &str) -> String {
    format!("0_{started_at:020}_{instance_id}")
}
