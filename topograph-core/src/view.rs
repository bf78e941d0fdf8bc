use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::DiscoveryError;
use crate::keys::{self, INSTANCES_PREFIX};
use crate::store::RecordStore;
use crate::types::{InstanceRecord, UnixMillis};

/// Result of one classification pass over the instance records.
#[derive(Debug, Clone)]
pub struct LiveView {
    /// Instances whose heartbeat is within the timeout window.
    pub live: BTreeMap<String, InstanceRecord>,
    /// Instances whose heartbeat has timed out.
    pub timed_out: BTreeSet<String>,
}

impl LiveView {
    /// Member ids of the live set.
    #[must_use]
    pub fn member_ids(&self) -> BTreeSet<String> {
        self.live.keys().cloned().collect()
    }
}

/// Classifies instance records as alive or timed out.
///
/// Classification is local and asymmetric: each instance runs it
/// independently against the same shared records, so two instances may
/// momentarily disagree about a peer near the timeout boundary. The voting
/// step exists precisely to converge those candidate views without
/// synchronized clocks.
pub struct ViewChecker {
    store: Arc<dyn RecordStore>,
    heartbeat_timeout_ms: u64,
    stale_after_ms: u64,
}

impl ViewChecker {
    /// Creates a checker. `stale_after_ms` of zero disables removal of
    /// long-dead instance records.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, heartbeat_timeout_ms: u64, stale_after_ms: u64) -> Self {
        Self {
            store,
            heartbeat_timeout_ms,
            stale_after_ms,
        }
    }

    /// Enumerates all instance records and classifies each against `now`.
    ///
    /// Records that have been dead for several timeout windows are removed
    /// from the store; an instance that returns simply recreates its record
    /// on its next heartbeat.
    pub fn determine_live_instances(&self, now: UnixMillis) -> Result<LiveView, DiscoveryError> {
        let children = self.store.list_children(INSTANCES_PREFIX)?;
        let mut live = BTreeMap::new();
        let mut timed_out = BTreeSet::new();

        for (key, versioned) in children {
            let record: InstanceRecord = match serde_json::from_value(versioned.value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(%key, %err, "skipping undecodable instance record");
                    continue;
                }
            };
            let age = now.saturating_sub(record.last_heartbeat_at);
            if age < self.heartbeat_timeout_ms {
                live.insert(record.instance_id.clone(), record);
            } else {
                debug!(
                    instance_id = %record.instance_id,
                    age_ms = age,
                    "instance heartbeat timed out"
                );
                if self.stale_after_ms > 0 && age >= self.stale_after_ms {
                    info!(instance_id = %record.instance_id, "removing stale instance record");
                    if let Err(err) = self.store.remove(&key) {
                        warn!(%key, %err, "failed to remove stale instance record");
                    }
                }
                timed_out.insert(record.instance_id);
            }
        }

        Ok(LiveView { live, timed_out })
    }
}
