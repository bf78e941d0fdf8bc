use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use thiserror::Error;

/// Errors raised by a [`RecordStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write precondition did not hold; the caller should re-read and retry.
    #[error("conflicting update for record {key}")]
    Conflict {
        /// Key of the contested record.
        key: String,
    },
    /// The store could not be reached; the caller retries on a later tick.
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Version precondition attached to a [`RecordStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// The record must not exist yet.
    Absent,
    /// The record must currently be at exactly this version.
    MatchesVersion(u64),
    /// Unconditional write.
    Any,
}

/// A record value together with the store version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    /// Opaque record payload.
    pub value: Value,
    /// Monotonically increasing per-key version counter.
    pub version: u64,
}

/// Key-addressed record storage shared by every instance of the cluster.
///
/// This is the sole cross-instance coordination channel: heartbeat, voting
/// and established-view records all live here. Implementations must provide
/// read-your-writes consistency and per-key optimistic concurrency: a `put`
/// whose precondition no longer holds fails with [`StoreError::Conflict`]
/// and the caller re-reads. No structure beyond key-prefix enumeration is
/// assumed.
pub trait RecordStore: Send + Sync {
    /// Writes a record, returning the new version on success.
    fn put(&self, key: &str, value: Value, precondition: Precondition) -> Result<u64, StoreError>;

    /// Reads a record, or `None` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Enumerates all records whose key starts with `prefix`, sorted by key.
    fn list_children(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError>;

    /// Removes a record. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory [`RecordStore`] with per-key version counters.
///
/// Backs the integration tests and embedded single-process deployments.
/// [`MemoryStore::set_unavailable`] simulates a store outage: every
/// operation fails until the flag is cleared, which is how tests exercise
/// the transient-failure recovery paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, Versioned>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles simulated unavailability.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Number of records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(StoreError::Unavailable(
                "store marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl RecordStore for MemoryStore {
    fn put(&self, key: &str, value: Value, precondition: Precondition) -> Result<u64, StoreError> {
        self.ensure_available()?;
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().version;
                match precondition {
                    Precondition::Absent => Err(StoreError::Conflict {
                        key: key.to_string(),
                    }),
                    Precondition::MatchesVersion(expected) if expected != current => {
                        Err(StoreError::Conflict {
                            key: key.to_string(),
                        })
                    }
                    Precondition::MatchesVersion(_) | Precondition::Any => {
                        let next = current + 1;
                        occupied.insert(Versioned {
                            value,
                            version: next,
                        });
                        Ok(next)
                    }
                }
            }
            Entry::Vacant(vacant) => match precondition {
                Precondition::MatchesVersion(_) => Err(StoreError::Conflict {
                    key: key.to_string(),
                }),
                Precondition::Absent | Precondition::Any => {
                    vacant.insert(Versioned { value, version: 1 });
                    Ok(1)
                }
            },
        }
    }

    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.ensure_available()?;
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    fn list_children(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        self.ensure_available()?;
        let mut children: Vec<_> = self
            .records
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(children)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.records.remove(key);
        Ok(())
    }
}
