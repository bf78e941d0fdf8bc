//! Heartbeat-based cluster topology discovery with deterministic leader
//! election.
//!
//! Cooperating process instances periodically write liveness records into a
//! shared [`store::RecordStore`], classify each other as alive or timed out,
//! and run voting rounds to converge their locally computed candidate views
//! into one agreed [`types::ClusterView`]. The member with the lowest
//! leader-election id leads. Listeners observe a well-formed event sequence:
//! one `Init`, then `Changing`/`Changed` pairs around every transition, with
//! property-only deltas announced as `PropertiesChanged`.
//!
//! The store is the only cross-instance channel; there is no transport or
//! cross-instance lock. Everything time-dependent takes `now` as a
//! parameter, so tests drive the whole protocol with a manual clock.

#![warn(
    missing_docs,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]

/// Protocol tuning knobs and startup validation.
pub mod config;
/// Listener registry and ordered event delivery.
pub mod dispatch;
/// Error taxonomy surfaced by the protocol.
pub mod error;
/// Liveness-record writer with duplicate-instance detection.
pub mod heartbeat;
/// Store key layout and typed record access helpers.
pub mod keys;
/// Service wiring and the periodic runtime loops.
pub mod service;
/// Shared record-store boundary and the in-memory implementation.
pub mod store;
/// Topology event sequencing state machine.
pub mod topology;
/// Shared data model: records, views, events.
pub mod types;
/// Alive/timed-out classification of instance records.
pub mod view;
/// Voting rounds and the agreement state machine.
pub mod voting;

pub use config::DiscoveryConfig;
pub use dispatch::{EventDispatcher, ListenerId, TopologyListener};
pub use error::DiscoveryError;
pub use heartbeat::{HeartbeatWriter, generate_leader_election_id};
pub use service::{DiscoveryHandle, DiscoveryRuntime, DiscoveryService, unix_now};
pub use store::{MemoryStore, Precondition, RecordStore, StoreError, Versioned};
pub use topology::TopologyViewManager;
pub use types::{
    ClusterView, EstablishedView, InstanceRecord, TopologyEvent, TopologyEventType, UnixMillis,
    ViewMember,
};
pub use view::{LiveView, ViewChecker};
pub use voting::{MemberVote, VotingCoordinator, VotingRecord};
