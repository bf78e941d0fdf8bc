use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Milliseconds since the unix epoch.
///
/// The protocol takes `now` as an explicit parameter everywhere so that
/// tests can drive a manual clock; only the runtime loop reads the system
/// clock.
pub type UnixMillis = u64;

/// Liveness record one instance writes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Globally unique, stable identifier for the instance's lifetime.
    pub instance_id: String,
    /// Totally ordered leader tie-break key; lowest wins. Stable while the
    /// process runs, regenerated across restarts.
    pub leader_election_id: String,
    /// Per-process id used to detect two processes sharing one instance id.
    pub runtime_id: String,
    /// Timestamp of the most recent successful heartbeat write.
    pub last_heartbeat_at: UnixMillis,
    /// Opaque instance properties; changes trigger a properties-changed
    /// event without affecting membership.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// One member of an agreed view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMember {
    /// Member instance id.
    pub instance_id: String,
    /// Leader tie-break key captured when the view was voted on.
    pub leader_election_id: String,
    /// Member properties as last observed.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// The agreed view record a winning voting is promoted into.
///
/// Stored at [`crate::keys::ESTABLISHED_KEY`] and replaced wholesale on
/// every promotion; late joiners and re-checking instances converge on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstablishedView {
    /// Identifier of the view, carried over from the winning voting.
    pub view_id: String,
    /// Members of the agreed view, keyed by instance id.
    pub members: BTreeMap<String, ViewMember>,
    /// Leader derived at promotion time, persisted for diagnostics.
    pub leader_id: String,
    /// Instance that performed the promotion.
    pub promoted_by: String,
    /// Promotion timestamp.
    pub promoted_at: UnixMillis,
}

impl EstablishedView {
    /// Member ids of the agreed view.
    #[must_use]
    pub fn member_ids(&self) -> BTreeSet<String> {
        self.members.keys().cloned().collect()
    }
}

/// The agreed topology as last computed by one instance.
///
/// Replaced wholesale on every accepted transition, never partially
/// mutated. `leader_instance_id` is derived, never stored: two instances
/// that agree on `members` always agree on the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterView {
    /// Identifier of the agreed view this snapshot was built from.
    pub view_id: String,
    /// Member snapshots keyed by instance id.
    pub members: BTreeMap<String, ViewMember>,
    /// Which member is "self".
    pub local_instance_id: String,
    /// Whether this instance still considers itself part of this view.
    /// `false` while isolated, partitioned or mid-transition.
    pub is_current: bool,
}

impl ClusterView {
    /// The member with the lowest `(leader_election_id, instance_id)` pair.
    ///
    /// A pure function of `members`: recomputing it from the same set always
    /// yields the same result, on every instance.
    #[must_use]
    pub fn leader_instance_id(&self) -> Option<&str> {
        leader_of(&self.members).map(|member| member.instance_id.as_str())
    }

    /// True when the given instance is a member of this view.
    #[must_use]
    pub fn contains(&self, instance_id: &str) -> bool {
        self.members.contains_key(instance_id)
    }

    /// Member ids of this view.
    #[must_use]
    pub fn member_ids(&self) -> BTreeSet<String> {
        self.members.keys().cloned().collect()
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when the view has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Deterministic leader selection: lowest leader-election id, instance id
/// as the final tie-break.
#[must_use]
pub fn leader_of(members: &BTreeMap<String, ViewMember>) -> Option<&ViewMember> {
    members.values().min_by(|a, b| {
        a.leader_election_id
            .cmp(&b.leader_election_id)
            .then_with(|| a.instance_id.cmp(&b.instance_id))
    })
}

/// Kind of topology transition delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyEventType {
    /// First agreed view observed by this instance.
    Init,
    /// The current view can no longer be trusted; a new agreement is pending.
    Changing,
    /// Membership is unchanged but member properties differ.
    PropertiesChanged,
    /// A new view has been agreed and is now the baseline.
    Changed,
}

/// Immutable topology notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyEvent {
    /// Transition kind.
    pub event_type: TopologyEventType,
    /// Previous view; `None` for [`TopologyEventType::Init`].
    pub old_view: Option<ClusterView>,
    /// New view; `None` for [`TopologyEventType::Changing`].
    pub new_view: Option<ClusterView>,
}

impl TopologyEvent {
    pub(crate) fn init(new_view: ClusterView) -> Self {
        Self {
            event_type: TopologyEventType::Init,
            old_view: None,
            new_view: Some(new_view),
        }
    }

    pub(crate) fn changing(old_view: ClusterView) -> Self {
        Self {
            event_type: TopologyEventType::Changing,
            old_view: Some(old_view),
            new_view: None,
        }
    }

    pub(crate) fn properties_changed(old_view: ClusterView, new_view: ClusterView) -> Self {
        Self {
            event_type: TopologyEventType::PropertiesChanged,
            old_view: Some(old_view),
            new_view: Some(new_view),
        }
    }

    pub(crate) fn changed(old_view: Option<ClusterView>, new_view: ClusterView) -> Self {
        Self {
            event_type: TopologyEventType::Changed,
            old_view,
            new_view: Some(new_view),
        }
    }
}
