use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::types::{ClusterView, TopologyEvent, UnixMillis, ViewMember};

/// Event-sequencing state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequencerState {
    /// No view accepted yet; the first one emits `Init`.
    Uninitialized,
    /// The held view is trusted.
    Current,
    /// A disagreement was detected; `Changing` has been announced and the
    /// resolving `Changed` is pending.
    Changing,
}

/// Converts view-check and voting outcomes into a well-formed event stream.
///
/// Guarantees, per instance: exactly one `Init` before anything else, at
/// most one `Changing` per disagreement episode, and every `Changing`
/// resolved by exactly one `Changed`. Settled events are spaced at least
/// `min_event_delay` apart; a view arriving earlier is held, and newer
/// pending views replace older ones so rapid flapping collapses into one
/// transition.
pub struct TopologyViewManager {
    local_instance_id: String,
    min_event_delay_ms: u64,
    state: SequencerState,
    current: Option<ClusterView>,
    pending: Option<ClusterView>,
    last_settled_at: UnixMillis,
}

impl TopologyViewManager {
    /// Creates an uninitialized manager for the given instance.
    #[must_use]
    pub fn new(local_instance_id: String, min_event_delay_ms: u64) -> Self {
        Self {
            local_instance_id,
            min_event_delay_ms,
            state: SequencerState::Uninitialized,
            current: None,
            pending: None,
            last_settled_at: 0,
        }
    }

    /// The last agreed view, if any. Its `is_current` flag is `false` while
    /// a transition is in flight.
    #[must_use]
    pub fn current_view(&self) -> Option<&ClusterView> {
        self.current.as_ref()
    }

    /// True while a `Changing` awaits its resolving `Changed`.
    #[must_use]
    pub fn is_changing(&self) -> bool {
        self.state == SequencerState::Changing
    }

    /// Marks the held view as no longer trustworthy.
    ///
    /// Emits `Changing` on the first call of a disagreement episode and
    /// nothing on repeats; listeners are warned once, promptly, before
    /// voting completes.
    pub fn handle_changing(&mut self, _now: UnixMillis) -> Option<TopologyEvent> {
        if self.state != SequencerState::Current {
            return None;
        }
        self.state = SequencerState::Changing;
        if let Some(current) = self.current.as_mut() {
            current.is_current = false;
            info!(view_id = %current.view_id, "topology changing");
            return Some(TopologyEvent::changing(current.clone()));
        }
        None
    }

    /// Accepts a newly agreed view and returns the events it produces.
    pub fn handle_new_view(
        &mut self,
        view_id: String,
        members: BTreeMap<String, ViewMember>,
        now: UnixMillis,
    ) -> Vec<TopologyEvent> {
        let new_view = ClusterView {
            view_id,
            members,
            local_instance_id: self.local_instance_id.clone(),
            is_current: true,
        };

        match self.state {
            SequencerState::Uninitialized => {
                info!(view_id = %new_view.view_id, members = new_view.len(), "topology initialized");
                self.state = SequencerState::Current;
                self.current = Some(new_view.clone());
                self.last_settled_at = now;
                vec![TopologyEvent::init(new_view)]
            }
            SequencerState::Current => {
                let Some(current) = self.current.as_ref() else {
                    // Current state always holds a view; recover by settling.
                    return vec![self.settle(new_view, now)];
                };
                if current.members == new_view.members {
                    if current.view_id != new_view.view_id {
                        // Same membership re-promoted under a new id; adopt
                        // silently.
                        self.current = Some(new_view);
                    }
                    return Vec::new();
                }
                if current.member_ids() == new_view.member_ids() {
                    let old_view = current.clone();
                    debug!(view_id = %new_view.view_id, "member properties changed");
                    self.current = Some(new_view.clone());
                    return vec![TopologyEvent::properties_changed(old_view, new_view)];
                }
                // Membership differs: warn first, then settle or hold.
                let mut events = Vec::new();
                if let Some(changing) = self.handle_changing(now) {
                    events.push(changing);
                }
                if self.delay_elapsed(now) {
                    events.push(self.settle(new_view, now));
                } else {
                    self.pending = Some(new_view);
                }
                events
            }
            SequencerState::Changing => {
                if self.delay_elapsed(now) {
                    vec![self.settle(new_view, now)]
                } else {
                    self.pending = Some(new_view);
                    Vec::new()
                }
            }
        }
    }

    /// Releases a held view once the minimum event spacing has elapsed.
    pub fn poll_pending(&mut self, now: UnixMillis) -> Option<TopologyEvent> {
        if self.state == SequencerState::Changing && self.pending.is_some() && self.delay_elapsed(now)
        {
            let pending = self.pending.take()?;
            return Some(self.settle(pending, now));
        }
        None
    }

    fn delay_elapsed(&self, now: UnixMillis) -> bool {
        self.min_event_delay_ms == 0
            || now.saturating_sub(self.last_settled_at) >= self.min_event_delay_ms
    }

    fn settle(&mut self, new_view: ClusterView, now: UnixMillis) -> TopologyEvent {
        let old_view = self.current.take().map(|mut view| {
            view.is_current = false;
            view
        });
        info!(
            view_id = %new_view.view_id,
            members = new_view.len(),
            leader = new_view.leader_instance_id().unwrap_or("-"),
            "topology changed"
        );
        self.state = SequencerState::Current;
        self.current = Some(new_view.clone());
        self.pending = None;
        self.last_settled_at = now;
        TopologyEvent::changed(old_view, new_view)
    }
}
