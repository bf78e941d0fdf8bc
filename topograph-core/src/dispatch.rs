use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace};

use crate::types::{ClusterView, TopologyEvent, TopologyEventType};

/// Receives topology events in strict per-listener order.
///
/// Implemented for any `Fn(&TopologyEvent) + Send + Sync` closure.
pub trait TopologyListener: Send + Sync {
    /// Handles one topology event.
    fn handle_topology_event(&self, event: &TopologyEvent);
}

impl<F> TopologyListener for F
where
    F: Fn(&TopologyEvent) + Send + Sync,
{
    fn handle_topology_event(&self, event: &TopologyEvent) {
        self(event);
    }
}

/// Handle returned by listener registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    listener: Arc<dyn TopologyListener>,
    /// False until the listener has received its `Init`; a listener
    /// registered mid-transition is held back and initialized when the
    /// topology settles.
    initialized: bool,
    last_event: Option<TopologyEventType>,
}

/// Delivers topology events to registered listeners.
///
/// Per-listener ordering is guaranteed by a delivery lock held across the
/// computation and invocation of one batch; the registry lock is released
/// before callbacks run, so listeners may register or remove listeners and
/// query the service from inside a callback.
#[derive(Default)]
pub struct EventDispatcher {
    entries: Mutex<Registry>,
    delivery: ReentrantMutex<()>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: BTreeMap<u64, ListenerEntry>,
}

impl EventDispatcher {
    /// Creates a dispatcher with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    ///
    /// When a settled current view exists, the listener immediately receives
    /// `Init` carrying it; otherwise `Init` is delivered once the topology
    /// settles.
    pub fn add_listener(
        &self,
        listener: Arc<dyn TopologyListener>,
        current: Option<ClusterView>,
    ) -> ListenerId {
        let _delivery = self.delivery.lock();
        let initial = current.filter(|view| view.is_current);
        let id = {
            let mut registry = self.entries.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.insert(
                id,
                ListenerEntry {
                    listener: Arc::clone(&listener),
                    initialized: initial.is_some(),
                    last_event: initial.is_some().then_some(TopologyEventType::Init),
                },
            );
            id
        };
        if let Some(view) = initial {
            debug!(listener = id, "delivering init to late-registered listener");
            listener.handle_topology_event(&TopologyEvent::init(view));
        }
        ListenerId(id)
    }

    /// Removes a listener; a no-op for unknown ids.
    pub fn remove_listener(&self, id: ListenerId) {
        self.entries.lock().listeners.remove(&id.0);
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.entries.lock().listeners.len()
    }

    /// Delivers a batch of events, preserving per-listener ordering.
    ///
    /// Uninitialized listeners skip `Changing` and property deltas and
    /// receive a synthesized `Init` in place of the `Changed` that settles
    /// the topology. Repeated `Changing` to one listener is suppressed.
    pub fn dispatch(&self, events: &[TopologyEvent]) {
        if events.is_empty() {
            return;
        }
        let _delivery = self.delivery.lock();
        for event in events {
            let deliveries = self.plan_deliveries(event);
            for (id, listener, event) in deliveries {
                trace!(listener = id, kind = ?event.event_type, "delivering topology event");
                listener.handle_topology_event(&event);
            }
        }
    }

    fn plan_deliveries(
        &self,
        event: &TopologyEvent,
    ) -> Vec<(u64, Arc<dyn TopologyListener>, TopologyEvent)> {
        let mut registry = self.entries.lock();
        let mut deliveries = Vec::new();
        for (id, entry) in &mut registry.listeners {
            let outgoing = match event.event_type {
                TopologyEventType::Init => {
                    if entry.initialized {
                        continue;
                    }
                    entry.initialized = true;
                    event.clone()
                }
                TopologyEventType::Changing => {
                    if !entry.initialized || entry.last_event == Some(TopologyEventType::Changing) {
                        continue;
                    }
                    event.clone()
                }
                TopologyEventType::PropertiesChanged => {
                    if !entry.initialized {
                        continue;
                    }
                    event.clone()
                }
                TopologyEventType::Changed => {
                    if entry.initialized {
                        event.clone()
                    } else {
                        // First contact for this listener: the settling view
                        // arrives as its Init baseline.
                        entry.initialized = true;
                        match &event.new_view {
                            Some(view) => TopologyEvent::init(view.clone()),
                            None => continue,
                        }
                    }
                }
            };
            entry.last_event = Some(outgoing.event_type);
            deliveries.push((*id, Arc::clone(&entry.listener), outgoing));
        }
        deliveries
    }
}
