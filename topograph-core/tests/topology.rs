#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

//! Multi-instance protocol scenarios driven over one shared in-memory store
//! with a manual clock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use topograph_core::{
    DiscoveryConfig, DiscoveryError, DiscoveryService, MemoryStore, RecordStore, TopologyEvent,
    TopologyEventType,
};

const BASE: u64 = 1_700_000_000_000;
const CYCLE_MS: u64 = 1_000;

fn test_config(idx: usize) -> DiscoveryConfig {
    DiscoveryConfig {
        instance_id: format!("node-{idx}"),
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_secs(3),
        check_interval: Duration::from_secs(1),
        min_event_delay: Duration::ZERO,
        voting_stability_window: Duration::from_secs(1),
        store_retry_limit: 3,
        stale_instance_multiplier: 0,
    }
}

struct Cluster {
    store: Arc<MemoryStore>,
    services: Vec<Arc<DiscoveryService>>,
    now: u64,
}

impl Cluster {
    fn new(count: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let services = (0..count)
            .map(|idx| {
                DiscoveryService::new(
                    test_config(idx),
                    Arc::clone(&store) as Arc<dyn RecordStore>,
                    BASE + idx as u64,
                )
                .unwrap()
            })
            .collect();
        Self {
            store,
            services,
            now: BASE,
        }
    }

    fn run_cycles(&mut self, cycles: usize) {
        self.run_cycles_pausing(cycles, &[]);
    }

    /// Advances the clock one cycle at a time, running every instance except
    /// the paused ones (a paused instance neither heartbeats nor checks).
    fn run_cycles_pausing(&mut self, cycles: usize, paused: &[usize]) {
        for _ in 0..cycles {
            self.now += CYCLE_MS;
            for (idx, service) in self.services.iter().enumerate() {
                if paused.contains(&idx) {
                    continue;
                }
                let _ = service.run_cycle(self.now);
            }
        }
    }
}

fn record_events(service: &DiscoveryService) -> Arc<Mutex<Vec<TopologyEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    service.add_topology_listener(Arc::new(move |event: &TopologyEvent| {
        sink.lock().push(event.clone());
    }));
    events
}

fn kinds(events: &[TopologyEvent]) -> Vec<TopologyEventType> {
    events.iter().map(|event| event.event_type).collect()
}

/// Asserts the per-listener delivery contract: exactly one leading `Init`,
/// every `Changing` resolved by exactly one `Changed`, never two `Changed`
/// without an intervening `Changing`.
fn assert_well_formed(kinds: &[TopologyEventType]) {
    assert!(!kinds.is_empty(), "listener saw no events");
    assert_eq!(kinds[0], TopologyEventType::Init, "first event must be Init");
    assert_eq!(
        kinds
            .iter()
            .filter(|kind| **kind == TopologyEventType::Init)
            .count(),
        1,
        "Init must be delivered exactly once"
    );
    let mut changing_open = false;
    for kind in &kinds[1..] {
        match kind {
            TopologyEventType::Init => unreachable!("counted above"),
            TopologyEventType::Changing => {
                assert!(!changing_open, "Changing delivered twice without Changed");
                changing_open = true;
            }
            TopologyEventType::Changed => {
                assert!(changing_open, "Changed without a preceding Changing");
                changing_open = false;
            }
            TopologyEventType::PropertiesChanged => {}
        }
    }
}

#[test]
fn all_instances_converge_on_one_view_and_leader() {
    let mut cluster = Cluster::new(3);
    cluster.run_cycles(6);

    let views: Vec<_> = cluster
        .services
        .iter()
        .map(|service| service.get_current_view().expect("converged view"))
        .collect();
    for view in &views {
        assert!(view.is_current);
        assert_eq!(view.len(), 3);
        assert_eq!(view.leader_instance_id(), Some("node-0"));
        assert_eq!(view.view_id, views[0].view_id);
    }
}

#[test]
fn leader_is_a_pure_function_of_the_member_set() {
    let mut cluster = Cluster::new(3);
    cluster.run_cycles(6);

    let view = cluster.services[1].get_current_view().unwrap();
    let first = view.leader_instance_id().map(str::to_string);
    for _ in 0..10 {
        assert_eq!(view.leader_instance_id().map(str::to_string), first);
    }
}

#[test]
fn a_silent_instance_is_excluded_and_sees_itself_stale() {
    let mut cluster = Cluster::new(3);
    cluster.run_cycles(6);

    // node-2 stops heartbeating; the others keep running past the timeout.
    cluster.run_cycles_pausing(8, &[2]);

    for idx in [0, 1] {
        let view = cluster.services[idx].get_current_view().unwrap();
        assert!(view.is_current, "peer {idx} should settle on the new view");
        assert_eq!(view.len(), 2);
        assert!(!view.contains("node-2"));
    }

    // The silent instance's own next check marks its view stale.
    cluster.services[2].check_view(cluster.now).unwrap();
    let view = cluster.services[2].get_current_view().unwrap();
    assert!(!view.is_current);
}

#[test]
fn at_most_one_open_voting_for_a_stable_candidate_set() {
    let mut cluster = Cluster::new(3);
    for _ in 0..10 {
        cluster.now += CYCLE_MS;
        for service in &cluster.services {
            let _ = service.run_cycle(cluster.now);
            let open: Vec<_> = service
                .list_open_votings()
                .unwrap()
                .into_iter()
                .filter(|voting| !voting.is_winning())
                .collect();
            assert!(
                open.len() <= 1,
                "multiple non-winning votings for one stable set: {open:?}"
            );
        }
    }
    assert!(cluster.services[0].get_current_view().unwrap().is_current);
}

#[test]
fn rejoining_lowest_election_id_regains_leadership() {
    let mut cluster = Cluster::new(5);
    cluster.run_cycles(6);
    let events = record_events(&cluster.services[1]);
    assert_eq!(
        cluster.services[0]
            .get_current_view()
            .unwrap()
            .leader_instance_id(),
        Some("node-0")
    );

    // The leader goes silent; the remaining four converge without it.
    cluster.run_cycles_pausing(10, &[0]);
    for idx in 1..5 {
        let view = cluster.services[idx].get_current_view().unwrap();
        assert_eq!(view.len(), 4);
        assert_eq!(view.leader_instance_id(), Some("node-1"));
    }

    // It resumes heartbeating; all five reconverge with it leading again.
    cluster.run_cycles(10);
    for service in &cluster.services {
        let view = service.get_current_view().unwrap();
        assert!(view.is_current);
        assert_eq!(view.len(), 5);
        assert_eq!(view.leader_instance_id(), Some("node-0"));
    }

    assert_well_formed(&kinds(&events.lock()));
}

#[test]
fn listeners_observe_a_well_formed_event_sequence() {
    let mut cluster = Cluster::new(3);
    let events = record_events(&cluster.services[0]);

    cluster.run_cycles(6);
    cluster.run_cycles_pausing(8, &[2]);
    cluster.run_cycles(8);

    let observed = kinds(&events.lock());
    assert_well_formed(&observed);
    // The scenario contains at least one full transition after Init.
    assert!(observed.contains(&TopologyEventType::Changing));
    assert!(observed.contains(&TopologyEventType::Changed));
}

#[test]
fn listener_registered_after_convergence_receives_init() {
    let mut cluster = Cluster::new(2);
    cluster.run_cycles(6);

    let events = record_events(&cluster.services[0]);
    let observed = events.lock();
    assert_eq!(kinds(&observed), vec![TopologyEventType::Init]);
    assert_eq!(observed[0].new_view.as_ref().unwrap().len(), 2);
}

#[test]
fn property_updates_are_announced_without_revoting() {
    let mut cluster = Cluster::new(3);
    cluster.run_cycles(6);
    let events = record_events(&cluster.services[0]);

    cluster.services[1].set_local_property("zone", "eu-west");
    cluster.run_cycles(3);

    let observed = kinds(&events.lock());
    assert!(observed.contains(&TopologyEventType::PropertiesChanged));
    assert!(!observed.contains(&TopologyEventType::Changing));

    let view = cluster.services[0].get_current_view().unwrap();
    assert!(view.is_current);
    assert_eq!(
        view.members.get("node-1").unwrap().properties.get("zone"),
        Some(&"eu-west".to_string())
    );
}

#[test]
fn repeated_heartbeats_keep_a_single_record() {
    let cluster = Cluster::new(1);
    let service = &cluster.services[0];
    service.issue_heartbeat(BASE + 10).unwrap();
    service.issue_heartbeat(BASE + 11).unwrap();

    let records = cluster.store.list_children("instances/").unwrap();
    assert_eq!(records.len(), 1);
}

#[test]
fn store_outage_is_retried_without_disturbing_listeners() {
    let mut cluster = Cluster::new(3);
    cluster.run_cycles(6);
    let events = record_events(&cluster.services[0]);

    // One missed cycle keeps every record inside the timeout window.
    cluster.store.set_unavailable(true);
    cluster.run_cycles(1);
    cluster.store.set_unavailable(false);
    cluster.run_cycles(3);

    // The outage was shorter than the heartbeat timeout: nothing changed.
    let observed = kinds(&events.lock());
    assert_eq!(observed, vec![TopologyEventType::Init]);
    assert!(cluster.services[0].get_current_view().unwrap().is_current);
}

#[test]
fn clean_shutdown_is_observed_as_a_departure() {
    let mut cluster = Cluster::new(3);
    cluster.run_cycles(6);

    cluster.services[2].shutdown().unwrap();
    cluster.run_cycles_pausing(6, &[2]);

    let view = cluster.services[0].get_current_view().unwrap();
    assert!(view.is_current);
    assert_eq!(view.len(), 2);
    assert!(!view.contains("node-2"));
}

#[test]
fn duplicate_instance_id_halts_heartbeats() {
    let store = Arc::new(MemoryStore::new());
    let first = DiscoveryService::new(
        test_config(0),
        Arc::clone(&store) as Arc<dyn RecordStore>,
        BASE,
    )
    .unwrap();
    let second = DiscoveryService::new(
        test_config(0),
        Arc::clone(&store) as Arc<dyn RecordStore>,
        BASE + 5,
    )
    .unwrap();

    first.run_cycle(BASE + 1_000).unwrap();
    second.run_cycle(BASE + 1_001).unwrap();
    let err = first.run_cycle(BASE + 2_000).unwrap_err();
    assert!(matches!(err, DiscoveryError::DuplicateInstanceId { .. }));

    // Halted: further cycles are no-ops, the impostor keeps running.
    first.run_cycle(BASE + 3_000).unwrap();
    second.run_cycle(BASE + 3_001).unwrap();
}

#[test]
fn single_instance_forms_a_one_member_view() {
    let mut cluster = Cluster::new(1);
    cluster.run_cycles(5);

    let view = cluster.services[0].get_current_view().unwrap();
    assert!(view.is_current);
    assert_eq!(view.len(), 1);
    assert_eq!(view.leader_instance_id(), Some("node-0"));
}
