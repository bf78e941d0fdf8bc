use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DiscoveryConfig;
use crate::dispatch::{EventDispatcher, ListenerId, TopologyListener};
use crate::error::DiscoveryError;
use crate::heartbeat::{HeartbeatWriter, generate_leader_election_id};
use crate::keys::{self, ESTABLISHED_KEY};
use crate::store::RecordStore;
use crate::topology::TopologyViewManager;
use crate::types::{
    ClusterView, EstablishedView, InstanceRecord, TopologyEvent, UnixMillis, ViewMember,
};
use crate::view::{LiveView, ViewChecker};
use crate::voting::{VotingCoordinator, VotingRecord};

/// One instance of the discovery protocol.
///
/// Owns the heartbeat writer, view checker, voting coordinator and event
/// sequencer behind a single per-instance mutex, so a heartbeat and a view
/// check never observe each other's half-updated state. There is no
/// cross-instance lock: all coordination goes through the injected
/// [`RecordStore`]. Events are dispatched after the mutex is released.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    store: Arc<dyn RecordStore>,
    instance_id: String,
    state: Mutex<ProtocolState>,
    dispatcher: EventDispatcher,
}

impl std::fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

struct ProtocolState {
    heartbeat: HeartbeatWriter,
    checker: ViewChecker,
    coordinator: VotingCoordinator,
    sequencer: TopologyViewManager,
    properties: BTreeMap<String, String>,
    halted: bool,
}

impl DiscoveryService {
    /// Creates an instance of the protocol.
    ///
    /// `started_at` seeds the leader-election id: earlier-started instances
    /// win leadership ties. Configuration problems are the only fatal
    /// startup error.
    pub fn new(
        config: DiscoveryConfig,
        store: Arc<dyn RecordStore>,
        started_at: UnixMillis,
    ) -> Result<Arc<Self>, DiscoveryError> {
        config.validate()?;
        let instance_id = if config.instance_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            config.instance_id.clone()
        };
        let leader_election_id = generate_leader_election_id(started_at, &instance_id);

        let heartbeat = HeartbeatWriter::new(
            Arc::clone(&store),
            instance_id.clone(),
            leader_election_id.clone(),
            config.store_retry_limit,
        );
        let checker = ViewChecker::new(
            Arc::clone(&store),
            config.heartbeat_timeout_ms(),
            config.stale_instance_after_ms(),
        );
        let coordinator = VotingCoordinator::new(
            Arc::clone(&store),
            instance_id.clone(),
            leader_election_id.clone(),
            config.heartbeat_timeout_ms(),
            config.voting_stability_window_ms(),
        );
        let sequencer = TopologyViewManager::new(instance_id.clone(), config.min_event_delay_ms());

        info!(%instance_id, %leader_election_id, "discovery service created");
        Ok(Arc::new(Self {
            config,
            store,
            instance_id,
            state: Mutex::new(ProtocolState {
                heartbeat,
                checker,
                coordinator,
                sequencer,
                properties: BTreeMap::new(),
                halted: false,
            }),
            dispatcher: EventDispatcher::new(),
        }))
    }

    /// The local instance id.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The configuration this service runs with.
    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Writes the local liveness record.
    ///
    /// Detecting a duplicate instance id halts the service and announces
    /// `Changing` to listeners; the topology can no longer be trusted.
    pub fn issue_heartbeat(&self, now: UnixMillis) -> Result<(), DiscoveryError> {
        let (events, result) = {
            let mut state = self.state.lock();
            Self::heartbeat_locked(&mut state, now)
        };
        self.dispatcher.dispatch(&events);
        result
    }

    /// Runs one view check: classification, voting analysis and event
    /// sequencing.
    pub fn check_view(&self, now: UnixMillis) -> Result<(), DiscoveryError> {
        let events = {
            let mut state = self.state.lock();
            if state.halted {
                return Ok(());
            }
            Self::check_locked(self, &mut state, now)?
        };
        self.dispatcher.dispatch(&events);
        Ok(())
    }

    /// Runs heartbeat-then-check as one atomic unit relative to this
    /// instance's protocol state.
    ///
    /// A transient heartbeat failure does not skip the check; both paths
    /// retry on the next cycle. A duplicate-instance-id detection halts the
    /// service and announces `Changing` to listeners.
    pub fn run_cycle(&self, now: UnixMillis) -> Result<(), DiscoveryError> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            if state.halted {
                return Ok(());
            }
            let (heartbeat_events, heartbeat_result) = Self::heartbeat_locked(&mut state, now);
            events.extend(heartbeat_events);
            match heartbeat_result {
                Err(err @ DiscoveryError::DuplicateInstanceId { .. }) => Err(err),
                heartbeat_result => {
                    if let Err(err) = heartbeat_result {
                        warn!(%err, "heartbeat write failed; retrying next cycle");
                    }
                    Self::check_locked(self, &mut state, now).map(|check_events| {
                        events.extend(check_events);
                    })
                }
            }
        };
        self.dispatcher.dispatch(&events);
        result
    }

    /// Read-only snapshot of the last agreed view, if any.
    #[must_use]
    pub fn get_current_view(&self) -> Option<ClusterView> {
        self.state.lock().sequencer.current_view().cloned()
    }

    /// Diagnostic listing of voting rounds currently visible in the store.
    pub fn list_open_votings(&self) -> Result<Vec<VotingRecord>, DiscoveryError> {
        let state = self.state.lock();
        Ok(state
            .coordinator
            .list_votings()?
            .into_iter()
            .map(|(record, _)| record)
            .collect())
    }

    /// Registers a topology listener; see
    /// [`EventDispatcher::add_listener`] for the init-delivery contract.
    pub fn add_topology_listener(&self, listener: Arc<dyn TopologyListener>) -> ListenerId {
        let current = self.get_current_view().filter(|view| view.is_current);
        self.dispatcher.add_listener(listener, current)
    }

    /// Removes a previously registered listener.
    pub fn remove_topology_listener(&self, id: ListenerId) {
        self.dispatcher.remove_listener(id);
    }

    /// Sets a local instance property, visible to peers after the next
    /// heartbeat. Property changes never affect membership; peers announce
    /// them as `PropertiesChanged`.
    pub fn set_local_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.lock().properties.insert(key.into(), value.into());
    }

    /// Management hook: forces a new voting round for the current live set,
    /// bypassing the stability guard.
    pub fn start_new_voting(&self, now: UnixMillis) -> Result<(), DiscoveryError> {
        let mut state = self.state.lock();
        if state.halted {
            return Ok(());
        }
        let live = Self::live_with_self(&state, self.instance_id(), now)?;
        state.coordinator.open_voting(now, &live.live)?;
        Ok(())
    }

    /// Stops participating and removes the local heartbeat record. Peers
    /// observe the departure as one more timeout; removal only improves
    /// promptness.
    pub fn shutdown(&self) -> Result<(), DiscoveryError> {
        let mut state = self.state.lock();
        if state.halted {
            return Ok(());
        }
        state.halted = true;
        info!(instance_id = %self.instance_id, "discovery service shutting down");
        state.heartbeat.remove_record()
    }

    fn heartbeat_locked(
        state: &mut ProtocolState,
        now: UnixMillis,
    ) -> (Vec<TopologyEvent>, Result<(), DiscoveryError>) {
        if state.halted {
            return (Vec::new(), Ok(()));
        }
        let properties = state.properties.clone();
        match state.heartbeat.issue_heartbeat(now, &properties) {
            Err(err @ DiscoveryError::DuplicateInstanceId { .. }) => {
                error!(%err, "halting discovery: duplicate instance id");
                state.halted = true;
                let events = state.sequencer.handle_changing(now).into_iter().collect();
                (events, Err(err))
            }
            result => (Vec::new(), result),
        }
    }

    fn check_locked(
        &self,
        state: &mut ProtocolState,
        now: UnixMillis,
    ) -> Result<Vec<TopologyEvent>, DiscoveryError> {
        let mut events = Vec::new();
        let live = Self::live_with_self(state, self.instance_id(), now)?;

        let mut analysis = state.coordinator.analyze_votings(now, &live.live)?;
        if let Some(established) = analysis.promoted.take() {
            state.coordinator.note_view_agreed();
            let (view_id, members) = Self::effective_view(&established, &live);
            events.extend(state.sequencer.handle_new_view(view_id, members, now));
        } else if !analysis.open_votings.is_empty() {
            // Votings pending: the current view can no longer be trusted.
            events.extend(state.sequencer.handle_changing(now));
        } else {
            let established =
                keys::read_record::<EstablishedView>(&*self.store, ESTABLISHED_KEY)?
                    .map(|(record, _)| record);
            let live_ids = live.member_ids();
            match established {
                Some(established) if established.member_ids() == live_ids => {
                    state.coordinator.note_view_agreed();
                    let (view_id, members) = Self::effective_view(&established, &live);
                    events.extend(state.sequencer.handle_new_view(view_id, members, now));
                }
                maybe_established => {
                    debug!(
                        live = live_ids.len(),
                        established = maybe_established.is_some(),
                        "live view disagrees with established view"
                    );
                    events.extend(state.sequencer.handle_changing(now));
                    state
                        .coordinator
                        .maybe_open_voting(now, &live.live, &analysis.open_votings)?;
                }
            }
        }

        events.extend(state.sequencer.poll_pending(now));
        Ok(events)
    }

    /// Candidate classification with self always included: this instance
    /// has just heartbeated (or is about to), whatever the store says.
    fn live_with_self(
        state: &ProtocolState,
        instance_id: &str,
        now: UnixMillis,
    ) -> Result<LiveView, DiscoveryError> {
        let mut live = state.checker.determine_live_instances(now)?;
        if !live.live.contains_key(instance_id) {
            live.live.insert(
                instance_id.to_string(),
                InstanceRecord {
                    instance_id: instance_id.to_string(),
                    leader_election_id: state.heartbeat.leader_election_id().to_string(),
                    runtime_id: state.heartbeat.runtime_id().to_string(),
                    last_heartbeat_at: now,
                    properties: state.properties.clone(),
                },
            );
            live.timed_out.remove(instance_id);
        }
        Ok(live)
    }

    /// Overlays the freshest known member properties onto an established
    /// view, so property updates are announced without a new voting round.
    fn effective_view(
        established: &EstablishedView,
        live: &LiveView,
    ) -> (String, BTreeMap<String, ViewMember>) {
        let members = established
            .members
            .iter()
            .map(|(instance_id, member)| {
                let properties = live
                    .live
                    .get(instance_id)
                    .map(|record| record.properties.clone())
                    .unwrap_or_else(|| member.properties.clone());
                (
                    instance_id.clone(),
                    ViewMember {
                        instance_id: member.instance_id.clone(),
                        leader_election_id: member.leader_election_id.clone(),
                        properties,
                    },
                )
            })
            .collect();
        (established.view_id.clone(), members)
    }
}

/// Spawns the periodic heartbeat and check loops for a service.
pub struct DiscoveryRuntime;

impl DiscoveryRuntime {
    /// Starts the two tick loops on the current tokio runtime.
    ///
    /// The heartbeat loop runs at `heartbeat_interval`, the check loop at
    /// `check_interval`; both skip missed ticks rather than bursting.
    /// Transient errors are logged and retried on the next tick; a
    /// duplicate-instance-id detection stops the heartbeat loop for good.
    #[must_use]
    pub fn spawn(service: Arc<DiscoveryService>) -> DiscoveryHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(2);

        let heartbeat_service = Arc::clone(&service);
        let mut heartbeat_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(heartbeat_service.config().heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = heartbeat_shutdown.changed() => break,
                    _ = ticker.tick() => {
                        match heartbeat_service.issue_heartbeat(unix_now()) {
                            Ok(()) => {}
                            Err(err @ DiscoveryError::DuplicateInstanceId { .. }) => {
                                error!(%err, "stopping heartbeat loop");
                                break;
                            }
                            Err(err) => warn!(%err, "heartbeat failed; retrying next tick"),
                        }
                    }
                }
            }
        }));

        let check_service = Arc::clone(&service);
        let mut check_shutdown = shutdown_rx;
        tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(check_service.config().check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = check_shutdown.changed() => {
                        debug!("check loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = check_service.check_view(unix_now()) {
                            warn!(%err, "view check failed; retrying next tick");
                        }
                    }
                }
            }
        }));

        DiscoveryHandle {
            shutdown_tx,
            tasks,
            service,
        }
    }
}

/// Handle controlling a running [`DiscoveryRuntime`].
pub struct DiscoveryHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    service: Arc<DiscoveryService>,
}

impl DiscoveryHandle {
    /// Signals both tick loops to exit.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for the loops to terminate, then removes the local heartbeat
    /// record.
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
        if let Err(err) = self.service.shutdown() {
            warn!(%err, "failed to remove heartbeat record on shutdown");
        }
    }
}

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn unix_now() -> UnixMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
