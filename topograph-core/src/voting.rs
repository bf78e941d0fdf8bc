use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DiscoveryError;
use crate::keys::{self, ESTABLISHED_KEY, VOTINGS_PREFIX};
use crate::store::{Precondition, RecordStore, StoreError};
use crate::types::{
    EstablishedView, InstanceRecord, UnixMillis, ViewMember, leader_of,
};

/// Backoff growth is capped so a long oscillation cannot push the re-vote
/// window out indefinitely.
const MAX_BACKOFF_FACTOR: u32 = 10;

/// One member's slot in a voting round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberVote {
    /// `Some(true)` = yes, `Some(false)` = no, `None` = not voted yet.
    #[serde(default)]
    pub vote: Option<bool>,
    /// When the vote was cast.
    #[serde(default)]
    pub voted_at: Option<UnixMillis>,
    /// Leader-election id the member advertised when voting.
    #[serde(default)]
    pub leader_election_id: Option<String>,
    /// True for the member that opened the round; counts as a yes.
    #[serde(default)]
    pub initiator: bool,
}

/// One voting round over a disputed candidate membership set.
///
/// Stored as a single flat record at `votings/<voting_id>`. The candidate
/// set is the key set of `member_votes`. A round is winning once every
/// member has voted yes (unanimity); a single no-vote dooms it, after which
/// it lingers until the voting timeout and is garbage-collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingRecord {
    /// Unique id of this round; doubles as the view id on promotion.
    pub voting_id: String,
    /// Instance that detected the disagreement and opened the round.
    pub initiator_id: String,
    /// When the round was opened; rounds time out like heartbeats do.
    pub voting_start: UnixMillis,
    /// Vote slots keyed by instance id.
    pub member_votes: BTreeMap<String, MemberVote>,
}

impl VotingRecord {
    /// Opens a round for the given candidates, with the initiator's yes
    /// vote already cast.
    #[must_use]
    pub fn open(
        voting_id: String,
        initiator_id: &str,
        now: UnixMillis,
        candidates: &BTreeMap<String, InstanceRecord>,
    ) -> Self {
        let member_votes = candidates
            .iter()
            .map(|(instance_id, record)| {
                let initiator = instance_id == initiator_id;
                let vote = MemberVote {
                    vote: initiator.then_some(true),
                    voted_at: initiator.then_some(now),
                    leader_election_id: Some(record.leader_election_id.clone()),
                    initiator,
                };
                (instance_id.clone(), vote)
            })
            .collect();
        Self {
            voting_id,
            initiator_id: initiator_id.to_string(),
            voting_start: now,
            member_votes,
        }
    }

    /// The membership set this round proposes.
    #[must_use]
    pub fn candidate_members(&self) -> BTreeSet<String> {
        self.member_votes.keys().cloned().collect()
    }

    /// True when this round proposes exactly the given membership set.
    #[must_use]
    pub fn matches_members(&self, members: &BTreeSet<String>) -> bool {
        self.member_votes.len() == members.len()
            && self.member_votes.keys().all(|id| members.contains(id))
    }

    /// The given instance's vote, if cast.
    #[must_use]
    pub fn vote_of(&self, instance_id: &str) -> Option<bool> {
        self.member_votes.get(instance_id).and_then(|slot| slot.vote)
    }

    /// Casts or overwrites a vote. A vote from outside the candidate set
    /// inserts a new slot, which dooms the round (it can no longer reach
    /// unanimity over the original candidates).
    pub fn cast_vote(
        &mut self,
        instance_id: &str,
        vote: bool,
        leader_election_id: Option<&str>,
        now: UnixMillis,
    ) {
        let slot = self.member_votes.entry(instance_id.to_string()).or_default();
        slot.vote = Some(vote);
        slot.voted_at = Some(now);
        if let Some(election_id) = leader_election_id {
            slot.leader_election_id = Some(election_id.to_string());
        }
    }

    /// True when any member voted no.
    #[must_use]
    pub fn has_no_votes(&self) -> bool {
        self.member_votes.values().any(|slot| slot.vote == Some(false))
    }

    /// True once every member has voted yes or is the initiator.
    #[must_use]
    pub fn is_winning(&self) -> bool {
        !self.member_votes.is_empty()
            && self
                .member_votes
                .values()
                .all(|slot| slot.initiator || slot.vote == Some(true))
    }

    /// True once the round has outlived the voting timeout.
    #[must_use]
    pub fn is_timed_out(&self, now: UnixMillis, timeout_ms: u64) -> bool {
        now.saturating_sub(self.voting_start) >= timeout_ms
    }

    fn leader(&self) -> Option<(&str, &str)> {
        self.member_votes
            .iter()
            .filter_map(|(id, slot)| {
                slot.leader_election_id
                    .as_deref()
                    .map(|election_id| (election_id, id.as_str()))
            })
            .min()
            .map(|(election_id, id)| (id, election_id))
    }
}

/// Outcome of one voting-analysis pass.
#[derive(Debug)]
pub struct VotingAnalysis {
    /// Set when a winning round initiated by this instance was promoted.
    pub promoted: Option<EstablishedView>,
    /// Rounds still present in the store after cleanup (winning or not).
    pub open_votings: Vec<VotingRecord>,
    /// True when an open round matching the local live set exists.
    pub matched_open: bool,
}

impl VotingAnalysis {
    /// True when any round is still pending resolution.
    #[must_use]
    pub fn has_open_votings(&self) -> bool {
        !self.open_votings.is_empty()
    }
}

/// Follows and resolves voting rounds for one instance.
///
/// All mutations are optimistic-concurrency writes: a conflicting vote write
/// is dropped with a warning and revisited on the next check cycle, which
/// re-reads the latest state. The re-open loop guard lives here: a new round
/// is only opened for a candidate set that stayed unchanged for the
/// stability window, with linear backoff across consecutive re-opens.
pub struct VotingCoordinator {
    store: Arc<dyn RecordStore>,
    instance_id: String,
    leader_election_id: String,
    voting_timeout_ms: u64,
    stability_window_ms: u64,
    last_candidates: Option<BTreeSet<String>>,
    stable_since: UnixMillis,
    reopen_attempts: u32,
}

impl VotingCoordinator {
    /// Creates a coordinator for the given instance.
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        instance_id: String,
        leader_election_id: String,
        voting_timeout_ms: u64,
        stability_window_ms: u64,
    ) -> Self {
        Self {
            store,
            instance_id,
            leader_election_id,
            voting_timeout_ms,
            stability_window_ms,
            last_candidates: None,
            stable_since: 0,
            reopen_attempts: 0,
        }
    }

    /// Lists all voting records currently in the store, sorted by id.
    pub fn list_votings(&self) -> Result<Vec<(VotingRecord, u64)>, DiscoveryError> {
        let children = self.store.list_children(VOTINGS_PREFIX)?;
        let mut votings = Vec::with_capacity(children.len());
        for (key, versioned) in children {
            match serde_json::from_value::<VotingRecord>(versioned.value) {
                Ok(record) => votings.push((record, versioned.version)),
                Err(err) => warn!(%key, %err, "skipping undecodable voting record"),
            }
        }
        votings.sort_by(|a, b| a.0.voting_id.cmp(&b.0.voting_id));
        Ok(votings)
    }

    /// Analyzes every round visible in the store and votes accordingly.
    ///
    /// Winning rounds are promoted by their initiator; everyone else waits
    /// for the promotion to appear. Otherwise each round is visited in id
    /// order: timed-out rounds are removed, doomed or mismatching rounds get
    /// a no vote, and exactly the first round matching the local live set
    /// gets our yes.
    pub fn analyze_votings(
        &mut self,
        now: UnixMillis,
        live: &BTreeMap<String, InstanceRecord>,
    ) -> Result<VotingAnalysis, DiscoveryError> {
        let listed = self.list_votings()?;

        if let Some((winning, _)) = listed.iter().find(|(record, _)| record.is_winning()) {
            if winning.initiator_id == self.instance_id {
                let established = self.promote(now, winning, live)?;
                return Ok(VotingAnalysis {
                    promoted: Some(established),
                    open_votings: Vec::new(),
                    matched_open: false,
                });
            }
            debug!(
                voting_id = %winning.voting_id,
                initiator = %winning.initiator_id,
                "winning voting awaits promotion by its initiator"
            );
            return Ok(VotingAnalysis {
                promoted: None,
                open_votings: listed.into_iter().map(|(record, _)| record).collect(),
                matched_open: false,
            });
        }

        let live_ids: BTreeSet<String> = live.keys().cloned().collect();
        let mut open_votings = Vec::new();
        let mut matched_open = false;

        for (mut record, version) in listed {
            if record.is_timed_out(now, self.voting_timeout_ms) {
                info!(voting_id = %record.voting_id, "removing timed-out voting");
                if let Err(err) = self.store.remove(&keys::voting_key(&record.voting_id)) {
                    warn!(voting_id = %record.voting_id, %err, "failed to remove voting");
                }
                continue;
            }
            let my_vote = record.vote_of(&self.instance_id);
            if record.has_no_votes() {
                if my_vote != Some(false) {
                    debug!(voting_id = %record.voting_id, "voting already doomed; voting no");
                    self.cast(&mut record, version, false, now);
                }
                open_votings.push(record);
                continue;
            }
            if !record.matches_members(&live_ids) {
                if my_vote != Some(false) {
                    info!(
                        voting_id = %record.voting_id,
                        "voting does not match local live view; voting no"
                    );
                    self.cast(&mut record, version, false, now);
                }
                open_votings.push(record);
                continue;
            }
            if matched_open {
                // Only one yes per instance; later equivalents get a no.
                if my_vote != Some(false) {
                    self.cast(&mut record, version, false, now);
                }
                open_votings.push(record);
                continue;
            }
            matched_open = true;
            if my_vote != Some(true) {
                info!(voting_id = %record.voting_id, "casting yes vote");
                self.cast(&mut record, version, true, now);
            }
            open_votings.push(record);
        }

        Ok(VotingAnalysis {
            promoted: None,
            open_votings,
            matched_open,
        })
    }

    /// Opens a new round for the current candidate set once the loop guard
    /// allows it. Returns the opened record, or `None` when an equivalent
    /// round already exists or the set has not been stable long enough.
    pub fn maybe_open_voting(
        &mut self,
        now: UnixMillis,
        live: &BTreeMap<String, InstanceRecord>,
        open_votings: &[VotingRecord],
    ) -> Result<Option<VotingRecord>, DiscoveryError> {
        let candidates: BTreeSet<String> = live.keys().cloned().collect();
        let equivalent_open = open_votings
            .iter()
            .any(|record| !record.has_no_votes() && record.matches_members(&candidates));
        if equivalent_open {
            return Ok(None);
        }

        match &self.last_candidates {
            Some(previous) if *previous == candidates => {
                let factor = u64::from((self.reopen_attempts + 1).min(MAX_BACKOFF_FACTOR));
                let required = self.stability_window_ms.saturating_mul(factor);
                if now.saturating_sub(self.stable_since) < required {
                    debug!(
                        attempts = self.reopen_attempts,
                        required_ms = required,
                        "candidate set not yet stable; deferring new voting"
                    );
                    return Ok(None);
                }
            }
            _ => {
                // First sighting of this candidate set; start the window.
                self.last_candidates = Some(candidates);
                self.stable_since = now;
                return Ok(None);
            }
        }

        self.open_voting(now, live).map(Some)
    }

    /// Opens a round immediately, bypassing the stability guard. Management
    /// hook for forcing a re-vote (and thereby a leader re-election).
    pub fn open_voting(
        &mut self,
        now: UnixMillis,
        live: &BTreeMap<String, InstanceRecord>,
    ) -> Result<VotingRecord, DiscoveryError> {
        let voting_id = Uuid::new_v4().to_string();
        let record = VotingRecord::open(voting_id, &self.instance_id, now, live);
        match keys::write_record(
            &*self.store,
            &keys::voting_key(&record.voting_id),
            &record,
            Precondition::Absent,
        ) {
            Ok(_) => {
                info!(
                    voting_id = %record.voting_id,
                    members = record.member_votes.len(),
                    "opened new voting"
                );
                self.reopen_attempts += 1;
                self.stable_since = now;
                Ok(record)
            }
            Err(err) => Err(err),
        }
    }

    /// Resets the loop guard after a view was agreed.
    pub fn note_view_agreed(&mut self) {
        self.reopen_attempts = 0;
    }

    fn cast(&self, record: &mut VotingRecord, version: u64, vote: bool, now: UnixMillis) {
        let election_id = vote.then_some(self.leader_election_id.as_str());
        record.cast_vote(&self.instance_id, vote, election_id, now);
        match keys::write_record(
            &*self.store,
            &keys::voting_key(&record.voting_id),
            record,
            Precondition::MatchesVersion(version),
        ) {
            Ok(_) => {}
            Err(DiscoveryError::Store(StoreError::Conflict { .. })) => {
                // A concurrent voter got there first; the next cycle re-reads.
                warn!(voting_id = %record.voting_id, "vote write conflicted; retrying next cycle");
            }
            Err(err) => {
                warn!(voting_id = %record.voting_id, %err, "vote write failed; retrying next cycle");
            }
        }
    }

    fn promote(
        &self,
        now: UnixMillis,
        winning: &VotingRecord,
        live: &BTreeMap<String, InstanceRecord>,
    ) -> Result<EstablishedView, DiscoveryError> {
        let members: BTreeMap<String, ViewMember> = winning
            .member_votes
            .iter()
            .map(|(instance_id, slot)| {
                let properties = live
                    .get(instance_id)
                    .map(|record| record.properties.clone())
                    .unwrap_or_default();
                let leader_election_id = slot
                    .leader_election_id
                    .clone()
                    .unwrap_or_else(|| instance_id.clone());
                (
                    instance_id.clone(),
                    ViewMember {
                        instance_id: instance_id.clone(),
                        leader_election_id,
                        properties,
                    },
                )
            })
            .collect();
        let leader_id = leader_of(&members)
            .map(|member| member.instance_id.clone())
            .or_else(|| winning.leader().map(|(id, _)| id.to_string()))
            .unwrap_or_else(|| self.instance_id.clone());

        let established = EstablishedView {
            view_id: winning.voting_id.clone(),
            members,
            leader_id,
            promoted_by: self.instance_id.clone(),
            promoted_at: now,
        };
        keys::write_record(&*self.store, ESTABLISHED_KEY, &established, Precondition::Any)?;
        info!(
            view_id = %established.view_id,
            members = established.members.len(),
            leader = %established.leader_id,
            "promoted winning voting to established view"
        );

        for (key, _) in self.store.list_children(VOTINGS_PREFIX)? {
            if let Err(err) = self.store.remove(&key) {
                warn!(%key, %err, "failed to remove voting after promotion");
            }
        }
        Ok(established)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::store::MemoryStore;

    fn instance(id: &str, election_id: &str) -> (String, InstanceRecord) {
        (
            id.to_string(),
            InstanceRecord {
                instance_id: id.to_string(),
                leader_election_id: election_id.to_string(),
                runtime_id: format!("rt-{id}"),
                last_heartbeat_at: 1_000,
                properties: BTreeMap::new(),
            },
        )
    }

    fn live_set(ids: &[(&str, &str)]) -> BTreeMap<String, InstanceRecord> {
        ids.iter().map(|(id, lei)| instance(id, lei)).collect()
    }

    fn coordinator(store: &Arc<MemoryStore>, id: &str, election_id: &str) -> VotingCoordinator {
        VotingCoordinator::new(
            Arc::clone(store) as Arc<dyn RecordStore>,
            id.to_string(),
            election_id.to_string(),
            3_000,
            1_000,
        )
    }

    #[test]
    fn unanimity_decides_winning() {
        let live = live_set(&[("a", "0_1_a"), ("b", "0_2_b")]);
        let mut record = VotingRecord::open("v1".to_string(), "a", 1_000, &live);
        assert!(!record.is_winning());

        record.cast_vote("b", true, Some("0_2_b"), 1_100);
        assert!(record.is_winning());
    }

    #[test]
    fn a_single_no_vote_dooms_the_round() {
        let live = live_set(&[("a", "0_1_a"), ("b", "0_2_b")]);
        let mut record = VotingRecord::open("v1".to_string(), "a", 1_000, &live);
        record.cast_vote("b", false, None, 1_100);
        assert!(record.has_no_votes());
        assert!(!record.is_winning());
    }

    #[test]
    fn stability_guard_defers_the_first_open() {
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(&store, "a", "0_1_a");
        let live = live_set(&[("a", "0_1_a"), ("b", "0_2_b")]);

        // First sighting only records the candidate set.
        assert!(coordinator
            .maybe_open_voting(1_000, &live, &[])
            .unwrap()
            .is_none());
        // Still inside the stability window.
        assert!(coordinator
            .maybe_open_voting(1_500, &live, &[])
            .unwrap()
            .is_none());
        // Window elapsed: the round opens.
        let opened = coordinator.maybe_open_voting(2_100, &live, &[]).unwrap();
        assert!(opened.is_some());
        assert_eq!(store.list_children(VOTINGS_PREFIX).unwrap().len(), 1);
    }

    #[test]
    fn no_equivalent_round_is_opened_twice() {
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(&store, "a", "0_1_a");
        let live = live_set(&[("a", "0_1_a"), ("b", "0_2_b")]);

        coordinator.maybe_open_voting(1_000, &live, &[]).unwrap();
        let opened = coordinator
            .maybe_open_voting(2_100, &live, &[])
            .unwrap()
            .unwrap();

        // With the equivalent round visible, nothing new is opened.
        assert!(coordinator
            .maybe_open_voting(5_000, &live, std::slice::from_ref(&opened))
            .unwrap()
            .is_none());
    }

    #[test]
    fn reopen_backoff_grows_linearly() {
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(&store, "a", "0_1_a");
        let live = live_set(&[("a", "0_1_a")]);

        coordinator.maybe_open_voting(0, &live, &[]).unwrap();
        let first = coordinator.maybe_open_voting(1_000, &live, &[]).unwrap();
        assert!(first.is_some());

        // Second round for the same set now requires two windows.
        store.remove(&keys::voting_key(&first.unwrap().voting_id)).unwrap();
        assert!(coordinator
            .maybe_open_voting(2_500, &live, &[])
            .unwrap()
            .is_none());
        assert!(coordinator
            .maybe_open_voting(3_100, &live, &[])
            .unwrap()
            .is_some());
    }

    #[test]
    fn initiator_promotes_winning_round() {
        let store = Arc::new(MemoryStore::new());
        let mut initiator = coordinator(&store, "a", "0_1_a");
        let mut voter = coordinator(&store, "b", "0_2_b");
        let live = live_set(&[("a", "0_1_a"), ("b", "0_2_b")]);

        initiator.open_voting(1_000, &live).unwrap();

        // The peer joins the round.
        let analysis = voter.analyze_votings(1_500, &live).unwrap();
        assert!(analysis.matched_open);

        // The initiator observes unanimity and promotes.
        let analysis = initiator.analyze_votings(2_000, &live).unwrap();
        let established = analysis.promoted.unwrap();
        assert_eq!(established.leader_id, "a");
        assert_eq!(established.member_ids().len(), 2);
        assert!(store.list_children(VOTINGS_PREFIX).unwrap().is_empty());
    }

    #[test]
    fn mismatching_round_collects_no_votes() {
        let store = Arc::new(MemoryStore::new());
        let mut initiator = coordinator(&store, "a", "0_1_a");
        let mut voter = coordinator(&store, "b", "0_2_b");
        let stale = live_set(&[("a", "0_1_a"), ("c", "0_3_c")]);
        let live = live_set(&[("a", "0_1_a"), ("b", "0_2_b")]);

        initiator.open_voting(1_000, &stale).unwrap();
        let analysis = voter.analyze_votings(1_500, &live).unwrap();
        assert!(!analysis.matched_open);
        let (record, _) = &voter.list_votings().unwrap()[0];
        assert_eq!(record.vote_of("b"), Some(false));
        assert!(record.has_no_votes());
    }

    #[test]
    fn timed_out_rounds_are_garbage_collected() {
        let store = Arc::new(MemoryStore::new());
        let mut initiator = coordinator(&store, "a", "0_1_a");
        let live = live_set(&[("a", "0_1_a"), ("b", "0_2_b")]);

        initiator.open_voting(1_000, &live).unwrap();
        let analysis = initiator.analyze_votings(4_200, &live).unwrap();
        assert!(!analysis.has_open_votings());
        assert!(store.list_children(VOTINGS_PREFIX).unwrap().is_empty());
    }
}
