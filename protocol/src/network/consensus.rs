//! # Three-Phase Consensus
//!
//! Byzantine-fault-tolerant agreement on opaque JSON payloads, in the
//! classic pre-prepare / prepare / commit shape:
//!
//! ```text
//! proposer ──pre-prepare──▶ all
//! all      ──prepare──────▶ all   (once the pre-prepare is stored)
//! all      ──commit───────▶ all   (once 2f+1 prepares are counted)
//! all      execute                (once 2f+1 commits are counted)
//! ```
//!
//! `f = floor((n - 1) / 3)` where `n` is the number of connected peers plus
//! this node, so a cluster of `3f + 1` nodes keeps deciding with up to `f`
//! silent members.
//!
//! ## At-most-once execution
//!
//! Decisions are append-only. A proposal id with a recorded decision is
//! never transitioned again: late or duplicated votes for it are ignored.
//!
//! ## Out-of-order votes
//!
//! A vote for a proposal whose pre-prepare has not arrived yet is reported
//! as [`ConsensusError::UnknownProposal`] and buffered. Once the pre-prepare
//! arrives the buffered votes are replayed. The buffer holds at most one
//! vote per member and phase for at most [`MAX_BUFFERED_PROPOSALS`] ids, and
//! is aged out with the rest of the undecided state. Decisions are pruned
//! once they are older than the decision retention.
//!
//! The engine performs no I/O. Handlers return [`ConsensusAction`]s that
//! the node carries out after the engine lock is released.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MAX_BUFFERED_PROPOSALS;
use crate::error::MeshError;
use crate::network::message::Message;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where a proposal stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Announced, not yet stored by this node.
    PrePrepare,
    /// Stored; collecting prepares.
    Prepare,
    /// Prepare quorum reached; collecting commits.
    Commit,
    /// Commit quorum reached; decision recorded.
    Executed,
}

/// Pre-prepare broadcast by the proposer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrePrepare {
    /// Proposal id.
    pub proposal_id: String,
    /// The value being agreed on.
    pub payload: serde_json::Value,
    /// Proposer's view.
    pub view: u64,
    /// Proposer's sequence number.
    pub sequence: u64,
}

/// Phase a vote belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotePhase {
    /// Prepare vote.
    Prepare,
    /// Commit vote.
    Commit,
}

/// A prepare or commit vote. The voter is the envelope's sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusVote {
    /// Proposal voted on.
    pub proposal_id: String,
    /// Phase of the vote.
    pub phase: VotePhase,
    /// View of the proposal.
    pub view: u64,
    /// Sequence of the proposal.
    pub sequence: u64,
}

/// Local state of one proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusProposal {
    /// Proposal id.
    pub id: String,
    /// Proposed value.
    pub payload: serde_json::Value,
    /// View the proposal was made in.
    pub view_number: u64,
    /// Proposer's sequence number.
    pub sequence_number: u64,
    /// Current phase.
    pub phase: Phase,
    /// Nodes whose prepare was counted.
    pub prepare_votes: BTreeSet<String>,
    /// Nodes whose commit was counted.
    pub commit_votes: BTreeSet<String>,
    /// Unix ms at which this node stored the proposal.
    pub created_at: u64,
    /// Node that sent the pre-prepare.
    pub proposer: String,
}

/// Immutable outcome of an executed proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Proposal id.
    pub proposal_id: String,
    /// The agreed value.
    pub payload: serde_json::Value,
    /// Whether the proposal was approved.
    pub approved: bool,
    /// Commit votes counted at execution.
    pub participant_count: usize,
    /// Unix ms of execution.
    pub timestamp: u64,
}

/// Work the node must do after a handler returns.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusAction {
    /// Broadcast this message to every connected peer.
    Broadcast(Message),
    /// A proposal executed on this node.
    Executed(Decision),
}

/// Rejections raised by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// The pre-prepare is missing its id or payload.
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),
    /// A vote referenced a proposal this node has not stored.
    #[error("unknown proposal: {0}")]
    UnknownProposal(String),
    /// The pre-prepare belongs to an older view.
    #[error("proposal {proposal_id} is from view {view}, current view is {current}")]
    StaleView {
        /// Proposal id.
        proposal_id: String,
        /// View carried by the pre-prepare.
        view: u64,
        /// This node's view.
        current: u64,
    },
}

impl From<ConsensusError> for MeshError {
    fn from(e: ConsensusError) -> Self {
        match e {
            ConsensusError::UnknownProposal(id) => MeshError::UnknownProposal(id),
            other => MeshError::InvalidProposal(other.to_string()),
        }
    }
}

/// Agreeing participants required out of `total_nodes`: `2f + 1` with
/// `f = floor((total_nodes - 1) / 3)`.
pub fn quorum_size(total_nodes: usize) -> usize {
    let f = total_nodes.saturating_sub(1) / 3;
    2 * f + 1
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EngineState {
    view: u64,
    sequence: u64,
    proposals: HashMap<String, ConsensusProposal>,
    decisions: HashMap<String, Decision>,
    buffered: HashMap<String, BufferedVotes>,
    waiters: HashMap<String, oneshot::Sender<Decision>>,
}

struct BufferedVotes {
    first_seen: u64,
    votes: HashSet<(String, VotePhase)>,
}

/// Per-node consensus state machine.
pub struct ConsensusEngine {
    node_id: String,
    state: Mutex<EngineState>,
}

impl ConsensusEngine {
    /// Creates an engine in view 0 with no proposals.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Current view.
    pub fn view(&self) -> u64 {
        self.state.lock().view
    }

    /// Starts a proposal with this node as proposer.
    ///
    /// Returns the pre-prepare to broadcast and a receiver that resolves
    /// when the proposal executes locally. The caller must also feed the
    /// pre-prepare to [`handle_pre_prepare`](Self::handle_pre_prepare) so the
    /// proposer votes too.
    pub fn begin_proposal(
        &self,
        payload: serde_json::Value,
    ) -> Result<(PrePrepare, oneshot::Receiver<Decision>), ConsensusError> {
        if payload_is_empty(&payload) {
            return Err(ConsensusError::InvalidProposal("empty payload".into()));
        }

        let mut state = self.state.lock();
        state.sequence += 1;
        let pre_prepare = PrePrepare {
            proposal_id: Uuid::new_v4().to_string(),
            payload,
            view: state.view,
            sequence: state.sequence,
        };

        let (tx, rx) = oneshot::channel();
        state.waiters.insert(pre_prepare.proposal_id.clone(), tx);
        debug!(node = %self.node_id, proposal = %pre_prepare.proposal_id, sequence = pre_prepare.sequence, "proposal started");
        Ok((pre_prepare, rx))
    }

    /// Stores a pre-prepare and votes prepare on it.
    ///
    /// `members` is the set of connected peers; the quorum counts them plus
    /// this node. An already stored or decided proposal yields no actions.
    pub fn handle_pre_prepare(
        &self,
        from: &str,
        pre_prepare: PrePrepare,
        members: &HashSet<String>,
        now: u64,
    ) -> Result<Vec<ConsensusAction>, ConsensusError> {
        if pre_prepare.proposal_id.is_empty() {
            return Err(ConsensusError::InvalidProposal("missing proposal id".into()));
        }
        if payload_is_empty(&pre_prepare.payload) {
            return Err(ConsensusError::InvalidProposal(format!(
                "proposal {} has no payload",
                pre_prepare.proposal_id
            )));
        }

        let mut state = self.state.lock();
        if pre_prepare.view < state.view {
            return Err(ConsensusError::StaleView {
                proposal_id: pre_prepare.proposal_id,
                view: pre_prepare.view,
                current: state.view,
            });
        }
        let id = pre_prepare.proposal_id.clone();
        if state.decisions.contains_key(&id) || state.proposals.contains_key(&id) {
            return Ok(Vec::new());
        }

        let proposal = ConsensusProposal {
            id: id.clone(),
            payload: pre_prepare.payload,
            view_number: pre_prepare.view,
            sequence_number: pre_prepare.sequence,
            phase: Phase::Prepare,
            prepare_votes: BTreeSet::from([self.node_id.clone()]),
            commit_votes: BTreeSet::new(),
            created_at: now,
            proposer: from.to_string(),
        };
        let prepare = Message::ConsensusVote(ConsensusVote {
            proposal_id: id.clone(),
            phase: VotePhase::Prepare,
            view: proposal.view_number,
            sequence: proposal.sequence_number,
        });
        state.proposals.insert(id.clone(), proposal);

        if let Some(buffered) = state.buffered.remove(&id) {
            debug!(node = %self.node_id, proposal = %id, count = buffered.votes.len(), "replaying buffered votes");
            if let Some(proposal) = state.proposals.get_mut(&id) {
                for (voter, phase) in buffered.votes {
                    if voter == self.node_id || members.contains(&voter) {
                        count_vote(proposal, voter, phase);
                    }
                }
            }
        }

        let mut actions = vec![ConsensusAction::Broadcast(prepare)];
        actions.extend(self.advance(&mut state, &id, members, now));
        Ok(actions)
    }

    /// Counts a prepare or commit vote from `from`.
    pub fn handle_vote(
        &self,
        from: &str,
        vote: ConsensusVote,
        members: &HashSet<String>,
        now: u64,
    ) -> Result<Vec<ConsensusAction>, ConsensusError> {
        let mut state = self.state.lock();
        let id = vote.proposal_id.clone();

        if state.decisions.contains_key(&id) {
            return Ok(Vec::new());
        }
        if from != self.node_id && !members.contains(from) {
            debug!(node = %self.node_id, voter = %from, "vote from non-member ignored");
            return Ok(Vec::new());
        }
        if !state.proposals.contains_key(&id) {
            let room = state.buffered.len() < MAX_BUFFERED_PROPOSALS;
            let key = (from.to_string(), vote.phase);
            if let Some(buffered) = state.buffered.get_mut(&id) {
                buffered.votes.insert(key);
            } else if room {
                state.buffered.insert(
                    id.clone(),
                    BufferedVotes {
                        first_seen: now,
                        votes: HashSet::from([key]),
                    },
                );
            }
            return Err(ConsensusError::UnknownProposal(id));
        }

        if let Some(proposal) = state.proposals.get_mut(&id) {
            count_vote(proposal, from.to_string(), vote.phase);
        }
        Ok(self.advance(&mut state, &id, members, now))
    }

    fn advance(
        &self,
        state: &mut EngineState,
        id: &str,
        members: &HashSet<String>,
        now: u64,
    ) -> Vec<ConsensusAction> {
        let quorum = quorum_size(members.len() + 1);
        let mut actions = Vec::new();

        let Some(proposal) = state.proposals.get_mut(id) else {
            return actions;
        };

        if proposal.phase == Phase::Prepare && proposal.prepare_votes.len() >= quorum {
            proposal.phase = Phase::Commit;
            proposal.commit_votes.insert(self.node_id.clone());
            actions.push(ConsensusAction::Broadcast(Message::ConsensusVote(
                ConsensusVote {
                    proposal_id: proposal.id.clone(),
                    phase: VotePhase::Commit,
                    view: proposal.view_number,
                    sequence: proposal.sequence_number,
                },
            )));
        }

        if proposal.phase == Phase::Commit && proposal.commit_votes.len() >= quorum {
            proposal.phase = Phase::Executed;
            let decision = Decision {
                proposal_id: proposal.id.clone(),
                payload: proposal.payload.clone(),
                approved: true,
                participant_count: proposal.commit_votes.len(),
                timestamp: now,
            };

            if !state.decisions.contains_key(id) {
                info!(
                    node = %self.node_id,
                    proposal = %id,
                    participants = decision.participant_count,
                    quorum,
                    "consensus reached"
                );
                state.decisions.insert(id.to_string(), decision.clone());
                if let Some(waiter) = state.waiters.remove(id) {
                    let _ = waiter.send(decision.clone());
                }
                actions.push(ConsensusAction::Executed(decision));
            }
        }

        actions
    }

    /// Removes a departed peer's votes from every undecided proposal.
    pub fn forget_peer(&self, peer_id: &str) {
        let mut state = self.state.lock();
        for proposal in state.proposals.values_mut() {
            if proposal.phase != Phase::Executed {
                proposal.prepare_votes.remove(peer_id);
                proposal.commit_votes.remove(peer_id);
            }
        }
        for buffered in state.buffered.values_mut() {
            buffered.votes.retain(|(voter, _)| voter.as_str() != peer_id);
        }
    }

    /// Stops waiting for a proposal. Its state is left for garbage collection.
    pub fn abandon(&self, proposal_id: &str) {
        self.state.lock().waiters.remove(proposal_id);
    }

    /// Drops proposals and buffered votes older than `retention_ms` and
    /// decisions older than `decision_retention_ms`. Returns the ids of
    /// undecided proposals dropped.
    pub fn collect_garbage(&self, now: u64, retention_ms: u64, decision_retention_ms: u64) -> Vec<String> {
        let mut state = self.state.lock();
        let expired = |at: u64| now.saturating_sub(at) > retention_ms;

        let stale: Vec<String> = state
            .proposals
            .values()
            .filter(|p| expired(p.created_at))
            .map(|p| p.id.clone())
            .collect();

        let mut dropped = Vec::new();
        for id in stale {
            if let Some(proposal) = state.proposals.remove(&id) {
                if proposal.phase != Phase::Executed {
                    state.waiters.remove(&id);
                    dropped.push(id);
                }
            }
        }
        state.buffered.retain(|_, b| !expired(b.first_seen));
        state
            .decisions
            .retain(|_, d| now.saturating_sub(d.timestamp) <= decision_retention_ms);
        state.waiters.retain(|_, waiter| !waiter.is_closed());

        if !dropped.is_empty() {
            debug!(node = %self.node_id, count = dropped.len(), "collected undecided proposals");
        }
        dropped
    }

    /// The decision for a proposal, if it executed here.
    pub fn decision(&self, proposal_id: &str) -> Option<Decision> {
        self.state.lock().decisions.get(proposal_id).cloned()
    }

    /// All decisions, oldest first.
    pub fn decisions(&self) -> Vec<Decision> {
        let mut decisions: Vec<Decision> = self.state.lock().decisions.values().cloned().collect();
        decisions.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.proposal_id.cmp(&b.proposal_id))
        });
        decisions
    }

    /// Local state of a proposal.
    pub fn proposal(&self, proposal_id: &str) -> Option<ConsensusProposal> {
        self.state.lock().proposals.get(proposal_id).cloned()
    }

    /// Number of proposals with buffered votes.
    pub fn buffered_count(&self) -> usize {
        self.state.lock().buffered.len()
    }

    /// Number of votes buffered for one proposal.
    pub fn buffered_votes(&self, proposal_id: &str) -> usize {
        self.state
            .lock()
            .buffered
            .get(proposal_id)
            .map_or(0, |b| b.votes.len())
    }
}

fn count_vote(proposal: &mut ConsensusProposal, voter: String, phase: VotePhase) {
    match phase {
        VotePhase::Prepare => {
            proposal.prepare_votes.insert(voter);
        }
        VotePhase::Commit => {
            proposal.commit_votes.insert(voter);
        }
    }
}

fn payload_is_empty(payload: &serde_json::Value) -> bool {
    match payload {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use serde_json::json;

    use super::*;

    /// Engines wired together by an in-memory queue.
    struct Cluster {
        ids: Vec<String>,
        engines: HashMap<String, ConsensusEngine>,
        silent: HashSet<String>,
        queue: VecDeque<(String, String, Message)>,
    }

    impl Cluster {
        fn new(n: usize) -> Self {
            let ids: Vec<String> = (0..n).map(|i| format!("n{i}")).collect();
            let engines = ids
                .iter()
                .map(|id| (id.clone(), ConsensusEngine::new(id.clone())))
                .collect();
            Self {
                ids,
                engines,
                silent: HashSet::new(),
                queue: VecDeque::new(),
            }
        }

        fn members(&self, of: &str) -> HashSet<String> {
            self.ids.iter().filter(|id| *id != of).cloned().collect()
        }

        fn broadcast(&mut self, from: &str, message: Message) {
            for to in self.ids.clone() {
                if to != from {
                    self.queue.push_back((from.to_string(), to, message.clone()));
                }
            }
        }

        fn apply(&mut self, from: &str, actions: Vec<ConsensusAction>) {
            for action in actions {
                if let ConsensusAction::Broadcast(message) = action {
                    self.broadcast(from, message);
                }
            }
        }

        fn propose(&mut self, proposer: &str) -> (String, oneshot::Receiver<Decision>) {
            let (pp, rx) = self.engines[proposer]
                .begin_proposal(json!({ "op": "set" }))
                .unwrap();
            let id = pp.proposal_id.clone();
            let members = self.members(proposer);
            let actions = self.engines[proposer]
                .handle_pre_prepare(proposer, pp.clone(), &members, 0)
                .unwrap();
            self.broadcast(proposer, Message::ConsensusProposal(pp));
            self.apply(proposer, actions);
            (id, rx)
        }

        fn run(&mut self) {
            while let Some((from, to, message)) = self.queue.pop_front() {
                if self.silent.contains(&to) || self.silent.contains(&from) {
                    continue;
                }
                let members = self.members(&to);
                let engine = &self.engines[&to];
                let result = match message {
                    Message::ConsensusProposal(pp) => engine.handle_pre_prepare(&from, pp, &members, 0),
                    Message::ConsensusVote(vote) => engine.handle_vote(&from, vote, &members, 0),
                    _ => Ok(Vec::new()),
                };
                if let Ok(actions) = result {
                    self.apply(&to, actions);
                }
            }
        }
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(7), 5);
        assert_eq!(quorum_size(10), 7);
        assert_eq!(quorum_size(0), 1);
    }

    #[test]
    fn single_node_executes_alone() {
        let engine = ConsensusEngine::new("solo");
        let (pp, mut rx) = engine.begin_proposal(json!(1)).unwrap();
        let actions = engine
            .handle_pre_prepare("solo", pp, &HashSet::new(), 5)
            .unwrap();
        assert!(actions
            .iter()
            .any(|a| matches!(a, ConsensusAction::Executed(d) if d.participant_count == 1)));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn executes_with_up_to_f_silent_nodes() {
        for (n, f) in [(4, 1), (7, 2), (10, 3)] {
            for silent in 0..=f {
                let mut cluster = Cluster::new(n);
                for i in 0..silent {
                    cluster.silent.insert(format!("n{}", n - 1 - i));
                }
                let (id, mut rx) = cluster.propose("n0");
                cluster.run();

                let decision = rx.try_recv().unwrap_or_else(|_| {
                    panic!("n={n} silent={silent} should decide")
                });
                assert!(decision.participant_count >= 2 * f + 1);
                for node in &cluster.ids {
                    if !cluster.silent.contains(node) {
                        assert!(cluster.engines[node].decision(&id).is_some());
                    }
                }
            }
        }
    }

    #[test]
    fn stalls_with_more_than_f_silent_nodes() {
        let mut cluster = Cluster::new(4);
        cluster.silent.insert("n2".into());
        cluster.silent.insert("n3".into());
        let (id, mut rx) = cluster.propose("n0");
        cluster.run();

        assert!(rx.try_recv().is_err());
        assert!(cluster.engines["n0"].decision(&id).is_none());
        assert_eq!(cluster.engines["n0"].proposal(&id).unwrap().phase, Phase::Prepare);
    }

    #[test]
    fn repeated_commits_do_not_execute_twice() {
        let mut cluster = Cluster::new(4);
        let (id, _rx) = cluster.propose("n0");
        cluster.run();

        let engine = &cluster.engines["n1"];
        let before = engine.decision(&id).unwrap();
        let members = cluster.members("n1");
        for voter in ["n0", "n2", "n3"] {
            let vote = ConsensusVote {
                proposal_id: id.clone(),
                phase: VotePhase::Commit,
                view: 0,
                sequence: 1,
            };
            let actions = engine.handle_vote(voter, vote, &members, 99).unwrap();
            assert!(actions.is_empty());
        }
        assert_eq!(engine.decision(&id).unwrap(), before);
        assert_eq!(engine.decisions().len(), 1);
    }

    #[test]
    fn early_votes_are_buffered_and_replayed() {
        let engine = ConsensusEngine::new("n1");
        let members: HashSet<String> = ["n0", "n2", "n3"].iter().map(|s| s.to_string()).collect();
        let pp = PrePrepare {
            proposal_id: "p-1".into(),
            payload: json!("value"),
            view: 0,
            sequence: 1,
        };
        let prepare = || ConsensusVote {
            proposal_id: "p-1".into(),
            phase: VotePhase::Prepare,
            view: 0,
            sequence: 1,
        };

        assert_eq!(
            engine.handle_vote("n0", prepare(), &members, 0),
            Err(ConsensusError::UnknownProposal("p-1".into()))
        );
        let _ = engine.handle_vote("n2", prepare(), &members, 0);
        assert_eq!(engine.buffered_count(), 1);

        let actions = engine.handle_pre_prepare("n0", pp, &members, 0).unwrap();
        // Own prepare plus two replayed ones reach the quorum of 3.
        assert_eq!(engine.proposal("p-1").unwrap().phase, Phase::Commit);
        assert_eq!(actions.len(), 2);
        assert_eq!(engine.buffered_count(), 0);
    }

    #[test]
    fn repeated_early_votes_are_buffered_once() {
        let engine = ConsensusEngine::new("n1");
        let members: HashSet<String> = ["n0", "n2", "n3"].iter().map(|s| s.to_string()).collect();
        let vote = |phase| ConsensusVote {
            proposal_id: "ghost".into(),
            phase,
            view: 0,
            sequence: 1,
        };

        for _ in 0..10_000 {
            let _ = engine.handle_vote("n0", vote(VotePhase::Prepare), &members, 0);
        }
        assert_eq!(engine.buffered_votes("ghost"), 1);

        let _ = engine.handle_vote("n0", vote(VotePhase::Commit), &members, 0);
        let _ = engine.handle_vote("n2", vote(VotePhase::Prepare), &members, 0);
        assert_eq!(engine.buffered_votes("ghost"), 3);
    }

    #[test]
    fn early_votes_from_non_members_are_not_buffered() {
        let engine = ConsensusEngine::new("n1");
        let members: HashSet<String> = ["n0"].iter().map(|s| s.to_string()).collect();
        let vote = ConsensusVote {
            proposal_id: "ghost".into(),
            phase: VotePhase::Prepare,
            view: 0,
            sequence: 1,
        };

        assert_eq!(engine.handle_vote("mallory", vote, &members, 0), Ok(Vec::new()));
        assert_eq!(engine.buffered_count(), 0);
    }

    #[test]
    fn decisions_are_pruned_after_their_retention() {
        let engine = ConsensusEngine::new("n0");
        let (pp, _rx) = engine.begin_proposal(json!("x")).unwrap();
        let id = pp.proposal_id.clone();
        engine.handle_pre_prepare("n0", pp, &HashSet::new(), 1_000).unwrap();
        assert!(engine.decision(&id).is_some());

        engine.collect_garbage(2_500, 1_000, 5_000);
        assert!(engine.proposal(&id).is_none());
        assert!(engine.decision(&id).is_some());

        engine.collect_garbage(6_001, 1_000, 5_000);
        assert!(engine.decision(&id).is_none());
    }

    #[test]
    fn votes_from_non_members_are_ignored() {
        let engine = ConsensusEngine::new("n1");
        let members: HashSet<String> = ["n0"].iter().map(|s| s.to_string()).collect();
        let pp = PrePrepare {
            proposal_id: "p-2".into(),
            payload: json!(true),
            view: 0,
            sequence: 1,
        };
        engine.handle_pre_prepare("n0", pp, &members, 0).unwrap();

        let vote = ConsensusVote {
            proposal_id: "p-2".into(),
            phase: VotePhase::Prepare,
            view: 0,
            sequence: 1,
        };
        engine.handle_vote("mallory", vote, &members, 0).unwrap();
        assert!(!engine
            .proposal("p-2")
            .unwrap()
            .prepare_votes
            .contains("mallory"));
    }

    #[test]
    fn malformed_pre_prepares_are_rejected() {
        let engine = ConsensusEngine::new("n1");
        let members = HashSet::new();
        let missing_id = PrePrepare {
            proposal_id: String::new(),
            payload: json!(1),
            view: 0,
            sequence: 1,
        };
        assert!(matches!(
            engine.handle_pre_prepare("n0", missing_id, &members, 0),
            Err(ConsensusError::InvalidProposal(_))
        ));

        let missing_payload = PrePrepare {
            proposal_id: "p".into(),
            payload: serde_json::Value::Null,
            view: 0,
            sequence: 1,
        };
        assert!(engine
            .handle_pre_prepare("n0", missing_payload, &members, 0)
            .is_err());
        assert!(engine.begin_proposal(json!({})).is_err());
    }

    #[test]
    fn garbage_collection_drops_stale_undecided_state() {
        let engine = ConsensusEngine::new("n1");
        let members: HashSet<String> = ["n0", "n2", "n3"].iter().map(|s| s.to_string()).collect();
        let (pp, rx) = engine.begin_proposal(json!("x")).unwrap();
        let id = pp.proposal_id.clone();
        engine.handle_pre_prepare("n1", pp, &members, 1_000).unwrap();

        assert!(engine.collect_garbage(1_500, 1_000, 10_000).is_empty());
        assert_eq!(engine.collect_garbage(2_001, 1_000, 10_000), vec![id.clone()]);
        assert!(engine.proposal(&id).is_none());

        let mut rx = rx;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn departed_voters_are_forgotten() {
        let engine = ConsensusEngine::new("n1");
        let members: HashSet<String> = ["n0", "n2", "n3"].iter().map(|s| s.to_string()).collect();
        let pp = PrePrepare {
            proposal_id: "p-3".into(),
            payload: json!(1),
            view: 0,
            sequence: 1,
        };
        engine.handle_pre_prepare("n0", pp, &members, 0).unwrap();
        let vote = ConsensusVote {
            proposal_id: "p-3".into(),
            phase: VotePhase::Prepare,
            view: 0,
            sequence: 1,
        };
        engine.handle_vote("n0", vote, &members, 0).unwrap();

        engine.forget_peer("n0");
        assert_eq!(
            engine.proposal("p-3").unwrap().prepare_votes,
            BTreeSet::from(["n1".to_string()])
        );
    }
}
