use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use crate::types::{Cluster, LogIndex, NodeId};

/// §5.1: followers are passive. They only respond to RPCs from leaders and
/// candidates; if no communication arrives before the deadline they start an
/// election.
pub struct Follower {
    deadline: Instant,
}

impl Follower {
    pub fn new(deadline: Instant) -> Self {
        Self { deadline }
    }

    pub fn reset(&mut self, deadline: Instant) {
        self.deadline = deadline;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// §5.2: a candidate votes for itself and wins once a majority of the current
/// cluster has granted it a vote in this term.
pub struct Candidate {
    deadline: Instant,
    votes_received: BTreeSet<NodeId>,
}

impl Candidate {
    pub fn new(self_id: NodeId, deadline: Instant) -> Self {
        Self {
            deadline,
            votes_received: BTreeSet::from([self_id]),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns false if this voter was already counted.
    pub fn record_vote(&mut self, from: NodeId) -> bool {
        self.votes_received.insert(from)
    }

    pub fn votes(&self) -> usize {
        self.votes_received.len()
    }

    // Only votes from current members count: ⌊N/2⌋ + 1 out of N.
    pub fn has_majority(&self, cluster: &Cluster) -> bool {
        let granted = self
            .votes_received
            .iter()
            .filter(|id| cluster.contains_key(id))
            .count();
        granted > cluster.len() / 2
    }
}

/// Figure 2, volatile state on leaders (reinitialized after election).
pub struct Leader {
    next_index: HashMap<NodeId, LogIndex>,  // next log index to send to each peer
    match_index: HashMap<NodeId, LogIndex>, // highest log index known to be replicated
    /// Bytes of the current snapshot each lagging peer has acknowledged.
    snapshot_offsets: HashMap<NodeId, u64>,
}

impl Leader {
    // nextIndex starts optimistic at last + 1, matchIndex conservative at 0.
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        Self {
            next_index: peers.iter().map(|&p| (p, last_log_index.next())).collect(),
            match_index: peers.iter().map(|&p| (p, LogIndex::default())).collect(),
            snapshot_offsets: HashMap::new(),
        }
    }

    pub fn next_index_for(&self, peer: NodeId) -> Option<LogIndex> {
        self.next_index.get(&peer).copied()
    }

    pub fn match_index_for(&self, peer: NodeId) -> Option<LogIndex> {
        self.match_index.get(&peer).copied()
    }

    pub fn match_indices(&self) -> impl Iterator<Item = LogIndex> + '_ {
        self.match_index.values().copied()
    }

    /// Update peer progress after successful replication. matchIndex never
    /// moves backwards, so a reordered older response cannot undo progress.
    pub fn record_success(&mut self, from: NodeId, match_index: LogIndex) {
        let Some(current) = self.match_index.get_mut(&from) else {
            return;
        };
        *current = (*current).max(match_index);
        let matched = *current;
        self.next_index.insert(from, matched.next());
    }

    /// Back off after a failed consistency check, jumping straight past the
    /// follower's hint when it is lower. Never drops below 1.
    pub fn record_failure(&mut self, from: NodeId, hint: LogIndex) {
        if let Some(next) = self.next_index.get_mut(&from) {
            let stepped = next.prev().unwrap_or_default().min(hint.next());
            *next = stepped.max(LogIndex::from(1));
        }
    }

    /// Bring the progress table in line with a new membership: new peers start
    /// at last + 1, removed peers are forgotten.
    pub fn sync_peers(&mut self, peers: &[NodeId], last_log_index: LogIndex) {
        self.next_index.retain(|id, _| peers.contains(id));
        self.match_index.retain(|id, _| peers.contains(id));
        self.snapshot_offsets.retain(|id, _| peers.contains(id));
        for &peer in peers {
            self.next_index.entry(peer).or_insert(last_log_index.next());
            self.match_index.entry(peer).or_default();
        }
    }

    /// Where the next snapshot chunk for `peer` starts.
    pub fn snapshot_offset(&self, peer: NodeId) -> u64 {
        self.snapshot_offsets.get(&peer).copied().unwrap_or_default()
    }

    pub fn set_snapshot_offset(&mut self, peer: NodeId, offset: u64) {
        self.snapshot_offsets.insert(peer, offset);
    }

    pub fn clear_snapshot_offset(&mut self, peer: NodeId) {
        self.snapshot_offsets.remove(&peer);
    }

    /// Restart every transfer, for when the snapshot itself is replaced.
    pub fn clear_snapshot_offsets(&mut self) {
        self.snapshot_offsets.clear();
    }
}

/// Server role with its role-specific state. Replaced wholesale on every
/// transition.
pub enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }

    /// Election deadline; leaders have none.
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Role::Follower(follower) => Some(follower.deadline()),
            Role::Candidate(candidate) => Some(candidate.deadline()),
            Role::Leader(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Follower(_) => "follower",
            Role::Candidate(_) => "candidate",
            Role::Leader(_) => "leader",
        }
    }
}
