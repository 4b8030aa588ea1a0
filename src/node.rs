use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::action::Action;
use crate::codec::MAX_DATAGRAM;
use crate::error::Result;
use crate::log::{Applied, LogContainer};
use crate::runtime::{Event, ReplyTo, StateMachine};
use crate::state::{Candidate, Follower, Leader, Role};
use crate::storage::{Metadata, Persistence};
use crate::timer::Timer;
use crate::types::{
    AppendEntries, AppendEntriesResponse, ClientRequest, ClientResponse, Cluster, InstallSnapshot,
    InstallSnapshotResponse, LogEntry, LogIndex, Message, NodeId, Packet, Payload, RequestVote,
    RequestVoteResponse, Snapshot, Term,
};

/// Upper bound on entries carried by one AppendEntries. The encoded size of
/// the datagram bounds the batch as well.
const MAX_ENTRIES_PER_MESSAGE: usize = 64;

/// Raw snapshot bytes per InstallSnapshot chunk. Base64 grows this by a third,
/// which still leaves room for the envelope and membership in one datagram.
const SNAPSHOT_CHUNK: usize = 32 * 1024;

/// Room left for the term, index and commit fields to grow between the size
/// check of a new command and the datagrams that later carry it.
const HEADER_SLACK: usize = 64;

/// A Raft node. Sans-IO: events go in through [`Node::dispatch`], and the
/// side effects come back as [`Action`]s only after everything they depend on
/// has been persisted.
pub struct Node<S: StateMachine, P: Persistence<S::Command>> {
    id: NodeId,
    current_term: Term,
    voted_for: Option<NodeId>,
    cluster: Cluster,
    leader_id: Option<NodeId>,
    role: Role,
    log: LogContainer<S::Command>,
    /// Latest snapshot, sent to peers whose nextIndex fell below the watermark.
    snapshot: Snapshot,
    /// A snapshot being received in chunks, with the leader term it came in.
    incoming: Option<(Term, Snapshot)>,
    /// Membership to fall back on when the log holds no configuration.
    base_cluster: Cluster,
    /// Index of the entry removing this node, once a leave is in progress.
    leaving: Option<LogIndex>,
    state_machine: S,
    persistence: P,
    timer: Box<dyn Timer>,
    /// Client replies waiting for their entry to be applied.
    pending: HashMap<LogIndex, ReplyTo<S::Output>>,
    outbox: Vec<Action<S>>,
    meta_dirty: bool,
    log_dirty: bool,
    stopped: bool,
}

impl<S, P> Node<S, P>
where
    S: StateMachine,
    P: Persistence<S::Command>,
{
    /// Restore a node from `persistence`. `bootstrap` seeds the membership:
    /// persisted members win over it, and the latest membership entry in the
    /// log (or snapshot) wins over both.
    pub fn new(
        id: NodeId,
        bootstrap: Cluster,
        mut state_machine: S,
        persistence: P,
        mut timer: Box<dyn Timer>,
    ) -> Result<Self> {
        let metadata = persistence.read_metadata()?.unwrap_or_default();
        let snapshot = persistence.read_snapshot()?.unwrap_or_default();
        let entries = persistence.read_log_entries()?;

        if snapshot.last_included_index > LogIndex::default() {
            state_machine.restore(&snapshot.data)?;
        }
        let log = LogContainer::new(
            snapshot.last_included_index,
            snapshot.last_included_term,
            snapshot.cluster.clone(),
            entries,
        )?;

        let mut base_cluster = metadata.cluster;
        for (peer, addr) in bootstrap {
            base_cluster.entry(peer).or_insert(addr);
        }
        let cluster = log.config().unwrap_or(&base_cluster).clone();

        info!(
            node = %id,
            term = %metadata.current_term,
            last_index = %log.last_index(),
            snapshot = %snapshot.last_included_index,
            members = cluster.len(),
            "restored node"
        );

        let deadline = timer.next();
        Ok(Self {
            id,
            current_term: metadata.current_term,
            voted_for: metadata.voted_for,
            cluster,
            leader_id: None,
            role: Role::Follower(Follower::new(deadline)),
            log,
            snapshot,
            incoming: None,
            base_cluster,
            leaving: None,
            state_machine,
            persistence,
            timer,
            pending: HashMap::new(),
            outbox: Vec::new(),
            meta_dirty: true,
            log_dirty: false,
            stopped: false,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn leader_addr(&self) -> Option<SocketAddr> {
        self.leader_id
            .and_then(|leader| self.cluster.get(&leader).copied())
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    pub fn log(&self) -> &LogContainer<S::Command> {
        &self.log
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    /// Time left before the election timer fires; `None` for a leader.
    pub fn seconds_until_timeout(&self) -> Option<Duration> {
        let now = self.timer.now();
        self.role
            .deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// True once the node has left the cluster; further events are ignored.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Process one event. State changes are persisted before the resulting
    /// actions are returned; if persisting fails the actions are discarded.
    pub fn dispatch(&mut self, event: Event<S>) -> Result<Vec<Action<S>>> {
        if self.stopped {
            return Ok(Vec::new());
        }
        debug!(node = %self.id, term = %self.current_term, event = event.kind(), "dispatch");

        let result = self.route(event).and_then(|()| self.save());
        match result {
            Ok(()) => Ok(std::mem::take(&mut self.outbox)),
            Err(err) => {
                self.outbox.clear();
                Err(err)
            }
        }
    }

    fn route(&mut self, event: Event<S>) -> Result<()> {
        match event {
            Event::Tick => self.on_tick(),
            Event::BroadcastHeartbeat => self.broadcast_heartbeat(),
            Event::Message { from, message } => self.on_message(from, message),
            Event::Client { request, reply_to } => self.on_client_request(request, reply_to),
            Event::Leave => self.leave(),
        }
    }

    fn peers(&self) -> Vec<NodeId> {
        self.cluster
            .keys()
            .copied()
            .filter(|&peer| peer != self.id)
            .collect()
    }

    fn send(&mut self, to: NodeId, message: Message<S::Command>) {
        self.outbox.push(Action::Send { to, message });
    }

    fn reply(&mut self, to: ReplyTo<S::Output>, response: ClientResponse<S::Output>) {
        if matches!(to, ReplyTo::Discard) {
            return;
        }
        self.outbox.push(Action::Reply { to, response });
    }

    fn not_leader(&self) -> ClientResponse<S::Output> {
        ClientResponse::NotLeader {
            leader_id: self.leader_id,
            leader_addr: self.leader_addr(),
        }
    }

    fn on_tick(&mut self) -> Result<()> {
        if self.role.is_leader() {
            return self.broadcast_heartbeat();
        }
        match self.role.deadline() {
            Some(deadline) if self.timer.now() >= deadline => self.start_election(),
            _ => Ok(()),
        }
    }

    /// §5.2: increment the term, vote for self, ask every peer for a vote.
    fn start_election(&mut self) -> Result<()> {
        if !self.cluster.contains_key(&self.id) {
            debug!(node = %self.id, "not a cluster member, skipping election");
            self.role = Role::Follower(Follower::new(self.timer.next()));
            return Ok(());
        }

        self.current_term = self.current_term.increment();
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.meta_dirty = true;
        let candidate = Candidate::new(self.id, self.timer.next());
        let won = candidate.has_majority(&self.cluster);
        self.role = Role::Candidate(candidate);
        info!(node = %self.id, term = %self.current_term, "starting election");

        if won {
            return self.become_leader();
        }

        let request = RequestVote {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.peers() {
            self.send(peer, Message::RequestVote(request.clone()));
        }
        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        let last = self.log.last_index();
        self.role = Role::Leader(Leader::new(&self.peers(), last));
        self.leader_id = Some(self.id);
        info!(node = %self.id, term = %self.current_term, "became leader");

        // A no-op from the new term lets entries from earlier terms commit.
        self.log.push(self.current_term, Payload::Noop);
        self.log_dirty = true;
        self.advance_leader_commit();
        self.broadcast_heartbeat()
    }

    /// Drop to follower. A leader stepping down fails every pending reply.
    fn become_follower(&mut self) {
        let was_leader = self.role.is_leader();
        self.role = Role::Follower(Follower::new(self.timer.next()));
        if was_leader {
            info!(node = %self.id, term = %self.current_term, "stepping down");
            let waiting: Vec<_> = self.pending.drain().map(|(_, reply_to)| reply_to).collect();
            for reply_to in waiting {
                let response = self.not_leader();
                self.reply(reply_to, response);
            }
        }
    }

    /// §5.1: a higher term seen anywhere makes this node a follower of it.
    fn step_down(&mut self, term: Term) {
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
        self.meta_dirty = true;
        if !matches!(self.role, Role::Follower(_)) {
            self.become_follower();
        }
    }

    /// Accept `leader_id` as the leader of the current term and restart the
    /// election timer.
    fn follow(&mut self, leader_id: NodeId) {
        if self.leader_id != Some(leader_id) {
            info!(node = %self.id, term = %self.current_term, leader = %leader_id, "following");
        }
        self.leader_id = Some(leader_id);
        let deadline = self.timer.next();
        match &mut self.role {
            Role::Follower(follower) => follower.reset(deadline),
            _ => self.become_follower(),
        }
    }

    fn on_message(&mut self, from: NodeId, message: Message<S::Command>) -> Result<()> {
        if message.term() > self.current_term {
            info!(
                node = %self.id,
                term = %self.current_term,
                observed = %message.term(),
                from = %from,
                "observed newer term"
            );
            self.step_down(message.term());
        }

        match message {
            Message::RequestVote(request) => {
                self.on_request_vote(from, request);
                Ok(())
            }
            Message::RequestVoteResponse(response) => self.on_request_vote_resp(from, response),
            Message::AppendEntries(request) => self.on_append_entries(from, request),
            Message::AppendEntriesResponse(response) => {
                self.on_append_entries_resp(from, response);
                Ok(())
            }
            Message::InstallSnapshot(request) => self.on_install_snapshot(from, request),
            Message::InstallSnapshotResponse(response) => self.on_install_snapshot_resp(from, response),
        }
    }

    /// §5.2, §5.4.1: grant at most one vote per term, and only to a candidate
    /// whose log is at least as up-to-date as ours.
    fn on_request_vote(&mut self, from: NodeId, request: RequestVote) {
        let up_to_date = (request.last_log_term, request.last_log_index)
            >= (self.log.last_term(), self.log.last_index());
        let free = self
            .voted_for
            .map_or(true, |voted| voted == request.candidate_id);
        let granted = request.term >= self.current_term && free && up_to_date;

        if granted {
            self.voted_for = Some(request.candidate_id);
            self.meta_dirty = true;
            let deadline = self.timer.next();
            if let Role::Follower(follower) = &mut self.role {
                follower.reset(deadline);
            }
        }
        debug!(
            node = %self.id,
            term = %self.current_term,
            candidate = %request.candidate_id,
            granted,
            "vote requested"
        );

        self.send(
            from,
            Message::RequestVoteResponse(RequestVoteResponse {
                term: self.current_term,
                vote_granted: granted,
            }),
        );
    }

    fn on_request_vote_resp(&mut self, from: NodeId, response: RequestVoteResponse) -> Result<()> {
        if response.term != self.current_term || !response.vote_granted {
            return Ok(());
        }
        let Role::Candidate(candidate) = &mut self.role else {
            return Ok(());
        };
        candidate.record_vote(from);
        if candidate.has_majority(&self.cluster) {
            return self.become_leader();
        }
        Ok(())
    }

    /// Send every peer what it is missing: log entries from its nextIndex, or
    /// the latest snapshot once that index has been compacted away.
    fn broadcast_heartbeat(&mut self) -> Result<()> {
        let Role::Leader(leader) = &self.role else {
            return Ok(());
        };
        let end = self.log.last_index().next();
        let targets: Vec<(NodeId, LogIndex, u64)> = self
            .peers()
            .into_iter()
            .map(|peer| {
                let next = leader.next_index_for(peer).unwrap_or(end).min(end);
                (peer, next, leader.snapshot_offset(peer))
            })
            .collect();

        for (peer, next, offset) in targets {
            let message = self.replication_message(next, offset)?;
            self.send(peer, message);
        }
        Ok(())
    }

    /// The entries starting at `next`, as many as fit in one datagram, or the
    /// snapshot chunk at `offset` once `next` has been compacted away.
    fn replication_message(&self, next: LogIndex, offset: u64) -> Result<Message<S::Command>> {
        if next <= self.log.last_included_index() {
            return Ok(self.snapshot_chunk(offset));
        }

        let prev_log_index = next.prev().unwrap_or_default();
        let mut request = AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index)?,
            entries: Vec::new(),
            leader_commit: self.log.commit_index(),
        };
        let mut size = self.packet_len(&Message::AppendEntries(request.clone()))?;
        for entry in self.log.entries_from(next).into_iter().take(MAX_ENTRIES_PER_MESSAGE) {
            // One comma between array elements.
            let extra = serde_json::to_vec(&entry)?.len() + usize::from(!request.entries.is_empty());
            if !request.entries.is_empty() && size + extra > MAX_DATAGRAM {
                break;
            }
            size += extra;
            request.entries.push(entry);
        }
        Ok(Message::AppendEntries(request))
    }

    fn snapshot_chunk(&self, offset: u64) -> Message<S::Command> {
        let data = &self.snapshot.data;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(SNAPSHOT_CHUNK).min(data.len());
        Message::InstallSnapshot(InstallSnapshot {
            term: self.current_term,
            leader_id: self.id,
            last_included_index: self.snapshot.last_included_index,
            last_included_term: self.snapshot.last_included_term,
            cluster: self.snapshot.cluster.clone(),
            offset: start as u64,
            data: data[start..end].to_vec(),
            done: end == data.len(),
        })
    }

    /// Encoded size of `message` as a datagram from this node.
    fn packet_len(&self, message: &Message<S::Command>) -> Result<usize> {
        let packet: Packet<S::Command, S::Query> = Packet::Peer {
            from: self.id,
            message: message.clone(),
        };
        Ok(serde_json::to_vec(&packet)?.len())
    }

    /// §5.3: accept entries only if the log contains an entry at prevLogIndex
    /// whose term matches prevLogTerm.
    fn on_append_entries(&mut self, from: NodeId, request: AppendEntries<S::Command>) -> Result<()> {
        if request.term < self.current_term {
            debug!(node = %self.id, term = %self.current_term, stale = %request.term, "rejecting stale append");
            let match_index = self.log.last_index();
            self.reply_append(from, false, match_index);
            return Ok(());
        }

        self.follow(request.leader_id);

        if let Some(hint) = self.conflict_hint(request.prev_log_index, request.prev_log_term) {
            debug!(
                node = %self.id,
                prev = %request.prev_log_index,
                hint = %hint,
                "log inconsistency"
            );
            self.reply_append(from, false, hint);
            return Ok(());
        }

        let last_new = request.prev_log_index.advance(request.entries.len());
        if self.log.append(request.entries)? {
            self.log_dirty = true;
            self.refresh_cluster();
        }
        self.log.commit_through(request.leader_commit.min(last_new));
        self.apply_committed();

        self.reply_append(from, true, last_new);
        Ok(())
    }

    /// `None` when the entry at `prev_index` carries `prev_term`; otherwise the
    /// highest index that may still match the leader.
    fn conflict_hint(&self, prev_index: LogIndex, prev_term: Term) -> Option<LogIndex> {
        let watermark = self.log.last_included_index();
        if prev_index > self.log.last_index() {
            return Some(self.log.last_index());
        }
        if prev_index < watermark {
            return Some(watermark);
        }
        match self.log.term_at(prev_index) {
            Ok(term) if term == prev_term => None,
            Ok(term) => {
                let first = self.log.first_index_of_term(term, prev_index);
                Some(first.prev().unwrap_or_default().max(watermark))
            }
            Err(_) => Some(watermark),
        }
    }

    fn reply_append(&mut self, to: NodeId, success: bool, match_index: LogIndex) {
        self.send(
            to,
            Message::AppendEntriesResponse(AppendEntriesResponse {
                term: self.current_term,
                success,
                match_index,
            }),
        );
    }

    fn on_append_entries_resp(&mut self, from: NodeId, response: AppendEntriesResponse) {
        if response.term != self.current_term {
            return;
        }
        let Role::Leader(leader) = &mut self.role else {
            return;
        };
        if response.success {
            leader.record_success(from, response.match_index);
        } else {
            leader.record_failure(from, response.match_index);
        }
        self.advance_leader_commit();
    }

    /// §7: collect the snapshot chunk by chunk, then replace the state
    /// machine and the compacted log prefix with it.
    fn on_install_snapshot(&mut self, from: NodeId, request: InstallSnapshot) -> Result<()> {
        if request.term < self.current_term {
            let match_index = self.log.commit_index();
            self.reply_snapshot(from, false, match_index, 0);
            return Ok(());
        }

        self.follow(request.leader_id);

        if request.last_included_index <= self.log.last_applied() {
            self.incoming = None;
            let match_index = self.log.last_applied();
            self.reply_snapshot(from, false, match_index, 0);
            return Ok(());
        }

        let mut snapshot = match self.incoming.take() {
            Some((term, partial))
                if request.offset > 0
                    && term == request.term
                    && partial.last_included_index == request.last_included_index
                    && partial.last_included_term == request.last_included_term =>
            {
                partial
            }
            _ => Snapshot {
                last_included_index: request.last_included_index,
                last_included_term: request.last_included_term,
                cluster: Cluster::new(),
                data: Vec::new(),
            },
        };

        let received = snapshot.data.len() as u64;
        if received != request.offset {
            debug!(
                node = %self.id,
                offset = request.offset,
                received,
                "snapshot chunk out of order"
            );
            self.incoming = Some((request.term, snapshot));
            let match_index = self.log.commit_index();
            self.reply_snapshot(from, false, match_index, received);
            return Ok(());
        }

        snapshot.data.extend_from_slice(&request.data);
        if !request.done {
            let received = snapshot.data.len() as u64;
            self.incoming = Some((request.term, snapshot));
            let match_index = self.log.commit_index();
            self.reply_snapshot(from, true, match_index, received);
            return Ok(());
        }

        snapshot.cluster = request.cluster;
        let received = snapshot.data.len() as u64;
        self.state_machine.restore(&snapshot.data)?;
        self.log.install_snapshot(&snapshot);
        self.persistence.save_snapshot(&snapshot)?;
        info!(
            node = %self.id,
            term = %self.current_term,
            index = %snapshot.last_included_index,
            "installed snapshot"
        );
        let installed = snapshot.last_included_index;
        self.snapshot = snapshot;
        self.log_dirty = true;
        self.refresh_cluster();
        self.apply_committed();

        self.reply_snapshot(from, true, installed, received);
        Ok(())
    }

    fn reply_snapshot(&mut self, to: NodeId, success: bool, match_index: LogIndex, offset: u64) {
        self.send(
            to,
            Message::InstallSnapshotResponse(InstallSnapshotResponse {
                term: self.current_term,
                success,
                match_index,
                offset,
            }),
        );
    }

    fn on_install_snapshot_resp(&mut self, from: NodeId, response: InstallSnapshotResponse) -> Result<()> {
        if response.term != self.current_term {
            return Ok(());
        }
        let watermark = self.snapshot.last_included_index;
        let len = self.snapshot.data.len() as u64;
        let Role::Leader(leader) = &mut self.role else {
            return Ok(());
        };
        // Whether or not it installed, the peer holds everything up to
        // match_index as committed.
        leader.record_success(from, response.match_index);
        if response.match_index >= watermark {
            leader.clear_snapshot_offset(from);
        } else {
            let offset = response.offset.min(len);
            leader.set_snapshot_offset(from, offset);
            if response.success && offset < len {
                let chunk = self.snapshot_chunk(offset);
                self.send(from, chunk);
            }
        }
        self.advance_leader_commit();
        Ok(())
    }

    /// §5.3, §5.4: commit the highest index a strict majority of members has
    /// matched, provided it carries the current term.
    fn advance_leader_commit(&mut self) {
        let Role::Leader(leader) = &self.role else {
            return;
        };
        let mut matched: Vec<LogIndex> = self
            .cluster
            .keys()
            .map(|&member| {
                if member == self.id {
                    self.log.last_index()
                } else {
                    leader.match_index_for(member).unwrap_or_default()
                }
            })
            .collect();
        if matched.is_empty() {
            return;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[matched.len() / 2];

        if self.log.advance_commit(candidate, self.current_term) {
            debug!(node = %self.id, commit = %self.log.commit_index(), "commit advanced");
            self.apply_committed();
        }
    }

    /// Apply committed entries and release the replies waiting on them.
    fn apply_committed(&mut self) {
        let mut removed = false;
        for (index, applied) in self.log.apply_pending(&mut self.state_machine) {
            let response = match applied {
                Applied::Output(output) => ClientResponse::Output { output },
                Applied::Membership(cluster) => {
                    removed |= self.leaving.is_some() && !cluster.contains_key(&self.id);
                    ClientResponse::Membership { cluster }
                }
                Applied::Noop => continue,
            };
            if let Some(reply_to) = self.pending.remove(&index) {
                self.reply(reply_to, response);
            }
        }
        self.finish_leave(removed);
    }

    /// Adopt the newest membership recorded in the log. Takes effect as soon
    /// as the entry is appended, committed or not.
    /// A truncation that removes every configuration entry falls back to the
    /// membership the node started with.
    fn refresh_cluster(&mut self) {
        let config = self.log.config().unwrap_or(&self.base_cluster);
        if *config == self.cluster {
            return;
        }
        self.cluster = config.clone();
        self.meta_dirty = true;
        info!(node = %self.id, members = self.cluster.len(), "membership changed");

        let peers = self.peers();
        let last = self.log.last_index();
        if let Role::Leader(leader) = &mut self.role {
            leader.sync_peers(&peers, last);
        }
    }

    fn on_client_request(
        &mut self,
        request: ClientRequest<S::Command, S::Query>,
        reply_to: ReplyTo<S::Output>,
    ) -> Result<()> {
        match request {
            ClientRequest::Leader => {
                let response = ClientResponse::Leader {
                    leader_id: self.leader_id,
                    leader_addr: self.leader_addr(),
                };
                self.reply(reply_to, response);
            }
            _ if !self.role.is_leader() => {
                let response = self.not_leader();
                self.reply(reply_to, response);
            }
            ClientRequest::Command { command } => {
                let size = self.command_len(command.clone())?;
                if size > MAX_DATAGRAM {
                    warn!(node = %self.id, size, "refusing oversized command");
                    let limit = MAX_DATAGRAM;
                    self.reply(reply_to, ClientResponse::TooLarge { size, limit });
                    return Ok(());
                }
                let index = self.log.push(self.current_term, Payload::Command(command));
                self.log_dirty = true;
                self.pending.insert(index, reply_to);
                self.advance_leader_commit();
            }
            ClientRequest::Query { query } => {
                let output = self.state_machine.query(&query);
                self.reply(reply_to, ClientResponse::Output { output });
            }
            ClientRequest::Join {
                peer_id,
                peer_address,
            } => self.on_join(peer_id, peer_address, reply_to),
            ClientRequest::Leave { peer_id } => self.on_leave_request(peer_id, reply_to),
        }
        Ok(())
    }

    /// Size of the datagram that would replicate `command` on its own, plus
    /// some slack for the header fields to grow.
    fn command_len(&self, command: S::Command) -> Result<usize> {
        let last = self.log.last_index();
        let entry = LogEntry::new(last.next(), self.current_term, Payload::Command(command));
        let message = Message::AppendEntries(AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index: last,
            prev_log_term: self.log.last_term(),
            entries: vec![entry],
            leader_commit: self.log.commit_index(),
        });
        Ok(self.packet_len(&message)? + HEADER_SLACK)
    }

    fn on_join(&mut self, peer_id: NodeId, peer_address: SocketAddr, reply_to: ReplyTo<S::Output>) {
        if self.cluster.get(&peer_id) == Some(&peer_address) {
            let cluster = self.cluster.clone();
            self.reply(reply_to, ClientResponse::Membership { cluster });
            return;
        }
        info!(node = %self.id, peer = %peer_id, addr = %peer_address, "adding member");
        let mut cluster = self.cluster.clone();
        cluster.insert(peer_id, peer_address);
        self.propose_config(cluster, reply_to);
        self.advance_leader_commit();
    }

    fn on_leave_request(&mut self, peer_id: NodeId, reply_to: ReplyTo<S::Output>) {
        if !self.cluster.contains_key(&peer_id) || self.cluster.len() == 1 {
            if self.cluster.len() == 1 {
                warn!(node = %self.id, peer = %peer_id, "refusing to remove the last member");
            }
            let cluster = self.cluster.clone();
            self.reply(reply_to, ClientResponse::Membership { cluster });
            return;
        }
        info!(node = %self.id, peer = %peer_id, "removing member");
        let mut cluster = self.cluster.clone();
        cluster.remove(&peer_id);
        let index = self.propose_config(cluster, reply_to);
        if peer_id == self.id {
            self.leaving = Some(index);
        }
        self.advance_leader_commit();
    }

    fn propose_config(&mut self, cluster: Cluster, reply_to: ReplyTo<S::Output>) -> LogIndex {
        let index = self.log.push(self.current_term, Payload::Config(cluster));
        self.log_dirty = true;
        self.pending.insert(index, reply_to);
        self.refresh_cluster();
        index
    }

    /// Leave the cluster. A leader removes itself through the log and stops
    /// once that removal is applied. A follower asks the leader to remove it
    /// and stops right away. Without a known leader the node stays put.
    fn leave(&mut self) -> Result<()> {
        if self.role.is_leader() {
            if self.peers().is_empty() {
                info!(node = %self.id, "last member leaving");
                self.stop();
            } else {
                self.on_leave_request(self.id, ReplyTo::Discard);
            }
            return Ok(());
        }

        let Some(to) = self.leader_addr() else {
            warn!(node = %self.id, "no known leader, staying until one is known");
            return Ok(());
        };
        info!(node = %self.id, leader = %to, "asking leader to remove this node");
        self.outbox.push(Action::Forward {
            to,
            request: ClientRequest::Leave { peer_id: self.id },
        });
        self.stop();
        Ok(())
    }

    /// Stop once a configuration without this node has been applied. If the
    /// removal entry was overwritten by a later leader, ask again.
    fn finish_leave(&mut self, removed: bool) {
        let Some(index) = self.leaving else {
            return;
        };
        let reached = self.log.last_applied() >= index;
        if removed || (reached && !self.cluster.contains_key(&self.id)) {
            info!(node = %self.id, index = %index, "removal applied, leaving");
            if self.role.is_leader() {
                // One last round so the remaining members learn the commit index.
                if let Err(err) = self.broadcast_heartbeat() {
                    warn!(node = %self.id, error = %err, "final heartbeat failed");
                }
            }
            if !matches!(self.role, Role::Follower(_)) {
                self.become_follower();
            }
            self.leaving = None;
            self.stop();
        } else if reached {
            warn!(node = %self.id, index = %index, "removal entry was replaced, leaving again");
            self.leaving = None;
            if let Err(err) = self.leave() {
                warn!(node = %self.id, error = %err, "leave retry failed");
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.outbox.push(Action::Shutdown);
    }

    /// Compact if the log has grown past its limit, then write whatever this
    /// event changed.
    fn save(&mut self) -> Result<()> {
        if self.log.exceeds_limit() && self.log.last_applied() > self.log.last_included_index() {
            let snapshot = self.log.compact(&self.state_machine)?;
            self.persistence.save_snapshot(&snapshot)?;
            debug!(node = %self.id, index = %snapshot.last_included_index, "compacted log");
            self.snapshot = snapshot;
            // Transfers in progress refer to the old snapshot.
            if let Role::Leader(leader) = &mut self.role {
                leader.clear_snapshot_offsets();
            }
            self.log_dirty = true;
        }
        if self.log_dirty {
            self.persistence.save_log_entries(self.log.entries())?;
            self.log_dirty = false;
        }
        if self.meta_dirty {
            self.persistence.save_metadata(&Metadata {
                current_term: self.current_term,
                voted_for: self.voted_for,
                cluster: self.cluster.clone(),
            })?;
            self.meta_dirty = false;
        }
        Ok(())
    }
}
