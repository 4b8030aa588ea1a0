use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::log::LogEntry;
use super::primitives::{Cluster, LogIndex, NodeId, Term};

/// RequestVote RPC arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments. An empty `entries` is a heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries<C> {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry<C>>,
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
///
/// On success `match_index` is the last index known to match the leader. On
/// failure it is a back-off hint: the highest index that may still match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
}

/// InstallSnapshot RPC arguments (§7). Snapshot data is sent in chunks:
/// `data` holds the bytes starting at `offset`, and `done` marks the last one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshot {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub cluster: Cluster,
    pub offset: u64,
    #[serde(with = "super::bytes")]
    pub data: Vec<u8>,
    pub done: bool,
}

/// InstallSnapshot RPC response. `match_index` is what the follower now holds
/// as committed, whether or not the snapshot was installed. `offset` is how
/// many bytes of the snapshot in flight the follower has received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
    pub offset: u64,
}

/// All messages exchanged between nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message<C> {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries<C>),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl<C> Message<C> {
    /// The sender's term, used for step-down on every inbound message.
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResponse(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesResponse(m) => m.term,
            Message::InstallSnapshot(m) => m.term,
            Message::InstallSnapshotResponse(m) => m.term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote(_) => "request_vote",
            Message::RequestVoteResponse(_) => "request_vote_resp",
            Message::AppendEntries(_) => "append_entries",
            Message::AppendEntriesResponse(_) => "append_entries_resp",
            Message::InstallSnapshot(_) => "install_snapshot",
            Message::InstallSnapshotResponse(_) => "install_snapshot_resp",
        }
    }
}

/// Requests a client (or a leaving node) sends to a server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRequest<C, Q> {
    /// Who is the leader? Answered by any node.
    Leader,
    Command { command: C },
    Query { query: Q },
    Join { peer_id: NodeId, peer_address: SocketAddr },
    Leave { peer_id: NodeId },
}

impl<C, Q> ClientRequest<C, Q> {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::Leader => "leader",
            ClientRequest::Command { .. } => "command",
            ClientRequest::Query { .. } => "query",
            ClientRequest::Join { .. } => "join",
            ClientRequest::Leave { .. } => "leave",
        }
    }
}

/// Replies to client requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientResponse<R> {
    Leader {
        leader_id: Option<NodeId>,
        leader_addr: Option<SocketAddr>,
    },
    /// The state machine's output for a committed command or a query.
    Output { output: R },
    /// The membership after a committed join or leave.
    Membership { cluster: Cluster },
    /// This node cannot serve the request; retry against the hinted leader.
    NotLeader {
        leader_id: Option<NodeId>,
        leader_addr: Option<SocketAddr>,
    },
    /// The command would not fit in one replication datagram.
    TooLarge { size: usize, limit: usize },
}

/// A datagram addressed to a server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Packet<C, Q> {
    Peer { from: NodeId, message: Message<C> },
    Client { request: ClientRequest<C, Q> },
}
