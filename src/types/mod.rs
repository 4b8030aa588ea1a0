mod bytes;
mod log;
mod message;
mod primitives;

pub use log::{LogEntry, Payload, Snapshot};
pub use message::{
    AppendEntries, AppendEntriesResponse, ClientRequest, ClientResponse, InstallSnapshot,
    InstallSnapshotResponse, Message, Packet, RequestVote, RequestVoteResponse,
};
pub use primitives::{Cluster, LogIndex, NodeId, Term};
