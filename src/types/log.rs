use serde::{Deserialize, Serialize};

use super::primitives::{Cluster, LogIndex, Term};

/// What a log entry carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload<C> {
    /// Appended by a new leader so entries from earlier terms can commit.
    Noop,
    /// An application command for the state machine.
    Command(C),
    /// The complete membership that takes effect once this entry is in the log.
    Config(Cluster),
}

/// A single entry in the replicated log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub index: LogIndex,
    pub term: Term,
    pub payload: Payload<C>,
}

impl<C> LogEntry<C> {
    pub fn new(index: LogIndex, term: Term, payload: Payload<C>) -> Self {
        Self { index, term, payload }
    }
}

/// Handler state folded together with the log prefix it replaces.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Membership as of `last_included_index`.
    pub cluster: Cluster,
    #[serde(with = "super::bytes")]
    pub data: Vec<u8>,
}
