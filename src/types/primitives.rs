use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Monotonically increasing term number.
///
/// Terms act as logical clocks in Raft and are used to detect stale information.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Term(u64);

impl Term {
    pub fn increment(self) -> Term {
        Term(self.0.saturating_add(1))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Term(value)
    }
}

/// 1-based log index.
///
/// LogIndex 0 represents "no entries" or "before the first entry". Indices are
/// global: compaction never renumbers or reuses them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogIndex(u64);

impl LogIndex {
    pub fn next(self) -> LogIndex {
        LogIndex(self.0.saturating_add(1))
    }

    pub fn prev(self) -> Option<LogIndex> {
        self.0.checked_sub(1).map(LogIndex)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Distance from `base` to `self`, zero when `self` is not above `base`.
    pub fn offset_from(self, base: LogIndex) -> usize {
        self.0.saturating_sub(base.0) as usize
    }

    /// Index `count` positions after `self`.
    pub fn advance(self, count: usize) -> LogIndex {
        LogIndex(self.0.saturating_add(count as u64))
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        LogIndex(value)
    }
}

/// Unique server identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

/// Cluster membership: every voting member and the address it listens on.
pub type Cluster = BTreeMap<NodeId, SocketAddr>;
