//! The replicated log: entries after the snapshot watermark plus the commit
//! and apply cursors.

use crate::error::{Error, Result};
use crate::runtime::StateMachine;
use crate::types::{Cluster, LogEntry, LogIndex, Payload, Snapshot, Term};

/// Compaction threshold: a snapshot is taken once more entries than this are
/// retained.
pub const MAX_LOG_ENTRIES: usize = 128;

/// Outcome of applying one committed entry.
#[derive(Clone, Debug, PartialEq)]
pub enum Applied<R> {
    Output(R),
    Membership(Cluster),
    Noop,
}

pub struct LogContainer<C> {
    /// Contiguous, starting at `last_included_index + 1`.
    entries: Vec<LogEntry<C>>,
    last_included_index: LogIndex,
    last_included_term: Term,
    /// Membership captured by the latest snapshot.
    snapshot_cluster: Cluster,
    commit_index: LogIndex,
    last_applied: LogIndex,
}

impl<C: Clone> LogContainer<C> {
    /// Rebuild the log from a snapshot watermark and the persisted entries.
    /// Entries already covered by the snapshot are dropped; everything up to
    /// the watermark counts as committed and applied.
    pub fn new(
        last_included_index: LogIndex,
        last_included_term: Term,
        snapshot_cluster: Cluster,
        entries: Vec<LogEntry<C>>,
    ) -> Result<Self> {
        let mut log = Self {
            entries: Vec::with_capacity(entries.len()),
            last_included_index,
            last_included_term,
            snapshot_cluster,
            commit_index: last_included_index,
            last_applied: last_included_index,
        };
        for entry in entries {
            if entry.index <= last_included_index {
                continue;
            }
            log.push_entry(entry)?;
        }
        Ok(log)
    }

    pub fn last_included_index(&self) -> LogIndex {
        self.last_included_index
    }

    pub fn last_included_term(&self) -> Term {
        self.last_included_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn first_index(&self) -> LogIndex {
        self.last_included_index.next()
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map_or(self.last_included_index, |entry| entry.index)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map_or(self.last_included_term, |entry| entry.term)
    }

    /// Number of retained (uncompacted) entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry<C>] {
        &self.entries
    }

    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry<C>> {
        if index <= self.last_included_index {
            return None;
        }
        self.entries
            .get(index.offset_from(self.last_included_index) - 1)
    }

    /// Term of the entry at `index`. The watermark itself answers with the
    /// snapshot's term; anything below it or past the end is out of range.
    pub fn term_at(&self, index: LogIndex) -> Result<Term> {
        if index == self.last_included_index {
            return Ok(self.last_included_term);
        }
        self.entry_at(index)
            .map(|entry| entry.term)
            .ok_or(Error::IndexOutOfRange {
                index,
                first: self.last_included_index,
                last: self.last_index(),
            })
    }

    /// Clones of the entries from `start` (clamped to the first retained
    /// entry) to the end of the log.
    pub fn entries_from(&self, start: LogIndex) -> Vec<LogEntry<C>> {
        let skip = start.max(self.first_index()).offset_from(self.first_index());
        self.entries.get(skip..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// First index holding `term`, scanning back from `from`. Used to build
    /// the back-off hint on a consistency-check failure.
    pub fn first_index_of_term(&self, term: Term, from: LogIndex) -> LogIndex {
        let mut index = from;
        while index > self.first_index() {
            match self.entry_at(index.prev().unwrap_or_default()) {
                Some(entry) if entry.term == term => index = entry.index,
                _ => break,
            }
        }
        index
    }

    /// Leader-side append of a new entry at the end of the log.
    pub fn push(&mut self, term: Term, payload: Payload<C>) -> LogIndex {
        let index = self.last_index().next();
        self.entries.push(LogEntry::new(index, term, payload));
        index
    }

    /// Follower-side append. Entries at or below the watermark and entries
    /// already present with the same term are skipped; the first entry whose
    /// term differs from the local one truncates the local suffix. A matching
    /// prefix is never removed, so stale or duplicated requests cannot shorten
    /// the log. Returns whether the log changed.
    pub fn append(&mut self, entries: Vec<LogEntry<C>>) -> Result<bool> {
        let mut changed = false;
        for entry in entries {
            if entry.index <= self.last_included_index {
                continue;
            }
            match self.entry_at(entry.index).map(|existing| existing.term) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    let keep = entry.index.offset_from(self.last_included_index) - 1;
                    self.entries.truncate(keep);
                }
                None => {}
            }
            self.push_entry(entry)?;
            changed = true;
        }
        Ok(changed)
    }

    fn push_entry(&mut self, entry: LogEntry<C>) -> Result<()> {
        let last = self.last_index();
        if entry.index != last.next() {
            return Err(Error::NonContiguous {
                index: entry.index,
                last,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Membership from the most recent config entry, falling back to the
    /// snapshot's. `None` when neither has ever recorded one.
    pub fn config(&self) -> Option<&Cluster> {
        self.entries
            .iter()
            .rev()
            .find_map(|entry| match &entry.payload {
                Payload::Config(cluster) => Some(cluster),
                _ => None,
            })
            .or_else(|| (!self.snapshot_cluster.is_empty()).then_some(&self.snapshot_cluster))
    }

    /// Membership in effect at `index`.
    fn config_at(&self, index: LogIndex) -> Cluster {
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.index <= index)
            .find_map(|entry| match &entry.payload {
                Payload::Config(cluster) => Some(cluster.clone()),
                _ => None,
            })
            .unwrap_or_else(|| self.snapshot_cluster.clone())
    }

    /// Leader commit rule: move to `candidate` only if it is ahead of the
    /// current commit index, present in the log, and was created in
    /// `current_term`. Entries from earlier terms commit indirectly.
    pub fn advance_commit(&mut self, candidate: LogIndex, current_term: Term) -> bool {
        if candidate <= self.commit_index {
            return false;
        }
        match self.entry_at(candidate) {
            Some(entry) if entry.term == current_term => {
                self.commit_index = candidate;
                true
            }
            _ => false,
        }
    }

    /// Follower commit rule: raise the commit index to `index`, capped at the
    /// last local entry. Never lowers it.
    pub fn commit_through(&mut self, index: LogIndex) -> bool {
        let target = index.min(self.last_index());
        if target <= self.commit_index {
            return false;
        }
        self.commit_index = target;
        true
    }

    /// Apply every committed but unapplied entry in log order.
    pub fn apply_pending<S>(&mut self, state_machine: &mut S) -> Vec<(LogIndex, Applied<S::Output>)>
    where
        S: StateMachine<Command = C>,
    {
        let mut applied = Vec::new();
        while self.last_applied < self.commit_index {
            let index = self.last_applied.next();
            let Some(entry) = self.entry_at(index) else {
                break;
            };
            let outcome = match &entry.payload {
                Payload::Command(command) => Applied::Output(state_machine.apply(command.clone())),
                Payload::Config(cluster) => Applied::Membership(cluster.clone()),
                Payload::Noop => Applied::Noop,
            };
            self.last_applied = index;
            applied.push((index, outcome));
        }
        applied
    }

    pub fn exceeds_limit(&self) -> bool {
        self.entries.len() > MAX_LOG_ENTRIES
    }

    /// Fold every applied entry into a snapshot of `state_machine` and drop
    /// those entries. The state machine must reflect exactly `last_applied`.
    pub fn compact<S>(&mut self, state_machine: &S) -> Result<Snapshot>
    where
        S: StateMachine<Command = C>,
    {
        let index = self.last_applied;
        let term = self.term_at(index)?;
        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            cluster: self.config_at(index),
            data: state_machine.snapshot()?,
        };
        self.drop_until_last_applied(&snapshot);
        Ok(snapshot)
    }

    fn drop_until_last_applied(&mut self, snapshot: &Snapshot) {
        let covered = snapshot
            .last_included_index
            .offset_from(self.last_included_index);
        self.entries.drain(..covered.min(self.entries.len()));
        self.last_included_index = snapshot.last_included_index;
        self.last_included_term = snapshot.last_included_term;
        self.snapshot_cluster = snapshot.cluster.clone();
    }

    /// Replace the log prefix with a snapshot received from the leader. The
    /// suffix after the snapshot point survives only if it extends the same
    /// history; otherwise the whole log is discarded.
    pub fn install_snapshot(&mut self, snapshot: &Snapshot) {
        let consistent = self
            .term_at(snapshot.last_included_index)
            .is_ok_and(|term| term == snapshot.last_included_term);
        if consistent {
            self.drop_until_last_applied(snapshot);
        } else {
            self.entries.clear();
            self.last_included_index = snapshot.last_included_index;
            self.last_included_term = snapshot.last_included_term;
            self.snapshot_cluster = snapshot.cluster.clone();
        }
        self.commit_index = self.commit_index.max(snapshot.last_included_index);
        self.last_applied = self.last_applied.max(snapshot.last_included_index);
    }
}
