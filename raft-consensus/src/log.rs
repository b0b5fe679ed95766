//! The replicated log.
//!
//! Index 0 holds a sentinel entry (term 0, empty command) so that every
//! AppendEntries carries a valid `prev_log_index` and the "empty log" case
//! needs no special handling. Real entries start at index 1.

use serde::{Deserialize, Serialize};

/// Election epoch.
pub type Term = u64;

/// Position in the log. 0 is the sentinel.
pub type LogIndex = u64;

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The leader term in which this entry was created.
    pub term: Term,
    /// Opaque command for the application.
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: Term, command: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            command: command.into(),
        }
    }

    fn sentinel() -> Self {
        Self {
            term: 0,
            command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    pub fn new() -> Self {
        Self {
            entries: vec![LogEntry::sentinel()],
        }
    }

    /// Rebuilds a log from its full entry vector, sentinel included.
    ///
    /// Returns `None` if the first entry is not a sentinel.
    pub fn from_entries(entries: Vec<LogEntry>) -> Option<Self> {
        match entries.first() {
            Some(first) if first.term == 0 && first.command.is_empty() => Some(Self { entries }),
            _ => None,
        }
    }

    /// All entries, sentinel included.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Number of slots including the sentinel, i.e. the index the next
    /// appended entry will receive.
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    /// True when the log holds nothing but the sentinel.
    pub fn is_empty(&self) -> bool {
        self.entries.len() == 1
    }

    pub fn last_index(&self) -> LogIndex {
        self.len() - 1
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |entry| entry.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        self.entries.get(usize::try_from(index).ok()?)
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.get(index).map(|entry| entry.term)
    }

    /// Appends an entry and returns its index.
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.last_index()
    }

    /// Clones up to `max` entries starting at `from`.
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = (from.max(1) as usize).min(self.entries.len());
        let end = start.saturating_add(max).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// Clones the entries in `from..=to`, clamped to the log.
    pub fn slice(&self, from: LogIndex, to: LogIndex) -> Vec<(LogIndex, LogEntry)> {
        (from.max(1)..=to.min(self.last_index()))
            .filter_map(|index| self.get(index).map(|entry| (index, entry.clone())))
            .collect()
    }

    /// True if the entry at `index` exists and carries `term`.
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Smallest index of the run of entries sharing the term stored at
    /// `index`, scanning backwards from `index`.
    pub fn first_index_of_term_at(&self, index: LogIndex) -> LogIndex {
        let Some(term) = self.term_at(index) else {
            return self.len();
        };
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Largest index holding an entry of `term`, if any.
    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .rposition(|entry| entry.term == term)
            .map(|pos| pos as LogIndex)
            .filter(|index| *index > 0)
    }

    /// Merges `incoming` into the log right after `prev_index`.
    ///
    /// Entries that already match (same index and term) are kept in place;
    /// only the suffix starting at the first divergence is truncated and
    /// replaced. A shorter or stale batch never truncates matching entries.
    /// Returns true if the log changed.
    pub fn reconcile(&mut self, prev_index: LogIndex, incoming: Vec<LogEntry>) -> bool {
        let mut insert_at = prev_index as usize + 1;
        let mut skip = 0;
        while skip < incoming.len()
            && insert_at < self.entries.len()
            && self.entries[insert_at].term == incoming[skip].term
        {
            insert_at += 1;
            skip += 1;
        }
        if skip == incoming.len() {
            return false;
        }
        self.entries.truncate(insert_at);
        self.entries.extend(incoming.into_iter().skip(skip));
        true
    }

    /// True if a log ending at (`last_index`, `last_term`) is at least as
    /// up to date as this one.
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }
}
