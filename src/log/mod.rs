//! The in-memory replicated log (spec §4.1).
//!
//! The live window is a `VecDeque`, which is itself implemented as a
//! geometrically-growing ring buffer in the standard library — exactly the
//! resize policy spec §4.1 asks for, without hand-rolling one. A side table
//! tracks reference counts per `(term, index)` so that truncated entries
//! whose payload is still referenced by an in-flight I/O request (spec §5)
//! stay alive until every holder has released it.

mod entry;

pub use entry::{Entry, EntryKind};

use crate::error::{RaftError, Result};
use crate::ids::{Index, Term};
use std::collections::{HashMap, HashSet, VecDeque};

pub type BatchId = u64;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotBoundary {
    pub last_index: Index,
    pub last_term: Term,
}

struct RefCount {
    count: u32,
    batch: Option<BatchId>,
}

pub struct Log {
    /// Entries at `[first_index, first_index + live.len())`, in order.
    live: VecDeque<Entry>,
    /// Index of the first entry after the snapshot boundary; also the index
    /// the next `append` must target when `live` is empty.
    first_index: Index,
    snapshot: SnapshotBoundary,
    /// Refcounts for every entry the log has ever appended and not yet fully
    /// released, including ones that were truncated out of `live` but are
    /// still held by an outstanding I/O request.
    refs: HashMap<(Term, Index), RefCount>,
    /// Entries kept alive purely because an external holder still has a
    /// reference, after the log itself released its own.
    zombies: HashMap<(Term, Index), Entry>,
    batches: HashMap<BatchId, HashSet<(Term, Index)>>,
    next_batch_id: BatchId,
}

impl Log {
    pub fn new() -> Self {
        Log {
            live: VecDeque::new(),
            first_index: Index(1),
            snapshot: SnapshotBoundary::default(),
            refs: HashMap::new(),
            zombies: HashMap::new(),
            batches: HashMap::new(),
            next_batch_id: 1,
        }
    }

    pub fn first_index(&self) -> Index {
        self.first_index
    }

    pub fn last_index(&self) -> Index {
        match self.live.back() {
            Some(e) => e.index,
            None => self.snapshot.last_index,
        }
    }

    pub fn last_term(&self) -> Term {
        match self.live.back() {
            Some(e) => e.term,
            None => self.snapshot.last_term,
        }
    }

    pub fn snapshot_boundary(&self) -> SnapshotBoundary {
        self.snapshot
    }

    fn offset_of(&self, index: Index) -> Option<usize> {
        if index.0 < self.first_index.0 {
            return None;
        }
        let offset = (index.0 - self.first_index.0) as usize;
        if offset >= self.live.len() {
            None
        } else {
            Some(offset)
        }
    }

    /// Looks up an entry still in the live window. Returns `None` if the
    /// index predates the snapshot, is beyond `last_index`, or (per spec
    /// §4.1) is exactly the snapshot boundary — callers must consult
    /// `snapshot_boundary()` for that case.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        self.offset_of(index).map(|off| &self.live[off])
    }

    /// The term at `index`, or `None` if we don't have it (caller should
    /// fall back to snapshot metadata or an InstallSnapshot, per spec §4.1).
    /// Index 0 always yields term 0.
    pub fn term_at(&self, index: Index) -> Option<Term> {
        if index.is_none() {
            return Some(Term::ZERO);
        }
        if index == self.snapshot.last_index {
            return Some(self.snapshot.last_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Appends a single entry. `entry.index` must be exactly `last_index()+1`.
    pub fn append(&mut self, entry: Entry) -> Result<()> {
        self.append_batch(vec![entry], None).map(|_| ())
    }

    /// Appends a contiguous batch of entries that arrived together (e.g. in
    /// one AppendEntries RPC). If `batch` is `Some`, the entries share a
    /// logical batch id: the batch is only considered fully released once
    /// every member's refcount reaches zero (spec §4.1).
    pub fn append_batch(&mut self, entries: Vec<Entry>, batch: Option<()>) -> Result<Option<BatchId>> {
        if entries.is_empty() {
            return Ok(None);
        }

        let mut expected = self.last_index().next();
        for e in &entries {
            if e.index != expected {
                return Err(RaftError::Invalid(format!(
                    "log append out of order: expected index {}, got {}",
                    expected, e.index
                )));
            }
            expected = expected.next();
        }

        self.live
            .try_reserve(entries.len())
            .map_err(|_| RaftError::NoMem)?;

        let batch_id = if batch.is_some() {
            let id = self.next_batch_id;
            self.next_batch_id += 1;
            Some(id)
        } else {
            None
        };

        let mut members = HashSet::new();
        for e in entries {
            let key = (e.term, e.index);
            members.insert(key);
            self.refs.insert(
                key,
                RefCount {
                    count: 1,
                    batch: batch_id,
                },
            );
            self.live.push_back(e);
        }

        if let Some(id) = batch_id {
            self.batches.insert(id, members);
        }

        Ok(batch_id)
    }

    /// Adds an extra logical reference, e.g. for an outstanding send that
    /// must keep the payload alive even if the log truncates its own copy.
    /// Returns the entry's payload so the caller can hand it to the backend.
    pub fn acquire(&mut self, index: Index) -> Option<Entry> {
        let entry = self.get(index).or_else(|| {
            self.zombies
                .iter()
                .find(|(k, _)| k.1 == index)
                .map(|(_, v)| v)
        })?;
        let term = entry.term;
        let cloned = entry.clone();
        if let Some(rc) = self.refs.get_mut(&(term, index)) {
            rc.count += 1;
        }
        Some(cloned)
    }

    /// Releases a previously `acquire`d reference. When the count reaches
    /// zero the payload is dropped (and, if part of a batch, the batch is
    /// considered released once every member hits zero).
    pub fn release(&mut self, term: Term, index: Index) {
        self.release_key((term, index));
    }

    fn release_key(&mut self, key: (Term, Index)) {
        let Some(rc) = self.refs.get_mut(&key) else {
            return;
        };
        rc.count = rc.count.saturating_sub(1);
        if rc.count > 0 {
            return;
        }
        let batch = rc.batch;
        self.refs.remove(&key);
        self.zombies.remove(&key);

        if let Some(batch_id) = batch {
            if let Some(members) = self.batches.get_mut(&batch_id) {
                members.remove(&key);
                if members.is_empty() {
                    self.batches.remove(&batch_id);
                    tracing::trace!(batch_id, "released batch buffer");
                }
            }
        }
    }

    /// Removes entries with `index >= from_index` (used to resolve a log
    /// conflict with a leader). Releases the log's own hold on each removed
    /// entry; an entry with an outstanding external reference survives in
    /// `zombies` until that reference is also released.
    pub fn truncate_suffix(&mut self, from_index: Index) -> Result<()> {
        if from_index.0 < self.first_index.0 {
            return Err(RaftError::Invalid(
                "cannot truncate before the first index".into(),
            ));
        }
        while let Some(last) = self.live.back() {
            if last.index.0 < from_index.0 {
                break;
            }
            let entry = self.live.pop_back().unwrap();
            let key = (entry.term, entry.index);
            if self.refs.get(&key).map(|rc| rc.count).unwrap_or(0) > 1 {
                self.zombies.insert(key, entry);
            }
            self.release_key(key);
        }
        Ok(())
    }

    /// Removes entries with `index <= up_to_index`, typically after
    /// installing a snapshot. If `up_to_index >= last_index()` the log
    /// becomes empty and the next append starts at `up_to_index + 1`.
    pub fn truncate_prefix(&mut self, up_to_index: Index) -> Result<()> {
        while let Some(front) = self.live.front() {
            if front.index.0 > up_to_index.0 {
                break;
            }
            let entry = self.live.pop_front().unwrap();
            let key = (entry.term, entry.index);
            if self.refs.get(&key).map(|rc| rc.count).unwrap_or(0) > 1 {
                self.zombies.insert(key, entry);
            }
            self.release_key(key);
        }
        if up_to_index.0 >= self.first_index.0 {
            self.first_index = up_to_index.next();
        }
        Ok(())
    }

    /// Replaces the log wholesale with the boundary of an installed
    /// snapshot (spec §4.6): all prior entries are discarded.
    pub fn restore(&mut self, boundary: SnapshotBoundary) {
        self.live.clear();
        self.refs.clear();
        self.zombies.clear();
        self.batches.clear();
        self.snapshot = boundary;
        self.first_index = boundary.last_index.next();
    }

    /// Entries in `[from, to]`, inclusive, clamped to what's present.
    pub fn range(&self, from: Index, to: Index) -> Vec<Entry> {
        if from.0 > to.0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut i = from;
        while i.0 <= to.0 {
            match self.get(i) {
                Some(e) => out.push(e.clone()),
                None => break,
            }
            i = i.next();
        }
        out
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    #[cfg(test)]
    fn total_refs(&self) -> u32 {
        self.refs.values().map(|rc| rc.count).sum()
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(term: u64, index: u64) -> Entry {
        Entry {
            term: Term(term),
            index: Index(index),
            kind: EntryKind::Command,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn append_requires_contiguous_index() {
        let mut log = Log::new();
        log.append(entry(1, 1)).unwrap();
        assert!(log.append(entry(1, 3)).is_err());
        log.append(entry(1, 2)).unwrap();
        assert_eq!(log.last_index(), Index(2));
    }

    #[test]
    fn no_gaps_in_live_window() {
        let mut log = Log::new();
        for i in 1..=5 {
            log.append(entry(1, i)).unwrap();
        }
        for i in 1..=5 {
            assert!(log.get(Index(i)).is_some());
        }
        assert_eq!(log.first_index(), Index(1));
        assert_eq!(log.last_index(), Index(5));
    }

    #[test]
    fn truncate_suffix_releases_refs() {
        let mut log = Log::new();
        for i in 1..=5 {
            log.append(entry(1, i)).unwrap();
        }
        log.truncate_suffix(Index(3)).unwrap();
        assert_eq!(log.last_index(), Index(2));
        assert!(log.get(Index(3)).is_none());
        assert_eq!(log.total_refs(), 2);
    }

    #[test]
    fn truncated_entry_survives_while_externally_held() {
        let mut log = Log::new();
        log.append(entry(1, 1)).unwrap();
        log.append(entry(1, 2)).unwrap();

        let held = log.acquire(Index(2)).unwrap();
        assert_eq!(held.index, Index(2));

        log.truncate_suffix(Index(2)).unwrap();
        assert!(log.get(Index(2)).is_none());
        // Still referenced once (by the outstanding holder).
        assert_eq!(log.total_refs(), 1);

        log.release(Term(1), Index(2));
        assert_eq!(log.total_refs(), 0);
    }

    #[test]
    fn truncate_prefix_after_snapshot_advances_first_index() {
        let mut log = Log::new();
        for i in 1..=5 {
            log.append(entry(1, i)).unwrap();
        }
        log.truncate_prefix(Index(5)).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.first_index(), Index(6));
    }

    #[test]
    fn restore_replaces_log_with_snapshot_boundary() {
        let mut log = Log::new();
        for i in 1..=5 {
            log.append(entry(1, i)).unwrap();
        }
        log.restore(SnapshotBoundary {
            last_index: Index(100),
            last_term: Term(3),
        });
        assert!(log.is_empty());
        assert_eq!(log.first_index(), Index(101));
        assert_eq!(log.term_at(Index(100)), Some(Term(3)));
    }

    #[test]
    fn batch_release_waits_for_every_member() {
        let mut log = Log::new();
        log.append_batch(vec![entry(1, 1), entry(1, 2)], Some(())).unwrap();
        log.acquire(Index(1));
        log.truncate_suffix(Index(1)).unwrap();
        // Index 1 is held externally; index 2 was only held by the log and
        // is gone once truncated.
        assert!(log.zombies.contains_key(&(Term(1), Index(1))));
        assert!(!log.refs.contains_key(&(Term(1), Index(2))));
        log.release(Term(1), Index(1));
        assert!(log.zombies.is_empty());
    }

    #[test]
    fn append_with_gap_fails() {
        let mut log = Log::new();
        assert!(log.append(entry(1, 5)).is_err());
    }
}
