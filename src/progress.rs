//! Per-follower leader-side replication tracking (spec §4.4).
//!
//! Naming follows the conventions common to modern Raft libraries
//! (`next_index`/`match_index`), adapted to the synchronous, tick-driven
//! core instead of a spawned task per peer.

use crate::ids::Index;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// One entry at a time, waiting for an ack before sending more.
    Probe,
    /// Optimistic batching: send ahead of acks.
    Pipeline,
    /// An InstallSnapshot transfer is in flight.
    Snapshot,
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub mode: ReplicationMode,
    pub next_index: Index,
    pub match_index: Index,
    /// Set while `mode == Snapshot`: the boundary being transferred.
    pub snapshot_index: Index,
    pub last_send_time: u64,
    /// Whether any message was received from this peer within the last
    /// election timeout; reset at each leader step-down check (spec §4.4).
    pub recent_recv: bool,
}

impl Progress {
    pub fn new(last_log_index: Index) -> Self {
        Progress {
            mode: ReplicationMode::Probe,
            next_index: last_log_index.next(),
            match_index: Index::NONE,
            snapshot_index: Index::NONE,
            last_send_time: 0,
            recent_recv: false,
        }
    }

    /// Applies a successful AppendEntries ack covering up to `last_sent`.
    pub fn on_append_success(&mut self, last_sent: Index) {
        if last_sent.0 > self.match_index.0 {
            self.match_index = last_sent;
        }
        self.next_index = self.match_index.next();
        self.mode = ReplicationMode::Pipeline;
    }

    /// Applies a rejected AppendEntries, backing off per the conflict hint.
    pub fn on_append_rejected(&mut self, conflict_hint: Index, follower_last_log_index: Index) {
        let candidate = follower_last_log_index.next();
        self.next_index = Index(conflict_hint.0.min(candidate.0)).max(Index(1));
        self.mode = ReplicationMode::Probe;
    }

    pub fn begin_snapshot(&mut self, boundary: Index) {
        self.mode = ReplicationMode::Snapshot;
        self.snapshot_index = boundary;
    }

    pub fn on_snapshot_complete(&mut self) {
        self.next_index = self.snapshot_index.next();
        self.match_index = self.snapshot_index;
        self.mode = ReplicationMode::Probe;
    }

    pub fn needs_snapshot(&self, snapshot_last_index: Index) -> bool {
        self.next_index.0 <= snapshot_last_index.0 && snapshot_last_index.0 > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_probe_with_next_index_after_leader_last() {
        let p = Progress::new(Index(5));
        assert_eq!(p.mode, ReplicationMode::Probe);
        assert_eq!(p.next_index, Index(6));
        assert_eq!(p.match_index, Index::NONE);
    }

    #[test]
    fn success_advances_match_and_switches_to_pipeline() {
        let mut p = Progress::new(Index(5));
        p.on_append_success(Index(3));
        assert_eq!(p.match_index, Index(3));
        assert_eq!(p.next_index, Index(4));
        assert_eq!(p.mode, ReplicationMode::Pipeline);
    }

    #[test]
    fn rejection_backs_off_to_probe() {
        let mut p = Progress::new(Index(5));
        p.mode = ReplicationMode::Pipeline;
        p.on_append_rejected(Index(2), Index(1));
        assert_eq!(p.mode, ReplicationMode::Probe);
        assert_eq!(p.next_index, Index(2));
    }
}
