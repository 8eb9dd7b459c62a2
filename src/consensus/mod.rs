//! The consensus core (spec §2, §4, §5).
//!
//! `ConsensusModule` is a pure, synchronous state machine: every public
//! entry point mutates in-memory state and returns an [`Effects`] value
//! describing what the embedder must do to the outside world (persist,
//! send, apply). It never performs I/O itself — that split is what lets the
//! core remain single-threaded and reentrant (spec §5) while `driver::Raft`
//! does the actual talking to the `IoBackend`/`Fsm`, mirroring the teacher's
//! `ConsensusModule` + `Tick` split in `consensus_orig.rs`, generalized from
//! "the embedder applies a batch of side effects once per tick" to "every
//! entry point returns the side effects for that one event", since spec §5
//! calls for callback-driven reentry rather than a single tick-shaped batch.

mod election;
mod membership;
mod replication;
mod snapshot;
mod transfer;

use crate::config::Configuration;
use crate::error::{RaftError, Result};
use crate::ids::{Index, ServerId, Term};
use crate::io::SnapshotMetadata;
use crate::log::Log;
use crate::rpc::{Envelope, Message};
use crate::state::{FollowerState, Lifecycle, PersistentState, ServerState, VolatileState};

/// Tunable knobs (spec §6, "Configuration knobs").
#[derive(Debug, Clone, Copy)]
pub struct RaftConfig {
    pub election_timeout_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub snapshot_threshold: u64,
    pub snapshot_trailing: u64,
    /// Max entries sent in one AppendEntries while in pipeline mode.
    pub max_append_batch: usize,
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_ms == 0 {
            return Err(RaftError::Invalid("election_timeout must be > 0".into()));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(RaftError::Invalid("heartbeat_timeout must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_timeout_ms: 1000,
            heartbeat_timeout_ms: 100,
            snapshot_threshold: 1024,
            snapshot_trailing: 128,
            max_append_batch: 64,
        }
    }
}

/// A request the driver must send to the user FSM's `snapshot()` and then
/// hand to `IoBackend::snapshot_put`.
pub struct SnapshotPutRequest {
    pub trailing: u64,
    pub last_index: Index,
    pub last_term: Term,
    pub configuration: Configuration,
    pub configuration_index: Index,
}

/// Side effects produced by a single entry point into the core. The driver
/// executes these against the `IoBackend`/`Fsm` and, where an operation is
/// asynchronous, feeds the completion back into the matching `on_*_done`
/// method below.
#[derive(Default)]
pub struct Effects {
    pub persist_term: bool,
    pub persist_vote: bool,
    /// Entries that must become durable before anything in `outbound` that
    /// depends on them (spec §5 ordering guarantee) is actually sent. The
    /// driver calls `IoBackend::append` and only dispatches `outbound`'s
    /// dependent replies once that completes.
    pub append_entries: Option<(Vec<crate::log::Entry>, Vec<Envelope>)>,
    pub truncate_from: Option<Index>,
    /// Messages ready to send immediately (no pending durability wait).
    pub outbound: Vec<Envelope>,
    /// Commit index advanced; the driver should apply FSM commands for
    /// newly committed `Command` entries up to and including this index.
    pub apply_up_to: Option<Index>,
    pub snapshot_put: Option<SnapshotPutRequest>,
    /// An incoming snapshot the core has decided to adopt; driver persists
    /// it via `IoBackend::snapshot_put` equivalent storage path and then
    /// calls `on_snapshot_installed`.
    pub adopt_snapshot: Option<(SnapshotMetadata, ServerId)>,
    pub next_tick_ms: Option<u64>,
    pub shutdown: bool,
}

impl Effects {
    fn merge(&mut self, mut other: Effects) {
        self.persist_term |= other.persist_term;
        self.persist_vote |= other.persist_vote;
        if other.append_entries.is_some() {
            self.append_entries = other.append_entries.take();
        }
        if other.truncate_from.is_some() {
            self.truncate_from = other.truncate_from;
        }
        self.outbound.append(&mut other.outbound);
        if other.apply_up_to.is_some() {
            self.apply_up_to = other.apply_up_to;
        }
        if other.snapshot_put.is_some() {
            self.snapshot_put = other.snapshot_put.take();
        }
        if other.adopt_snapshot.is_some() {
            self.adopt_snapshot = other.adopt_snapshot.take();
        }
        if other.next_tick_ms.is_some() {
            self.next_tick_ms = other.next_tick_ms;
        }
        self.shutdown |= other.shutdown;
    }
}

/// The full consensus state machine for one server (spec §3).
pub struct ConsensusModule {
    pub(crate) persistent: PersistentState,
    pub(crate) volatile: VolatileState,
    pub(crate) server_state: ServerState,
    pub(crate) log: Log,
    pub(crate) configuration: Configuration,
    /// The configuration this instance was constructed with, with no backing
    /// log entry (`configuration_index` stays `Index::NONE` for it). Kept
    /// around so a revert after a truncated `ConfigChange` has something to
    /// fall back to when the committed configuration predates the log
    /// (spec §4.5).
    pub(crate) bootstrap_configuration: Configuration,
    pub(crate) snapshot: Option<SnapshotMetadata>,
    pub(crate) config: RaftConfig,
    pub(crate) self_id: ServerId,
}

impl ConsensusModule {
    pub fn new(self_id: ServerId, configuration: Configuration, config: RaftConfig) -> Self {
        ConsensusModule {
            persistent: PersistentState::new(),
            volatile: VolatileState::new(self_id),
            server_state: ServerState::Follower(FollowerState {
                randomized_election_timeout: config.election_timeout_ms,
                current_leader: None,
            }),
            log: Log::new(),
            bootstrap_configuration: configuration.clone(),
            configuration,
            snapshot: None,
            config,
            self_id,
        }
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.server_state.lifecycle()
    }

    pub fn is_leader(&self) -> bool {
        self.server_state.is_leader()
    }

    pub fn current_leader(&self) -> Option<ServerId> {
        self.volatile.current_leader
    }

    pub fn commit_index(&self) -> Index {
        self.volatile.commit_index
    }

    pub fn voted_for(&self) -> Option<ServerId> {
        self.persistent.voted_for
    }

    /// Public wrapper so the driver can re-check heartbeats right after a
    /// client request appends a new entry, without waiting for the next tick.
    pub fn send_due_heartbeats_pub(&mut self, now: u64) -> Effects {
        self.send_due_heartbeats(now)
    }

    /// Public wrapper so the driver can re-check config-commit bookkeeping
    /// immediately after applying entries, without waiting for the next tick.
    pub fn check_config_commit_pub(&mut self, now: u64) {
        self.check_config_commit(now)
    }

    pub fn is_voter_here(&self) -> bool {
        self.configuration.is_voter(self.self_id)
    }

    fn other_voter_ids(&self) -> Vec<ServerId> {
        self.configuration
            .voter_ids()
            .filter(|id| *id != self.self_id)
            .collect()
    }

    fn replication_peer_ids(&self) -> Vec<ServerId> {
        self.configuration
            .replication_target_ids()
            .filter(|id| *id != self.self_id)
            .collect()
    }

    /// Quorum count among voters, including self when self is a voter.
    fn quorum(&self) -> usize {
        self.configuration.quorum()
    }

    fn reset_election_timer(&mut self, now: u64, randomized_timeout: u64) {
        self.volatile.election_timer_start = now;
        match &mut self.server_state {
            ServerState::Follower(f) => f.randomized_election_timeout = randomized_timeout,
            ServerState::Candidate(c) => c.randomized_election_timeout = randomized_timeout,
            _ => {}
        }
    }

    fn pick_randomized_timeout(&self, rand_fn: &dyn Fn(u64, u64) -> u64) -> u64 {
        rand_fn(self.config.election_timeout_ms, 2 * self.config.election_timeout_ms)
    }

    /// Dispatches an inbound RPC to the appropriate handler (spec §4.8).
    pub fn recv(&mut self, from: ServerId, message: Message, now: u64, rand_fn: &dyn Fn(u64, u64) -> u64) -> Effects {
        match message {
            Message::RequestVoteRequest(req) => self.handle_request_vote(from, req, now),
            Message::RequestVoteResponse(resp) => self.handle_request_vote_response(from, resp, now, rand_fn),
            Message::AppendEntriesRequest(req) => self.handle_append_entries(from, req, now),
            Message::AppendEntriesResponse(resp) => self.handle_append_entries_response(from, resp, now),
            Message::InstallSnapshotRequest(req) => self.handle_install_snapshot(from, req, now),
            Message::InstallSnapshotResponse(resp) => self.handle_install_snapshot_response(from, resp, now),
            Message::TimeoutNow(msg) => self.handle_timeout_now(from, msg, now, rand_fn),
        }
    }

    /// Periodic tick (spec §4.8): apply, advance durability, timers,
    /// heartbeats, snapshot threshold, transfer deadline. The driver
    /// applies committed entries and advances `last_stored` itself (it owns
    /// the FSM and the append completions); this just covers timers.
    pub fn tick(&mut self, now: u64, rand_fn: &dyn Fn(u64, u64) -> u64) -> Effects {
        let mut effects = Effects::default();
        self.check_config_commit(now);
        effects.merge(self.check_election_timer(now, rand_fn));
        effects.merge(self.check_leader_step_down(now));
        effects.merge(self.check_promotion_round(now));
        effects.merge(self.send_due_heartbeats(now));
        effects.merge(self.check_snapshot_threshold());
        effects.merge(self.check_transfer_deadline(now));
        effects.next_tick_ms = Some(self.config.heartbeat_timeout_ms.min(self.config.election_timeout_ms));
        effects
    }

    /// Called by the driver once previously queued entries are durable, so
    /// the core can release its internal bookkeeping and emit any replies
    /// that were waiting on that durability.
    pub fn on_last_stored_advanced(&mut self, last_stored: Index) {
        if last_stored.0 > self.volatile.last_stored.0 {
            self.volatile.last_stored = last_stored;
        }
    }

    /// Commits newly durable entries to the FSM boundary tracked separately
    /// by the driver; returns nothing because application itself is the
    /// driver's job (it owns the `Fsm`). Kept here only to document the
    /// invariant: `last_applied <= commit_index <= last_stored`.
    pub fn mark_applied(&mut self, index: Index) {
        if index.0 > self.volatile.last_applied.0 {
            self.volatile.last_applied = index;
        }
    }
}

