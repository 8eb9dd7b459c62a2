//! Volatile and per-state-variant server state (spec §3).
//!
//! A tagged union keyed by server state, as the spec's design notes ask for:
//! each variant owns exactly the fields that only make sense in that state,
//! and a transition out of a variant drops its resources (leader -> follower
//! frees the progress table and any pending membership change).

use crate::config::Role;
use crate::ids::{Index, ServerId, Term};
use crate::progress::Progress;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Follower,
    Candidate,
    Leader,
    /// Entered when `load()` reports `Corrupt`; the instance no longer
    /// participates and every call fails (spec §7).
    Unavailable,
}

pub struct FollowerState {
    pub randomized_election_timeout: u64,
    pub current_leader: Option<ServerId>,
}

pub struct CandidateState {
    pub randomized_election_timeout: u64,
    pub votes: HashMap<ServerId, bool>,
}

impl CandidateState {
    pub fn granted_count(&self) -> usize {
        self.votes.values().filter(|v| **v).count()
    }
}

/// A membership change the leader is waiting to see committed.
pub struct PendingConfigChange {
    pub entry_index: Index,
}

/// Catch-up state for a server being promoted to voter (spec §4.5).
pub struct PromotionRound {
    pub promotee_id: ServerId,
    pub round_number: u32,
    pub round_index: Index,
    pub round_start: u64,
}

/// Leadership transfer in progress (spec §4.7).
pub struct TransferState {
    pub target: ServerId,
    pub deadline: u64,
    pub sent_timeout_now: bool,
}

pub struct LeaderState {
    pub progress: HashMap<ServerId, Progress>,
    pub pending_change: Option<PendingConfigChange>,
    pub promotion: Option<PromotionRound>,
    pub transfer: Option<TransferState>,
    /// Start of the current quorum-liveness window (spec §4.4): the
    /// step-down check and the `recent_recv` flags it resets both fire at
    /// most once per `election_timeout`, not on every tick.
    pub step_down_check_start: u64,
}

impl LeaderState {
    pub fn new(last_log_index: Index, peers: impl Iterator<Item = ServerId>, now: u64) -> Self {
        let progress = peers.map(|id| (id, Progress::new(last_log_index))).collect();
        LeaderState {
            progress,
            pending_change: None,
            promotion: None,
            transfer: None,
            step_down_check_start: now,
        }
    }
}

pub enum ServerState {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
    Unavailable,
}

impl ServerState {
    pub fn lifecycle(&self) -> Lifecycle {
        match self {
            ServerState::Follower(_) => Lifecycle::Follower,
            ServerState::Candidate(_) => Lifecycle::Candidate,
            ServerState::Leader(_) => Lifecycle::Leader,
            ServerState::Unavailable => Lifecycle::Unavailable,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, ServerState::Leader(_))
    }

    pub fn as_leader(&self) -> Option<&LeaderState> {
        match self {
            ServerState::Leader(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_leader_mut(&mut self) -> Option<&mut LeaderState> {
        match self {
            ServerState::Leader(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_follower(&self) -> Option<&FollowerState> {
        match self {
            ServerState::Follower(f) => Some(f),
            _ => None,
        }
    }
}

/// Persistent state that must be durable before any dependent RPC reply or
/// FSM apply (spec §3).
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
}

impl PersistentState {
    pub fn new() -> Self {
        PersistentState {
            current_term: Term::ZERO,
            voted_for: None,
        }
    }
}

impl Default for PersistentState {
    fn default() -> Self {
        Self::new()
    }
}

/// Volatile state common to all servers (spec §3).
pub struct VolatileState {
    pub commit_index: Index,
    pub last_applied: Index,
    pub last_stored: Index,
    pub election_timer_start: u64,
    pub current_leader: Option<ServerId>,
    /// Mirrors the log entry at `max(configuration_index, configuration_uncommitted_index)`.
    pub configuration_index: Index,
    pub configuration_uncommitted_index: Index,
    pub this_server_id: ServerId,
    pub this_server_role: Role,
}

impl VolatileState {
    pub fn new(this_server_id: ServerId) -> Self {
        VolatileState {
            commit_index: Index::NONE,
            last_applied: Index::NONE,
            last_stored: Index::NONE,
            election_timer_start: 0,
            current_leader: None,
            configuration_index: Index::NONE,
            configuration_uncommitted_index: Index::NONE,
            this_server_id,
            this_server_role: Role::Voter,
        }
    }
}
