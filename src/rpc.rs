//! Wire message types exchanged between servers (spec §4.3-§4.7, §6).
//!
//! These mirror the RPC shapes in the teacher's `protos.rs`, extended with
//! the InstallSnapshot and TimeoutNow messages the teacher only stubbed out.

use crate::ids::{Index, ServerId, Term};
use crate::log::Entry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: Index,
    pub last_log_term: Term,
    /// Set when this vote request was triggered by a leadership transfer
    /// (spec §4.7): bypasses the disruption-suppression check below.
    pub disrupt_leader: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: ServerId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub leader_commit: Index,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// When `success` is false, the first index in the follower's log for
    /// `conflict_term` (or the follower's log length if it has none),
    /// letting the leader skip straight past the conflicting term (spec
    /// §4.3) instead of backing off one index at a time.
    pub conflict_term: Option<Term>,
    pub conflict_index: Index,
    /// Echoes the end of `entries` that was applied, so the leader can
    /// advance `match_index` even if responses are reordered in flight.
    pub last_log_index: Index,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: ServerId,
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub offset: u64,
    pub data: bytes::Bytes,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    /// Bytes received so far, so the leader can resume a dropped transfer
    /// from the right offset instead of restarting it.
    pub bytes_received: u64,
}

/// Sent by a leader beginning a leadership transfer (spec §4.7), instructing
/// the target to start an election immediately rather than waiting out its
/// normal election timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutNow {
    pub term: Term,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    RequestVoteRequest(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntriesRequest(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshotRequest(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
    TimeoutNow(TimeoutNow),
}

/// A message paired with the peer it came from or is bound for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub peer: ServerId,
    pub message: Message,
}
