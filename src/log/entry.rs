use crate::ids::{Index, Term};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// What an entry represents. `ConfigChange` payloads are an encoded
/// `Configuration` (spec §3); everything else is opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// An opaque application command, handed to the user `Fsm` once committed.
    Command,
    /// Commits but is never applied; only enforces ordering for the client
    /// request that created it (spec §4.4).
    Barrier,
    /// Carries an encoded `Configuration` (spec §4.5).
    ConfigChange,
}

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: Term,
    pub index: Index,
    pub kind: EntryKind,
    pub payload: Bytes,
}

impl Entry {
    pub fn position(&self) -> crate::ids::LogPosition {
        crate::ids::LogPosition {
            term: self.term,
            index: self.index,
        }
    }
}
