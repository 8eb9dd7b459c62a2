//! Primitive identifiers shared across the whole crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Uniquely identifies a server. Guaranteed non-zero by construction; zero is
/// reserved to mean "no server" (e.g. `voted_for == None`, `leader == None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(u64);

impl ServerId {
    /// Constructs a `ServerId`. Returns `None` if `id == 0`.
    pub fn new(id: u64) -> Option<Self> {
        if id == 0 {
            None
        } else {
            Some(ServerId(id))
        }
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic election epoch. Starts at 0 before any election has occurred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an entry in the log. Index 0 is reserved to mean "none" /
/// "before the start of the log".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Index(pub u64);

impl Index {
    pub const NONE: Index = Index(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn next(self) -> Index {
        Index(self.0 + 1)
    }

    pub fn prev(self) -> Index {
        Index(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A position in the log: the pairing of an index with the term that
/// created it. Two logs that agree on a `LogPosition` are guaranteed (by the
/// log-matching property) to agree on every earlier entry too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub term: Term,
    pub index: Index,
}
