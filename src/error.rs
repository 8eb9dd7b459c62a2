//! Error codes surfaced by the core, with stable numeric values for callers
//! that cross an FFI-ish or wire boundary (spec §6, mirroring the
//! `RAFT_*` codes in `examples/original_source/include/raft.h`).

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("out of memory")]
    NoMem,

    #[error("bad server id: {0}")]
    BadId(String),

    #[error("duplicate server id: {0}")]
    DuplicateId(u64),

    #[error("duplicate server address: {0}")]
    DuplicateAddress(String),

    #[error("bad server role")]
    BadRole,

    #[error("malformed message or record: {0}")]
    Malformed(String),

    #[error("not the leader{}", .leader_hint.map(|id| format!(", leader is {}", id)).unwrap_or_default())]
    NotLeader { leader_hint: Option<u64> },

    #[error("leadership lost before the request completed")]
    LeadershipLost,

    #[error("the instance is shutting down")]
    Shutdown,

    #[error("cannot bootstrap: {0}")]
    CantBootstrap(String),

    #[error("cannot change membership: a configuration change is already uncommitted")]
    CantChange,

    #[error("persistent state is corrupt: {0}")]
    Corrupt(String),

    #[error("request canceled")]
    Canceled,

    #[error("name too long")]
    NameTooLong,

    #[error("value too big")]
    TooBig,

    #[error("no connection to peer")]
    NoConnection,

    #[error("backend busy, retry later")]
    Busy,

    #[error("I/O error: {0}")]
    IoErr(String),

    #[error("not found")]
    NotFound,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("no space left")]
    NoSpace,

    #[error("too many outstanding items")]
    TooMany,
}

impl RaftError {
    /// Stable numeric code, matching the `RAFT_*` defines in the original C
    /// header. Callers that persist or transmit error codes can rely on
    /// these values never changing.
    pub fn as_code(&self) -> i32 {
        match self {
            RaftError::NoMem => 1,
            RaftError::BadId(_) => 2,
            RaftError::DuplicateId(_) => 3,
            RaftError::DuplicateAddress(_) => 4,
            RaftError::BadRole => 5,
            RaftError::Malformed(_) => 6,
            RaftError::NotLeader { .. } => 7,
            RaftError::LeadershipLost => 8,
            RaftError::Shutdown => 9,
            RaftError::CantBootstrap(_) => 10,
            RaftError::CantChange => 11,
            RaftError::Corrupt(_) => 12,
            RaftError::Canceled => 13,
            RaftError::NameTooLong => 14,
            RaftError::TooBig => 15,
            RaftError::NoConnection => 16,
            RaftError::Busy => 17,
            RaftError::IoErr(_) => 18,
            RaftError::NotFound => 19,
            RaftError::Invalid(_) => 20,
            RaftError::Unauthorized => 21,
            RaftError::NoSpace => 22,
            RaftError::TooMany => 23,
        }
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(RaftError::NoMem.as_code(), 1);
        assert_eq!(RaftError::TooMany.as_code(), 23);
        assert_eq!(RaftError::NotLeader { leader_hint: None }.as_code(), 7);
    }
}
