//! A single-server Raft consensus core: leader election, log replication,
//! single-server membership change, snapshotting, and leadership transfer.
//!
//! The core is driven entirely by an externally supplied [`io::IoBackend`]
//! and [`io::Fsm`] — it never touches a socket, a file, or the wall clock
//! itself. See [`driver::Raft`] for the embedder-facing handle.

pub mod alloc;
pub mod config;
pub mod consensus;
pub mod driver;
pub mod error;
pub mod ids;
pub mod io;
pub mod log;
pub mod progress;
pub mod rpc;
pub mod state;

pub use config::{ConfigServer, Configuration, Role};
pub use consensus::{ConsensusModule, Effects, RaftConfig, SnapshotPutRequest};
pub use driver::{ApplyCallback, ChangeCallback, CloseCallback, Raft};
pub use error::{RaftError, Result};
pub use ids::{Index, LogPosition, ServerId, Term};
pub use io::{Fsm, IoBackend, LoadedState, SnapshotMetadata};
pub use log::{Entry, EntryKind, Log};
