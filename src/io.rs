//! The I/O backend and FSM capability objects (spec §6).
//!
//! Everything that touches a disk, a socket, or a clock is injected through
//! these traits; the core never does so directly (spec §1, §5). Operations
//! that can take time are callback-based rather than `async fn`: the core is
//! a synchronous, reentrant state machine (spec §5), and a literal
//! completion callback is the most direct expression of "submit, then
//! continue when told" without pulling in an async runtime the core has no
//! other use for.

use crate::config::Configuration;
use crate::error::Result;
use crate::ids::{Index, ServerId, Term};
use crate::log::Entry;
use crate::rpc::Message;
use bytes::Bytes;

/// A previously persisted snapshot, as returned by `load`/`snapshot_get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub last_index: Index,
    pub last_term: Term,
    pub configuration: Configuration,
    pub configuration_index: Index,
    pub data: Vec<Bytes>,
}

/// Everything durable that must survive a restart, as handed back by `load`.
pub struct LoadedState {
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub snapshot: Option<SnapshotMetadata>,
    /// The index of `entries[0]`; 1 if there is no snapshot.
    pub start_index: Index,
    pub entries: Vec<Entry>,
}

/// Completion callback for an asynchronous backend operation. Carries
/// nothing but success/failure: the data itself (if any) was already handed
/// to the backend by value when the request was submitted.
pub type Completion = Box<dyn FnOnce(Result<()>)>;

/// Capability object for disk and network I/O (spec §6). All methods other
/// than `init`/`bootstrap`/`recover`/`time`/`random` either complete
/// synchronously and durably, or accept a `Completion` invoked once the
/// operation has finished.
pub trait IoBackend {
    /// One-time setup before any other call.
    fn init(&mut self, id: ServerId, address: &str) -> Result<()>;

    /// Reads everything persisted from a previous run. Called exactly once,
    /// before `start`.
    fn load(&mut self) -> Result<LoadedState>;

    /// Registers the driver's tick and receive callbacks and starts the
    /// timer that invokes `on_tick` every `tick_interval_ms`.
    fn start(&mut self, tick_interval_ms: u64);

    /// Initializes a brand-new cluster. Synchronous and atomic: either the
    /// whole configuration is durable or none of it is.
    fn bootstrap(&mut self, conf: &Configuration) -> Result<()>;

    /// Re-adopts a configuration after a restart without replaying `load`.
    fn recover(&mut self, conf: &Configuration) -> Result<()>;

    /// Durably persists the current term. Must also clear any previously
    /// persisted vote as part of the same durable write (spec §4.3).
    fn set_term(&mut self, term: Term) -> Result<()>;

    /// Durably persists the vote cast for the given term.
    fn set_vote(&mut self, candidate: Option<ServerId>) -> Result<()>;

    /// Appends entries durably. `cb` fires only once every entry in
    /// `entries` is on stable storage.
    fn append(&mut self, entries: Vec<Entry>, cb: Completion);

    /// Discards entries with `index >= from_index` from stable storage.
    fn truncate(&mut self, from_index: Index, cb: Completion);

    /// Sends a message to a peer. `cb` fires once the send attempt
    /// completes (not once the peer has processed it).
    fn send(&mut self, peer: ServerId, message: Message, cb: Completion);

    /// Persists a snapshot. `trailing` is the number of log entries to keep
    /// immediately before the snapshot boundary (spec §4.6).
    fn snapshot_put(&mut self, trailing: u64, snapshot: SnapshotMetadata, cb: Completion);

    /// Reads the most recently persisted snapshot, if any.
    fn snapshot_get(&mut self) -> Result<Option<SnapshotMetadata>>;

    /// Monotonic milliseconds. The core never reads the wall clock itself.
    fn time(&self) -> u64;

    /// Uniformly distributed `[min, max)`, used for randomized election
    /// timeouts (spec §4.3).
    fn random(&self, min: u64, max: u64) -> u64;

    /// Begins the two-phase shutdown (spec §5): cancel pending requests,
    /// then invoke `cb` once every in-flight request has drained.
    fn close(&mut self, cb: Completion);
}

/// The user's deterministic state machine (spec §6). Apply calls are serial
/// and strictly in index order; the core owns the FSM exclusively while
/// running.
pub trait Fsm {
    /// Applies one committed `Command` entry's payload.
    fn apply(&mut self, index: Index, payload: &Bytes) -> Result<Bytes>;

    /// Produces one or more buffers capturing the FSM's full state as of the
    /// last `apply` call.
    fn snapshot(&mut self) -> Result<Vec<Bytes>>;

    /// Replaces the FSM's entire state from a previously produced snapshot.
    fn restore(&mut self, data: &[Bytes]) -> Result<()>;
}
