//! An in-memory `IoBackend`/`Fsm` harness for integration tests, patterned
//! after `async-raft`'s `memstore` crate but adapted to the synchronous,
//! callback-based backend contract. `send` queues onto a shared `Network`
//! rather than calling the target's `recv` inline; test code drains the
//! queue with `Network::pump` between ticks.

use raft::config::Configuration;
use raft::driver::Raft;
use raft::error::Result;
use raft::ids::{Index, ServerId, Term};
use raft::io::{Completion, Fsm, IoBackend, LoadedState, SnapshotMetadata};
use raft::log::Entry;
use raft::rpc::Message;
use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

pub type TestRaft = Raft<MemBackend, MemFsm>;

/// Messages are queued rather than delivered inline from `IoBackend::send`:
/// the core is reentrant across independent `Raft` handles, but a single
/// handle's own `RefCell` must not be re-entered while already borrowed, and
/// an inline synchronous deliver-and-reply chain can loop straight back into
/// the sender before its outer call returns. Queuing and draining from the
/// test driver (`Network::pump`) sidesteps that without needing the core
/// itself to know anything about it.
#[derive(Default)]
pub struct Network {
    routes: RefCell<HashMap<ServerId, Box<dyn Fn(ServerId, Message, u64)>>>,
    queue: RefCell<VecDeque<(ServerId, ServerId, Message, u64)>>,
    clock: Cell<u64>,
}

impl Network {
    pub fn new() -> Rc<Network> {
        Rc::new(Network::default())
    }

    pub fn register(&self, id: ServerId, route: impl Fn(ServerId, Message, u64) + 'static) {
        self.routes.borrow_mut().insert(id, Box::new(route));
    }

    /// Advances the shared clock that `MemBackend::time`/`send` read from.
    /// Test code calls this before each round of ticks so every node agrees
    /// on `now` without threading it through the `IoBackend::send` signature.
    pub fn set_now(&self, now: u64) {
        self.clock.set(now);
    }

    pub fn now(&self) -> u64 {
        self.clock.get()
    }

    fn enqueue(&self, from: ServerId, to: ServerId, message: Message) {
        let now = self.clock.get();
        self.queue.borrow_mut().push_back((from, to, message, now));
    }

    /// Delivers every message queued so far, including ones produced by
    /// delivering earlier ones in this same call.
    pub fn pump(&self) {
        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some((from, to, message, now)) = next else {
                break;
            };
            if let Some(route) = self.routes.borrow().get(&to) {
                route(from, message, now);
            }
        }
    }
}

pub struct MemBackend {
    id: ServerId,
    network: Rc<Network>,
    current_term: Term,
    voted_for: Option<ServerId>,
    entries: Vec<Entry>,
    snapshot: Option<SnapshotMetadata>,
}

impl MemBackend {
    pub fn new(id: ServerId, network: Rc<Network>) -> Self {
        MemBackend {
            id,
            network,
            current_term: Term::ZERO,
            voted_for: None,
            entries: Vec::new(),
            snapshot: None,
        }
    }
}

impl IoBackend for MemBackend {
    fn init(&mut self, _id: ServerId, _address: &str) -> Result<()> {
        Ok(())
    }

    fn load(&mut self) -> Result<LoadedState> {
        Ok(LoadedState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            snapshot: self.snapshot.clone(),
            start_index: Index(1),
            entries: self.entries.clone(),
        })
    }

    fn start(&mut self, _tick_interval_ms: u64) {}

    fn bootstrap(&mut self, _conf: &Configuration) -> Result<()> {
        Ok(())
    }

    fn recover(&mut self, _conf: &Configuration) -> Result<()> {
        Ok(())
    }

    fn set_term(&mut self, term: Term) -> Result<()> {
        self.current_term = term;
        self.voted_for = None;
        Ok(())
    }

    fn set_vote(&mut self, candidate: Option<ServerId>) -> Result<()> {
        self.voted_for = candidate;
        Ok(())
    }

    fn append(&mut self, entries: Vec<Entry>, cb: Completion) {
        self.entries.extend(entries);
        cb(Ok(()));
    }

    fn truncate(&mut self, from_index: Index, cb: Completion) {
        self.entries.retain(|e| e.index.0 < from_index.0);
        cb(Ok(()));
    }

    fn send(&mut self, peer: ServerId, message: Message, cb: Completion) {
        self.network.enqueue(self.id, peer, message);
        cb(Ok(()));
    }

    fn snapshot_put(&mut self, _trailing: u64, snapshot: SnapshotMetadata, cb: Completion) {
        self.snapshot = Some(snapshot);
        cb(Ok(()));
    }

    fn snapshot_get(&mut self) -> Result<Option<SnapshotMetadata>> {
        Ok(self.snapshot.clone())
    }

    fn time(&self) -> u64 {
        self.network.now()
    }

    fn random(&self, min: u64, _max: u64) -> u64 {
        min
    }

    fn close(&mut self, cb: Completion) {
        cb(Ok(()));
    }
}

#[derive(Default)]
pub struct MemFsm {
    pub applied: Vec<Bytes>,
}

impl Fsm for MemFsm {
    fn apply(&mut self, _index: Index, payload: &Bytes) -> Result<Bytes> {
        self.applied.push(payload.clone());
        Ok(payload.clone())
    }

    fn snapshot(&mut self) -> Result<Vec<Bytes>> {
        Ok(vec![Bytes::from(self.applied.concat())])
    }

    fn restore(&mut self, data: &[Bytes]) -> Result<()> {
        self.applied = data.to_vec();
        Ok(())
    }
}

/// Builds `n` nodes sharing one `Network`, all bootstrapped with the same
/// voter configuration. Nodes register a route that calls straight into
/// their own `recv`; delivery itself happens later via `Network::pump`. The
/// caller drives ticks and `Network::set_now` manually.
pub fn build_cluster(ids: &[u64], config: raft::RaftConfig) -> (Rc<Network>, Vec<TestRaft>) {
    let network = Network::new();
    let mut configuration = Configuration::new();
    for &id in ids {
        configuration
            .add(ServerId::new(id).unwrap(), format!("node-{id}"), raft::config::Role::Voter)
            .unwrap();
    }

    let mut nodes = Vec::new();
    for &id in ids {
        let sid = ServerId::new(id).unwrap();
        let backend = MemBackend::new(sid, network.clone());
        let raft = Raft::bootstrap(sid, &format!("node-{id}"), backend, MemFsm::default(), config, configuration.clone())
            .unwrap();
        network.register(sid, {
            let raft = raft.clone();
            move |from, msg, now| raft.recv(from, msg, now)
        });
        nodes.push(raft);
    }
    (network, nodes)
}
