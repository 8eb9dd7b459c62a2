//! The embedder-facing handle (spec §4.8, §5).
//!
//! `Raft` owns the `ConsensusModule`, the `IoBackend`, and the `Fsm`, and is
//! the only thing that actually calls the backend. It translates each
//! [`Effects`] value the core produces into concrete I/O, and feeds
//! completions back into the core — the reentrant loop spec §5 describes.
//! Single-threaded by construction: everything lives behind `RefCell`s,
//! never a `Mutex`, since the core is never meant to be touched from two
//! threads at once.
//!
//! State and backend live in *separate* `RefCell`s (`Shared::state` and
//! `Shared::backend`) rather than one combined cell. `IoBackend` callbacks
//! may fire synchronously, inline, from within the very call that submitted
//! them (a real backend fires later, off an event loop, but nothing in the
//! trait forbids firing immediately — and the in-memory test backend does
//! exactly that). A synchronous completion needs to touch `state` while the
//! call that triggered it is still holding `backend` borrowed; keeping them
//! in one cell would make that a guaranteed `BorrowMutError`. Completions
//! that would need to submit further backend work (e.g. sending a reply
//! once its entries are durable) queue onto `state.ready_to_send` instead of
//! calling back into the backend directly; `dispatch` drains that queue
//! once its own backend borrow has dropped.

use crate::config::Configuration;
use crate::consensus::{ConsensusModule, Effects, RaftConfig, SnapshotPutRequest};
use crate::error::{RaftError, Result};
use crate::ids::{Index, ServerId, Term};
use crate::io::{Fsm, IoBackend, LoadedState, SnapshotMetadata};
use crate::log::EntryKind;
use crate::rpc::{Envelope, Message};
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub type ApplyCallback = Box<dyn FnOnce(Result<Bytes>)>;
pub type ChangeCallback = Box<dyn FnOnce(Result<()>)>;
pub type CloseCallback = Box<dyn FnOnce()>;

struct State<F: Fsm> {
    core: ConsensusModule,
    fsm: F,
    pending_applies: HashMap<Index, ApplyCallback>,
    pending_barriers: HashMap<Index, ChangeCallback>,
    pending_changes: HashMap<Index, ChangeCallback>,
    pending_promotion: HashMap<ServerId, ChangeCallback>,
    pending_transfer: Option<ChangeCallback>,
    ready_to_send: Vec<Envelope>,
    closing: bool,
    close_cb: Option<CloseCallback>,
    in_flight: u64,
}

struct Shared<B: IoBackend, F: Fsm> {
    state: RefCell<State<F>>,
    backend: RefCell<B>,
}

/// A single-server Raft instance, generic over its I/O backend and state
/// machine (spec §6).
pub struct Raft<B: IoBackend, F: Fsm> {
    shared: Rc<Shared<B, F>>,
}

impl<B: IoBackend + 'static, F: Fsm + 'static> Clone for Raft<B, F> {
    fn clone(&self) -> Self {
        Raft {
            shared: self.shared.clone(),
        }
    }
}

impl<B: IoBackend + 'static, F: Fsm + 'static> Raft<B, F> {
    /// Bootstraps a brand-new single-server cluster with `configuration`,
    /// or loads persisted state if `backend.load()` reports any.
    pub fn new(self_id: ServerId, address: &str, mut backend: B, fsm: F, config: RaftConfig) -> Result<Self> {
        config.validate()?;
        backend.init(self_id, address)?;
        let loaded: LoadedState = backend.load()?;

        let configuration = loaded
            .snapshot
            .as_ref()
            .map(|s| s.configuration.clone())
            .unwrap_or_default();

        let mut core = ConsensusModule::new(self_id, configuration, config);
        core.persistent.current_term = loaded.current_term;
        core.persistent.voted_for = loaded.voted_for;
        if let Some(snapshot) = &loaded.snapshot {
            core.log.restore(crate::log::SnapshotBoundary {
                last_index: snapshot.last_index,
                last_term: snapshot.last_term,
            });
            core.volatile.commit_index = snapshot.last_index;
            core.volatile.last_applied = snapshot.last_index;
            core.volatile.last_stored = snapshot.last_index;
            core.volatile.configuration_index = snapshot.configuration_index;
            core.snapshot = Some(snapshot.clone());
        }
        for entry in loaded.entries {
            let _ = core.log.append(entry);
        }
        core.volatile.last_stored = core.log.last_index().max(core.volatile.last_stored);

        Ok(Raft {
            shared: Rc::new(Shared {
                state: RefCell::new(State {
                    core,
                    fsm,
                    pending_applies: HashMap::new(),
                    pending_barriers: HashMap::new(),
                    pending_changes: HashMap::new(),
                    pending_promotion: HashMap::new(),
                    pending_transfer: None,
                    ready_to_send: Vec::new(),
                    closing: false,
                    close_cb: None,
                    in_flight: 0,
                }),
                backend: RefCell::new(backend),
            }),
        })
    }

    /// Creates a fresh single-server cluster and persists its bootstrap
    /// configuration (spec §6, `bootstrap`).
    pub fn bootstrap(
        self_id: ServerId,
        address: &str,
        mut backend: B,
        fsm: F,
        config: RaftConfig,
        configuration: Configuration,
    ) -> Result<Self> {
        config.validate()?;
        backend.init(self_id, address)?;
        backend.bootstrap(&configuration)?;
        let core = ConsensusModule::new(self_id, configuration, config);
        Ok(Raft {
            shared: Rc::new(Shared {
                state: RefCell::new(State {
                    core,
                    fsm,
                    pending_applies: HashMap::new(),
                    pending_barriers: HashMap::new(),
                    pending_changes: HashMap::new(),
                    pending_promotion: HashMap::new(),
                    pending_transfer: None,
                    ready_to_send: Vec::new(),
                    closing: false,
                    close_cb: None,
                    in_flight: 0,
                }),
                backend: RefCell::new(backend),
            }),
        })
    }

    pub fn start(&self, tick_interval_ms: u64) {
        self.shared.backend.borrow_mut().start(tick_interval_ms);
    }

    pub fn is_leader(&self) -> bool {
        self.shared.state.borrow().core.is_leader()
    }

    pub fn leader(&self) -> Option<ServerId> {
        self.shared.state.borrow().core.current_leader()
    }

    pub fn current_term(&self) -> Term {
        self.shared.state.borrow().core.current_term()
    }

    /// Read access to the state machine, for serving local reads once a
    /// `barrier` (or simply `commit_index`) confirms this server is caught
    /// up — reads never need to go through the log themselves.
    pub fn with_fsm<R>(&self, f: impl FnOnce(&F) -> R) -> R {
        let state = self.shared.state.borrow();
        f(&state.fsm)
    }

    /// Drives the periodic tick (spec §4.8): apply committed entries,
    /// check timers, send heartbeats, check snapshot/transfer conditions.
    pub fn tick(&self, now: u64) {
        let effects = {
            let mut state = self.shared.state.borrow_mut();
            let backend = self.shared.backend.borrow();
            let rand_fn = |min, max| backend.random(min, max);
            state.core.tick(now, &rand_fn)
        };
        self.apply_committed(now);
        self.dispatch(effects, now);
    }

    pub fn recv(&self, from: ServerId, message: Message, now: u64) {
        let effects = {
            let mut state = self.shared.state.borrow_mut();
            let backend = self.shared.backend.borrow();
            let rand_fn = |min, max| backend.random(min, max);
            state.core.recv(from, message, now, &rand_fn)
        };
        self.apply_committed(now);
        self.dispatch(effects, now);
    }

    /// Proposes an application command. Fires `cb` with the FSM's result
    /// once the entry commits and is applied, in index order.
    pub fn apply(&self, payload: Bytes, cb: ApplyCallback, now: u64) -> Result<Index> {
        let index = {
            let mut state = self.shared.state.borrow_mut();
            if state.closing {
                return Err(RaftError::Shutdown);
            }
            if state.core.is_transferring() || !state.core.is_leader() {
                return Err(RaftError::NotLeader {
                    leader_hint: state.core.current_leader().map(|id| id.value()),
                });
            }
            let index = state.core.log.last_index().next();
            let entry = crate::log::Entry {
                term: state.core.current_term(),
                index,
                kind: EntryKind::Command,
                payload,
            };
            state.core.log.append(entry).map_err(|_| RaftError::NoMem)?;
            state.pending_applies.insert(index, cb);
            index
        };
        let effects = {
            let mut state = self.shared.state.borrow_mut();
            state.core.send_due_heartbeats_pub(now)
        };
        self.dispatch(effects, now);
        Ok(index)
    }

    /// Proposes a barrier entry: commits but is never applied, used purely
    /// to order a client request against prior commands (spec §4.4).
    pub fn barrier(&self, cb: ChangeCallback, now: u64) -> Result<Index> {
        let index = {
            let mut state = self.shared.state.borrow_mut();
            if state.closing {
                return Err(RaftError::Shutdown);
            }
            if !state.core.is_leader() {
                return Err(RaftError::NotLeader {
                    leader_hint: state.core.current_leader().map(|id| id.value()),
                });
            }
            let index = state.core.log.last_index().next();
            let entry = crate::log::Entry {
                term: state.core.current_term(),
                index,
                kind: EntryKind::Barrier,
                payload: Bytes::new(),
            };
            state.core.log.append(entry).map_err(|_| RaftError::NoMem)?;
            state.pending_barriers.insert(index, cb);
            index
        };
        let effects = {
            let mut state = self.shared.state.borrow_mut();
            state.core.send_due_heartbeats_pub(now)
        };
        self.dispatch(effects, now);
        Ok(index)
    }

    pub fn add_server(&self, id: ServerId, address: String, cb: ChangeCallback, now: u64) -> Result<()> {
        let effects = {
            let mut state = self.shared.state.borrow_mut();
            let effects = state.core.add_server(id, address, now)?;
            let index = state.core.volatile.configuration_uncommitted_index;
            state.pending_changes.insert(index, cb);
            effects
        };
        self.dispatch(effects, now);
        Ok(())
    }

    pub fn remove_server(&self, id: ServerId, cb: ChangeCallback, now: u64) -> Result<()> {
        let effects = {
            let mut state = self.shared.state.borrow_mut();
            let effects = state.core.remove_server(id, now)?;
            let index = state.core.volatile.configuration_uncommitted_index;
            state.pending_changes.insert(index, cb);
            effects
        };
        self.dispatch(effects, now);
        Ok(())
    }

    pub fn demote_server(&self, id: ServerId, role: crate::config::Role, cb: ChangeCallback, now: u64) -> Result<()> {
        let effects = {
            let mut state = self.shared.state.borrow_mut();
            let effects = state.core.demote_server(id, role, now)?;
            let index = state.core.volatile.configuration_uncommitted_index;
            state.pending_changes.insert(index, cb);
            effects
        };
        self.dispatch(effects, now);
        Ok(())
    }

    /// Promotes `id` to voter. `cb` fires once the promotion's
    /// `ConfigChange` entry commits (spec §4.5); catch-up rounds happen
    /// transparently on subsequent ticks.
    pub fn promote_server(&self, id: ServerId, cb: ChangeCallback, now: u64) -> Result<()> {
        let mut state = self.shared.state.borrow_mut();
        state.core.promote_server(id, now)?;
        state.pending_promotion.insert(id, cb);
        Ok(())
    }

    pub fn transfer_leadership(&self, target: Option<ServerId>, cb: ChangeCallback, now: u64) -> Result<()> {
        let effects = {
            let mut state = self.shared.state.borrow_mut();
            let effects = state.core.transfer_leadership(target, now)?;
            state.pending_transfer = Some(cb);
            effects
        };
        self.dispatch(effects, now);
        Ok(())
    }

    /// Two-phase shutdown (spec §5): fails pending callbacks with
    /// `Shutdown`, asks the backend to cancel outstanding requests, and
    /// invokes `cb` once everything has drained.
    pub fn close(&self, cb: CloseCallback) {
        let drained_already = {
            let mut state = self.shared.state.borrow_mut();
            state.closing = true;
            for (_, cb) in state.pending_applies.drain() {
                cb(Err(RaftError::Shutdown));
            }
            for (_, cb) in state.pending_barriers.drain() {
                cb(Err(RaftError::Shutdown));
            }
            for (_, cb) in state.pending_changes.drain() {
                cb(Err(RaftError::Shutdown));
            }
            for (_, cb) in state.pending_promotion.drain() {
                cb(Err(RaftError::Shutdown));
            }
            if let Some(t) = state.pending_transfer.take() {
                t(Err(RaftError::Shutdown));
            }
            state.in_flight == 0
        };
        if drained_already {
            cb();
            return;
        }
        self.shared.state.borrow_mut().close_cb = Some(cb);
        let shared = self.shared.clone();
        self.shared.backend.borrow_mut().close(Box::new(move |_| {
            let mut state = shared.state.borrow_mut();
            if let Some(cb) = state.close_cb.take() {
                drop(state);
                cb();
            }
        }));
    }

    fn apply_committed(&self, now: u64) {
        loop {
            let next = {
                let state = self.shared.state.borrow();
                let next = state.core.volatile.last_applied.next();
                // Never apply past what's actually durable yet: on a
                // follower, `commit_index` can be advanced by an
                // AppendEntries whose entries are still in flight to the
                // backend (`dispatch` runs after this), so the apply
                // boundary is `min(commit_index, last_stored)`, not
                // `commit_index` alone (spec §5, §8.7).
                let apply_boundary = state.core.volatile.commit_index.0.min(state.core.volatile.last_stored.0);
                if next.0 > apply_boundary {
                    break;
                }
                next
            };
            let entry = {
                let state = self.shared.state.borrow();
                state.core.log.get(next).cloned()
            };
            let Some(entry) = entry else { break };
            match entry.kind {
                EntryKind::Command => {
                    let result = {
                        let mut state = self.shared.state.borrow_mut();
                        state.fsm.apply(next, &entry.payload)
                    };
                    let mut state = self.shared.state.borrow_mut();
                    if let Some(cb) = state.pending_applies.remove(&next) {
                        drop(state);
                        cb(result);
                    }
                }
                EntryKind::Barrier => {
                    let mut state = self.shared.state.borrow_mut();
                    if let Some(cb) = state.pending_barriers.remove(&next) {
                        drop(state);
                        cb(Ok(()));
                    }
                }
                EntryKind::ConfigChange => {}
            }
            let mut state = self.shared.state.borrow_mut();
            state.core.mark_applied(next);
            state.core.check_config_commit_pub(now);
        }
        self.fire_config_callbacks();
    }

    fn fire_config_callbacks(&self) {
        let (callbacks, promo_callbacks) = {
            let mut state = self.shared.state.borrow_mut();
            let configuration_index = state.core.volatile.configuration_index;
            let to_fire: Vec<Index> = state
                .pending_changes
                .keys()
                .copied()
                .filter(|i| i.0 <= configuration_index.0)
                .collect();
            let mut callbacks = Vec::new();
            for index in to_fire {
                if let Some(cb) = state.pending_changes.remove(&index) {
                    callbacks.push(cb);
                }
            }
            let promoted: Vec<ServerId> = state
                .pending_promotion
                .keys()
                .copied()
                .filter(|id| state.core.configuration.is_voter(*id))
                .collect();
            let mut promo_callbacks = Vec::new();
            for id in promoted {
                if let Some(cb) = state.pending_promotion.remove(&id) {
                    promo_callbacks.push(cb);
                }
            }
            (callbacks, promo_callbacks)
        };
        for cb in callbacks {
            cb(Ok(()));
        }
        for cb in promo_callbacks {
            cb(Ok(()));
        }
    }

    fn dispatch(&self, effects: Effects, now: u64) {
        let Effects {
            persist_term,
            persist_vote,
            append_entries,
            truncate_from,
            outbound,
            apply_up_to: _,
            snapshot_put,
            adopt_snapshot,
            next_tick_ms: _,
            shutdown: _,
        } = effects;

        if persist_term {
            let term = self.shared.state.borrow().core.current_term();
            let _ = self.shared.backend.borrow_mut().set_term(term);
        }
        if persist_vote {
            let vote = self.shared.state.borrow().core.voted_for();
            let _ = self.shared.backend.borrow_mut().set_vote(vote);
        }

        if let Some(from_index) = truncate_from {
            let shared = self.shared.clone();
            self.shared.state.borrow_mut().in_flight += 1;
            self.shared.backend.borrow_mut().truncate(
                from_index,
                Box::new(move |_| {
                    shared.state.borrow_mut().in_flight -= 1;
                }),
            );
        }

        if let Some((entries, dependent_replies)) = append_entries {
            let last_index = entries.last().map(|e| e.index);
            let shared = self.shared.clone();
            self.shared.state.borrow_mut().in_flight += 1;
            self.shared.backend.borrow_mut().append(
                entries,
                Box::new(move |result| {
                    let mut state = shared.state.borrow_mut();
                    state.in_flight -= 1;
                    if result.is_ok() {
                        if let Some(last) = last_index {
                            state.core.on_last_stored_advanced(last);
                        }
                        state.ready_to_send.extend(dependent_replies);
                    }
                }),
            );
            self.drain_ready_to_send();
        }

        for envelope in outbound {
            Raft::send_one(&self.shared, envelope);
        }
        self.drain_ready_to_send();

        if let Some(req) = snapshot_put {
            self.run_snapshot_put(req, now);
        }

        if let Some((metadata, from)) = adopt_snapshot {
            self.run_adopt_snapshot(metadata, from);
        }
        self.drain_ready_to_send();
    }

    /// Drains replies queued by a synchronously-completing `append` (see
    /// module docs) now that the backend borrow that produced them has
    /// dropped.
    fn drain_ready_to_send(&self) {
        loop {
            let next = {
                let mut state = self.shared.state.borrow_mut();
                if state.ready_to_send.is_empty() {
                    break;
                }
                state.ready_to_send.remove(0)
            };
            Raft::send_one(&self.shared, next);
        }
    }

    fn send_one(shared: &Rc<Shared<B, F>>, envelope: Envelope) {
        let peer = envelope.peer;
        shared.state.borrow_mut().in_flight += 1;
        let shared2 = shared.clone();
        shared.backend.borrow_mut().send(
            peer,
            envelope.message,
            Box::new(move |result| {
                let mut state = shared2.state.borrow_mut();
                state.in_flight -= 1;
                if result.is_err() {
                    state.core.on_send_failed(peer);
                }
            }),
        );
    }

    fn run_snapshot_put(&self, req: SnapshotPutRequest, _now: u64) {
        let data = { self.shared.state.borrow_mut().fsm.snapshot() };
        let Ok(data) = data else { return };
        let metadata = SnapshotMetadata {
            last_index: req.last_index,
            last_term: req.last_term,
            configuration: req.configuration.clone(),
            configuration_index: req.configuration_index,
            data,
        };
        let shared = self.shared.clone();
        let trailing = req.trailing;
        self.shared.state.borrow_mut().in_flight += 1;
        self.shared.backend.borrow_mut().snapshot_put(
            trailing,
            metadata,
            Box::new(move |result| {
                let mut state = shared.state.borrow_mut();
                state.in_flight -= 1;
                if result.is_ok() {
                    state.core.on_snapshot_persisted(&req);
                }
            }),
        );
    }

    fn run_adopt_snapshot(&self, metadata: SnapshotMetadata, from: ServerId) {
        {
            let mut state = self.shared.state.borrow_mut();
            let _ = state.fsm.restore(&metadata.data);
        }
        let effects = {
            let mut state = self.shared.state.borrow_mut();
            state.core.on_snapshot_installed(metadata, from)
        };
        for envelope in effects.outbound {
            Raft::send_one(&self.shared, envelope);
        }
    }
}
