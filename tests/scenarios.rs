//! Integration scenarios (S1/S2/S3/S6) driven through the full `Raft`
//! handle + `Network` harness, exercising only the public driver API.
//! Log-divergence and snapshot-install scenarios (S4/S5) live as unit tests
//! next to `ConsensusModule` itself (`src/consensus/replication.rs`,
//! `src/consensus/snapshot.rs`), since they need access to its internal log
//! and volatile state that this crate boundary doesn't expose.

mod common;

use bytes::Bytes;
use common::{build_cluster, MemBackend, MemFsm, Network};
use raft::ids::ServerId;
use raft::RaftConfig;
use std::cell::RefCell;
use std::rc::Rc;

fn sid(v: u64) -> ServerId {
    ServerId::new(v).unwrap()
}

fn small_config() -> RaftConfig {
    RaftConfig {
        election_timeout_ms: 100,
        heartbeat_timeout_ms: 20,
        ..RaftConfig::default()
    }
}

fn tick_all(nodes: &[common::TestRaft], network: &Rc<Network>, now: &mut u64, step: u64, rounds: u32) {
    for _ in 0..rounds {
        *now += step;
        network.set_now(*now);
        for n in nodes {
            n.tick(*now);
        }
        network.pump();
    }
}

fn wait_for_leader(nodes: &[common::TestRaft], network: &Rc<Network>, now: &mut u64) -> usize {
    for _ in 0..50 {
        tick_all(nodes, network, now, 25, 1);
        if let Some((i, _)) = nodes.iter().enumerate().find(|(_, n)| n.is_leader()) {
            return i;
        }
    }
    panic!("no leader elected within the budget");
}

#[test]
fn s1_single_voter_bootstraps_and_applies() {
    let (network, nodes) = build_cluster(&[1], small_config());
    let mut now = 0u64;

    // A single voter is its own quorum, but it still only becomes leader
    // once its own election timer fires.
    let leader = wait_for_leader(&nodes, &network, &mut now);
    assert_eq!(leader, 0);

    let result = Rc::new(RefCell::new(None));
    let result2 = result.clone();
    nodes[0]
        .apply(
            Bytes::from_static(b"hello"),
            Box::new(move |r| *result2.borrow_mut() = Some(r)),
            now,
        )
        .unwrap();

    tick_all(&nodes, &network, &mut now, 25, 4);

    let got = result.borrow_mut().take().expect("apply should have completed");
    assert_eq!(got.unwrap(), Bytes::from_static(b"hello"));
    assert_eq!(nodes[0].with_fsm(|f| f.applied.clone()), vec![Bytes::from_static(b"hello")]);
}

#[test]
fn s2_three_voters_elect_and_replicate() {
    let (network, nodes) = build_cluster(&[1, 2, 3], small_config());
    let mut now = 0u64;

    let leader = wait_for_leader(&nodes, &network, &mut now);

    let result = Rc::new(RefCell::new(None));
    let result2 = result.clone();
    nodes[leader]
        .apply(
            Bytes::from_static(b"set x=1"),
            Box::new(move |r| *result2.borrow_mut() = Some(r)),
            now,
        )
        .unwrap();

    tick_all(&nodes, &network, &mut now, 25, 10);

    assert!(result.borrow().is_some(), "leader's apply callback never fired");
    for (i, n) in nodes.iter().enumerate() {
        assert_eq!(
            n.with_fsm(|f| f.applied.clone()),
            vec![Bytes::from_static(b"set x=1")],
            "node {i} did not replicate the command"
        );
    }

    let leader_term = nodes[leader].current_term();
    for n in &nodes {
        assert_eq!(n.current_term(), leader_term, "terms diverged after a quiet round");
    }
}

#[test]
fn s3_leader_failure_triggers_new_election() {
    let (network, nodes) = build_cluster(&[1, 2, 3], small_config());
    let mut now = 0u64;

    let first_leader = wait_for_leader(&nodes, &network, &mut now);
    let first_term = nodes[first_leader].current_term();

    // Simulate the old leader going silent: stop ticking/pumping messages
    // to or from it by only driving the other two nodes from here on.
    let survivors: Vec<&common::TestRaft> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != first_leader)
        .map(|(_, n)| n)
        .collect();

    let mut new_leader = None;
    for _ in 0..80 {
        now += 25;
        network.set_now(now);
        for n in &survivors {
            n.tick(now);
        }
        network.pump();
        if let Some(n) = survivors.iter().find(|n| n.is_leader()) {
            new_leader = Some(*n);
            break;
        }
    }
    let new_leader = new_leader.expect("survivors failed to elect a replacement leader");
    assert!(new_leader.current_term().0 > first_term.0);

    let result = Rc::new(RefCell::new(None));
    let result2 = result.clone();
    new_leader
        .apply(Bytes::from_static(b"after failover"), Box::new(move |r| *result2.borrow_mut() = Some(r)), now)
        .unwrap();
    for _ in 0..10 {
        now += 25;
        network.set_now(now);
        for n in &survivors {
            n.tick(now);
        }
        network.pump();
    }
    assert!(result.borrow().is_some(), "new leader could not commit after failover");
}

#[test]
fn s6_single_server_add_and_promote() {
    let (network, mut nodes) = build_cluster(&[1, 2, 3], small_config());
    let mut now = 0u64;
    let leader = wait_for_leader(&nodes, &network, &mut now);

    // Bring up a fourth node that joins an existing cluster rather than
    // bootstrapping one (`Raft::new`, not `Raft::bootstrap`).
    let id4 = sid(4);
    let backend4 = MemBackend::new(id4, network.clone());
    let joined = common::TestRaft::new(id4, "node-4", backend4, MemFsm::default(), small_config()).unwrap();
    network.register(id4, {
        let joined = joined.clone();
        move |from, msg, now| joined.recv(from, msg, now)
    });

    let add_done = Rc::new(RefCell::new(false));
    let add_done2 = add_done.clone();
    nodes[leader]
        .add_server(id4, "node-4".into(), Box::new(move |r| { r.unwrap(); *add_done2.borrow_mut() = true; }), now)
        .unwrap();

    tick_all(&nodes, &network, &mut now, 25, 10);
    assert!(*add_done.borrow(), "add_server's ConfigChange never committed");

    let promote_done = Rc::new(RefCell::new(false));
    let promote_done2 = promote_done.clone();
    nodes[leader]
        .promote_server(id4, Box::new(move |r| { r.unwrap(); *promote_done2.borrow_mut() = true; }), now)
        .unwrap();

    // Catch-up + the promotion's own ConfigChange both need several rounds.
    for _ in 0..40 {
        now += 25;
        network.set_now(now);
        for n in nodes.iter().chain(std::iter::once(&joined)) {
            n.tick(now);
        }
        network.pump();
        if *promote_done.borrow() {
            break;
        }
    }
    assert!(*promote_done.borrow(), "raft_promote never fired after catch-up");
    nodes.push(joined);
}
