//! Log replication: AppendEntries flow, progress tracking, and commit-index
//! advancement (spec §4.4).

use super::{ConsensusModule, Effects};
use crate::ids::{Index, ServerId, Term};
use crate::log::Entry;
use crate::progress::ReplicationMode;
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse, Envelope, Message};
use crate::state::ServerState;

impl ConsensusModule {
    pub(super) fn send_due_heartbeats(&mut self, now: u64) -> Effects {
        let mut effects = Effects::default();
        let heartbeat_timeout = self.config.heartbeat_timeout_ms;
        let max_batch = self.config.max_append_batch;
        let commit_index = self.volatile.commit_index;
        let log = &self.log;
        let snapshot_last_index = self.snapshot.as_ref().map(|s| s.last_index).unwrap_or(Index::NONE);

        let peers: Vec<ServerId> = if let ServerState::Leader(l) = &self.server_state {
            l.progress.keys().copied().collect()
        } else {
            return effects;
        };

        for peer in peers {
            let ServerState::Leader(l) = &mut self.server_state else {
                unreachable!()
            };
            let progress = l.progress.get_mut(&peer).expect("peer tracked");

            if progress.needs_snapshot(snapshot_last_index) {
                progress.begin_snapshot(snapshot_last_index);
                continue;
            }
            if progress.mode == ReplicationMode::Snapshot {
                continue;
            }

            let due = now.saturating_sub(progress.last_send_time) >= heartbeat_timeout;
            let has_backlog = progress.next_index.0 <= log.last_index().0;
            if !due && !(progress.mode == ReplicationMode::Pipeline && has_backlog) {
                continue;
            }

            let prev_log_index = progress.next_index.prev();
            let prev_log_term = log.term_at(prev_log_index).unwrap_or(Term::ZERO);

            let entries = match progress.mode {
                ReplicationMode::Probe => {
                    if has_backlog {
                        log.get(progress.next_index).cloned().into_iter().collect()
                    } else {
                        Vec::new()
                    }
                }
                ReplicationMode::Pipeline => {
                    log.range(progress.next_index, Index(progress.next_index.0 + max_batch as u64 - 1))
                }
                ReplicationMode::Snapshot => Vec::new(),
            };

            let n_sent = entries.len() as u64;
            let last_sent_index = if n_sent > 0 {
                Index(progress.next_index.0 + n_sent - 1)
            } else {
                prev_log_index
            };
            let leader_commit = Index(commit_index.0.min(last_sent_index.0));

            progress.last_send_time = now;
            if progress.mode == ReplicationMode::Pipeline && n_sent > 0 {
                progress.next_index = last_sent_index.next();
            }

            effects.outbound.push(Envelope {
                peer,
                message: Message::AppendEntriesRequest(AppendEntriesRequest {
                    term: self.persistent.current_term,
                    leader_id: self.self_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                }),
            });
        }

        effects
    }

    pub(super) fn handle_append_entries(
        &mut self,
        from: ServerId,
        req: AppendEntriesRequest,
        now: u64,
    ) -> Effects {
        let mut effects = Effects::default();
        let current_term = self.persistent.current_term;

        if req.term.0 < current_term.0 {
            effects.outbound.push(reject(from, current_term, self.log.last_index()));
            return effects;
        }

        if req.term.0 > current_term.0 || matches!(self.server_state, crate::state::ServerState::Candidate(_)) {
            self.become_follower(req.term, now, &mut effects);
        }

        self.volatile.current_leader = Some(req.leader_id);
        if let ServerState::Follower(f) = &mut self.server_state {
            f.current_leader = Some(req.leader_id);
        }
        self.reset_election_timer(now, self.config.election_timeout_ms);

        let snapshot_last_index = self.snapshot.as_ref().map(|s| s.last_index).unwrap_or(Index::NONE);
        let have_prev = req.prev_log_index.is_none()
            || req.prev_log_index == snapshot_last_index
            || self.log.term_at(req.prev_log_index) == Some(req.prev_log_term);

        if !have_prev {
            effects.outbound.push(reject(from, self.persistent.current_term, self.log.last_index()));
            return effects;
        }

        let mut new_entries = Vec::new();
        let mut next_expected = req.prev_log_index.next();
        for entry in req.entries {
            if entry.index != next_expected {
                break;
            }
            let conflicts = match self.log.term_at(entry.index) {
                Some(existing_term) => existing_term != entry.term,
                None => entry.index.0 > self.log.last_index().0,
            };
            if conflicts {
                if entry.index.0 <= self.log.last_index().0 {
                    let _ = self.log.truncate_suffix(entry.index);
                    self.revert_uncommitted_config(entry.index);
                    effects.truncate_from = Some(entry.index);
                }
                new_entries.push(entry);
            } else if entry.index.0 > self.log.last_index().0 {
                new_entries.push(entry);
            }
            next_expected = next_expected.next();
        }

        let last_new_index = if new_entries.is_empty() {
            self.log.last_index()
        } else {
            new_entries.last().unwrap().index
        };

        for entry in &new_entries {
            self.adopt_if_config_change(entry);
        }

        if !new_entries.is_empty() {
            let _ = self.log.append_batch(new_entries.clone(), Some(()));
        }

        let new_commit = Index(req.leader_commit.0.min(last_new_index.0));
        if new_commit.0 > self.volatile.commit_index.0 {
            self.volatile.commit_index = new_commit;
            effects.apply_up_to = Some(new_commit);
            tracing::debug!(commit_index = new_commit.0, "commit index advanced");
        }

        let reply = Envelope {
            peer: from,
            message: Message::AppendEntriesResponse(AppendEntriesResponse {
                term: self.persistent.current_term,
                success: true,
                conflict_term: None,
                conflict_index: Index::NONE,
                last_log_index: last_new_index,
            }),
        };

        if !new_entries.is_empty() {
            effects.append_entries = Some((new_entries.clone(), vec![reply]));
        } else {
            effects.outbound.push(reply);
        }
        effects
    }

    pub(super) fn handle_append_entries_response(
        &mut self,
        from: ServerId,
        resp: AppendEntriesResponse,
        now: u64,
    ) -> Effects {
        let mut effects = Effects::default();
        if resp.term.0 > self.persistent.current_term.0 {
            self.become_follower(resp.term, now, &mut effects);
            return effects;
        }

        let quorum = self.quorum();
        let current_term = self.persistent.current_term;
        let log_last_index = self.log.last_index();

        let ServerState::Leader(l) = &mut self.server_state else {
            return effects;
        };
        let Some(progress) = l.progress.get_mut(&from) else {
            return effects;
        };
        progress.recent_recv = true;

        if resp.success {
            progress.on_append_success(resp.last_log_index);
        } else {
            progress.on_append_rejected(resp.conflict_index, resp.last_log_index);
        }

        let mut match_indices: Vec<Index> = self
            .configuration
            .voter_ids()
            .map(|id| {
                if id == self.self_id {
                    self.volatile.last_stored
                } else {
                    l.progress.get(&id).map(|p| p.match_index).unwrap_or(Index::NONE)
                }
            })
            .collect();
        match_indices.sort_by_key(|i| i.0);

        if match_indices.len() >= quorum {
            let candidate_n = match_indices[match_indices.len() - quorum];
            if candidate_n.0 > self.volatile.commit_index.0
                && self.log.term_at(candidate_n) == Some(current_term)
            {
                self.volatile.commit_index = candidate_n;
                effects.apply_up_to = Some(candidate_n);
                tracing::debug!(commit_index = candidate_n.0, "commit index advanced");
            }
        }

        let _ = log_last_index;
        effects
    }

    /// A send to `peer` failed; demote it out of pipeline mode so the next
    /// attempt re-probes rather than assuming the peer is caught up (spec §7).
    pub fn on_send_failed(&mut self, peer: ServerId) {
        if let ServerState::Leader(l) = &mut self.server_state {
            if let Some(progress) = l.progress.get_mut(&peer) {
                if progress.mode == ReplicationMode::Pipeline {
                    progress.mode = ReplicationMode::Probe;
                }
            }
        }
    }
}

fn reject(peer: ServerId, term: Term, last_log_index: Index) -> Envelope {
    Envelope {
        peer,
        message: Message::AppendEntriesResponse(AppendEntriesResponse {
            term,
            success: false,
            conflict_term: None,
            conflict_index: Index::NONE,
            last_log_index,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, Role};
    use crate::consensus::RaftConfig;
    use crate::log::EntryKind;

    fn sid(v: u64) -> ServerId {
        ServerId::new(v).unwrap()
    }

    fn two_voter_config() -> Configuration {
        let mut config = Configuration::new();
        config.add(sid(1), "a".into(), Role::Voter).unwrap();
        config.add(sid(2), "b".into(), Role::Voter).unwrap();
        config
    }

    /// A later AppendEntries whose entry conflicts with an already-stored
    /// uncommitted entry must truncate the suffix and adopt the leader's
    /// version rather than leaving the divergent entry in place.
    #[test]
    fn conflicting_suffix_is_truncated_and_replaced() {
        let mut follower = ConsensusModule::new(sid(2), two_voter_config(), RaftConfig::default());
        let rand_fn = |min: u64, _max: u64| min;

        let _ = follower.recv(
            sid(1),
            Message::AppendEntriesRequest(AppendEntriesRequest {
                term: Term(1),
                leader_id: sid(1),
                prev_log_index: Index::NONE,
                prev_log_term: Term::ZERO,
                entries: vec![
                    Entry {
                        term: Term(1),
                        index: Index(1),
                        kind: EntryKind::Command,
                        payload: bytes::Bytes::from_static(b"a"),
                    },
                    Entry {
                        term: Term(1),
                        index: Index(2),
                        kind: EntryKind::Command,
                        payload: bytes::Bytes::from_static(b"b"),
                    },
                ],
                leader_commit: Index::NONE,
            }),
            10,
            &rand_fn,
        );
        assert_eq!(follower.log.last_index(), Index(2));
        assert_eq!(follower.log.term_at(Index(2)), Some(Term(1)));

        // A term-2 leader's log diverged at index 2 and replaces it.
        let _ = follower.recv(
            sid(1),
            Message::AppendEntriesRequest(AppendEntriesRequest {
                term: Term(2),
                leader_id: sid(1),
                prev_log_index: Index(1),
                prev_log_term: Term(1),
                entries: vec![Entry {
                    term: Term(2),
                    index: Index(2),
                    kind: EntryKind::Command,
                    payload: bytes::Bytes::from_static(b"c"),
                }],
                leader_commit: Index(2),
            }),
            20,
            &rand_fn,
        );

        assert_eq!(follower.log.last_index(), Index(2));
        assert_eq!(follower.log.term_at(Index(2)), Some(Term(2)));
        assert_eq!(follower.log.get(Index(2)).unwrap().payload, bytes::Bytes::from_static(b"c"));
        assert_eq!(follower.current_term(), Term(2));
    }
}

