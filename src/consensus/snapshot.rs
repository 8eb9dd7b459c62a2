//! Snapshotting and log compaction (spec §4.6).

use super::{ConsensusModule, Effects, SnapshotPutRequest};
use crate::ids::{Index, ServerId};
use crate::io::SnapshotMetadata;
use crate::log::SnapshotBoundary;
use crate::rpc::{AppendEntriesResponse, Envelope, InstallSnapshotRequest, InstallSnapshotResponse, Message};
use crate::state::ServerState;

impl ConsensusModule {
    pub(super) fn check_snapshot_threshold(&mut self) -> Effects {
        let mut effects = Effects::default();
        let snapshot_last_index = self.snapshot.as_ref().map(|s| s.last_index).unwrap_or(Index::NONE);
        let distance = self.volatile.last_applied.0.saturating_sub(snapshot_last_index.0);
        if distance < self.config.snapshot_threshold {
            return effects;
        }
        let Some(term) = self.log.term_at(self.volatile.last_applied) else {
            return effects;
        };
        effects.snapshot_put = Some(SnapshotPutRequest {
            trailing: self.config.snapshot_trailing,
            last_index: self.volatile.last_applied,
            last_term: term,
            configuration: self.configuration.clone(),
            configuration_index: self.volatile.configuration_index,
        });
        effects
    }

    /// Called by the driver once the FSM snapshot has been durably written
    /// via `IoBackend::snapshot_put`.
    pub fn on_snapshot_persisted(&mut self, req: &SnapshotPutRequest) {
        self.snapshot = Some(SnapshotMetadata {
            last_index: req.last_index,
            last_term: req.last_term,
            configuration: req.configuration.clone(),
            configuration_index: req.configuration_index,
            data: Vec::new(),
        });
        let compact_to = if req.trailing == 0 {
            req.last_index
        } else {
            Index(req.last_index.0.saturating_sub(req.trailing))
        };
        tracing::info!(
            last_index = req.last_index.0,
            compact_to = compact_to.0,
            "snapshot persisted, compacting log"
        );
        let _ = self.log.truncate_prefix(compact_to);
    }

    pub(super) fn handle_install_snapshot(
        &mut self,
        from: ServerId,
        req: InstallSnapshotRequest,
        now: u64,
    ) -> Effects {
        let mut effects = Effects::default();
        if req.term.0 < self.persistent.current_term.0 {
            effects.outbound.push(Envelope {
                peer: from,
                message: Message::AppendEntriesResponse(AppendEntriesResponse {
                    term: self.persistent.current_term,
                    success: false,
                    conflict_term: None,
                    conflict_index: Index::NONE,
                    last_log_index: self.log.last_index(),
                }),
            });
            return effects;
        }
        if req.term.0 > self.persistent.current_term.0 || !matches!(self.server_state, ServerState::Follower(_)) {
            self.become_follower(req.term, now, &mut effects);
        }
        self.reset_election_timer(now, self.config.election_timeout_ms);

        if req.last_included_index.0 <= self.volatile.commit_index.0 {
            effects.outbound.push(Envelope {
                peer: from,
                message: Message::InstallSnapshotResponse(InstallSnapshotResponse {
                    term: self.persistent.current_term,
                    bytes_received: req.data.len() as u64,
                }),
            });
            return effects;
        }

        if !req.done {
            effects.outbound.push(Envelope {
                peer: from,
                message: Message::InstallSnapshotResponse(InstallSnapshotResponse {
                    term: self.persistent.current_term,
                    bytes_received: req.offset + req.data.len() as u64,
                }),
            });
            return effects;
        }

        let metadata = SnapshotMetadata {
            last_index: req.last_included_index,
            last_term: req.last_included_term,
            configuration: self.configuration.clone(),
            configuration_index: self.volatile.configuration_index,
            data: vec![req.data],
        };
        effects.adopt_snapshot = Some((metadata, from));
        effects
    }

    /// Finishes adopting an installed snapshot once the driver has
    /// persisted it and restored the FSM (spec §4.6).
    pub fn on_snapshot_installed(&mut self, metadata: SnapshotMetadata, from: ServerId) -> Effects {
        tracing::info!(
            last_index = metadata.last_index.0,
            last_term = metadata.last_term.0,
            "snapshot installed"
        );
        self.log.restore(SnapshotBoundary {
            last_index: metadata.last_index,
            last_term: metadata.last_term,
        });
        self.volatile.commit_index = metadata.last_index;
        self.volatile.last_applied = metadata.last_index;
        self.volatile.last_stored = metadata.last_index;
        self.configuration = metadata.configuration.clone();
        self.volatile.configuration_index = metadata.configuration_index;
        self.snapshot = Some(metadata.clone());

        let mut effects = Effects::default();
        effects.outbound.push(Envelope {
            peer: from,
            message: Message::AppendEntriesResponse(AppendEntriesResponse {
                term: self.persistent.current_term,
                success: true,
                conflict_term: None,
                conflict_index: Index::NONE,
                last_log_index: metadata.last_index,
            }),
        });
        effects
    }

    pub(super) fn handle_install_snapshot_response(
        &mut self,
        from: ServerId,
        resp: InstallSnapshotResponse,
        now: u64,
    ) -> Effects {
        let mut effects = Effects::default();
        if resp.term.0 > self.persistent.current_term.0 {
            self.become_follower(resp.term, now, &mut effects);
            return effects;
        }
        let Some(snapshot) = &self.snapshot else {
            return effects;
        };
        let boundary = snapshot.last_index;
        if let ServerState::Leader(l) = &mut self.server_state {
            if let Some(progress) = l.progress.get_mut(&from) {
                progress.on_snapshot_complete();
                let _ = boundary;
            }
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, Role};
    use crate::consensus::RaftConfig;
    use crate::log::{Entry, EntryKind};

    fn sid(v: u64) -> ServerId {
        ServerId::new(v).unwrap()
    }

    /// Crossing `snapshot_threshold` on tick produces a `snapshot_put`
    /// request; persisting it compacts the log up to the trailing window,
    /// leaving only entries after the new boundary visible.
    #[test]
    fn threshold_crossing_compacts_log_to_trailing_window() {
        let mut config = Configuration::new();
        config.add(sid(1), "a".into(), Role::Voter).unwrap();

        let raft_config = RaftConfig {
            snapshot_threshold: 3,
            snapshot_trailing: 1,
            ..RaftConfig::default()
        };
        let mut leader = ConsensusModule::new(sid(1), config, raft_config);
        let rand_fn = |min: u64, _max: u64| min;

        // Single voter: the first tick past the election timeout wins
        // immediately since quorum is 1.
        let _ = leader.tick(leader.config.election_timeout_ms, &rand_fn);
        assert!(leader.is_leader());

        for i in 1..=5u64 {
            let entry = Entry {
                term: leader.persistent.current_term,
                index: Index(i),
                kind: EntryKind::Command,
                payload: bytes::Bytes::from(format!("entry-{i}")),
            };
            leader.log.append(entry).unwrap();
        }
        leader.volatile.commit_index = Index(5);
        leader.volatile.last_applied = Index(5);
        leader.volatile.last_stored = Index(5);

        let effects = leader.tick(leader.config.election_timeout_ms + 10_000, &rand_fn);
        let req = effects.snapshot_put.expect("snapshot threshold should have tripped");
        assert_eq!(req.last_index, Index(5));

        leader.on_snapshot_persisted(&req);

        // Trailing window of 1 keeps index 5 around and compacts before it.
        assert_eq!(leader.log.first_index(), Index(5));
        assert!(leader.log.get(Index(4)).is_none());
        assert_eq!(leader.log.get(Index(5)).unwrap().payload, bytes::Bytes::from("entry-5"));
    }
}
