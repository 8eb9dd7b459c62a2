//! Single-server membership change (spec §4.5).

use super::{ConsensusModule, Effects};
use crate::config::{Configuration, Role};
use crate::error::{RaftError, Result};
use crate::ids::{Index, ServerId, Term};
use crate::log::{Entry, EntryKind};
use crate::state::{PromotionRound, ServerState};

impl ConsensusModule {
    fn require_leader(&self) -> Result<()> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.volatile.current_leader.map(|id| id.value()),
            });
        }
        Ok(())
    }

    fn require_no_uncommitted_change(&self) -> Result<()> {
        if !self.volatile.configuration_uncommitted_index.is_none() {
            return Err(RaftError::CantChange);
        }
        Ok(())
    }

    fn propose_configuration(&mut self, new_config: Configuration, now: u64) -> (Effects, Index) {
        let mut effects = Effects::default();
        let index = self.log.last_index().next();
        let entry = Entry {
            term: self.persistent.current_term,
            index,
            kind: EntryKind::ConfigChange,
            payload: bytes::Bytes::from(new_config.encode()),
        };
        let _ = self.log.append(entry);
        self.configuration = new_config;
        self.volatile.configuration_uncommitted_index = index;

        if let ServerState::Leader(l) = &mut self.server_state {
            for peer in self.configuration.replication_target_ids() {
                l.progress
                    .entry(peer)
                    .or_insert_with(|| crate::progress::Progress::new(index.prev()));
            }
            l.progress.retain(|id, _| self.configuration.contains(*id));
        }

        effects.merge(self.send_due_heartbeats(now));
        (effects, index)
    }

    pub fn add_server(&mut self, id: ServerId, address: String, now: u64) -> std::result::Result<Effects, RaftError> {
        self.require_leader()?;
        self.require_no_uncommitted_change()?;
        let mut new_config = self.configuration.clone();
        new_config.add(id, address, Role::Idle)?;
        let (effects, index) = self.propose_configuration(new_config, now);
        if let ServerState::Leader(l) = &mut self.server_state {
            l.pending_change = Some(crate::state::PendingConfigChange { entry_index: index });
        }
        Ok(effects)
    }

    pub fn remove_server(&mut self, id: ServerId, now: u64) -> std::result::Result<Effects, RaftError> {
        self.require_leader()?;
        self.require_no_uncommitted_change()?;
        if !self.configuration.contains(id) {
            return Err(RaftError::BadId("server not in configuration".into()));
        }
        let mut new_config = self.configuration.clone();
        new_config.remove(id);
        let (effects, index) = self.propose_configuration(new_config, now);
        if let ServerState::Leader(l) = &mut self.server_state {
            l.pending_change = Some(crate::state::PendingConfigChange { entry_index: index });
        }
        Ok(effects)
    }

    pub fn demote_server(&mut self, id: ServerId, role: Role, now: u64) -> std::result::Result<Effects, RaftError> {
        self.require_leader()?;
        self.require_no_uncommitted_change()?;
        if role == Role::Voter {
            return Err(RaftError::Invalid("demote requires standby or idle".into()));
        }
        let mut new_config = self.configuration.clone();
        new_config.set_role(id, role)?;
        let (effects, index) = self.propose_configuration(new_config, now);
        if let ServerState::Leader(l) = &mut self.server_state {
            l.pending_change = Some(crate::state::PendingConfigChange { entry_index: index });
        }
        Ok(effects)
    }

    /// Begins (or continues) promoting `id` to voter. Catch-up rounds are
    /// checked on every tick via `check_promotion_round`; the actual
    /// `ConfigChange` is only appended once a round completes within one
    /// election timeout (spec §4.5).
    pub fn promote_server(&mut self, id: ServerId, now: u64) -> std::result::Result<Effects, RaftError> {
        self.require_leader()?;
        self.require_no_uncommitted_change()?;
        if !self.configuration.contains(id) {
            return Err(RaftError::BadId("server not in configuration".into()));
        }
        if self.configuration.is_voter(id) {
            return Err(RaftError::Invalid("server is already a voter".into()));
        }
        let round_index = self.log.last_index();
        if let ServerState::Leader(l) = &mut self.server_state {
            // An idle member isn't a replication target (`replication_target_ids`
            // excludes it), so without this it would never receive the entries
            // catch-up is waiting on. Give it a `Progress` from scratch here;
            // `propose_configuration`'s later retain pass leaves it alone since
            // it only drops ids no longer in the configuration at all.
            l.progress
                .entry(id)
                .or_insert_with(|| crate::progress::Progress::new(Index::NONE));
            l.promotion = Some(PromotionRound {
                promotee_id: id,
                round_number: 1,
                round_index,
                round_start: now,
            });
        }
        Ok(self.send_due_heartbeats(now))
    }

    pub(super) fn check_promotion_round(&mut self, now: u64) -> Effects {
        let mut effects = Effects::default();
        let (promotee, round_index, round_start, round_number) = match &self.server_state {
            ServerState::Leader(l) => match &l.promotion {
                Some(p) => (p.promotee_id, p.round_index, p.round_start, p.round_number),
                None => return effects,
            },
            _ => return effects,
        };

        let match_index = if let ServerState::Leader(l) = &self.server_state {
            l.progress.get(&promotee).map(|p| p.match_index).unwrap_or(Index::NONE)
        } else {
            Index::NONE
        };

        if match_index.0 >= round_index.0 {
            let elapsed = now.saturating_sub(round_start);
            if elapsed <= self.config.election_timeout_ms {
                let mut new_config = self.configuration.clone();
                if new_config.set_role(promotee, Role::Voter).is_ok() {
                    let (propose_effects, index) = self.propose_configuration(new_config, now);
                    if let ServerState::Leader(l) = &mut self.server_state {
                        l.promotion = None;
                        l.pending_change = Some(crate::state::PendingConfigChange { entry_index: index });
                    }
                    effects.merge(propose_effects);
                    return effects;
                }
            }
        }

        if now.saturating_sub(round_start) >= self.config.election_timeout_ms {
            let new_round_index = self.log.last_index();
            if let ServerState::Leader(l) = &mut self.server_state {
                if let Some(p) = &mut l.promotion {
                    p.round_number = round_number + 1;
                    p.round_index = new_round_index;
                    p.round_start = now;
                }
            }
        }
        effects
    }

    pub(crate) fn adopt_if_config_change(&mut self, entry: &Entry) {
        if entry.kind == EntryKind::ConfigChange {
            if let Ok(config) = Configuration::decode(&entry.payload) {
                self.configuration = config;
                self.volatile.configuration_uncommitted_index = entry.index;
            }
        }
    }

    /// Called once `commit_index` passes the index of an uncommitted
    /// `ConfigChange` (spec §4.5).
    pub(super) fn check_config_commit(&mut self, now: u64) {
        let uncommitted = self.volatile.configuration_uncommitted_index;
        if uncommitted.is_none() || self.volatile.commit_index.0 < uncommitted.0 {
            return;
        }
        self.volatile.configuration_index = uncommitted;
        self.volatile.configuration_uncommitted_index = Index::NONE;

        let self_removed = !self.configuration.contains(self.self_id);
        if let ServerState::Leader(l) = &mut self.server_state {
            l.pending_change = None;
        }
        if self_removed && self.is_leader() {
            let mut dummy = Effects::default();
            self.become_follower(self.persistent.current_term, now, &mut dummy);
        }
    }

    /// Reverts to the last committed configuration after a truncated
    /// `ConfigChange` (spec §4.5).
    pub(crate) fn revert_uncommitted_config(&mut self, from_index: Index) {
        if self.volatile.configuration_uncommitted_index.0 >= from_index.0
            && self.volatile.configuration_uncommitted_index.0 != 0
        {
            self.volatile.configuration_uncommitted_index = Index::NONE;
            if self.volatile.configuration_index.is_none() {
                // Committed configuration predates the log (bootstrap):
                // there's no entry to decode it back out of.
                self.configuration = self.bootstrap_configuration.clone();
            } else if let Some(entry) = self.log.get(self.volatile.configuration_index) {
                let _ = Configuration::decode(&entry.payload).map(|c| self.configuration = c);
            }
        }
    }
}
