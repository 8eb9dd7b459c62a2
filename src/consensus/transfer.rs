//! Leadership transfer (spec §4.7).

use super::{ConsensusModule, Effects};
use crate::error::{RaftError, Result};
use crate::ids::ServerId;
use crate::rpc::{Envelope, Message, TimeoutNow};
use crate::state::{ServerState, TransferState};

impl ConsensusModule {
    /// Begins transferring leadership to `target`, or to the most
    /// up-to-date voting follower if `target` is `None` (spec §4.7).
    pub fn transfer_leadership(&mut self, target: Option<ServerId>, now: u64) -> Result<Effects> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.volatile.current_leader.map(|id| id.value()),
            });
        }
        let self_id = self.self_id;
        let deadline = now + self.config.election_timeout_ms;

        let chosen = match target {
            Some(id) => {
                if id == self_id || !self.configuration.is_voter(id) {
                    return Err(RaftError::Invalid("transfer target must be a different voter".into()));
                }
                id
            }
            None => {
                let ServerState::Leader(l) = &self.server_state else {
                    unreachable!()
                };
                l.progress
                    .iter()
                    .filter(|(id, _)| self.configuration.is_voter(**id))
                    .max_by_key(|(_, p)| p.match_index.0)
                    .map(|(id, _)| *id)
                    .ok_or_else(|| RaftError::Invalid("no eligible transfer target".into()))?
            }
        };

        if let ServerState::Leader(l) = &mut self.server_state {
            l.transfer = Some(TransferState {
                target: chosen,
                deadline,
                sent_timeout_now: false,
            });
        }

        tracing::info!(target = chosen.value(), deadline, "starting leadership transfer");
        let mut effects = self.send_due_heartbeats(now);
        effects.merge(self.maybe_send_timeout_now(now));
        Ok(effects)
    }

    fn maybe_send_timeout_now(&mut self, now: u64) -> Effects {
        let mut effects = Effects::default();
        let term = self.persistent.current_term;
        let leader_last_index = self.log.last_index();

        let ServerState::Leader(l) = &mut self.server_state else {
            return effects;
        };
        let Some(transfer) = &mut l.transfer else {
            return effects;
        };
        if transfer.sent_timeout_now {
            return effects;
        }
        let caught_up = l
            .progress
            .get(&transfer.target)
            .map(|p| p.match_index.0 >= leader_last_index.0)
            .unwrap_or(false);
        if !caught_up {
            return effects;
        }
        let target = transfer.target;
        transfer.sent_timeout_now = true;
        tracing::info!(target = target.value(), "sending timeout-now to transfer leadership");
        effects.outbound.push(Envelope {
            peer: target,
            message: Message::TimeoutNow(TimeoutNow {
                term,
                last_log_index: leader_last_index,
                last_log_term: self.log.last_term(),
            }),
        });
        let _ = now;
        effects
    }

    pub(super) fn check_transfer_deadline(&mut self, now: u64) -> Effects {
        let mut effects = Effects::default();
        let expired = matches!(
            &self.server_state,
            ServerState::Leader(l) if l.transfer.as_ref().map(|t| now >= t.deadline).unwrap_or(false)
        );
        if expired {
            if let ServerState::Leader(l) = &mut self.server_state {
                l.transfer = None;
            }
            return effects;
        }
        effects.merge(self.maybe_send_timeout_now(now));
        effects
    }

    pub fn is_transferring(&self) -> bool {
        matches!(&self.server_state, ServerState::Leader(l) if l.transfer.is_some())
    }
}
