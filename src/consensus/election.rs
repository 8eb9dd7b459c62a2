//! Leader election (spec §4.3).

use super::{ConsensusModule, Effects};
use crate::ids::{Index, ServerId, Term};
use crate::rpc::{Envelope, Message, RequestVoteRequest, RequestVoteResponse};
use crate::state::{CandidateState, FollowerState, LeaderState, ServerState};
use std::collections::HashMap;

impl ConsensusModule {
    /// Transitions to follower, adopting `term` if it's newer. Clears the
    /// vote and drops any leader-only state. Does not itself persist; the
    /// caller sets `effects.persist_term` when `term` actually advances.
    pub(crate) fn become_follower(&mut self, term: Term, now: u64, effects: &mut Effects) {
        let was_leader = self.is_leader();
        if term.0 > self.persistent.current_term.0 {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
            effects.persist_term = true;
            effects.persist_vote = true;
        }
        self.volatile.current_leader = None;
        self.server_state = ServerState::Follower(FollowerState {
            randomized_election_timeout: self.config.election_timeout_ms,
            current_leader: None,
        });
        self.reset_election_timer(now, self.config.election_timeout_ms);
        if was_leader {
            tracing::info!(term = self.persistent.current_term.0, "stepping down from leader");
        } else {
            tracing::debug!(term = self.persistent.current_term.0, "becoming follower");
        }
    }

    fn recent_leader_contact(&self, now: u64) -> bool {
        now.saturating_sub(self.volatile.election_timer_start) < self.config.election_timeout_ms
            && self.volatile.current_leader.is_some()
    }

    pub(super) fn check_election_timer(&mut self, now: u64, rand_fn: &dyn Fn(u64, u64) -> u64) -> Effects {
        let mut effects = Effects::default();
        let should_start = match &self.server_state {
            ServerState::Follower(f) => {
                now.saturating_sub(self.volatile.election_timer_start) >= f.randomized_election_timeout
                    && self.is_voter_here()
            }
            ServerState::Candidate(c) => {
                now.saturating_sub(self.volatile.election_timer_start) >= c.randomized_election_timeout
            }
            _ => false,
        };
        if should_start {
            self.start_election(now, rand_fn, &mut effects);
        }
        effects
    }

    /// Candidate entry (spec §4.3). `disrupt_leader` is only ever true when
    /// triggered by a received `TimeoutNow` (spec §4.7).
    pub(crate) fn start_election(
        &mut self,
        now: u64,
        rand_fn: &dyn Fn(u64, u64) -> u64,
        effects: &mut Effects,
    ) {
        self.start_election_inner(now, rand_fn, false, effects)
    }

    fn start_election_inner(
        &mut self,
        now: u64,
        rand_fn: &dyn Fn(u64, u64) -> u64,
        disrupt_leader: bool,
        effects: &mut Effects,
    ) {
        self.persistent.current_term = self.persistent.current_term.next();
        self.persistent.voted_for = Some(self.self_id);
        effects.persist_term = true;
        effects.persist_vote = true;

        tracing::info!(
            term = self.persistent.current_term.0,
            disrupt_leader,
            "starting election"
        );

        let timeout = self.pick_randomized_timeout(rand_fn);
        let mut votes = HashMap::new();
        votes.insert(self.self_id, true);
        self.server_state = ServerState::Candidate(CandidateState {
            randomized_election_timeout: timeout,
            votes,
        });
        self.reset_election_timer(now, timeout);
        self.volatile.current_leader = None;

        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        let term = self.persistent.current_term;

        for peer in self.other_voter_ids() {
            effects.outbound.push(Envelope {
                peer,
                message: Message::RequestVoteRequest(RequestVoteRequest {
                    term,
                    candidate_id: self.self_id,
                    last_log_index,
                    last_log_term,
                    disrupt_leader,
                }),
            });
        }

        // A single-voter cluster elects itself with no peers to wait on.
        if self.quorum() <= 1 {
            self.become_leader(now, effects);
        }
    }

    pub(crate) fn become_leader(&mut self, now: u64, effects: &mut Effects) {
        let last_log_index = self.log.last_index();
        self.volatile.current_leader = Some(self.self_id);
        self.server_state = ServerState::Leader(LeaderState::new(
            last_log_index,
            self.replication_peer_ids().into_iter(),
            now,
        ));
        tracing::info!(term = self.persistent.current_term.0, "became leader");
        effects.merge(self.send_due_heartbeats(now));
    }

    pub(super) fn handle_request_vote(
        &mut self,
        from: ServerId,
        req: RequestVoteRequest,
        now: u64,
    ) -> Effects {
        let mut effects = Effects::default();

        if req.term.0 < self.persistent.current_term.0 {
            effects.outbound.push(reply_vote(from, self.persistent.current_term, false));
            return effects;
        }
        if req.term.0 > self.persistent.current_term.0 {
            self.become_follower(req.term, now, &mut effects);
        }

        if let Some(voted) = self.persistent.voted_for {
            if voted != req.candidate_id {
                effects.outbound.push(reply_vote(from, self.persistent.current_term, false));
                return effects;
            }
        }

        let last_log_term = self.log.last_term();
        let last_log_index = self.log.last_index();
        let candidate_up_to_date = req.last_log_term.0 > last_log_term.0
            || (req.last_log_term.0 == last_log_term.0 && req.last_log_index.0 >= last_log_index.0);
        if !candidate_up_to_date {
            effects.outbound.push(reply_vote(from, self.persistent.current_term, false));
            return effects;
        }

        // Disruption suppression: bypassed only by an explicit transfer
        // (`disrupt_leader`), and only for this check, never for the
        // already-voted check above (spec §9 open question, conservative
        // reading preserved).
        if !req.disrupt_leader && self.recent_leader_contact(now) {
            effects.outbound.push(reply_vote(from, self.persistent.current_term, false));
            return effects;
        }

        self.persistent.voted_for = Some(req.candidate_id);
        effects.persist_vote = true;
        self.reset_election_timer(now, self.config.election_timeout_ms);
        effects.outbound.push(reply_vote(from, self.persistent.current_term, true));
        effects
    }

    pub(super) fn handle_request_vote_response(
        &mut self,
        from: ServerId,
        resp: RequestVoteResponse,
        now: u64,
        rand_fn: &dyn Fn(u64, u64) -> u64,
    ) -> Effects {
        let mut effects = Effects::default();

        if resp.term.0 > self.persistent.current_term.0 {
            self.become_follower(resp.term, now, &mut effects);
            return effects;
        }

        let still_candidate_same_term = resp.term.0 == self.persistent.current_term.0
            && matches!(self.server_state, ServerState::Candidate(_));
        if !still_candidate_same_term || !resp.vote_granted {
            if let ServerState::Candidate(c) = &mut self.server_state {
                c.votes.insert(from, resp.vote_granted);
            }
            return effects;
        }

        let quorum = self.quorum();
        let granted = if let ServerState::Candidate(c) = &mut self.server_state {
            c.votes.insert(from, true);
            c.granted_count()
        } else {
            0
        };
        let _ = rand_fn;
        if granted >= quorum {
            self.become_leader(now, &mut effects);
        }
        effects
    }

    /// Starts an election immediately, bypassing the follower/candidate
    /// timer, with `disrupt_leader=true` (spec §4.7).
    pub(super) fn handle_timeout_now(
        &mut self,
        _from: ServerId,
        msg: crate::rpc::TimeoutNow,
        now: u64,
        rand_fn: &dyn Fn(u64, u64) -> u64,
    ) -> Effects {
        let mut effects = Effects::default();
        if msg.term.0 < self.persistent.current_term.0 {
            return effects;
        }
        self.start_election_inner(now, rand_fn, true, &mut effects);
        effects
    }

    /// Runs at most once per `election_timeout` (spec §4.4): both the
    /// liveness check and the `recent_recv` reset it drives share that
    /// window, so a peer has a full `election_timeout` to ack at least once
    /// before it can cost the leader its quorum.
    pub(super) fn check_leader_step_down(&mut self, now: u64) -> Effects {
        let mut effects = Effects::default();
        let window_start = match &self.server_state {
            ServerState::Leader(l) => l.step_down_check_start,
            _ => return effects,
        };
        if now.saturating_sub(window_start) < self.config.election_timeout_ms {
            return effects;
        }

        let quorum = self.quorum();
        let configuration = &self.configuration;
        let should_step_down = if let ServerState::Leader(l) = &self.server_state {
            let alive = l
                .progress
                .iter()
                .filter(|(id, p)| p.recent_recv && configuration.is_voter(**id))
                .count()
                + 1;
            alive < quorum
        } else {
            false
        };
        if should_step_down {
            tracing::warn!(quorum, "lost quorum contact, stepping down");
            self.become_follower(self.persistent.current_term, now, &mut effects);
            return effects;
        }
        if let ServerState::Leader(l) = &mut self.server_state {
            for p in l.progress.values_mut() {
                p.recent_recv = false;
            }
            l.step_down_check_start = now;
        }
        let _ = Index::NONE;
        effects
    }
}

fn reply_vote(peer: ServerId, term: Term, granted: bool) -> Envelope {
    Envelope {
        peer,
        message: Message::RequestVoteResponse(RequestVoteResponse {
            term,
            vote_granted: granted,
        }),
    }
}
