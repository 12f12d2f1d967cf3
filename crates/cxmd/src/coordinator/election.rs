//! Leader election.
//!
//! Any joined node may start an election by broadcasting a vote request
//! with a fresh election id. Every joined recipient stops its heartbeats,
//! broadcasts a random ballot and tallies after `TM_TALLY`: the voter with
//! the highest ballot becomes the active master.
//!
//! A node only counts the ballots it actually receives, its own included,
//! so an election heard by nobody ends with an empty ballot box and panic.
//! Concurrent elections converge on the highest election id.

use rand::Rng;
use tracing::{debug, error, info};

use cxm_proto::cluster::Role;
use cxm_proto::error::{CxmError, CxmResult};
use cxm_proto::message::{Message, VoteRequest, VoteResponse};

use super::{Coordinator, Dest, Effect, Timer, TimerKind};

impl Coordinator {
    /// `random(1..=99) * 1000 + last IP octet`.
    fn draw(&mut self) -> u64 {
        self.rng.gen_range(1..=99u64) * 1000 + self.ip_suffix
    }

    /// Start a new election.
    pub(super) fn trigger_election(&mut self) -> CxmResult<()> {
        if matches!(self.role, Role::Alone | Role::Joining | Role::Leaving) {
            return Err(CxmError::NotJoined);
        }
        if self.role == Role::Voting {
            info!(
                "coordinator: election {:?} already in progress",
                self.current_election
            );
            return Ok(());
        }

        let election = self.draw();
        info!("coordinator: starting election {}", election);
        let msg = Message::VoteRequest(VoteRequest {
            cluster: self.message_cluster(),
            node: self.name().to_string(),
            election,
        });
        self.emit(Effect::Send {
            msg,
            dest: Dest::Broadcast,
        });
        self.enter_voting(election);
        Ok(())
    }

    /// Ask the other members to elect a master without us.
    pub(super) fn call_election(&mut self) {
        let election = self.draw();
        info!("coordinator: calling election {} before leaving", election);
        let msg = Message::VoteRequest(VoteRequest {
            cluster: self.message_cluster(),
            node: self.name().to_string(),
            election,
        });
        self.emit(Effect::Send {
            msg,
            dest: Dest::Broadcast,
        });
    }

    fn enter_voting(&mut self, election: u64) {
        self.set_role(Role::Voting);
        self.current_election = Some(election);
        self.ballots.clear();
        self.leader_saw_panic = false;

        for kind in [
            TimerKind::Tally,
            TimerKind::LeaderHeartbeat,
            TimerKind::FollowerHeartbeat,
            TimerKind::LeaderWatchdog,
            TimerKind::FollowerWatchdog,
        ] {
            self.emit(Effect::StopTimer(kind));
        }

        let ballot = self.draw();
        debug!("coordinator: ballot {} for election {}", ballot, election);
        let msg = Message::VoteResponse(VoteResponse {
            cluster: self.message_cluster(),
            node: self.name().to_string(),
            election,
            ballot,
        });
        self.emit(Effect::Send {
            msg,
            dest: Dest::Broadcast,
        });
        self.emit(Effect::StartTimer(Timer::Tally { election }));
    }

    pub(super) fn on_vote_request(&mut self, req: VoteRequest) {
        if matches!(self.role, Role::Alone | Role::Joining | Role::Leaving) {
            debug!("coordinator: vote request from {} ignored while {}", req.node, self.role);
            return;
        }
        if let Some(current) = self.current_election {
            if self.role == Role::Voting && req.election <= current {
                if req.election < current {
                    debug!(
                        "coordinator: election {} from {} superseded by {}",
                        req.election, req.node, current
                    );
                }
                return;
            }
        }

        info!("coordinator: {} started election {}", req.node, req.election);
        self.enter_voting(req.election);
    }

    pub(super) fn on_vote_response(&mut self, resp: VoteResponse) {
        if self.role != Role::Voting || self.current_election != Some(resp.election) {
            debug!(
                "coordinator: stale ballot from {} for election {}",
                resp.node, resp.election
            );
            return;
        }
        self.ballots.insert(resp.ballot, resp.node);
    }

    pub(super) fn tally(&mut self, now: i64, election: u64) {
        if self.role != Role::Voting || self.current_election != Some(election) {
            return;
        }
        self.last_tally_at = Some(now);

        let winner = self.ballots.values().next_back().cloned();
        match winner {
            None => {
                error!("coordinator: no ballot received for election {}", election);
                self.set_role(Role::Passive);
                self.leader = None;
                self.engage_panic("election without any vote, network is down");
            }
            Some(winner) if winner == self.name() => {
                info!(
                    "coordinator: won election {} with {} voter(s)",
                    election,
                    self.ballots.len()
                );
                self.become_active(now);
            }
            Some(winner) => {
                info!("coordinator: {} won election {}", winner, election);
                self.become_passive(now, winner);
            }
        }
    }
}
