//! Election module: terms, votes, and role transitions.
//!
//! Followers run a randomized election timer that is reset by any valid
//! leader contact. When it fires, the broker becomes a candidate,
//! increments its term, and solicits votes in parallel; a strict majority
//! in the same term makes it leader. The leader drives a heartbeat loop
//! that doubles as the replication round scheduler: it fires on a fixed
//! interval and immediately on the submit trigger. Observing a higher
//! term anywhere drops the broker straight back to follower.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tracing::{debug, info};

use crate::broker::replication::ReplicationModule;
use crate::broker::rpc::{PeerRequest, PeerResponse};
use crate::broker::server::{BrokerCore, Consensus, Role};

/// Leader heartbeat period. Kept well under the election timeout so a
/// healthy leader always suppresses follower elections.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
/// How often the election timer task re-checks its deadline.
const TIMER_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: i64,
    pub last_log_term: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

/// Handle over the shared broker core exposing the election side of the
/// consensus protocol.
#[derive(Clone)]
pub struct ElectionModule {
    core: Arc<BrokerCore>,
}

impl ElectionModule {
    pub(crate) fn new(core: Arc<BrokerCore>) -> Self {
        Self { core }
    }

    fn replication(&self) -> ReplicationModule {
        ReplicationModule::new(self.core.clone())
    }

    /// Vote handler. Grants when the candidate's term is current, this
    /// broker has not voted for anyone else this term, and the candidate's
    /// log is at least as up to date as ours.
    pub fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut consensus = self.core.consensus.lock().unwrap();
        if consensus.role == Role::Dead {
            return RequestVoteReply {
                term: consensus.term,
                vote_granted: false,
            };
        }

        if args.term > consensus.term {
            self.become_follower(&mut consensus, args.term);
        }

        let (last_log_index, last_log_term) = consensus.last_log_position();
        let log_up_to_date = (args.last_log_term, args.last_log_index)
            >= (last_log_term, last_log_index);
        let vote_granted = args.term == consensus.term
            && (consensus.voted_for.is_none() || consensus.voted_for == Some(args.candidate_id))
            && log_up_to_date;

        if vote_granted {
            consensus.voted_for = Some(args.candidate_id);
            consensus.election_reset = Instant::now();
        }

        debug!(
            broker = self.core.id,
            role = %consensus.role,
            term = consensus.term,
            candidate = args.candidate_id,
            vote_granted,
            "handled vote request"
        );

        RequestVoteReply {
            term: consensus.term,
            vote_granted,
        }
    }

    /// Drops to follower in `new_term`, clears the vote, resets the
    /// election timer, and arms a fresh timer task. Called from both
    /// modules whenever a higher term is observed.
    pub(crate) fn become_follower(&self, consensus: &mut Consensus, new_term: u64) {
        info!(
            broker = self.core.id,
            role = %consensus.role,
            term = new_term,
            "becoming follower"
        );
        consensus.role = Role::Follower;
        consensus.term = new_term;
        consensus.voted_for = None;
        consensus.election_reset = Instant::now();
        self.spawn_election_timer();
    }

    pub(crate) fn become_leader(&self, consensus: &mut Consensus) {
        consensus.role = Role::Leader;
        let next = consensus.log.len() as i64;
        for &peer_id in &self.core.peer_ids {
            consensus.next_index.insert(peer_id, next);
            consensus.match_index.insert(peer_id, -1);
        }
        info!(
            broker = self.core.id,
            term = consensus.term,
            "becoming leader"
        );

        let em = self.clone();
        let term = consensus.term;
        tokio::spawn(async move {
            em.run_leader(term).await;
        });
    }

    pub(crate) fn spawn_election_timer(&self) {
        let em = self.clone();
        tokio::spawn(async move {
            em.run_election_timer().await;
        });
    }

    /// One election-timer tenure. The task retires as soon as the term it
    /// was started in moves on or the broker stops being a follower or
    /// candidate; a fresh task is armed with each transition, so exactly
    /// one live timer watches any given term.
    async fn run_election_timer(&self) {
        let timeout = election_timeout();
        let term_started = {
            let consensus = self.core.consensus.lock().unwrap();
            consensus.term
        };
        debug!(
            broker = self.core.id,
            term = term_started,
            timeout_ms = timeout.as_millis() as u64,
            "election timer started"
        );

        let mut ticker = interval(TIMER_TICK);
        loop {
            ticker.tick().await;

            let mut consensus = self.core.consensus.lock().unwrap();
            if consensus.role != Role::Candidate && consensus.role != Role::Follower {
                return;
            }
            if consensus.term != term_started {
                return;
            }
            if consensus.election_reset.elapsed() >= timeout {
                self.start_election(&mut consensus);
                return;
            }
        }
    }

    /// Becomes candidate in the next term and solicits votes from every
    /// peer in parallel. A majority of grants in the same term wins;
    /// anything newer drops us back to follower. A split vote simply
    /// times out and restarts via the candidate's own election timer.
    fn start_election(&self, consensus: &mut Consensus) {
        consensus.role = Role::Candidate;
        consensus.term += 1;
        let saved_term = consensus.term;
        consensus.election_reset = Instant::now();
        consensus.voted_for = Some(self.core.id);
        let (last_log_index, last_log_term) = consensus.last_log_position();

        info!(
            broker = self.core.id,
            term = saved_term,
            "election timeout, starting election"
        );

        let votes = Arc::new(AtomicUsize::new(1));
        for &peer_id in &self.core.peer_ids {
            let em = self.clone();
            let votes = votes.clone();
            tokio::spawn(async move {
                let args = RequestVoteArgs {
                    term: saved_term,
                    candidate_id: em.core.id,
                    last_log_index,
                    last_log_term,
                };
                let reply = match em.core.call(peer_id, PeerRequest::RequestVote(args)).await {
                    Ok(PeerResponse::RequestVote(reply)) => reply,
                    Ok(_) => return,
                    Err(err) => {
                        debug!(
                            broker = em.core.id,
                            peer = peer_id,
                            error = %err,
                            "vote request failed"
                        );
                        return;
                    }
                };

                let mut consensus = em.core.consensus.lock().unwrap();
                if consensus.role != Role::Candidate || consensus.term != saved_term {
                    return;
                }
                if reply.term > saved_term {
                    em.become_follower(&mut consensus, reply.term);
                    return;
                }
                if reply.term == saved_term && reply.vote_granted {
                    let granted = votes.fetch_add(1, Ordering::SeqCst) + 1;
                    if granted * 2 > em.core.peer_ids.len() + 1 {
                        em.become_leader(&mut consensus);
                    }
                }
            });
        }

        // Candidate tenure gets its own timer so a split vote retries.
        self.spawn_election_timer();
    }

    /// Leader loop: every iteration runs one replication round, then waits
    /// for either the heartbeat interval or the submit trigger. Exits the
    /// moment this broker stops being leader for `term`.
    async fn run_leader(&self, term: u64) {
        let rm = self.replication();
        let mut quit = self.core.quit_rx();
        loop {
            rm.broadcast_round();

            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                _ = self.core.trigger.notified() => {}
                _ = quit.wait_for(|quit| *quit) => return,
            }

            let consensus = self.core.consensus.lock().unwrap();
            if consensus.role != Role::Leader || consensus.term != term {
                return;
            }
        }
    }
}

fn election_timeout() -> Duration {
    Duration::from_millis(150 + rand::rng().random_range(0..150))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, QuorumRule};
    use crate::message::{EditKind, EditOperation};
    use crate::broker::replication::LogEntry;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_module(role: Role, term: u64, log_terms: &[u64]) -> ElectionModule {
        let config = BrokerConfig {
            id: 0,
            peer_ids: vec![1, 2],
            rpc_listen: "127.0.0.1:0".parse().unwrap(),
            http_listen: "127.0.0.1:0".parse().unwrap(),
            initial_role: role,
            quorum: QuorumRule::Majority,
        };
        let (commit_tx, _commit_rx) = mpsc::channel(8);
        let core = BrokerCore::new(&config, commit_tx);
        {
            let mut consensus = core.consensus.lock().unwrap();
            consensus.term = term;
            consensus.log = log_terms
                .iter()
                .map(|&t| LogEntry {
                    term: t,
                    document: "7".into(),
                    operation: EditOperation {
                        kind: EditKind::Insert,
                        index: 0,
                        value: json!("x"),
                        replica: "editor".into(),
                    },
                })
                .collect();
        }
        ElectionModule::new(core)
    }

    fn vote_args(term: u64, candidate_id: u64) -> RequestVoteArgs {
        RequestVoteArgs {
            term,
            candidate_id,
            last_log_index: -1,
            last_log_term: None,
        }
    }

    #[tokio::test]
    async fn grants_vote_to_current_candidate() {
        let em = test_module(Role::Follower, 1, &[]);
        let reply = em.request_vote(vote_args(1, 2));
        assert!(reply.vote_granted);
        assert_eq!(
            em.core.consensus.lock().unwrap().voted_for,
            Some(2)
        );
    }

    #[tokio::test]
    async fn rejects_vote_for_stale_term() {
        let em = test_module(Role::Follower, 5, &[]);
        let reply = em.request_vote(vote_args(3, 2));
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 5);
    }

    #[tokio::test]
    async fn one_vote_per_term() {
        let em = test_module(Role::Follower, 2, &[]);
        assert!(em.request_vote(vote_args(2, 1)).vote_granted);
        assert!(!em.request_vote(vote_args(2, 2)).vote_granted);
        // The same candidate may ask again.
        assert!(em.request_vote(vote_args(2, 1)).vote_granted);
    }

    #[tokio::test]
    async fn rejects_candidate_with_stale_log() {
        let em = test_module(Role::Follower, 2, &[1, 2]);
        let stale = RequestVoteArgs {
            term: 2,
            candidate_id: 2,
            last_log_index: 5,
            last_log_term: Some(1),
        };
        assert!(!em.request_vote(stale).vote_granted);

        let shorter_same_term = RequestVoteArgs {
            term: 2,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: Some(2),
        };
        assert!(!em.request_vote(shorter_same_term).vote_granted);

        let up_to_date = RequestVoteArgs {
            term: 2,
            candidate_id: 2,
            last_log_index: 1,
            last_log_term: Some(2),
        };
        assert!(em.request_vote(up_to_date).vote_granted);
    }

    #[tokio::test]
    async fn higher_term_vote_request_forces_follower() {
        let em = test_module(Role::Leader, 2, &[]);
        let reply = em.request_vote(vote_args(6, 2));
        assert!(reply.vote_granted);
        let consensus = em.core.consensus.lock().unwrap();
        assert_eq!(consensus.role, Role::Follower);
        assert_eq!(consensus.term, 6);
    }

    #[tokio::test]
    async fn become_follower_clears_vote_and_adopts_term() {
        let em = test_module(Role::Candidate, 3, &[]);
        {
            let mut consensus = em.core.consensus.lock().unwrap();
            consensus.voted_for = Some(0);
            em.become_follower(&mut consensus, 8);
        }
        let consensus = em.core.consensus.lock().unwrap();
        assert_eq!(consensus.role, Role::Follower);
        assert_eq!(consensus.term, 8);
        assert_eq!(consensus.voted_for, None);
    }

    #[tokio::test]
    async fn dead_broker_refuses_votes() {
        let em = test_module(Role::Dead, 1, &[]);
        assert!(!em.request_vote(vote_args(5, 2)).vote_granted);
    }
}
