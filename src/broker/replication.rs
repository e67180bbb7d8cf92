//! Replication module: owns the edit log and the commit index.
//!
//! The leader appends submitted edits, pushes them to every peer in
//! parallel rounds, and advances the commit index once the configured
//! quorum holds an entry from the current term. Followers serve the
//! `AppendEntries` RPC: they verify the consistency point, splice new
//! entries over any divergent suffix, and report fast-backup conflict
//! hints when the consistency check fails so the leader can repair a
//! lagging log in few round trips. A dedicated worker drains committed
//! entries onto the commit stream in strictly increasing index order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::election::ElectionModule;
use crate::broker::server::{BrokerCore, Role};
use crate::message::EditOperation;

/// One position in the replicated log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub term: u64,
    pub document: String,
    pub operation: EditOperation,
}

/// One committed entry as surfaced on the commit stream, exactly once per
/// log position and in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEntry {
    pub index: u64,
    pub term: u64,
    pub document: String,
    pub operation: EditOperation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    /// Index of the entry immediately before `entries`, `-1` when the
    /// leader is sending from the start of the log.
    pub prev_log_index: i64,
    pub prev_log_term: Option<u64>,
    pub entries: Vec<LogEntry>,
    pub leader_commit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub id: u64,
    /// Fast-backup hints, populated only on a consistency-check rejection.
    pub conflict_index: i64,
    pub conflict_term: Option<u64>,
}

/// Handle over the shared broker core exposing the replication side of the
/// consensus protocol.
#[derive(Clone)]
pub struct ReplicationModule {
    core: Arc<BrokerCore>,
}

impl ReplicationModule {
    pub(crate) fn new(core: Arc<BrokerCore>) -> Self {
        Self { core }
    }

    pub(crate) fn quit_rx(&self) -> watch::Receiver<bool> {
        self.core.quit_rx()
    }

    fn election(&self) -> ElectionModule {
        ElectionModule::new(self.core.clone())
    }

    /// Appends an edit to the log if this broker is the leader and returns
    /// its index; `None` is the not-leader rejection. A successful submit
    /// edge-triggers a replication round.
    pub fn submit(&self, document: &str, operation: EditOperation) -> Option<u64> {
        let index = {
            let mut consensus = self.core.consensus.lock().unwrap();
            if consensus.role != Role::Leader {
                debug!(
                    broker = self.core.id,
                    role = %consensus.role,
                    term = consensus.term,
                    "rejecting submit: not the leader"
                );
                return None;
            }
            let index = consensus.log.len() as u64;
            let term = consensus.term;
            consensus.log.push(LogEntry {
                term,
                document: document.to_string(),
                operation,
            });
            info!(
                broker = self.core.id,
                term,
                index,
                document,
                "accepted edit submission"
            );
            index
        };
        self.core.trigger.notify_one();
        Some(index)
    }

    /// The committed operations in commit order, available from the leader
    /// only. Application servers replay this to recover a fresh replica.
    pub fn committed_operations(&self) -> Option<Vec<EditOperation>> {
        let consensus = self.core.consensus.lock().unwrap();
        if consensus.role != Role::Leader {
            return None;
        }
        Some(
            consensus
                .committed_log
                .iter()
                .map(|entry| entry.operation.clone())
                .collect(),
        )
    }

    /// Follower side of the replication RPC.
    pub fn append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut consensus = self.core.consensus.lock().unwrap();
        let mut reply = AppendEntriesReply {
            term: consensus.term,
            success: false,
            id: self.core.id,
            conflict_index: -1,
            conflict_term: None,
        };
        if consensus.role == Role::Dead {
            return reply;
        }
        debug!(
            broker = self.core.id,
            role = %consensus.role,
            term = consensus.term,
            leader = args.leader_id,
            prev_log_index = args.prev_log_index,
            entries = args.entries.len(),
            "received append entries"
        );

        if args.term > consensus.term {
            self.election().become_follower(&mut consensus, args.term);
        }

        if args.term == consensus.term {
            if consensus.role != Role::Follower {
                self.election().become_follower(&mut consensus, args.term);
            }
            consensus.election_reset = std::time::Instant::now();

            let prev_matches = args.prev_log_index == -1
                || (args.prev_log_index < consensus.log.len() as i64
                    && Some(consensus.log[args.prev_log_index as usize].term)
                        == args.prev_log_term);

            if prev_matches {
                reply.success = true;

                // Walk past the prefix both logs already agree on, so an
                // overlapping (duplicate) delivery never truncates entries
                // the follower already holds.
                let mut insert_index = (args.prev_log_index + 1) as usize;
                let mut new_index = 0;
                while insert_index < consensus.log.len()
                    && new_index < args.entries.len()
                    && consensus.log[insert_index].term == args.entries[new_index].term
                {
                    insert_index += 1;
                    new_index += 1;
                }

                if new_index < args.entries.len() {
                    consensus.log.truncate(insert_index);
                    consensus.log.extend_from_slice(&args.entries[new_index..]);
                    debug!(
                        broker = self.core.id,
                        from = insert_index,
                        appended = args.entries.len() - new_index,
                        "spliced entries into log"
                    );
                }

                if args.leader_commit > consensus.commit_index {
                    consensus.commit_index =
                        args.leader_commit.min(consensus.log.len() as i64 - 1);
                    debug!(
                        broker = self.core.id,
                        role = %consensus.role,
                        term = consensus.term,
                        commit_index = consensus.commit_index,
                        "advanced commit index from leader"
                    );
                    self.core.commit_ready.notify_one();
                }
            } else {
                // Fast backup: tell the leader where our log actually
                // stands instead of letting it probe one index at a time.
                if args.prev_log_index >= consensus.log.len() as i64 {
                    reply.conflict_index = consensus.log.len() as i64;
                    reply.conflict_term = None;
                } else {
                    let conflict_term = consensus.log[args.prev_log_index as usize].term;
                    reply.conflict_term = Some(conflict_term);
                    let mut first = args.prev_log_index;
                    while first > 0 && consensus.log[(first - 1) as usize].term == conflict_term {
                        first -= 1;
                    }
                    reply.conflict_index = first;
                }
                debug!(
                    broker = self.core.id,
                    conflict_index = reply.conflict_index,
                    conflict_term = ?reply.conflict_term,
                    "rejected append entries: log mismatch"
                );
            }
        }

        reply.term = consensus.term;
        reply
    }

    /// Starts one replication round: every peer gets its pending suffix in
    /// a parallel task. No-op on non-leaders.
    pub(crate) fn broadcast_round(&self) {
        let saved_term = {
            let consensus = self.core.consensus.lock().unwrap();
            if consensus.role != Role::Leader {
                return;
            }
            consensus.term
        };
        for &peer_id in &self.core.peer_ids {
            let rm = self.clone();
            tokio::spawn(async move {
                rm.replicate_to_peer(peer_id, saved_term).await;
            });
        }
    }

    async fn replicate_to_peer(&self, peer_id: u64, saved_term: u64) {
        let args = {
            let consensus = self.core.consensus.lock().unwrap();
            if consensus.role != Role::Leader || consensus.term != saved_term {
                return;
            }
            let next = consensus
                .next_index
                .get(&peer_id)
                .copied()
                .unwrap_or(consensus.log.len() as i64);
            let prev_log_index = next - 1;
            let prev_log_term = if prev_log_index >= 0 {
                Some(consensus.log[prev_log_index as usize].term)
            } else {
                None
            };
            AppendEntriesArgs {
                term: saved_term,
                leader_id: self.core.id,
                prev_log_index,
                prev_log_term,
                entries: consensus.log[next as usize..].to_vec(),
                leader_commit: consensus.commit_index,
            }
        };

        let prev_log_index = args.prev_log_index;
        let entries_len = args.entries.len() as i64;
        let reply = match self.core.call(peer_id, super::rpc::PeerRequest::AppendEntries(args)).await
        {
            Ok(super::rpc::PeerResponse::AppendEntries(reply)) => reply,
            Ok(_) => return,
            Err(err) => {
                debug!(
                    broker = self.core.id,
                    peer = peer_id,
                    error = %err,
                    "append entries rpc failed"
                );
                return;
            }
        };

        debug!(
            broker = self.core.id,
            peer = reply.id,
            success = reply.success,
            "received append entries reply"
        );
        self.handle_append_reply(peer_id, saved_term, prev_log_index, entries_len, reply);
    }

    /// Applies one peer's reply to leader state: bookkeeping and commit
    /// advance on success, fast backup on rejection, step-down on a newer
    /// term.
    pub(crate) fn handle_append_reply(
        &self,
        peer_id: u64,
        saved_term: u64,
        prev_log_index: i64,
        entries_len: i64,
        reply: AppendEntriesReply,
    ) {
        let mut consensus = self.core.consensus.lock().unwrap();

        if reply.term > consensus.term {
            warn!(
                broker = self.core.id,
                term = consensus.term,
                newer = reply.term,
                "leader term is stale, stepping down"
            );
            self.election().become_follower(&mut consensus, reply.term);
            return;
        }

        if consensus.role != Role::Leader || reply.term != saved_term {
            return;
        }

        if reply.success {
            let next = prev_log_index + 1 + entries_len;
            consensus.next_index.insert(peer_id, next);
            consensus.match_index.insert(peer_id, next - 1);

            let saved_commit = consensus.commit_index;
            for index in (consensus.commit_index + 1)..consensus.log.len() as i64 {
                if consensus.log[index as usize].term != consensus.term {
                    continue;
                }
                let mut matches = 1;
                for &peer in &self.core.peer_ids {
                    if consensus.match_index.get(&peer).copied().unwrap_or(-1) >= index {
                        matches += 1;
                    }
                }
                if self.core.quorum.reached(matches, self.core.peer_ids.len() + 1) {
                    consensus.commit_index = index;
                }
            }

            if consensus.commit_index != saved_commit {
                info!(
                    broker = self.core.id,
                    role = %consensus.role,
                    term = consensus.term,
                    commit_index = consensus.commit_index,
                    "commit index advanced"
                );
                drop(consensus);
                self.core.commit_ready.notify_one();
                // Another round so followers learn the new leader commit
                // without waiting out a heartbeat period.
                self.core.trigger.notify_one();
            }
        } else {
            let next = match reply.conflict_term {
                Some(conflict_term) => {
                    match (0..consensus.log.len())
                        .rev()
                        .find(|&index| consensus.log[index].term == conflict_term)
                    {
                        Some(last_of_term) => last_of_term as i64 + 1,
                        None => reply.conflict_index,
                    }
                }
                None => reply.conflict_index,
            };
            consensus.next_index.insert(peer_id, next);
            debug!(
                broker = self.core.id,
                peer = peer_id,
                next_index = next,
                "fast backup after rejected append entries"
            );
        }
    }

    /// Long-lived commit-stream worker. Waits for a commit-ready signal,
    /// captures the deliverable slice under the consensus lock, then emits
    /// the entries with the lock released. Entries land in `committed_log`
    /// before emission, so a slow consumer still observes the full history
    /// eventually.
    pub(crate) async fn run_commit_worker(self) {
        let mut quit = self.core.quit_rx();
        loop {
            tokio::select! {
                _ = self.core.commit_ready.notified() => {}
                _ = quit.wait_for(|quit| *quit) => return,
            }

            let batch = {
                let mut consensus = self.core.consensus.lock().unwrap();
                if consensus.role == Role::Dead {
                    return;
                }
                if consensus.commit_index <= consensus.last_applied {
                    continue;
                }
                let saved_term = consensus.term;
                let start = (consensus.last_applied + 1) as usize;
                let end = consensus.commit_index as usize;
                let entries = consensus.log[start..=end].to_vec();
                consensus.last_applied = consensus.commit_index;
                consensus.committed_log.extend(entries.iter().cloned());
                debug!(
                    broker = self.core.id,
                    role = %consensus.role,
                    term = saved_term,
                    from = start,
                    to = end,
                    "delivering committed entries"
                );
                (entries, start as u64, saved_term)
            };

            let (entries, start, saved_term) = batch;
            for (offset, entry) in entries.into_iter().enumerate() {
                let commit = CommitEntry {
                    index: start + offset as u64,
                    term: saved_term,
                    document: entry.document,
                    operation: entry.operation,
                };
                if self.core.commit_tx.send(commit).await.is_err() {
                    // Consumer went away; nothing left to deliver to.
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, QuorumRule};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn edit(text: &str) -> EditOperation {
        EditOperation {
            kind: crate::message::EditKind::Insert,
            index: 0,
            value: json!(text),
            replica: "editor".into(),
        }
    }

    fn entry(term: u64) -> LogEntry {
        LogEntry {
            term,
            document: "7".into(),
            operation: edit("x"),
        }
    }

    fn test_module(
        role: Role,
        term: u64,
        log_terms: &[u64],
    ) -> (ReplicationModule, mpsc::Receiver<CommitEntry>) {
        let config = BrokerConfig {
            id: 0,
            peer_ids: vec![1, 2],
            rpc_listen: "127.0.0.1:0".parse().unwrap(),
            http_listen: "127.0.0.1:0".parse().unwrap(),
            initial_role: role,
            quorum: QuorumRule::Majority,
        };
        let (commit_tx, commit_rx) = mpsc::channel(64);
        let core = BrokerCore::new(&config, commit_tx);
        {
            let mut consensus = core.consensus.lock().unwrap();
            consensus.term = term;
            consensus.log = log_terms.iter().map(|&t| entry(t)).collect();
        }
        (ReplicationModule::new(core), commit_rx)
    }

    fn append_args(
        term: u64,
        prev_log_index: i64,
        prev_log_term: Option<u64>,
        entries: Vec<LogEntry>,
        leader_commit: i64,
    ) -> AppendEntriesArgs {
        AppendEntriesArgs {
            term,
            leader_id: 1,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }
    }

    #[tokio::test]
    async fn submit_on_follower_is_rejected_without_mutation() {
        let (rm, _rx) = test_module(Role::Follower, 1, &[]);
        assert_eq!(rm.submit("7", edit("a")), None);
        let consensus = rm.core.consensus.lock().unwrap();
        assert!(consensus.log.is_empty());
    }

    #[tokio::test]
    async fn submit_on_leader_assigns_sequential_indices() {
        let (rm, _rx) = test_module(Role::Leader, 1, &[]);
        assert_eq!(rm.submit("7", edit("a")), Some(0));
        assert_eq!(rm.submit("7", edit("b")), Some(1));
        let consensus = rm.core.consensus.lock().unwrap();
        assert_eq!(consensus.log.len(), 2);
        assert_eq!(consensus.log[0].term, 1);
    }

    #[tokio::test]
    async fn empty_prev_index_accepts_regardless_of_log_length() {
        let (rm, _rx) = test_module(Role::Follower, 1, &[]);
        let reply = rm.append_entries(append_args(1, -1, None, vec![entry(1)], -1));
        assert!(reply.success);
        assert_eq!(rm.core.consensus.lock().unwrap().log.len(), 1);
    }

    #[tokio::test]
    async fn stale_term_is_rejected() {
        let (rm, _rx) = test_module(Role::Follower, 5, &[]);
        let reply = rm.append_entries(append_args(3, -1, None, vec![entry(3)], -1));
        assert!(!reply.success);
        assert_eq!(reply.term, 5);
        assert!(rm.core.consensus.lock().unwrap().log.is_empty());
    }

    #[tokio::test]
    async fn newer_term_forces_follower() {
        let (rm, _rx) = test_module(Role::Leader, 2, &[]);
        let reply = rm.append_entries(append_args(4, -1, None, vec![], -1));
        assert!(reply.success);
        let consensus = rm.core.consensus.lock().unwrap();
        assert_eq!(consensus.role, Role::Follower);
        assert_eq!(consensus.term, 4);
        assert_eq!(consensus.voted_for, None);
    }

    #[tokio::test]
    async fn overlapping_delivery_leaves_log_untouched() {
        let (rm, _rx) = test_module(Role::Follower, 1, &[1, 1, 1]);
        let before = rm.core.consensus.lock().unwrap().log.clone();

        let reply = rm.append_entries(append_args(
            1,
            -1,
            None,
            vec![entry(1), entry(1)],
            -1,
        ));

        assert!(reply.success);
        let consensus = rm.core.consensus.lock().unwrap();
        assert_eq!(consensus.log.len(), 3);
        assert_eq!(consensus.log, before);
    }

    #[tokio::test]
    async fn conflicting_suffix_is_truncated_and_replaced() {
        // Uncommitted entry from a deposed leader at the tail.
        let (rm, _rx) = test_module(Role::Follower, 3, &[1, 1, 1, 1, 1, 2]);
        let reply = rm.append_entries(append_args(3, 4, Some(1), vec![entry(3)], -1));

        assert!(reply.success);
        let consensus = rm.core.consensus.lock().unwrap();
        assert_eq!(consensus.log.len(), 6);
        assert_eq!(consensus.log[5].term, 3);
    }

    #[tokio::test]
    async fn missing_entries_report_log_length_hint() {
        let (rm, _rx) = test_module(Role::Follower, 1, &[1, 1]);
        let reply = rm.append_entries(append_args(1, 9, Some(1), vec![entry(1)], -1));

        assert!(!reply.success);
        assert_eq!(reply.conflict_index, 2);
        assert_eq!(reply.conflict_term, None);
    }

    #[tokio::test]
    async fn term_mismatch_reports_first_index_of_conflicting_term() {
        let (rm, _rx) = test_module(Role::Follower, 3, &[1, 2, 2, 2]);
        let reply = rm.append_entries(append_args(3, 3, Some(3), vec![entry(3)], -1));

        assert!(!reply.success);
        assert_eq!(reply.conflict_term, Some(2));
        assert_eq!(reply.conflict_index, 1);
    }

    #[tokio::test]
    async fn fast_backup_rewinds_next_index() {
        let (rm, _rx) = test_module(Role::Leader, 1, &[1, 1, 1, 1, 1, 1, 1, 1, 1, 1]);
        rm.core
            .consensus
            .lock()
            .unwrap()
            .next_index
            .insert(1, 10);

        let reply = AppendEntriesReply {
            term: 1,
            success: false,
            id: 1,
            conflict_index: 2,
            conflict_term: None,
        };
        rm.handle_append_reply(1, 1, 9, 1, reply);

        let consensus = rm.core.consensus.lock().unwrap();
        assert_eq!(consensus.next_index.get(&1), Some(&2));
    }

    #[tokio::test]
    async fn fast_backup_prefers_leaders_last_entry_of_conflict_term() {
        let (rm, _rx) = test_module(Role::Leader, 3, &[1, 2, 2, 3]);
        let reply = AppendEntriesReply {
            term: 3,
            success: false,
            id: 1,
            conflict_index: 1,
            conflict_term: Some(2),
        };
        rm.handle_append_reply(1, 3, 3, 0, reply);

        // Leader's last entry of term 2 sits at index 2, so the peer
        // resumes at index 3.
        let consensus = rm.core.consensus.lock().unwrap();
        assert_eq!(consensus.next_index.get(&1), Some(&3));
    }

    #[tokio::test]
    async fn successful_reply_advances_commit_on_majority() {
        let (rm, _rx) = test_module(Role::Leader, 1, &[1]);
        {
            let mut consensus = rm.core.consensus.lock().unwrap();
            consensus.next_index.insert(1, 0);
            consensus.next_index.insert(2, 0);
            consensus.match_index.insert(1, -1);
            consensus.match_index.insert(2, -1);
        }

        let reply = AppendEntriesReply {
            term: 1,
            success: true,
            id: 1,
            conflict_index: -1,
            conflict_term: None,
        };
        rm.handle_append_reply(1, 1, -1, 1, reply);

        let consensus = rm.core.consensus.lock().unwrap();
        assert_eq!(consensus.match_index.get(&1), Some(&0));
        assert_eq!(consensus.commit_index, 0);
    }

    #[tokio::test]
    async fn all_peers_rule_waits_for_the_last_follower() {
        let config = BrokerConfig {
            id: 0,
            peer_ids: vec![1, 2],
            rpc_listen: "127.0.0.1:0".parse().unwrap(),
            http_listen: "127.0.0.1:0".parse().unwrap(),
            initial_role: Role::Leader,
            quorum: QuorumRule::AllPeers,
        };
        let (commit_tx, _rx) = mpsc::channel(8);
        let core = BrokerCore::new(&config, commit_tx);
        {
            let mut consensus = core.consensus.lock().unwrap();
            consensus.term = 1;
            consensus.log = vec![entry(1)];
        }
        let rm = ReplicationModule::new(core);

        let success = |id| AppendEntriesReply {
            term: 1,
            success: true,
            id,
            conflict_index: -1,
            conflict_term: None,
        };

        rm.handle_append_reply(1, 1, -1, 1, success(1));
        assert_eq!(
            rm.core.consensus.lock().unwrap().commit_index,
            -1,
            "one follower short of the full cluster"
        );

        rm.handle_append_reply(2, 1, -1, 1, success(2));
        assert_eq!(rm.core.consensus.lock().unwrap().commit_index, 0);
    }

    #[tokio::test]
    async fn entries_from_older_terms_never_commit_by_counting() {
        let (rm, _rx) = test_module(Role::Leader, 2, &[1]);
        {
            let mut consensus = rm.core.consensus.lock().unwrap();
            consensus.match_index.insert(1, 0);
            consensus.match_index.insert(2, 0);
        }

        let reply = AppendEntriesReply {
            term: 2,
            success: true,
            id: 1,
            conflict_index: -1,
            conflict_term: None,
        };
        rm.handle_append_reply(1, 2, -1, 1, reply);

        assert_eq!(rm.core.consensus.lock().unwrap().commit_index, -1);
    }

    #[tokio::test]
    async fn stale_leader_steps_down_on_newer_reply_term() {
        let (rm, _rx) = test_module(Role::Leader, 2, &[]);
        let reply = AppendEntriesReply {
            term: 7,
            success: false,
            id: 1,
            conflict_index: -1,
            conflict_term: None,
        };
        rm.handle_append_reply(1, 2, -1, 0, reply);

        let consensus = rm.core.consensus.lock().unwrap();
        assert_eq!(consensus.role, Role::Follower);
        assert_eq!(consensus.term, 7);
    }

    #[tokio::test]
    async fn commit_worker_emits_each_entry_exactly_once() {
        let (rm, mut commit_rx) = test_module(Role::Follower, 1, &[1, 1]);
        {
            let mut consensus = rm.core.consensus.lock().unwrap();
            consensus.commit_index = 1;
        }
        let worker = tokio::spawn(rm.clone().run_commit_worker());
        rm.core.commit_ready.notify_one();

        let first = commit_rx.recv().await.expect("first commit");
        let second = commit_rx.recv().await.expect("second commit");
        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);

        // A redundant signal with no new commits must deliver nothing.
        rm.core.commit_ready.notify_one();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(commit_rx.try_recv().is_err());

        rm.core.consensus.lock().unwrap().role = Role::Dead;
        rm.core.commit_ready.notify_one();
        let _ = worker.await;
    }

    #[tokio::test]
    async fn committed_operations_are_leader_only() {
        let (rm, _rx) = test_module(Role::Follower, 1, &[]);
        assert!(rm.committed_operations().is_none());

        let (rm, _rx) = test_module(Role::Leader, 1, &[]);
        rm.core
            .consensus
            .lock()
            .unwrap()
            .committed_log
            .push(entry(1));
        let ops = rm.committed_operations().expect("leader serves the log");
        assert_eq!(ops.len(), 1);
    }
}
