//! In-process cluster harness shared by the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep};

use tandem::broker::{BrokerServer, BrokerStatus, CommitEntry, Role};
use tandem::config::{BrokerConfig, QuorumRule};
use tandem::message::{EditKind, EditMessage, Source};

pub const POLL_INTERVAL: Duration = Duration::from_millis(25);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A cluster of real brokers on ephemeral localhost ports, fully meshed
/// over their RPC transports.
pub struct TestCluster {
    pub brokers: Vec<Arc<BrokerServer>>,
    pub commit_rxs: Vec<mpsc::Receiver<CommitEntry>>,
    // Held so the ready gate stays open for the cluster's lifetime.
    _ready_tx: watch::Sender<bool>,
}

impl TestCluster {
    /// Spawns `n` brokers, meshes them, and opens the ready gate. With
    /// `bootstrap_leader`, broker 0 starts as leader; otherwise everyone
    /// starts as a follower and an election decides.
    pub async fn spawn(n: usize, quorum: QuorumRule, bootstrap_leader: bool) -> Result<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        let mut brokers = Vec::new();
        let mut commit_rxs = Vec::new();

        for id in 0..n as u64 {
            let (commit_tx, commit_rx) = mpsc::channel(512);
            let config = BrokerConfig {
                id,
                peer_ids: (0..n as u64).filter(|peer| *peer != id).collect(),
                rpc_listen: "127.0.0.1:0".parse().unwrap(),
                http_listen: "127.0.0.1:0".parse().unwrap(),
                initial_role: if bootstrap_leader && id == 0 {
                    Role::Leader
                } else {
                    Role::Follower
                },
                quorum,
            };
            brokers.push(BrokerServer::start(config, ready_rx.clone(), commit_tx).await?);
            commit_rxs.push(commit_rx);
        }

        for (i, broker) in brokers.iter().enumerate() {
            for (j, peer) in brokers.iter().enumerate() {
                if i != j {
                    broker.connect_to_peer(j as u64, peer.rpc_addr()).await?;
                }
            }
        }

        let _ = ready_tx.send(true);

        Ok(Self {
            brokers,
            commit_rxs,
            _ready_tx: ready_tx,
        })
    }

    pub fn statuses(&self) -> Vec<BrokerStatus> {
        self.brokers.iter().map(|broker| broker.status()).collect()
    }

    /// Waits until exactly one live broker is leader and returns its
    /// index.
    pub async fn wait_for_leader(&self) -> Result<usize> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let leaders: Vec<usize> = self
                .statuses()
                .iter()
                .enumerate()
                .filter(|(_, status)| status.role == Role::Leader)
                .map(|(index, _)| index)
                .collect();
            if leaders.len() == 1 {
                return Ok(leaders[0]);
            }
            if Instant::now() > deadline {
                bail!("no single leader emerged: {:?}", self.statuses());
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Waits until every live broker's commit index reaches `index`.
    pub async fn wait_for_commit(&self, index: i64) -> Result<()> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let statuses = self.statuses();
            if statuses
                .iter()
                .filter(|status| status.role != Role::Dead)
                .all(|status| status.commit_index >= index)
            {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("commit index never reached {index}: {statuses:?}");
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn shutdown(self) {
        for broker in &self.brokers {
            broker.shutdown().await;
        }
    }
}

pub fn insert_message(value: &str, index: i64, document: i64, replica: &str) -> EditMessage {
    EditMessage {
        kind: EditKind::Insert,
        index,
        value: json!(value),
        replica_id: replica.to_string(),
        document,
        source: Source::Client,
    }
}

/// POSTs an edit to one broker's HTTP endpoint and returns the status.
pub async fn post_edit(
    client: &reqwest::Client,
    http_addr: std::net::SocketAddr,
    message: &EditMessage,
) -> Result<reqwest::StatusCode> {
    let response = client
        .post(format!("http://{http_addr}/crdt"))
        .json(message)
        .send()
        .await?;
    Ok(response.status())
}
