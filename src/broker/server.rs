//! Broker lifecycle and shared state.
//!
//! A broker hosts the replication and election modules over one shared
//! core. Two locks partition the state: `peers` guards transport
//! membership (which peers are dialed), `consensus` guards every piece of
//! algorithmic state the two modules read or write. The consensus lock is
//! a blocking `std` mutex whose guard cannot be held across an `await`
//! point, so no RPC or commit-stream send can ever happen while the lock
//! is held: snapshots are taken under the lock, the lock is released,
//! and replies are applied under a fresh acquisition.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as TokioMutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::broker::election::ElectionModule;
use crate::broker::http;
use crate::broker::replication::{CommitEntry, LogEntry, ReplicationModule};
use crate::broker::rpc::{PeerClient, PeerRequest, PeerResponse, serve_peer};
use crate::config::{BrokerConfig, QuorumRule};
use crate::message::EditOperation;

/// Broker role. `Dead` is the administrative terminal state: a dead broker
/// stops answering RPCs and every worker task drains out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Dead,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// All algorithmic state of the replication and election modules. Log
/// indices are `i64` with `-1` meaning "nothing yet", matching the wire
/// protocol's sentinels.
pub(crate) struct Consensus {
    pub(crate) role: Role,
    pub(crate) term: u64,
    pub(crate) voted_for: Option<u64>,
    pub(crate) log: Vec<LogEntry>,
    pub(crate) committed_log: Vec<LogEntry>,
    pub(crate) commit_index: i64,
    pub(crate) last_applied: i64,
    pub(crate) next_index: HashMap<u64, i64>,
    pub(crate) match_index: HashMap<u64, i64>,
    pub(crate) election_reset: Instant,
}

impl Consensus {
    fn new(initial_role: Role) -> Self {
        Self {
            role: initial_role,
            term: 0,
            voted_for: None,
            log: Vec::new(),
            committed_log: Vec::new(),
            commit_index: -1,
            last_applied: -1,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_reset: Instant::now(),
        }
    }

    /// `(last index, last term)` of the log, `(-1, None)` when empty.
    pub(crate) fn last_log_position(&self) -> (i64, Option<u64>) {
        match self.log.last() {
            Some(entry) => (self.log.len() as i64 - 1, Some(entry.term)),
            None => (-1, None),
        }
    }
}

/// State shared by the replication module, the election module, and the
/// transports.
pub(crate) struct BrokerCore {
    pub(crate) id: u64,
    pub(crate) peer_ids: Vec<u64>,
    pub(crate) quorum: QuorumRule,
    pub(crate) consensus: StdMutex<Consensus>,
    pub(crate) peers: TokioMutex<HashMap<u64, Arc<PeerClient>>>,
    /// Wakes the commit-stream worker; its single stored permit coalesces
    /// bursts of signals into one delivery pass.
    pub(crate) commit_ready: Notify,
    /// Edge-triggers a leader replication round; one pending trigger
    /// coalesces any number of submits.
    pub(crate) trigger: Notify,
    pub(crate) commit_tx: mpsc::Sender<CommitEntry>,
    quit: watch::Sender<bool>,
}

impl BrokerCore {
    pub(crate) fn new(config: &BrokerConfig, commit_tx: mpsc::Sender<CommitEntry>) -> Arc<Self> {
        let (quit, _) = watch::channel(false);
        Arc::new(Self {
            id: config.id,
            peer_ids: config.peer_ids.clone(),
            quorum: config.quorum,
            consensus: StdMutex::new(Consensus::new(config.initial_role)),
            peers: TokioMutex::new(HashMap::new()),
            commit_ready: Notify::new(),
            trigger: Notify::new(),
            commit_tx,
            quit,
        })
    }

    pub(crate) fn quit_rx(&self) -> watch::Receiver<bool> {
        self.quit.subscribe()
    }

    /// Issues one RPC to a connected peer. Transport failures and timeouts
    /// surface as errors the caller treats as benign.
    pub(crate) async fn call(&self, peer_id: u64, request: PeerRequest) -> Result<PeerResponse> {
        let client = {
            let peers = self.peers.lock().await;
            peers.get(&peer_id).cloned()
        };
        let Some(client) = client else {
            bail!("peer {peer_id} is not connected");
        };
        client.call(&request).await
    }
}

/// Point-in-time view of a broker, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStatus {
    pub id: u64,
    pub role: Role,
    pub term: u64,
    pub commit_index: i64,
    pub last_applied: i64,
    pub log_len: usize,
}

/// A running broker: the consensus core plus its two listeners and worker
/// tasks.
pub struct BrokerServer {
    core: Arc<BrokerCore>,
    rm: ReplicationModule,
    rpc_addr: SocketAddr,
    http_addr: SocketAddr,
    tasks: TokioMutex<Vec<JoinHandle<()>>>,
}

impl BrokerServer {
    /// Binds the peer RPC and HTTP listeners and spawns the broker's
    /// worker tasks. Timers stay parked until `ready` flips to `true`, so
    /// a cluster can bring every member up before the first election
    /// timeout starts counting.
    ///
    /// Committed entries are delivered on `commit_tx` in strictly
    /// increasing index order; size the channel generously or drain it
    /// promptly, because a full channel backpressures the commit worker
    /// (never the consensus lock).
    pub async fn start(
        config: BrokerConfig,
        ready: watch::Receiver<bool>,
        commit_tx: mpsc::Sender<CommitEntry>,
    ) -> Result<Arc<Self>> {
        let rpc_listener = TcpListener::bind(config.rpc_listen)
            .await
            .with_context(|| format!("broker {} failed to bind rpc listener", config.id))?;
        let http_listener = TcpListener::bind(config.http_listen)
            .await
            .with_context(|| format!("broker {} failed to bind http listener", config.id))?;
        let rpc_addr = rpc_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        let core = BrokerCore::new(&config, commit_tx);
        let rm = ReplicationModule::new(core.clone());
        let em = ElectionModule::new(core.clone());

        info!(
            broker = core.id,
            rpc = %rpc_addr,
            http = %http_addr,
            "broker listening"
        );

        let mut tasks = Vec::new();
        tasks.push(spawn_rpc_accept_loop(rpc_listener, rm.clone(), em.clone()));
        tasks.push(spawn_http_server(http_listener, rm.clone()));
        tasks.push(tokio::spawn(rm.clone().run_commit_worker()));
        tasks.push(spawn_activation(core.clone(), em, ready, config.initial_role));

        Ok(Arc::new(Self {
            core,
            rm,
            rpc_addr,
            http_addr,
            tasks: TokioMutex::new(tasks),
        }))
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn status(&self) -> BrokerStatus {
        let consensus = self.core.consensus.lock().unwrap();
        BrokerStatus {
            id: self.core.id,
            role: consensus.role,
            term: consensus.term,
            commit_index: consensus.commit_index,
            last_applied: consensus.last_applied,
            log_len: consensus.log.len(),
        }
    }

    /// Submits an edit directly, bypassing HTTP. `None` means this broker
    /// is not the leader.
    pub fn submit(&self, document: &str, operation: EditOperation) -> Option<u64> {
        self.rm.submit(document, operation)
    }

    /// Dials a peer's RPC transport. Idempotent: reconnecting an already
    /// connected peer is a no-op.
    pub async fn connect_to_peer(&self, peer_id: u64, addr: SocketAddr) -> Result<()> {
        let mut peers = self.core.peers.lock().await;
        if peers.contains_key(&peer_id) {
            return Ok(());
        }
        let client = PeerClient::connect(addr)
            .await
            .with_context(|| format!("broker {} failed to dial peer {peer_id}", self.core.id))?;
        peers.insert(peer_id, Arc::new(client));
        debug!(broker = self.core.id, peer = peer_id, %addr, "connected to peer");
        Ok(())
    }

    pub async fn disconnect_peer(&self, peer_id: u64) {
        let mut peers = self.core.peers.lock().await;
        if peers.remove(&peer_id).is_some() {
            debug!(broker = self.core.id, peer = peer_id, "disconnected peer");
        }
    }

    pub async fn disconnect_all(&self) {
        let mut peers = self.core.peers.lock().await;
        peers.clear();
    }

    /// Stops the broker: role flips to `Dead`, the quit signal fans out to
    /// every worker, listeners close, and the spawned workers are joined.
    pub async fn shutdown(&self) {
        {
            let mut consensus = self.core.consensus.lock().unwrap();
            if consensus.role == Role::Dead {
                return;
            }
            consensus.role = Role::Dead;
            info!(broker = self.core.id, term = consensus.term, "broker shutting down");
        }

        let _ = self.core.quit.send(true);
        // Wake workers parked on their signals so they observe the quit.
        self.core.commit_ready.notify_one();
        self.core.trigger.notify_one();
        self.disconnect_all().await;

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}

fn spawn_rpc_accept_loop(
    listener: TcpListener,
    rm: ReplicationModule,
    em: ElectionModule,
) -> JoinHandle<()> {
    let mut quit = rm.quit_rx();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = quit.wait_for(|quit| *quit) => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let rm = rm.clone();
                            let em = em.clone();
                            let mut conn_quit = rm.quit_rx();
                            tokio::spawn(async move {
                                tokio::select! {
                                    result = serve_peer(stream, rm, em) => {
                                        if let Err(err) = result {
                                            debug!(peer = %peer_addr, error = %err, "peer connection closed with error");
                                        }
                                    }
                                    _ = conn_quit.wait_for(|quit| *quit) => {}
                                }
                            });
                        }
                        Err(err) => {
                            error!(error = %err, "rpc accept failed");
                            break;
                        }
                    }
                }
            }
        }
    })
}

fn spawn_http_server(listener: TcpListener, rm: ReplicationModule) -> JoinHandle<()> {
    let mut quit = rm.quit_rx();
    let app = http::router(rm.clone());
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = quit.wait_for(|quit| *quit).await;
        };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %err, "http server exited");
        }
    })
}

/// Parks until the cluster's ready gate opens, then arms the broker:
/// followers start their election timer, a bootstrap leader assumes
/// leadership immediately.
fn spawn_activation(
    core: Arc<BrokerCore>,
    em: ElectionModule,
    mut ready: watch::Receiver<bool>,
    initial_role: Role,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if ready.wait_for(|ready| *ready).await.is_err() {
            return;
        }
        let mut consensus = core.consensus.lock().unwrap();
        if consensus.role == Role::Dead {
            return;
        }
        consensus.election_reset = Instant::now();
        match initial_role {
            Role::Leader => em.become_leader(&mut consensus),
            _ => em.spawn_election_timer(),
        }
    })
}
