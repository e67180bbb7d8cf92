use std::net::SocketAddr;

use clap::ValueEnum;

use crate::broker::Role;

/// How many replicas must hold an entry before the leader commits it.
///
/// `Majority` is the availability-preserving rule: a strict majority of the
/// cluster (leader included) suffices. `AllPeers` demands every peer before
/// anything commits, which stalls the log as soon as a single follower is
/// unreachable; it exists for deployments that prefer full replication over
/// availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum QuorumRule {
    #[default]
    Majority,
    AllPeers,
}

impl QuorumRule {
    /// `matches` counts replicas holding the entry, leader included;
    /// `cluster` is the full cluster size.
    pub fn reached(&self, matches: usize, cluster: usize) -> bool {
        match self {
            QuorumRule::Majority => matches * 2 > cluster,
            QuorumRule::AllPeers => matches == cluster,
        }
    }
}

/// Per-broker settings. Peer RPC addresses are dialed explicitly via
/// `BrokerServer::connect_to_peer`, so only the ids live here.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub id: u64,
    pub peer_ids: Vec<u64>,
    /// Bind address for the peer RPC transport. Port 0 picks an ephemeral
    /// port; the bound address is available from the running server.
    pub rpc_listen: SocketAddr,
    /// Bind address for the client-facing HTTP endpoint.
    pub http_listen: SocketAddr,
    /// Role the broker assumes once the cluster releases its ready gate.
    /// Bootstrapping a fresh cluster starts one broker as leader; every
    /// other deployment starts followers and lets the election settle it.
    pub initial_role: Role,
    pub quorum: QuorumRule,
}

/// Per-application-server settings.
#[derive(Debug, Clone)]
pub struct AppServerConfig {
    /// Replica name used for CRDT element ids.
    pub replica_id: String,
    /// Bind address for client sessions.
    pub listen: SocketAddr,
    /// HTTP addresses (`host:port`) of every broker in the cluster.
    pub brokers: Vec<String>,
}
