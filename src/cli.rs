use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::config::QuorumRule;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one broker of the replicated edit-log cluster.
    Broker(BrokerArgs),
    /// Run an application server terminating editor sessions.
    Appserver(AppserverArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// This broker's id. Must be unique across the cluster.
    #[arg(long)]
    pub id: u64,

    /// Bind address for the peer RPC transport. Use port 0 for an
    /// ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7000")]
    pub rpc_listen: SocketAddr,

    /// Bind address for the client-facing HTTP endpoint.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub http_listen: SocketAddr,

    /// Peer brokers as `id=rpc-address` pairs, one per flag.
    #[arg(long = "peer", value_parser = parse_peer)]
    pub peers: Vec<(u64, SocketAddr)>,

    /// Replication threshold for committing entries.
    #[arg(long, value_enum, default_value_t = QuorumRule::Majority)]
    pub quorum: QuorumRule,

    /// Start this broker as the cluster's initial leader. Exactly one
    /// broker should carry this flag when bootstrapping a fresh cluster.
    #[arg(long)]
    pub bootstrap_leader: bool,
}

#[derive(Args, Debug, Clone)]
pub struct AppserverArgs {
    /// Replica name for this server's CRDT instance.
    #[arg(long)]
    pub replica_id: String,

    /// Bind address for client sessions.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub listen: SocketAddr,

    /// Broker HTTP addresses, one per flag.
    #[arg(long = "broker")]
    pub brokers: Vec<String>,

    /// Rebuild the local replica from the cluster's committed log before
    /// accepting sessions.
    #[arg(long)]
    pub reconcile: bool,
}

fn parse_peer(raw: &str) -> Result<(u64, SocketAddr), String> {
    let (id, addr) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected id=address, got '{raw}'"))?;
    let id = id
        .parse::<u64>()
        .map_err(|err| format!("invalid peer id '{id}': {err}"))?;
    let addr = addr
        .parse::<SocketAddr>()
        .map_err(|err| format!("invalid peer address '{addr}': {err}"))?;
    Ok((id, addr))
}
