use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tandem::appserver::{self, AppServer};
use tandem::broker::{BrokerServer, Role};
use tandem::cli::{AppserverArgs, BrokerArgs, Cli, Command};
use tandem::config::{AppServerConfig, BrokerConfig};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Broker(args) => run_broker(args).await,
        Command::Appserver(args) => run_appserver(args).await,
    }
}

async fn run_broker(args: BrokerArgs) -> Result<()> {
    let config = BrokerConfig {
        id: args.id,
        peer_ids: args.peers.iter().map(|(id, _)| *id).collect(),
        rpc_listen: args.rpc_listen,
        http_listen: args.http_listen,
        initial_role: if args.bootstrap_leader {
            Role::Leader
        } else {
            Role::Follower
        },
        quorum: args.quorum,
    };

    let (ready_tx, ready_rx) = watch::channel(false);
    // Generous buffer: the commit stream blocks the commit worker (never
    // the consensus lock) when it fills.
    let (commit_tx, mut commit_rx) = mpsc::channel(512);

    let broker = BrokerServer::start(config, ready_rx, commit_tx).await?;

    // Keep dialing peers in the background; members of a fresh cluster
    // come up in arbitrary order.
    for (peer_id, addr) in args.peers {
        let broker = broker.clone();
        tokio::spawn(async move {
            loop {
                match broker.connect_to_peer(peer_id, addr).await {
                    Ok(()) => break,
                    Err(err) => {
                        debug!(peer = peer_id, error = %err, "peer dial failed, retrying");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        });
    }

    let _ = ready_tx.send(true);

    loop {
        tokio::select! {
            entry = commit_rx.recv() => {
                match entry {
                    Some(entry) => {
                        info!(
                            index = entry.index,
                            term = entry.term,
                            document = %entry.document,
                            "edit committed"
                        );
                    }
                    None => break,
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to install ctrl-c handler");
                }
                break;
            }
        }
    }

    broker.shutdown().await;
    Ok(())
}

async fn run_appserver(args: AppserverArgs) -> Result<()> {
    let config = AppServerConfig {
        replica_id: args.replica_id,
        listen: args.listen,
        brokers: args.brokers,
    };

    let listener = appserver::bind_listener(config.listen).await?;
    let server = AppServer::new(&config);
    info!(
        replica = %config.replica_id,
        listen = %listener.local_addr()?,
        "application server listening"
    );

    if args.reconcile {
        match server.reconcile().await {
            Ok(replayed) => info!(replayed, "recovered replica from committed log"),
            Err(err) => warn!(error = %err, "reconciliation failed, starting empty"),
        }
    }

    server.run_until_ctrl_c(listener).await
}
