//! Application server: the edge process editor clients talk to.
//!
//! Each client holds a persistent newline-delimited-JSON session. Inbound
//! client edits are fanned out to every broker over HTTP (the leader
//! accepts, followers refuse) and simultaneously applied to this
//! process's CRDT replica; the resulting CRDT operation is broadcast to
//! every connected session. Broker-sourced edits are applied and
//! broadcast but never fanned back out, which is what breaks the
//! delivery loop. A fresh or rejoining server recovers by replaying the
//! cluster's committed operation sequence from the leader.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::future::join_all;
use reqwest::StatusCode;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::AppServerConfig;
use crate::crdt::{Operation, TextReplica};
use crate::message::{EditKind, EditMessage, EditOperation, Source, read_message, write_message};

/// How long a reconciliation GET may take before the next broker is tried.
const RECONCILE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AppServer {
    replica_id: String,
    brokers: Vec<String>,
    replica: Mutex<TextReplica>,
    broadcaster: broadcast::Sender<Operation>,
    http: reqwest::Client,
}

impl AppServer {
    pub fn new(config: &AppServerConfig) -> Arc<Self> {
        // The broadcast buffer covers bursts of edits; a session that lags
        // this far behind is warned and keeps going.
        let (broadcaster, _) = broadcast::channel(256);
        Arc::new(Self {
            replica_id: config.replica_id.clone(),
            brokers: config.brokers.clone(),
            replica: Mutex::new(TextReplica::new(&config.replica_id)),
            broadcaster,
            http: reqwest::Client::new(),
        })
    }

    /// Accepts client sessions until `shutdown` resolves. Each session
    /// runs on its own task so a slow client never blocks new accepts.
    pub async fn run_until<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(replica = %self.replica_id, "application server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(err) = server.handle_session(stream).await {
                                    debug!(peer = %peer, error = %err, "session closed with error");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to accept session");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        self.run_until(listener, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// One client session: read edits until the connection drops, while
    /// forwarding every broadcast operation back down the socket.
    async fn handle_session(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let peer = stream.peer_addr().ok();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut inbox = self.broadcaster.subscribe();

        info!(replica = %self.replica_id, ?peer, "session opened");

        loop {
            select! {
                incoming = read_message::<_, EditMessage>(&mut reader) => {
                    match incoming? {
                        Some(message) => self.process_message(message),
                        None => break,
                    }
                }
                operation = inbox.recv() => {
                    match operation {
                        Ok(operation) => {
                            if let Err(err) = write_message(&mut writer, &operation).await {
                                debug!(?peer, error = %err, "failed to deliver operation to session");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(?peer, skipped, "session fell behind the broadcast stream");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        info!(replica = %self.replica_id, ?peer, "session closed");
        Ok(())
    }

    fn process_message(&self, message: EditMessage) {
        match message.source {
            Source::Client => {
                self.fan_out(&message);
                self.apply_and_broadcast(&message);
            }
            // Broker-delivered edits are already cluster-ordered; apply
            // and rebroadcast, never fan back out.
            Source::Broker => self.apply_and_broadcast(&message),
        }
    }

    /// POSTs the raw message to every broker in parallel. Failures are
    /// logged and swallowed so one unreachable broker never stalls a
    /// session; follower refusals are expected.
    fn fan_out(&self, message: &EditMessage) {
        let client = self.http.clone();
        let brokers = self.brokers.clone();
        let message = message.clone();
        tokio::spawn(async move {
            let posts = brokers.iter().map(|broker| {
                let url = format!("http://{broker}/crdt");
                client.post(url).json(&message).send()
            });
            for (broker, result) in brokers.iter().zip(join_all(posts).await) {
                match result {
                    Ok(response) if response.status() == StatusCode::ACCEPTED => {
                        debug!(broker = %broker, "edit accepted by leader");
                    }
                    Ok(response) => {
                        debug!(broker = %broker, status = %response.status(), "broker refused edit");
                    }
                    Err(err) => {
                        warn!(broker = %broker, error = %err, "failed to deliver edit to broker");
                    }
                }
            }
        });
    }

    fn apply_and_broadcast(&self, message: &EditMessage) {
        let operation = {
            let mut replica = self.replica.lock().unwrap();
            apply_edit(&mut replica, &message.operation())
        };
        match operation {
            Some(operation) => {
                // Send fails only when no session is connected.
                let _ = self.broadcaster.send(operation);
            }
            None => {
                warn!(
                    replica = %self.replica_id,
                    index = message.index,
                    "ignored edit outside document bounds"
                );
            }
        }
    }

    /// The materialized text, in order.
    pub fn representation(&self) -> String {
        self.replica.lock().unwrap().materialize()
    }

    pub fn session_count(&self) -> usize {
        self.broadcaster.receiver_count()
    }

    /// Recovery path for a fresh or rejoining replica: asks each broker
    /// for the committed operation sequence (followers answer 403 and are
    /// skipped), then rebuilds the local replica by replaying it in
    /// order. Returns the number of operations replayed.
    pub async fn reconcile(&self) -> Result<usize> {
        for broker in &self.brokers {
            let url = format!("http://{broker}/logrequest");
            let response = match self
                .http
                .get(&url)
                .timeout(RECONCILE_TIMEOUT)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    warn!(broker = %broker, error = %err, "log request failed");
                    continue;
                }
            };

            if response.status() == StatusCode::FORBIDDEN {
                debug!(broker = %broker, "skipping non-leader during reconciliation");
                continue;
            }
            if !response.status().is_success() {
                warn!(broker = %broker, status = %response.status(), "unexpected log response");
                continue;
            }

            let operations: Vec<EditOperation> = response
                .json()
                .await
                .context("failed to decode committed log")?;
            let replayed = operations.len();

            let mut replica = self.replica.lock().unwrap();
            *replica = TextReplica::new(&self.replica_id);
            for operation in &operations {
                apply_edit(&mut replica, operation);
            }
            info!(
                replica = %self.replica_id,
                broker = %broker,
                replayed,
                "reconciled from committed log"
            );
            return Ok(replayed);
        }
        bail!("no broker returned the committed log")
    }
}

/// Applies one index-based edit to the replica, producing the CRDT
/// operation peers need. Indices below zero clamp to the start; inserts
/// past the end clamp to the end; deletes past the end are ignored.
fn apply_edit(replica: &mut TextReplica, edit: &EditOperation) -> Option<Operation> {
    let index = edit.index.max(0) as usize;
    match edit.kind {
        EditKind::Insert => Some(replica.local_insert(index, &edit.value_text())),
        EditKind::Delete => replica.local_delete(index),
    }
}

/// Binds the session listener for an application server.
pub async fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind session listener on {addr}"))
}
