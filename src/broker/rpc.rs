//! Peer-to-peer RPC transport.
//!
//! Brokers talk to each other over persistent TCP connections carrying
//! newline-delimited JSON frames. Each frame is a tagged request or
//! response envelope; a connection serves requests sequentially, and the
//! client side serializes its calls on the connection, so one in-flight
//! request pairs with one response. Every call is wrapped in a transport
//! timeout: a timed-out or failed call is a benign error and never mutates
//! consensus state.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::broker::election::{ElectionModule, RequestVoteArgs, RequestVoteReply};
use crate::broker::replication::{AppendEntriesArgs, AppendEntriesReply, ReplicationModule};
use crate::message::{read_message, write_message};

/// Per-call transport timeout. Short enough that a stalled peer does not
/// hold up a replication round past the next heartbeat.
const CALL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum PeerRequest {
    AppendEntries(AppendEntriesArgs),
    RequestVote(RequestVoteArgs),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "reply", rename_all = "snake_case")]
pub enum PeerResponse {
    AppendEntries(AppendEntriesReply),
    RequestVote(RequestVoteReply),
}

/// Client half of one broker-to-broker connection.
pub struct PeerClient {
    io: Mutex<(BufReader<OwnedReadHalf>, OwnedWriteHalf)>,
}

impl PeerClient {
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            io: Mutex::new((BufReader::new(reader), writer)),
        })
    }

    /// The timeout covers waiting for the connection as well as the wire
    /// round trip, so calls queued behind a stalled peer give up instead
    /// of piling onto the connection lock.
    pub async fn call(&self, request: &PeerRequest) -> Result<PeerResponse> {
        let response = timeout(CALL_TIMEOUT, async {
            let mut io = self.io.lock().await;
            let (reader, writer) = &mut *io;
            write_message(writer, request).await?;
            match read_message::<_, PeerResponse>(reader).await? {
                Some(response) => Ok::<_, io::Error>(response),
                None => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                )),
            }
        })
        .await
        .map_err(|_| anyhow!("rpc timed out"))?
        .context("rpc transport failed")?;
        Ok(response)
    }
}

/// Serves one inbound peer connection until the peer hangs up.
pub(crate) async fn serve_peer(
    stream: TcpStream,
    rm: ReplicationModule,
    em: ElectionModule,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(request) = read_message::<_, PeerRequest>(&mut reader).await? {
        let response = match request {
            PeerRequest::AppendEntries(args) => {
                PeerResponse::AppendEntries(rm.append_entries(args))
            }
            PeerRequest::RequestVote(args) => PeerResponse::RequestVote(em.request_vote(args)),
        };
        write_message(&mut writer, &response).await?;
    }

    Ok(())
}
