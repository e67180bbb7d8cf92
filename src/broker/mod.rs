//! Broker: one member of the replicated edit-log cluster.
//!
//! A broker hosts two cooperating modules over shared state: the
//! [`replication`] module owns the log, the commit index, and the commit
//! stream; the [`election`] module owns terms, votes, and role
//! transitions. The [`server`] wires both behind a peer-facing RPC
//! transport ([`rpc`]) and a client-facing HTTP endpoint ([`http`]).

pub mod election;
mod http;
pub mod replication;
pub mod rpc;
pub mod server;

pub use replication::{AppendEntriesArgs, AppendEntriesReply, CommitEntry, LogEntry};
pub use election::{RequestVoteArgs, RequestVoteReply};
pub use server::{BrokerServer, BrokerStatus, Role};
