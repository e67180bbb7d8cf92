//! Collaborative text-editing backend.
//!
//! Editor clients hold persistent sessions against stateless *application
//! servers*; every edit is fanned out to a *broker cluster* that replicates
//! an ordered log of operations for durability. Brokers run a leader-based
//! consensus core: the leader accepts edits, replicates them to followers,
//! advances a commit index once a quorum matches, and surfaces committed
//! entries on a commit stream in total order. Application servers apply
//! edits to a per-process sequence CRDT and broadcast the resulting
//! operations to every connected session, so replicas converge even when
//! the same edit is delivered more than once.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`broker`] hosts the replication and election modules behind a
//!   peer-facing RPC transport and a client-facing HTTP endpoint.
//! - [`appserver`] terminates client sessions, applies edits to the local
//!   CRDT replica, and multiplexes them to peers and brokers.
//! - [`crdt`] is the replicated character sequence the application servers
//!   edit.
//! - [`message`] provides the JSON line protocol shared by sessions and
//!   the peer RPC transport.
//! - [`config`] carries per-broker and per-application-server settings.
//! - [`cli`] parses the `broker` and `appserver` subcommands.
//!
//! Integration tests use this crate directly to spin multi-broker clusters
//! and application servers in one process on ephemeral ports.

pub mod appserver;
pub mod broker;
pub mod cli;
pub mod config;
pub mod crdt;
pub mod message;
