//! Typed RPC surface to tablet-manager agents.
//!
//! The `TabletManagerClient` trait is the seam the reparent coordinator
//! drives replication through. Two implementations ship in-tree:
//! `TcpTabletClient` (length-prefixed JSON frames over TCP) and
//! `FakeTabletClient` (programmable in-process double for tests).
//!
//! Every call targets one tablet and carries its own deadline. Calls are
//! idempotent at the coordinator level: the coordinator never retries an
//! individual RPC, the operator retries the reparent as a whole.
#![allow(clippy::too_many_arguments)]

pub mod client;
pub mod fake;
pub mod replication;
pub mod wire;

pub use client::TabletManagerClient;
pub use fake::FakeTabletClient;
pub use replication::{
    PrimaryStatus, ReplicationState, ReplicationStatus, StopReplicationMode,
    StopReplicationStatus,
};
pub use wire::TcpTabletClient;
