//! Replication status records returned by tablet-manager agents.

use serde::{Deserialize, Serialize};

use kestrel_mysql::{Position, SourceUuid};

/// State of one replication thread (IO or SQL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationState {
    Stopped,
    Connecting,
    Running,
}

/// How much to stop when snapshotting replication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReplicationMode {
    /// Stop both the IO and SQL threads.
    IoAndSqlThread,
    /// Stop only the IO thread, letting the SQL thread drain the relay log.
    IoThreadOnly,
}

/// Point-in-time replication state of one tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// Executed GTID set.
    pub position: Position,
    /// GTID set fetched into the relay log; a superset of `position` until
    /// the SQL thread catches up.
    pub relay_log_position: Position,
    /// Server UUID of the source this tablet was replicating from.
    pub source_uuid: Option<SourceUuid>,
    pub source_host: String,
    pub source_port: u16,
    pub io_state: ReplicationState,
    pub sql_state: ReplicationState,
}

impl ReplicationStatus {
    /// Both threads healthy.
    pub fn replication_running(&self) -> bool {
        self.io_state == ReplicationState::Running && self.sql_state == ReplicationState::Running
    }
}

/// Result of `stop_replication_and_get_status`: state at snapshot time and
/// after the threads stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReplicationStatus {
    pub before: ReplicationStatus,
    pub after: ReplicationStatus,
}

/// Status reported by a tablet that believes it is the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryStatus {
    pub position: Position,
    pub server_uuid: Option<SourceUuid>,
}
