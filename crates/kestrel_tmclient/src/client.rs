use std::time::Duration;

use async_trait::async_trait;

use kestrel_common::error::TmcError;
use kestrel_common::types::{Tablet, TabletAlias};
use kestrel_mysql::Position;

use crate::replication::{PrimaryStatus, StopReplicationMode, StopReplicationStatus};

/// Typed RPC surface to one tablet-manager agent per call.
///
/// Every method carries a per-call `deadline` the implementation must
/// enforce in wall time. All methods may suspend; none holds CPU.
#[async_trait]
pub trait TabletManagerClient: Send + Sync {
    /// Stop the IO and SQL replication threads and return the replication
    /// state before and after.
    ///
    /// Returns `TmcError::NotReplica` when the target claims PRIMARY role;
    /// callers treat that as a soft signal and probe `primary_status`.
    async fn stop_replication_and_get_status(
        &self,
        tablet: &Tablet,
        mode: StopReplicationMode,
        deadline: Duration,
    ) -> Result<StopReplicationStatus, TmcError>;

    /// CHANGE SOURCE to the given endpoint, optionally restarting
    /// replication. `force_start` additionally clears a stopped SQL thread.
    async fn set_source(
        &self,
        tablet: &Tablet,
        host: &str,
        port: u16,
        start_replication: bool,
        force_start: bool,
        deadline: Duration,
    ) -> Result<(), TmcError>;

    /// Promote the tablet to primary: stop replication, reset replica
    /// configuration, switch to read-write. Returns the position at
    /// promotion time.
    async fn promote_replica(
        &self,
        tablet: &Tablet,
        deadline: Duration,
    ) -> Result<Position, TmcError>;

    /// Demote a primary: set read-only, flush, and report the final
    /// position.
    async fn demote_primary(
        &self,
        tablet: &Tablet,
        deadline: Duration,
    ) -> Result<Position, TmcError>;

    /// Restore read-write on a primary whose demotion was abandoned.
    async fn undo_demote_primary(
        &self,
        tablet: &Tablet,
        deadline: Duration,
    ) -> Result<(), TmcError>;

    /// Block until the tablet's executed position reaches `position`.
    async fn wait_for_position(
        &self,
        tablet: &Tablet,
        position: &Position,
        deadline: Duration,
    ) -> Result<(), TmcError>;

    /// Append a promotion record to the tablet's reparent journal. Replicas
    /// read the journal on `set_source` to reject stale source assignments.
    async fn populate_reparent_journal(
        &self,
        tablet: &Tablet,
        term_counter: i64,
        action_name: &str,
        primary_alias: &TabletAlias,
        position: &Position,
        time_created_ns: u64,
        deadline: Duration,
    ) -> Result<(), TmcError>;

    /// Read the latest term counter from the tablet's reparent journal.
    async fn read_reparent_journal_info(
        &self,
        tablet: &Tablet,
        deadline: Duration,
    ) -> Result<i64, TmcError>;

    async fn primary_status(
        &self,
        tablet: &Tablet,
        deadline: Duration,
    ) -> Result<PrimaryStatus, TmcError>;

    async fn primary_position(
        &self,
        tablet: &Tablet,
        deadline: Duration,
    ) -> Result<Position, TmcError>;
}
