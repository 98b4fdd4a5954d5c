use async_trait::async_trait;

use kestrel_common::error::TopoError;
use kestrel_common::types::{ShardRecord, Tablet, TabletAlias, TabletMap};

use crate::lock::ShardLockGuard;

/// The shared topology store.
///
/// All methods may suspend; none holds CPU. Shard-record writes are only
/// valid while holding the shard lock from `lock_shard`; the store does not
/// enforce this, the coordinator's discipline does.
#[async_trait]
pub trait TopoStore: Send + Sync {
    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<ShardRecord, TopoError>;

    async fn update_shard(
        &self,
        keyspace: &str,
        shard: &str,
        record: ShardRecord,
    ) -> Result<(), TopoError>;

    async fn get_tablet(&self, alias: &TabletAlias) -> Result<Tablet, TopoError>;

    async fn update_tablet(&self, tablet: Tablet) -> Result<(), TopoError>;

    /// Snapshot of every tablet currently registered in the shard.
    async fn get_tablet_map_for_shard(
        &self,
        keyspace: &str,
        shard: &str,
    ) -> Result<TabletMap, TopoError>;

    /// Acquire the per-shard advisory lock. `reason` is recorded for
    /// observability and surfaces in lock-contention errors.
    async fn lock_shard(
        &self,
        keyspace: &str,
        shard: &str,
        reason: &str,
    ) -> Result<ShardLockGuard, TopoError>;
}
