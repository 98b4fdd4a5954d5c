//! In-process topology server.
//!
//! Backs the `TopoStore` trait with a versioned key-value map plus a lock
//! table, mirroring what a consensus KV store provides: `get`,
//! `compare_and_swap`, `list_keys`, and leased locks. Tests drive lease
//! revocation through `expire_lock`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use kestrel_common::error::TopoError;
use kestrel_common::types::{ShardRecord, Tablet, TabletAlias, TabletMap};

use crate::lock::{LeaseSignal, LockBackend, ShardLockGuard};
use crate::store::TopoStore;

/// A versioned value in the KV layer. Versions start at 1 and increment on
/// every write.
#[derive(Debug, Clone)]
pub struct VersionedValue {
    pub version: u64,
    pub data: Vec<u8>,
}

struct LockEntry {
    holder: u64,
    reason: String,
    lease: LeaseSignal,
}

struct LockTable {
    locks: DashMap<(String, String), LockEntry>,
    next_holder: AtomicU64,
}

#[async_trait]
impl LockBackend for LockTable {
    async fn release(&self, keyspace: &str, shard: &str, holder: u64) {
        let key = (keyspace.to_string(), shard.to_string());
        // Only the current holder may remove the entry; a stale release
        // after lease expiry and re-acquisition must not unlock the new
        // holder.
        self.locks.remove_if(&key, |_, entry| entry.holder == holder);
    }
}

/// In-memory topology server.
pub struct MemoryTopoServer {
    kv: DashMap<String, VersionedValue>,
    lock_table: Arc<LockTable>,
}

impl MemoryTopoServer {
    pub fn new() -> Self {
        Self {
            kv: DashMap::new(),
            lock_table: Arc::new(LockTable {
                locks: DashMap::new(),
                next_holder: AtomicU64::new(1),
            }),
        }
    }

    fn shard_key(keyspace: &str, shard: &str) -> String {
        format!("keyspaces/{keyspace}/shards/{shard}/Shard")
    }

    fn tablet_key(alias: &TabletAlias) -> String {
        format!("tablets/{alias}/Tablet")
    }

    // ── KV layer (the topology wire minimum: get / CAS / list) ──

    pub fn get(&self, key: &str) -> Option<VersionedValue> {
        self.kv.get(key).map(|v| v.clone())
    }

    /// Write `data` iff the current version matches `expected_version`
    /// (0 = key must not exist). Returns the new version.
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        data: Vec<u8>,
    ) -> Result<u64, TopoError> {
        match self.kv.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().version != expected_version {
                    return Err(TopoError::BadVersion(key.to_string()));
                }
                let version = expected_version + 1;
                occupied.insert(VersionedValue { version, data });
                Ok(version)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(TopoError::BadVersion(key.to_string()));
                }
                vacant.insert(VersionedValue { version: 1, data });
                Ok(1)
            }
        }
    }

    /// Unconditional write. Returns the new version.
    pub fn put(&self, key: &str, data: Vec<u8>) -> u64 {
        let mut entry = self.kv.entry(key.to_string()).or_insert(VersionedValue {
            version: 0,
            data: Vec::new(),
        });
        entry.version += 1;
        entry.data = data;
        entry.version
    }

    pub fn list_keys(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .kv
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    // ── Test / bootstrap helpers ──

    /// Register a tablet, overwriting any previous record.
    pub fn add_tablet(&self, tablet: Tablet) {
        let key = Self::tablet_key(&tablet.alias);
        let data = serde_json::to_vec(&tablet).expect("tablet serialization cannot fail");
        self.put(&key, data);
    }

    /// Seed a shard record.
    pub fn set_shard(&self, keyspace: &str, shard: &str, record: ShardRecord) {
        let data = serde_json::to_vec(&record).expect("shard serialization cannot fail");
        self.put(&Self::shard_key(keyspace, shard), data);
    }

    /// Revoke the lease on a held shard lock, simulating lease expiry.
    /// No-op when the lock is not held.
    pub fn expire_lock(&self, keyspace: &str, shard: &str) {
        let key = (keyspace.to_string(), shard.to_string());
        if let Some((_, entry)) = self.lock_table.locks.remove(&key) {
            entry.lease.revoke();
            tracing::info!(keyspace, shard, "shard lock lease expired");
        }
    }

    /// True when some holder currently has the shard lock.
    pub fn is_locked(&self, keyspace: &str, shard: &str) -> bool {
        self.lock_table
            .locks
            .contains_key(&(keyspace.to_string(), shard.to_string()))
    }
}

impl Default for MemoryTopoServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopoStore for MemoryTopoServer {
    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<ShardRecord, TopoError> {
        let key = Self::shard_key(keyspace, shard);
        let value = self.get(&key).ok_or(TopoError::NoNode(key.clone()))?;
        serde_json::from_slice(&value.data).map_err(|e| TopoError::Serialization(e.to_string()))
    }

    async fn update_shard(
        &self,
        keyspace: &str,
        shard: &str,
        record: ShardRecord,
    ) -> Result<(), TopoError> {
        let key = Self::shard_key(keyspace, shard);
        let data =
            serde_json::to_vec(&record).map_err(|e| TopoError::Serialization(e.to_string()))?;
        let current = self.get(&key).ok_or(TopoError::NoNode(key.clone()))?;
        self.compare_and_swap(&key, current.version, data)?;
        Ok(())
    }

    async fn get_tablet(&self, alias: &TabletAlias) -> Result<Tablet, TopoError> {
        let key = Self::tablet_key(alias);
        let value = self.get(&key).ok_or(TopoError::NoNode(key.clone()))?;
        serde_json::from_slice(&value.data).map_err(|e| TopoError::Serialization(e.to_string()))
    }

    async fn update_tablet(&self, tablet: Tablet) -> Result<(), TopoError> {
        let key = Self::tablet_key(&tablet.alias);
        let data =
            serde_json::to_vec(&tablet).map_err(|e| TopoError::Serialization(e.to_string()))?;
        self.put(&key, data);
        Ok(())
    }

    async fn get_tablet_map_for_shard(
        &self,
        keyspace: &str,
        shard: &str,
    ) -> Result<TabletMap, TopoError> {
        let mut map = TabletMap::new();
        for key in self.list_keys("tablets/") {
            let value = self.get(&key).ok_or(TopoError::NoNode(key.clone()))?;
            let tablet: Tablet = serde_json::from_slice(&value.data)
                .map_err(|e| TopoError::Serialization(e.to_string()))?;
            if tablet.keyspace == keyspace && tablet.shard == shard {
                map.insert(tablet.alias.clone(), tablet);
            }
        }
        Ok(map)
    }

    async fn lock_shard(
        &self,
        keyspace: &str,
        shard: &str,
        reason: &str,
    ) -> Result<ShardLockGuard, TopoError> {
        let key = (keyspace.to_string(), shard.to_string());
        let holder = self.lock_table.next_holder.fetch_add(1, Ordering::Relaxed);
        let lease = LeaseSignal::new();

        match self.lock_table.locks.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                // An abandoned guard leaves a revoked lease behind; treat it
                // as expired and take over.
                if occupied.get().lease.is_held() {
                    return Err(TopoError::LockContention(format!(
                        "{}/{} held for {:?}",
                        keyspace,
                        shard,
                        occupied.get().reason
                    )));
                }
                occupied.insert(LockEntry {
                    holder,
                    reason: reason.to_string(),
                    lease: lease.clone(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    holder,
                    reason: reason.to_string(),
                    lease: lease.clone(),
                });
            }
        }

        tracing::debug!(keyspace, shard, reason, "shard lock acquired");
        Ok(ShardLockGuard::new(
            keyspace,
            shard,
            reason,
            holder,
            lease,
            self.lock_table.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::types::TabletRole;

    fn tablet(uid: u32) -> Tablet {
        Tablet::new(
            TabletAlias::new("zone1", uid),
            "commerce",
            "-",
            TabletRole::Replica,
        )
    }

    #[tokio::test]
    async fn test_shard_record_round_trip() {
        let server = MemoryTopoServer::new();
        let record = ShardRecord {
            primary_alias: Some(TabletAlias::new("zone1", 100)),
            is_primary_serving: true,
            primary_term_start_time: Some(1),
        };
        server.set_shard("commerce", "-", record.clone());
        assert_eq!(server.get_shard("commerce", "-").await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_get_missing_shard_is_no_node() {
        let server = MemoryTopoServer::new();
        assert!(matches!(
            server.get_shard("commerce", "-").await,
            Err(TopoError::NoNode(_))
        ));
    }

    #[tokio::test]
    async fn test_tablet_map_filters_by_shard() {
        let server = MemoryTopoServer::new();
        server.add_tablet(tablet(100));
        server.add_tablet(tablet(101));
        let mut other = tablet(200);
        other.shard = "80-".to_string();
        server.add_tablet(other);

        let map = server.get_tablet_map_for_shard("commerce", "-").await.unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key(&TabletAlias::new("zone1", 100)));
    }

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let server = MemoryTopoServer::new();
        let guard = server.lock_shard("commerce", "-", "test").await.unwrap();
        assert!(matches!(
            server.lock_shard("commerce", "-", "other").await,
            Err(TopoError::LockContention(_))
        ));
        guard.unlock().await;
        let again = server.lock_shard("commerce", "-", "other").await.unwrap();
        again.unlock().await;
    }

    #[tokio::test]
    async fn test_expired_lock_fails_liveness_check() {
        let server = MemoryTopoServer::new();
        let guard = server.lock_shard("commerce", "-", "test").await.unwrap();
        server.expire_lock("commerce", "-");
        assert!(guard.check_still_held().is_err());
        // Release after expiry is a no-op.
        guard.unlock().await;
        assert!(!server.is_locked("commerce", "-"));
    }

    #[tokio::test]
    async fn test_stale_release_does_not_unlock_new_holder() {
        let server = MemoryTopoServer::new();
        let stale = server.lock_shard("commerce", "-", "first").await.unwrap();
        server.expire_lock("commerce", "-");
        let fresh = server.lock_shard("commerce", "-", "second").await.unwrap();
        stale.unlock().await;
        assert!(fresh.check_still_held().is_ok());
        assert!(server.is_locked("commerce", "-"));
        fresh.unlock().await;
    }

    #[tokio::test]
    async fn test_compare_and_swap_detects_conflict() {
        let server = MemoryTopoServer::new();
        let v1 = server.compare_and_swap("k", 0, b"a".to_vec()).unwrap();
        assert_eq!(v1, 1);
        assert!(matches!(
            server.compare_and_swap("k", 0, b"b".to_vec()),
            Err(TopoError::BadVersion(_))
        ));
        let v2 = server.compare_and_swap("k", v1, b"b".to_vec()).unwrap();
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn test_list_keys_prefix() {
        let server = MemoryTopoServer::new();
        server.put("a/1", vec![]);
        server.put("a/2", vec![]);
        server.put("b/1", vec![]);
        assert_eq!(server.list_keys("a/"), vec!["a/1".to_string(), "a/2".to_string()]);
    }
}
