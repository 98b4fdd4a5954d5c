//! Leased shard lock: advisory mutual exclusion with a liveness signal.
//!
//! The lock lease can be revoked out from under the holder (lease expiry,
//! store partition). Holders MUST check `check_still_held()` between phases
//! of any long-running operation; a revoked lease means stale-lockholder
//! assumptions and the operation must abort without further mutation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use kestrel_common::error::TopoError;

/// Shared liveness flag for one lock lease. Cloning shares state.
///
/// A single atomic read per check: cheap enough to call between every phase,
/// deliberately not wrapped around every RPC.
#[derive(Clone)]
pub struct LeaseSignal {
    inner: Arc<AtomicBool>,
}

impl LeaseSignal {
    /// Create a signal in the held state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Revoke the lease. All clones observe the revocation immediately.
    pub fn revoke(&self) {
        self.inner.store(false, Ordering::SeqCst);
    }

    pub fn is_held(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

impl Default for LeaseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Backend hook the guard releases through.
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn release(&self, keyspace: &str, shard: &str, holder: u64);
}

/// Guard for a held shard lock.
///
/// Release is explicit (`unlock().await`) because it talks to the store.
/// Dropping an unreleased guard revokes the local lease and logs a warning;
/// the store-side lease then expires on its own TTL.
pub struct ShardLockGuard {
    keyspace: String,
    shard: String,
    reason: String,
    holder: u64,
    lease: LeaseSignal,
    backend: Arc<dyn LockBackend>,
    released: bool,
}

impl ShardLockGuard {
    pub fn new(
        keyspace: impl Into<String>,
        shard: impl Into<String>,
        reason: impl Into<String>,
        holder: u64,
        lease: LeaseSignal,
        backend: Arc<dyn LockBackend>,
    ) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
            reason: reason.into(),
            holder,
            lease,
            backend,
            released: false,
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Verify the lease is still live. Call between phases.
    pub fn check_still_held(&self) -> Result<(), TopoError> {
        if self.lease.is_held() {
            Ok(())
        } else {
            Err(TopoError::LockLost(format!(
                "{}/{}",
                self.keyspace, self.shard
            )))
        }
    }

    /// Release the lock. Releasing an already-lost lease is a no-op on the
    /// store side.
    pub async fn unlock(mut self) {
        self.released = true;
        let still_held = self.lease.is_held();
        self.lease.revoke();
        if still_held {
            self.backend
                .release(&self.keyspace, &self.shard, self.holder)
                .await;
        }
        tracing::debug!(
            keyspace = %self.keyspace,
            shard = %self.shard,
            reason = %self.reason,
            "shard lock released"
        );
    }
}

impl Drop for ShardLockGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                keyspace = %self.keyspace,
                shard = %self.shard,
                reason = %self.reason,
                "shard lock guard dropped without unlock; lease left to expire"
            );
            self.lease.revoke();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopBackend;

    #[async_trait]
    impl LockBackend for NoopBackend {
        async fn release(&self, _keyspace: &str, _shard: &str, _holder: u64) {}
    }

    fn guard(lease: LeaseSignal) -> ShardLockGuard {
        ShardLockGuard::new("ks", "-", "test", 1, lease, Arc::new(NoopBackend))
    }

    #[test]
    fn test_lease_signal_shared_across_clones() {
        let lease = LeaseSignal::new();
        let clone = lease.clone();
        assert!(clone.is_held());
        lease.revoke();
        assert!(!clone.is_held());
    }

    #[tokio::test]
    async fn test_check_still_held() {
        let lease = LeaseSignal::new();
        let guard = guard(lease.clone());
        assert!(guard.check_still_held().is_ok());
        lease.revoke();
        assert!(matches!(
            guard.check_still_held(),
            Err(TopoError::LockLost(_))
        ));
        guard.unlock().await;
    }

    #[tokio::test]
    async fn test_drop_revokes_lease() {
        let lease = LeaseSignal::new();
        drop(guard(lease.clone()));
        assert!(!lease.is_held());
    }
}
