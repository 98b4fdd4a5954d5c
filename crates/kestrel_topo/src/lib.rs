//! Topology store: shard metadata, tablet records, and the per-shard
//! advisory lock the reparent coordinator serializes on.
//!
//! The `TopoStore` trait is the seam; `MemoryTopoServer` is the in-process
//! implementation used by tests and single-binary deployments. A production
//! deployment backs the same trait with a consensus KV store.

pub mod lock;
pub mod memory;
pub mod store;

pub use lock::{LeaseSignal, ShardLockGuard};
pub use memory::MemoryTopoServer;
pub use store::TopoStore;
