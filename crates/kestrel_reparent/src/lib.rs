//! Emergency reparent coordinator for sharded MySQL clusters.
//!
//! When a shard's primary becomes unreachable, `EmergencyReparenter` elects a
//! new primary among the surviving replicas, rewires replication, and updates
//! the shared topology store, all under a leased per-shard lock, refusing to
//! lose durably-acknowledged writes.
//!
//! # Architecture
//!
//! ```text
//!   EmergencyReparenter (state machine, emergency.rs)
//!       |
//!       +-- stop.rs        fan-out STOP REPLICA, build status maps
//!       +-- candidate.rs   positions, errant-GTID marking, selection
//!       +-- policy.rs      durability policies & promotion rules
//!       +-- events.rs      ordered phase events, subscribable sink
//!       |
//!       +-- kestrel_topo   shard lock + shard/tablet records
//!       +-- kestrel_tmclient  per-tablet RPCs
//! ```

pub mod candidate;
pub mod emergency;
pub mod events;
pub mod options;
pub mod policy;
pub mod stop;

pub use emergency::{EmergencyReparenter, ReparentResult};
pub use events::{EventLog, EventSink, ReparentEvent, ReparentPhase};
pub use options::EmergencyReparentOptions;
pub use policy::{policy_for_name, DurabilityPolicy, PromotionRule};
pub use stop::StatusMaps;
