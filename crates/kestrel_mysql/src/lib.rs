//! Replication position algebra for MySQL GTID sets.
//!
//! A position is a durable, transaction-granularity marker in the replication
//! stream. Two flavors exist and never interoperate:
//! - `MySQL56`: GTID sets keyed by source UUID, each holding a normalized
//!   list of inclusive sequence intervals.
//! - `FilePos`: binary-log (file, offset) pairs, totally ordered.
//!
//! All operations are total and deterministic; positions are value types and
//! are never shared mutably across tasks.

pub mod position;

pub use position::{FilePosition, Interval, Mysql56GtidSet, Position, SourceUuid};
