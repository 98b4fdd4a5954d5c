//! Shared foundation for the Kestrel reparent coordinator: error taxonomy,
//! tablet identity types, shard metadata, and configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::CoordinatorConfig;
pub use error::{
    ErrorKind, KestrelError, KestrelResult, PositionError, ReparentError, TmcError, TopoError,
};
pub use types::{ShardRecord, Tablet, TabletAlias, TabletMap, TabletRole};
