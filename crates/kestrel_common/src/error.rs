use thiserror::Error;

use crate::types::TabletAlias;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — bad input or an ineligible request; retrying unchanged will not help
/// - `Retryable`   — the whole reparent may be retried by the operator once the cause clears
/// - `Transient`   — timeout, unreachable tablet; MAY clear on its own
/// - `InternalBug` — should never happen; triggers alert + diagnostic dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Topology error: {0}")]
    Topo(#[from] TopoError),

    #[error("Tablet manager error: {0}")]
    Tmc(#[from] TmcError),

    #[error("Replication position error: {0}")]
    Position(#[from] PositionError),

    #[error("Reparent error: {0}")]
    Reparent(#[from] ReparentError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Topology store errors.
#[derive(Error, Debug)]
pub enum TopoError {
    #[error("Node not found: {0}")]
    NoNode(String),

    #[error("Shard lock lost: {0}")]
    LockLost(String),

    #[error("Shard lock held elsewhere: {0}")]
    LockContention(String),

    #[error("Compare-and-swap version mismatch on {0}")]
    BadVersion(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Tablet manager RPC errors.
#[derive(Error, Debug)]
pub enum TmcError {
    /// Soft error: the target claims PRIMARY role and has no replication
    /// threads to stop. The caller probes `primary_status` instead.
    #[error("Tablet {0} is not a replica")]
    NotReplica(TabletAlias),

    #[error("RPC {rpc} to {tablet} timed out after {timeout_ms}ms")]
    Timeout {
        rpc: &'static str,
        tablet: TabletAlias,
        timeout_ms: u64,
    },

    #[error("Cannot connect to {tablet}: {reason}")]
    Connect { tablet: TabletAlias, reason: String },

    #[error("Remote error from {tablet}: {reason}")]
    Remote { tablet: TabletAlias, reason: String },

    #[error("Wire error: {0}")]
    Wire(String),
}

/// Replication position parse/algebra errors.
#[derive(Error, Debug)]
pub enum PositionError {
    #[error("Malformed position {input:?}: {reason}")]
    Malformed { input: String, reason: String },

    #[error("Unknown position flavor: {0}")]
    UnknownFlavor(String),

    #[error("Position flavor mismatch: {left} vs {right}")]
    FlavorMismatch {
        left: &'static str,
        right: &'static str,
    },
}

/// Emergency reparent failure taxonomy.
#[derive(Error, Debug)]
pub enum ReparentError {
    #[error("Current primary {actual} does not match expected primary {expected}")]
    ExpectedPrimaryMismatch {
        expected: TabletAlias,
        actual: String,
    },

    #[error("Failed to stop replication on a majority of tablets: {successful}/{total} succeeded")]
    StopReplicationFailed { successful: usize, total: usize },

    #[error("Tablet {0} has a zero replication position (uninitialized replica)")]
    ZeroPosition(TabletAlias),

    #[error("Could not read reparent journal information for tablet {tablet}: {reason}")]
    JournalUnreadable { tablet: TabletAlias, reason: String },

    #[error("Split brain: no candidate position is a superset of all others")]
    SplitBrain,

    #[error("No valid candidates for emergency reparent")]
    NoCandidates,

    #[error("Requested primary candidate {tablet} is ineligible: {reason}")]
    ExplicitCandidateIneligible { tablet: TabletAlias, reason: String },

    #[error("Durability cannot be established for candidate {0} with the reachable tablets")]
    CannotEstablish(TabletAlias),

    #[error("No candidate applied its relay logs within the wait timeout")]
    RelayLogsDidNotApply,

    #[error("Promotion of intermediate source {tablet} failed: {reason}")]
    IntermediatePromotionFailed { tablet: TabletAlias, reason: String },

    #[error("Promotion of new primary {tablet} failed: {reason}")]
    PromotionFailed { tablet: TabletAlias, reason: String },

    #[error("Failed to populate reparent journal on new primary {tablet}: {reason}")]
    JournalWrite { tablet: TabletAlias, reason: String },

    #[error("All surviving replicas failed to reparent to {0}")]
    AllReplicasFailed(TabletAlias),
}

// ── KestrelError classification & helpers ────────────────────────────────────

impl KestrelError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            // Bad requests: retrying unchanged will produce the same answer.
            KestrelError::Configuration(_) => ErrorKind::UserError,
            KestrelError::Reparent(ReparentError::ExpectedPrimaryMismatch { .. }) => {
                ErrorKind::UserError
            }
            KestrelError::Reparent(ReparentError::ExplicitCandidateIneligible { .. }) => {
                ErrorKind::UserError
            }
            KestrelError::Position(_) => ErrorKind::UserError,

            // The operator retries the reparent as a whole once the cluster
            // state changes; no individual RPC is retried (see DESIGN.md).
            KestrelError::Topo(TopoError::LockContention(_)) => ErrorKind::Retryable,
            KestrelError::Topo(TopoError::LockLost(_)) => ErrorKind::Retryable,
            KestrelError::Topo(TopoError::BadVersion(_)) => ErrorKind::Retryable,
            KestrelError::Reparent(ReparentError::StopReplicationFailed { .. }) => {
                ErrorKind::Retryable
            }
            KestrelError::Reparent(ReparentError::RelayLogsDidNotApply) => ErrorKind::Retryable,
            KestrelError::Reparent(ReparentError::IntermediatePromotionFailed { .. }) => {
                ErrorKind::Retryable
            }
            KestrelError::Reparent(ReparentError::AllReplicasFailed(_)) => ErrorKind::Retryable,
            KestrelError::Reparent(ReparentError::JournalUnreadable { .. }) => {
                ErrorKind::Retryable
            }

            // May clear without operator action.
            KestrelError::Tmc(TmcError::Timeout { .. }) => ErrorKind::Transient,
            KestrelError::Tmc(TmcError::Connect { .. }) => ErrorKind::Transient,

            // Split brain and durability establishment need a human; journal
            // write failure on a freshly promoted primary needs one urgently.
            KestrelError::Reparent(ReparentError::SplitBrain) => ErrorKind::InternalBug,
            KestrelError::Reparent(ReparentError::JournalWrite { .. }) => ErrorKind::InternalBug,

            KestrelError::Reparent(_) => ErrorKind::Retryable,
            KestrelError::Tmc(_) => ErrorKind::Transient,
            KestrelError::Topo(_) => ErrorKind::Retryable,
            KestrelError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    /// Returns true if the operator should retry the whole reparent.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable | ErrorKind::Transient)
    }

    /// Returns true if this failure occurred before any topology mutation
    /// could have happened, so the shard is guaranteed untouched.
    pub fn shard_untouched(&self) -> bool {
        matches!(
            self,
            KestrelError::Configuration(_)
                | KestrelError::Position(_)
                | KestrelError::Topo(_)
                | KestrelError::Reparent(
                    ReparentError::ExpectedPrimaryMismatch { .. }
                        | ReparentError::StopReplicationFailed { .. }
                        | ReparentError::ZeroPosition(_)
                        | ReparentError::JournalUnreadable { .. }
                        | ReparentError::SplitBrain
                        | ReparentError::NoCandidates
                        | ReparentError::ExplicitCandidateIneligible { .. }
                        | ReparentError::CannotEstablish(_)
                        | ReparentError::RelayLogsDidNotApply,
                )
        )
    }
}
