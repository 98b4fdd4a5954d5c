//! Caller-supplied knobs for one emergency reparent run.

use std::collections::BTreeSet;
use std::time::Duration;

use kestrel_common::types::TabletAlias;

/// Options for `EmergencyReparenter::reparent_shard`. Fields left at their
/// defaults fall back to the coordinator configuration.
#[derive(Debug, Clone, Default)]
pub struct EmergencyReparentOptions {
    /// Prefer this tablet as the new primary; fail if it is ineligible.
    pub new_primary_alias: Option<TabletAlias>,
    /// Guard: abort without mutation if the shard's current primary is not
    /// this tablet.
    pub expected_primary_alias: Option<TabletAlias>,
    /// Tablets skipped during the stop and set-source fan-outs.
    pub ignore_replicas: BTreeSet<TabletAlias>,
    /// Deadline for the stop and relay-log-apply phases. `None` uses the
    /// configured default.
    pub wait_replicas_timeout: Option<Duration>,
    /// Restrict candidates to the previous primary's cell.
    pub prevent_cross_cell_promotion: bool,
    /// Durability policy name override. `None` uses the configured default.
    pub durability: Option<String>,
}

impl EmergencyReparentOptions {
    pub fn with_new_primary(mut self, alias: TabletAlias) -> Self {
        self.new_primary_alias = Some(alias);
        self
    }

    pub fn with_expected_primary(mut self, alias: TabletAlias) -> Self {
        self.expected_primary_alias = Some(alias);
        self
    }

    pub fn with_ignored(mut self, alias: TabletAlias) -> Self {
        self.ignore_replicas.insert(alias);
        self
    }

    pub fn with_wait_replicas_timeout(mut self, timeout: Duration) -> Self {
        self.wait_replicas_timeout = Some(timeout);
        self
    }

    pub fn with_prevent_cross_cell_promotion(mut self) -> Self {
        self.prevent_cross_cell_promotion = true;
        self
    }

    pub fn with_durability(mut self, policy: impl Into<String>) -> Self {
        self.durability = Some(policy.into());
        self
    }

    /// Reason string recorded on the shard lock and in the reparent journal.
    pub fn lock_action(&self) -> String {
        match &self.new_primary_alias {
            Some(alias) => format!("EmergencyReparentShard({alias})"),
            None => "EmergencyReparentShard".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_action_includes_explicit_candidate() {
        let opts = EmergencyReparentOptions::default()
            .with_new_primary(TabletAlias::new("zone1", 100));
        assert_eq!(opts.lock_action(), "EmergencyReparentShard(zone1-0000000100)");
    }

    #[test]
    fn test_lock_action_omits_parens_without_candidate() {
        let opts = EmergencyReparentOptions::default();
        assert_eq!(opts.lock_action(), "EmergencyReparentShard");
    }
}
