//! Durability policies: who must acknowledge a write for it to be durable,
//! and which tablets may be promoted.
//!
//! Policies are pure and stateless; every decision is a function of tablet
//! records alone, so candidate selection stays a total order after
//! tie-breaks.

use std::sync::Arc;

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::{Tablet, TabletRole};

/// Per-tablet promotion preference, most to least preferred.
/// `MustNot` excludes a tablet from final candidacy outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionRule {
    Must,
    Prefer,
    Neutral,
    PreferNot,
    MustNot,
}

impl PromotionRule {
    /// Integer priority: higher is more preferred. Used as a sort key so
    /// selection is a total order.
    pub fn priority(self) -> u8 {
        match self {
            PromotionRule::Must => 4,
            PromotionRule::Prefer => 3,
            PromotionRule::Neutral => 2,
            PromotionRule::PreferNot => 1,
            PromotionRule::MustNot => 0,
        }
    }
}

/// A durability policy.
///
/// `can_establish` is the forward-progress predicate: after promoting
/// `candidate`, can enough eligible acknowledgers (excluding the candidate
/// itself) ever ACK a write among the reachable tablets?
pub trait DurabilityPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn promotion_rule(&self, tablet: &Tablet) -> PromotionRule;

    /// Whether this tablet's ACK counts toward durability.
    fn is_replica_eligible(&self, tablet: &Tablet) -> bool;

    fn can_establish(&self, candidate: &Tablet, reachable: &[&Tablet]) -> bool;
}

/// Shared promotion rule for all shipped policies: writable roles are
/// neutral candidates, everything else must not be promoted.
fn default_promotion_rule(tablet: &Tablet) -> PromotionRule {
    match tablet.role {
        TabletRole::Primary | TabletRole::Replica => PromotionRule::Neutral,
        _ => PromotionRule::MustNot,
    }
}

/// `none`: no ACK required, every tablet eligible, establishment trivial.
struct DurabilityNone;

impl DurabilityPolicy for DurabilityNone {
    fn name(&self) -> &'static str {
        "none"
    }

    fn promotion_rule(&self, tablet: &Tablet) -> PromotionRule {
        default_promotion_rule(tablet)
    }

    fn is_replica_eligible(&self, _tablet: &Tablet) -> bool {
        true
    }

    fn can_establish(&self, _candidate: &Tablet, _reachable: &[&Tablet]) -> bool {
        true
    }
}

/// `semi_sync`: one eligible ACK required; rdonly tablets never ACK.
struct DurabilitySemiSync;

fn semi_sync_eligible(tablet: &Tablet) -> bool {
    matches!(tablet.role, TabletRole::Primary | TabletRole::Replica)
}

impl DurabilityPolicy for DurabilitySemiSync {
    fn name(&self) -> &'static str {
        "semi_sync"
    }

    fn promotion_rule(&self, tablet: &Tablet) -> PromotionRule {
        default_promotion_rule(tablet)
    }

    fn is_replica_eligible(&self, tablet: &Tablet) -> bool {
        semi_sync_eligible(tablet)
    }

    fn can_establish(&self, candidate: &Tablet, reachable: &[&Tablet]) -> bool {
        reachable
            .iter()
            .any(|t| t.alias != candidate.alias && semi_sync_eligible(t))
    }
}

/// `cross_cell`: one eligible ACK in a different cell than the candidate.
struct DurabilityCrossCell {
    name: &'static str,
}

impl DurabilityPolicy for DurabilityCrossCell {
    fn name(&self) -> &'static str {
        self.name
    }

    fn promotion_rule(&self, tablet: &Tablet) -> PromotionRule {
        default_promotion_rule(tablet)
    }

    fn is_replica_eligible(&self, tablet: &Tablet) -> bool {
        semi_sync_eligible(tablet)
    }

    fn can_establish(&self, candidate: &Tablet, reachable: &[&Tablet]) -> bool {
        reachable.iter().any(|t| {
            t.alias != candidate.alias
                && t.alias.cell != candidate.alias.cell
                && semi_sync_eligible(t)
        })
    }
}

/// Look up a policy by its configured name.
pub fn policy_for_name(name: &str) -> KestrelResult<Arc<dyn DurabilityPolicy>> {
    match name {
        "none" => Ok(Arc::new(DurabilityNone)),
        "semi_sync" => Ok(Arc::new(DurabilitySemiSync)),
        "cross_cell" => Ok(Arc::new(DurabilityCrossCell { name: "cross_cell" })),
        "cross_cell_semi_sync" => Ok(Arc::new(DurabilityCrossCell {
            name: "cross_cell_semi_sync",
        })),
        other => Err(KestrelError::Configuration(format!(
            "unknown durability policy {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::types::TabletAlias;

    fn tablet(cell: &str, uid: u32, role: TabletRole) -> Tablet {
        Tablet::new(TabletAlias::new(cell, uid), "commerce", "-", role)
    }

    #[test]
    fn test_unknown_policy_name() {
        assert!(matches!(
            policy_for_name("chain_replication"),
            Err(KestrelError::Configuration(_))
        ));
    }

    #[test]
    fn test_rule_priority_total_order() {
        assert!(PromotionRule::Must.priority() > PromotionRule::Prefer.priority());
        assert!(PromotionRule::Prefer.priority() > PromotionRule::Neutral.priority());
        assert!(PromotionRule::Neutral.priority() > PromotionRule::PreferNot.priority());
        assert!(PromotionRule::PreferNot.priority() > PromotionRule::MustNot.priority());
    }

    #[test]
    fn test_rdonly_must_not_be_promoted() {
        let policy = policy_for_name("none").unwrap();
        assert_eq!(
            policy.promotion_rule(&tablet("zone1", 1, TabletRole::Rdonly)),
            PromotionRule::MustNot
        );
        assert_eq!(
            policy.promotion_rule(&tablet("zone1", 1, TabletRole::Replica)),
            PromotionRule::Neutral
        );
    }

    #[test]
    fn test_none_establishes_alone() {
        let policy = policy_for_name("none").unwrap();
        let candidate = tablet("zone1", 1, TabletRole::Replica);
        assert!(policy.can_establish(&candidate, &[&candidate]));
    }

    #[test]
    fn test_semi_sync_needs_another_acker() {
        let policy = policy_for_name("semi_sync").unwrap();
        let candidate = tablet("zone1", 1, TabletRole::Replica);
        let replica = tablet("zone1", 2, TabletRole::Replica);
        let rdonly = tablet("zone1", 3, TabletRole::Rdonly);

        assert!(!policy.can_establish(&candidate, &[&candidate]));
        assert!(!policy.can_establish(&candidate, &[&candidate, &rdonly]));
        assert!(policy.can_establish(&candidate, &[&candidate, &replica]));
        assert!(!policy.is_replica_eligible(&rdonly));
    }

    #[test]
    fn test_cross_cell_needs_acker_in_other_cell() {
        let policy = policy_for_name("cross_cell").unwrap();
        let candidate = tablet("zone1", 1, TabletRole::Replica);
        let same_cell = tablet("zone1", 2, TabletRole::Replica);
        let other_cell = tablet("zone2", 3, TabletRole::Replica);

        assert!(!policy.can_establish(&candidate, &[&candidate, &same_cell]));
        assert!(policy.can_establish(&candidate, &[&candidate, &other_cell]));
    }

    #[test]
    fn test_cross_cell_semi_sync_is_registered() {
        let policy = policy_for_name("cross_cell_semi_sync").unwrap();
        assert_eq!(policy.name(), "cross_cell_semi_sync");
    }
}
