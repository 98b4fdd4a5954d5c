//! Candidate selection: position collection, errant-GTID marking, and the
//! most-advanced / final-primary decision procedures.
//!
//! Errant-GTID detection leans on the reparent journal term counter: tablets
//! at the newest term are trusted as a group, older tablets are judged
//! against the union of trusted history. Without the counter read, an old
//! primary that briefly came back is indistinguishable from a replica with
//! genuine errant writes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::error::ReparentError;
use kestrel_common::types::{Tablet, TabletAlias, TabletMap};
use kestrel_mysql::{Position, SourceUuid};
use kestrel_tmclient::TabletManagerClient;

use crate::options::EmergencyReparentOptions;
use crate::policy::{DurabilityPolicy, PromotionRule};
use crate::stop::StatusMaps;

/// Pass A: collect the position of every tablet that answered the stop
/// phase. A zero relay-log position means an uninitialized replica; electing
/// around it is unsafe, so the whole run is rejected.
pub fn valid_candidates(
    status_maps: &StatusMaps,
) -> Result<BTreeMap<TabletAlias, Position>, ReparentError> {
    let mut positions = BTreeMap::new();
    for (alias, status) in &status_maps.status_map {
        let position = status.after.relay_log_position.clone();
        if position.is_zero() {
            return Err(ReparentError::ZeroPosition(alias.clone()));
        }
        positions.insert(alias.clone(), position);
    }
    for (alias, status) in &status_maps.primary_status_map {
        positions.insert(alias.clone(), status.position.clone());
    }
    Ok(positions)
}

/// Pass B: mark tablets carrying errant GTIDs as ineligible, in place.
///
/// Returns the maximum reparent-journal term counter observed; the caller
/// uses `max + 1` as the new term so the journal is monotonic by
/// construction.
pub async fn find_errant_gtids(
    tmc: &Arc<dyn TabletManagerClient>,
    candidates: &mut BTreeMap<TabletAlias, Position>,
    status_maps: &StatusMaps,
    tablet_map: &TabletMap,
    deadline: Duration,
) -> Result<i64, ReparentError> {
    if candidates.is_empty() {
        return Ok(0);
    }

    let mut counters: BTreeMap<TabletAlias, i64> = BTreeMap::new();
    for (alias, tablet) in tablet_map {
        if !candidates.contains_key(alias) {
            continue;
        }
        let counter = tmc
            .read_reparent_journal_info(tablet, deadline)
            .await
            .map_err(|e| ReparentError::JournalUnreadable {
                tablet: alias.clone(),
                reason: e.to_string(),
            })?;
        counters.insert(alias.clone(), counter);
    }
    let max_epoch = counters.values().copied().max().unwrap_or(0);

    let keep = errant_pass(candidates, &counters, status_maps, max_epoch, false);
    let keep = if keep.is_empty() {
        // Everyone looked errant against the newest term. Re-judge each
        // tablet against peers at its own term or newer; a freshly-returned
        // old primary with a larger journal term then correctly invalidates
        // lagging replicas instead of the whole shard.
        errant_pass(candidates, &counters, status_maps, max_epoch, true)
    } else {
        keep
    };

    candidates.retain(|alias, _| keep.contains(alias));
    Ok(max_epoch)
}

fn errant_pass(
    candidates: &BTreeMap<TabletAlias, Position>,
    counters: &BTreeMap<TabletAlias, i64>,
    status_maps: &StatusMaps,
    max_epoch: i64,
    relaxed: bool,
) -> BTreeSet<TabletAlias> {
    let mut keep = BTreeSet::new();
    for (alias, position) in candidates {
        let my_counter = counters.get(alias).copied().unwrap_or(0);
        let reference_aliases: Vec<&TabletAlias> = candidates
            .keys()
            .filter(|other| {
                *other != alias && {
                    let theirs = counters.get(*other).copied().unwrap_or(0);
                    if relaxed {
                        theirs >= my_counter
                    } else {
                        theirs == max_epoch
                    }
                }
            })
            .collect();

        if reference_aliases.is_empty() {
            // Sole tablet at the newest term: its history IS the agreed-upon
            // history.
            if my_counter == max_epoch {
                keep.insert(alias.clone());
            }
            continue;
        }

        // GTIDs sourced from the primary this tablet replicated from came
        // through legitimate replication; they are exempt even when no other
        // tablet has caught up to them yet.
        let source = status_maps
            .status_map
            .get(alias)
            .and_then(|s| s.after.source_uuid);
        let base = exempt_source(position, source.as_ref());

        let mut reference: Option<Position> = None;
        for other in reference_aliases {
            let p = &candidates[other];
            if p.flavor() != position.flavor() {
                continue;
            }
            reference = Some(match reference.take() {
                None => p.clone(),
                // Same flavor on both sides; union cannot fail.
                Some(r) => r.union(p).unwrap_or(r),
            });
        }

        let errant = match &reference {
            None => base.clone(),
            Some(r) => base.subtract(r).unwrap_or_else(|_| base.clone()),
        };
        if errant.is_zero() {
            keep.insert(alias.clone());
        } else {
            tracing::warn!(
                tablet = %alias,
                errant = %errant,
                "tablet carries errant GTIDs, excluded from candidacy"
            );
        }
    }
    keep
}

fn exempt_source(position: &Position, source: Option<&SourceUuid>) -> Position {
    match (position, source) {
        (Position::Mysql56(set), Some(uuid)) => Position::Mysql56(set.without_source(uuid)),
        _ => position.clone(),
    }
}

/// Choose the most-advanced candidate by the subset partial order.
///
/// Divergent candidates with no maximum mean the shard's histories have
/// split; promoting anything would lose acknowledged writes.
pub fn find_most_advanced(
    candidates: &BTreeMap<TabletAlias, Position>,
    tablet_map: &TabletMap,
    policy: &dyn DurabilityPolicy,
    prev_primary: Option<&Tablet>,
    opts: &EmergencyReparentOptions,
) -> Result<(Tablet, Position), ReparentError> {
    let entries: Vec<(&TabletAlias, &Position)> = candidates
        .iter()
        .filter(|(alias, _)| tablet_map.contains_key(*alias))
        .collect();
    if entries.is_empty() {
        return Err(ReparentError::NoCandidates);
    }

    let mut maxima: Vec<(&TabletAlias, &Position)> = entries
        .iter()
        .filter(|(_, p)| entries.iter().all(|&(_, q)| p.at_least(q)))
        .copied()
        .collect();
    if maxima.is_empty() {
        return Err(ReparentError::SplitBrain);
    }

    // Tie-breaks among equal maxima: promotion-rule preference, then the
    // previous primary's cell when cross-cell promotion is prevented, then
    // alias for determinism.
    maxima.sort_by_key(|(alias, _)| {
        let tablet = &tablet_map[*alias];
        let priority = policy.promotion_rule(tablet).priority();
        let same_cell = match prev_primary {
            Some(prev) if opts.prevent_cross_cell_promotion => {
                tablet.alias.cell == prev.alias.cell
            }
            _ => true,
        };
        (std::cmp::Reverse(priority), std::cmp::Reverse(same_cell), (*alias).clone())
    });

    if let Some(requested) = &opts.new_primary_alias {
        if let Some((alias, position)) = maxima.iter().find(|(alias, _)| *alias == requested) {
            return Ok((tablet_map[*alias].clone(), (*position).clone()));
        }
    }

    let (alias, position) = maxima[0];
    Ok((tablet_map[alias].clone(), position.clone()))
}

/// Result of the promotion-rule / cell / backup filter.
#[derive(Debug)]
pub struct FilterOutcome {
    pub tablets: Vec<Tablet>,
    pub warnings: Vec<String>,
}

/// Apply promotion rules and placement restrictions to the caught-up
/// candidate list, ahead of any promotion.
///
/// Backup-taking tablets are dispreferred, not excluded: they only drop out
/// while at least one non-backing-up candidate remains.
pub fn filter_valid_candidates(
    tablets: &[Tablet],
    policy: &dyn DurabilityPolicy,
    prev_primary: Option<&Tablet>,
    opts: &EmergencyReparentOptions,
) -> Result<FilterOutcome, ReparentError> {
    let mut preferred = Vec::new();
    let mut backing_up = Vec::new();
    let mut warnings = Vec::new();

    for tablet in tablets {
        let explicit = opts.new_primary_alias.as_ref() == Some(&tablet.alias);
        if policy.promotion_rule(tablet) == PromotionRule::MustNot {
            if explicit {
                return Err(ReparentError::ExplicitCandidateIneligible {
                    tablet: tablet.alias.clone(),
                    reason: "tablet has a must-not promotion rule".to_string(),
                });
            }
            continue;
        }
        if opts.prevent_cross_cell_promotion {
            if let Some(prev) = prev_primary {
                if tablet.alias.cell != prev.alias.cell {
                    if explicit {
                        return Err(ReparentError::ExplicitCandidateIneligible {
                            tablet: tablet.alias.clone(),
                            reason: format!(
                                "tablet is not in the previous primary's cell {}",
                                prev.alias.cell
                            ),
                        });
                    }
                    continue;
                }
            }
        }
        if tablet.is_backing_up && !explicit {
            backing_up.push(tablet.clone());
            continue;
        }
        preferred.push(tablet.clone());
    }

    if preferred.is_empty() && !backing_up.is_empty() {
        warnings.push(
            "every remaining candidate is taking a backup; considering them anyway".to_string(),
        );
        preferred = backing_up;
    } else if !backing_up.is_empty() {
        warnings.push(format!(
            "{} backup-taking candidate(s) dispreferred for promotion",
            backing_up.len()
        ));
    }

    Ok(FilterOutcome {
        tablets: preferred,
        warnings,
    })
}

/// After the intermediate source is promoted and survivors are attached,
/// decide who should be the final primary.
///
/// The intermediate wins when it is itself a top-preference candidate; the
/// intermediate-then-final split exists exactly for the case where the most
/// advanced tablet must not stay primary but holds data that must spread
/// first.
pub fn identify_primary_candidate(
    intermediate: &Tablet,
    valid: &[Tablet],
    policy: &dyn DurabilityPolicy,
    opts: &EmergencyReparentOptions,
) -> Result<Tablet, ReparentError> {
    if let Some(requested) = &opts.new_primary_alias {
        return match valid.iter().find(|t| &t.alias == requested) {
            Some(tablet) => Ok(tablet.clone()),
            None => Err(ReparentError::ExplicitCandidateIneligible {
                tablet: requested.clone(),
                reason: "tablet is not among the valid candidates after filtering".to_string(),
            }),
        };
    }

    let max_priority = valid
        .iter()
        .map(|t| policy.promotion_rule(t).priority())
        .max()
        .ok_or(ReparentError::NoCandidates)?;

    if let Some(tablet) = valid.iter().find(|t| t.alias == intermediate.alias) {
        if policy.promotion_rule(tablet).priority() == max_priority {
            return Ok(tablet.clone());
        }
    }

    let mut top: Vec<&Tablet> = valid
        .iter()
        .filter(|t| policy.promotion_rule(t).priority() == max_priority)
        .collect();
    top.sort_by_key(|t| (t.alias.cell != intermediate.alias.cell, t.alias.clone()));
    top.first()
        .map(|t| (*t).clone())
        .ok_or(ReparentError::NoCandidates)
}
