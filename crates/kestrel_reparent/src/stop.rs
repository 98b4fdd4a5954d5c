//! Stop-and-snapshot phase: fan out STOP REPLICA to every tablet in the
//! shard and build the status maps the rest of the reparent runs on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use kestrel_common::error::{ReparentError, TmcError};
use kestrel_common::types::{TabletAlias, TabletMap};
use kestrel_tmclient::{
    PrimaryStatus, StopReplicationMode, StopReplicationStatus, TabletManagerClient,
};

/// Outcome of the stop fan-out.
#[derive(Debug, Default)]
pub struct StatusMaps {
    /// Tablets whose replication threads stopped cleanly.
    pub status_map: BTreeMap<TabletAlias, StopReplicationStatus>,
    /// Tablets that claimed PRIMARY and had their primary status probed:
    /// the old primary came back.
    pub primary_status_map: BTreeMap<TabletAlias, PrimaryStatus>,
    /// Tablets that could not be reached or errored, with the reason.
    pub failed: BTreeMap<TabletAlias, String>,
}

impl StatusMaps {
    /// A tablet is reachable when the stop phase got any answer out of it.
    pub fn is_reachable(&self, alias: &TabletAlias) -> bool {
        self.status_map.contains_key(alias) || self.primary_status_map.contains_key(alias)
    }
}

enum StopOutcome {
    Stopped(Box<StopReplicationStatus>),
    ClaimsPrimary(PrimaryStatus),
    Failed(String),
}

/// Fan out `stop_replication_and_get_status` to every tablet in the map
/// except the ignore set, concurrently, each with its own deadline.
///
/// A tablet answering `NotReplica` is probed for primary status instead.
/// The phase succeeds when at least ⌈n/2⌉ tablets stopped cleanly OR the old
/// primary answered; anything less means the snapshot is too partial to
/// reparent safely.
///
/// The fan-out tasks live and die with this call: cancelling the reparent
/// drops the `JoinSet`, which aborts the in-flight stop RPCs with it.
pub async fn stop_replication_and_build_status_maps(
    tmc: Arc<dyn TabletManagerClient>,
    tablet_map: &TabletMap,
    ignore_replicas: &BTreeSet<TabletAlias>,
    deadline: Duration,
) -> Result<StatusMaps, ReparentError> {
    let participants: Vec<_> = tablet_map
        .values()
        .filter(|t| !ignore_replicas.contains(&t.alias))
        .cloned()
        .collect();
    let total = participants.len();

    let mut tasks: JoinSet<(TabletAlias, StopOutcome)> = JoinSet::new();
    for tablet in participants {
        let tmc = Arc::clone(&tmc);
        tasks.spawn(async move {
            let alias = tablet.alias.clone();
            let outcome = match tmc
                .stop_replication_and_get_status(
                    &tablet,
                    StopReplicationMode::IoAndSqlThread,
                    deadline,
                )
                .await
            {
                Ok(status) => StopOutcome::Stopped(Box::new(status)),
                Err(TmcError::NotReplica(_)) => {
                    tracing::info!(tablet = %alias, "tablet claims primary, probing status");
                    match tmc.primary_status(&tablet, deadline).await {
                        Ok(status) => StopOutcome::ClaimsPrimary(status),
                        Err(e) => StopOutcome::Failed(e.to_string()),
                    }
                }
                Err(e) => StopOutcome::Failed(e.to_string()),
            };
            (alias, outcome)
        });
    }

    let mut maps = StatusMaps::default();
    while let Some(joined) = tasks.join_next().await {
        let Ok((alias, outcome)) = joined else {
            continue;
        };
        match outcome {
            StopOutcome::Stopped(status) => {
                maps.status_map.insert(alias, *status);
            }
            StopOutcome::ClaimsPrimary(status) => {
                maps.primary_status_map.insert(alias, status);
            }
            StopOutcome::Failed(reason) => {
                tracing::warn!(tablet = %alias, reason = %reason, "stop replication failed");
                maps.failed.insert(alias, reason);
            }
        }
    }

    // Nothing answered at all: there is nobody to elect, which is a more
    // precise failure than a missed majority.
    if maps.status_map.is_empty() && maps.primary_status_map.is_empty() {
        return Err(ReparentError::NoCandidates);
    }

    let successful = maps.status_map.len();
    let quorum = total.div_ceil(2);
    if successful >= quorum || !maps.primary_status_map.is_empty() {
        Ok(maps)
    } else {
        Err(ReparentError::StopReplicationFailed { successful, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::types::{Tablet, TabletRole};
    use kestrel_mysql::Position;
    use kestrel_tmclient::FakeTabletClient;

    const U1: &str = "00000000-0000-0000-0000-000000000001";

    fn pos(spec: &str) -> Position {
        format!("MySQL56/{U1}:{spec}").parse().unwrap()
    }

    fn alias(uid: u32) -> TabletAlias {
        TabletAlias::new("zone1", uid)
    }

    fn tablet_map(uids: &[u32]) -> TabletMap {
        uids.iter()
            .map(|&uid| {
                let a = alias(uid);
                (
                    a.clone(),
                    Tablet::new(a, "commerce", "-", TabletRole::Replica),
                )
            })
            .collect()
    }

    const DEADLINE: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_majority_stop_succeeds() {
        let fake = FakeTabletClient::new();
        fake.add_unreachable(&alias(100));
        fake.add_replica(&alias(101), pos("1-21"), None, 1);
        fake.add_replica(&alias(102), pos("1-26"), None, 1);

        let maps = stop_replication_and_build_status_maps(
            Arc::new(fake),
            &tablet_map(&[100, 101, 102]),
            &BTreeSet::new(),
            DEADLINE,
        )
        .await
        .unwrap();

        assert_eq!(maps.status_map.len(), 2);
        assert_eq!(maps.failed.len(), 1);
        assert!(maps.is_reachable(&alias(101)));
        assert!(!maps.is_reachable(&alias(100)));
    }

    #[tokio::test]
    async fn test_minority_stop_fails() {
        let fake = FakeTabletClient::new();
        fake.add_unreachable(&alias(100));
        fake.add_unreachable(&alias(101));
        fake.add_replica(&alias(102), pos("1-26"), None, 1);

        let err = stop_replication_and_build_status_maps(
            Arc::new(fake),
            &tablet_map(&[100, 101, 102]),
            &BTreeSet::new(),
            DEADLINE,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ReparentError::StopReplicationFailed {
                successful: 1,
                total: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_returned_primary_rescues_minority() {
        let fake = FakeTabletClient::new();
        fake.add_returned_primary(&alias(100), pos("1-26"), None, 1);
        fake.add_unreachable(&alias(101));
        fake.add_unreachable(&alias(102));

        let maps = stop_replication_and_build_status_maps(
            Arc::new(fake),
            &tablet_map(&[100, 101, 102]),
            &BTreeSet::new(),
            DEADLINE,
        )
        .await
        .unwrap();
        assert_eq!(maps.primary_status_map.len(), 1);
        assert!(maps.primary_status_map.contains_key(&alias(100)));
    }

    #[tokio::test]
    async fn test_ignored_tablets_are_skipped() {
        let fake = FakeTabletClient::new();
        fake.add_replica(&alias(101), pos("1-21"), None, 1);
        fake.add_replica(&alias(102), pos("1-26"), None, 1);

        let mut ignore = BTreeSet::new();
        ignore.insert(alias(102));

        let maps = stop_replication_and_build_status_maps(
            Arc::new(fake),
            &tablet_map(&[101, 102]),
            &ignore,
            DEADLINE,
        )
        .await
        .unwrap();
        assert_eq!(maps.status_map.len(), 1);
        assert!(!maps.is_reachable(&alias(102)));
    }

    #[tokio::test]
    async fn test_slow_tablet_times_out_but_quorum_holds() {
        let fake = FakeTabletClient::new();
        fake.add_replica(&alias(101), pos("1-21"), None, 1);
        fake.add_replica(&alias(102), pos("1-26"), None, 1);
        fake.add_replica(&alias(103), pos("1-26"), None, 1);
        fake.delay_stop(&alias(103), Duration::from_secs(5));

        let maps = stop_replication_and_build_status_maps(
            Arc::new(fake),
            &tablet_map(&[101, 102, 103]),
            &BTreeSet::new(),
            DEADLINE,
        )
        .await
        .unwrap();
        assert_eq!(maps.status_map.len(), 2);
        assert!(maps.failed.contains_key(&alias(103)));
    }
}
