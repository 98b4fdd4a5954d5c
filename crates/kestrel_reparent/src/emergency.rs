//! The emergency reparent state machine.
//!
//! Protocol, per shard, under the topology lock:
//! 1. Stop replication everywhere and snapshot positions.
//! 2. Mark errant-GTID holders ineligible, wait for relay logs to apply.
//! 3. Promote the most advanced tablet as intermediate source and attach
//!    the reachable tablets to it.
//! 4. Re-select under promotion rules; promote the final primary if it
//!    differs from the intermediate.
//! 5. Write the reparent journal, reparent all survivors, update the shard
//!    record, release the lock.
//!
//! Failures before step 3 leave the shard untouched. Failures afterwards
//! leave the promoted tablet in place: survivors attached to a valid
//! candidate are strictly safer than a rollback attempted with a possibly
//! lost lock.
//!
//! Cancelling the caller's future aborts the stop, relay-wait, and
//! intermediate-attach fan-outs along with it; only the final-phase
//! `set_source` tasks are detached and run to their own deadlines.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use kestrel_common::config::CoordinatorConfig;
use kestrel_common::error::{KestrelResult, ReparentError, TmcError};
use kestrel_common::types::{Tablet, TabletAlias, TabletMap, TabletRole};
use kestrel_mysql::Position;
use kestrel_tmclient::TabletManagerClient;
use kestrel_topo::{ShardLockGuard, TopoStore};

use crate::candidate::{
    filter_valid_candidates, find_errant_gtids, find_most_advanced, identify_primary_candidate,
    valid_candidates,
};
use crate::events::{EventLog, EventSink, ReparentEvent, ReparentPhase};
use crate::options::EmergencyReparentOptions;
use crate::policy::policy_for_name;
use crate::stop::{stop_replication_and_build_status_maps, StatusMaps};

/// Outcome of a successful reparent.
#[derive(Debug)]
pub struct ReparentResult {
    pub new_primary: TabletAlias,
    pub events: EventLog,
}

/// Coordinator for emergency reparents. One instance serves many shards;
/// per-shard mutual exclusion comes from the topology lock.
pub struct EmergencyReparenter {
    topo: Arc<dyn TopoStore>,
    tmc: Arc<dyn TabletManagerClient>,
    config: CoordinatorConfig,
    sink: EventSink,
}

impl EmergencyReparenter {
    pub fn new(
        topo: Arc<dyn TopoStore>,
        tmc: Arc<dyn TabletManagerClient>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            topo,
            tmc,
            config,
            sink: EventSink::default(),
        }
    }

    /// Subscribe to phase events across all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<ReparentEvent> {
        self.sink.subscribe()
    }

    /// Elect and install a new primary for `keyspace/shard`.
    pub async fn reparent_shard(
        &self,
        keyspace: &str,
        shard: &str,
        opts: EmergencyReparentOptions,
    ) -> KestrelResult<ReparentResult> {
        let started = Instant::now();
        let mut rec = Recorder::new(keyspace, shard, &self.sink);
        tracing::warn!(keyspace, shard, action = %opts.lock_action(), "emergency reparent requested");
        rec.advance(ReparentPhase::Started, opts.lock_action());

        let outcome = self.run_locked(keyspace, shard, &opts, &mut rec).await;

        kestrel_observability::record_reparent_duration(
            keyspace,
            shard,
            started.elapsed().as_secs_f64(),
        );
        match outcome {
            Ok(new_primary) => {
                kestrel_observability::record_reparent(keyspace, shard, "success");
                rec.advance(ReparentPhase::Done, new_primary.to_string());
                Ok(ReparentResult {
                    new_primary,
                    events: rec.into_log(),
                })
            }
            Err(err) => {
                kestrel_observability::record_reparent(keyspace, shard, "failure");
                rec.advance(ReparentPhase::Aborted, err.to_string());
                Err(err)
            }
        }
    }

    async fn run_locked(
        &self,
        keyspace: &str,
        shard: &str,
        opts: &EmergencyReparentOptions,
        rec: &mut Recorder<'_>,
    ) -> KestrelResult<TabletAlias> {
        let guard = self
            .topo
            .lock_shard(keyspace, shard, &opts.lock_action())
            .await?;
        rec.advance(ReparentPhase::Locked, guard.reason().to_string());

        let result = self
            .reparent_shard_locked(&guard, keyspace, shard, opts, rec)
            .await;
        // Release on every exit path; releasing a lost lease is a no-op.
        guard.unlock().await;
        result
    }

    async fn reparent_shard_locked(
        &self,
        guard: &ShardLockGuard,
        keyspace: &str,
        shard: &str,
        opts: &EmergencyReparentOptions,
        rec: &mut Recorder<'_>,
    ) -> KestrelResult<TabletAlias> {
        let wait_timeout = opts
            .wait_replicas_timeout
            .unwrap_or_else(|| self.config.wait_replicas_timeout());
        let remote_timeout = self.config.remote_operation_timeout();
        let policy = policy_for_name(
            opts.durability
                .as_deref()
                .unwrap_or(&self.config.durability_policy),
        )?;

        let shard_record = self.topo.get_shard(keyspace, shard).await?;
        if let Some(expected) = &opts.expected_primary_alias {
            if shard_record.primary_alias.as_ref() != Some(expected) {
                let actual = shard_record
                    .primary_alias
                    .as_ref()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "<none>".to_string());
                return Err(ReparentError::ExpectedPrimaryMismatch {
                    expected: expected.clone(),
                    actual,
                }
                .into());
            }
        }

        let tablet_map = self.topo.get_tablet_map_for_shard(keyspace, shard).await?;
        let prev_primary = shard_record
            .primary_alias
            .as_ref()
            .and_then(|alias| tablet_map.get(alias))
            .cloned();

        // B→C: stop everything and snapshot.
        let status_maps = stop_replication_and_build_status_maps(
            Arc::clone(&self.tmc),
            &tablet_map,
            &opts.ignore_replicas,
            wait_timeout,
        )
        .await?;
        rec.advance(
            ReparentPhase::ReplicasStopped,
            format!(
                "{} stopped, {} claimed primary, {} unreachable",
                status_maps.status_map.len(),
                status_maps.primary_status_map.len(),
                status_maps.failed.len()
            ),
        );
        guard.check_still_held()?;

        let mut candidates = valid_candidates(&status_maps)?;
        let max_journal = find_errant_gtids(
            &self.tmc,
            &mut candidates,
            &status_maps,
            &tablet_map,
            wait_timeout,
        )
        .await?;
        if candidates.is_empty() {
            return Err(ReparentError::NoCandidates.into());
        }
        // Final-primary eligibility is judged over every errant-free
        // candidate: a laggard dropped from the intermediate pool below can
        // still catch up through the intermediate and become primary.
        let candidate_tablets: Vec<Tablet> = candidates
            .keys()
            .filter_map(|alias| tablet_map.get(alias).cloned())
            .collect();

        // C→D: let the relay logs drain.
        let caught_up = self
            .wait_for_relay_logs(&mut candidates, &status_maps, &tablet_map, wait_timeout)
            .await?;
        rec.advance(
            ReparentPhase::RelaysCaughtUp,
            format!("{caught_up} candidate(s) applied their relay logs"),
        );
        guard.check_still_held()?;

        // Selection and eligibility, all before the first mutation.
        let (intermediate, _) = find_most_advanced(
            &candidates,
            &tablet_map,
            policy.as_ref(),
            prev_primary.as_ref(),
            opts,
        )?;
        let filtered = filter_valid_candidates(
            &candidate_tablets,
            policy.as_ref(),
            prev_primary.as_ref(),
            opts,
        )?;
        for warning in &filtered.warnings {
            tracing::warn!(keyspace, shard, "{warning}");
        }
        if filtered.tablets.is_empty() {
            return Err(ReparentError::NoCandidates.into());
        }
        let prospective =
            identify_primary_candidate(&intermediate, &filtered.tablets, policy.as_ref(), opts)?;

        let reachable: Vec<&Tablet> = tablet_map
            .values()
            .filter(|t| status_maps.is_reachable(&t.alias))
            .collect();
        if !policy.can_establish(&prospective, &reachable) {
            let err = if opts.new_primary_alias.as_ref() == Some(&prospective.alias) {
                ReparentError::ExplicitCandidateIneligible {
                    tablet: prospective.alias.clone(),
                    reason: "durability cannot be established with the reachable tablets"
                        .to_string(),
                }
            } else {
                ReparentError::CannotEstablish(prospective.alias.clone())
            };
            return Err(err.into());
        }

        // D→E: promote the intermediate source and attach the fleet to it.
        self.tmc
            .promote_replica(&intermediate, remote_timeout)
            .await
            .map_err(|e| ReparentError::IntermediatePromotionFailed {
                tablet: intermediate.alias.clone(),
                reason: e.to_string(),
            })?;
        let attach_targets: Vec<Tablet> = tablet_map
            .values()
            .filter(|t| t.alias != intermediate.alias)
            .filter(|t| !opts.ignore_replicas.contains(&t.alias))
            .filter(|t| status_maps.is_reachable(&t.alias))
            .cloned()
            .collect();
        let attached = self
            .attach_replicas(&intermediate, &attach_targets, &status_maps, wait_timeout)
            .await;
        let failures = attach_targets.len() - attached.len();
        if failures * 2 > attach_targets.len() {
            return Err(ReparentError::IntermediatePromotionFailed {
                tablet: intermediate.alias.clone(),
                reason: format!(
                    "{failures}/{} replicas failed to attach",
                    attach_targets.len()
                ),
            }
            .into());
        }
        rec.advance(
            ReparentPhase::IntermediatePromoted,
            intermediate.alias.to_string(),
        );
        guard.check_still_held()?;

        // E→F: the most advanced tablet is not always allowed to stay
        // primary; re-select under promotion rules among the caught-up set.
        let caught_up_tablets: Vec<Tablet> = filtered
            .tablets
            .iter()
            .filter(|t| t.alias == intermediate.alias || attached.contains(&t.alias))
            .cloned()
            .collect();
        let new_primary = identify_primary_candidate(
            &intermediate,
            &caught_up_tablets,
            policy.as_ref(),
            opts,
        )?;
        if new_primary.alias != intermediate.alias {
            if !policy.can_establish(&new_primary, &reachable) {
                return Err(ReparentError::CannotEstablish(new_primary.alias.clone()).into());
            }
            self.tmc
                .promote_replica(&new_primary, remote_timeout)
                .await
                .map_err(|e| ReparentError::PromotionFailed {
                    tablet: new_primary.alias.clone(),
                    reason: e.to_string(),
                })?;
        }
        rec.advance(ReparentPhase::FinalPromoted, new_primary.alias.to_string());
        guard.check_still_held()?;

        // F→G: the journal write must land before any survivor is told, so
        // reattaching replicas can verify term monotonicity.
        let term_counter = max_journal + 1;
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let primary_position = self
            .tmc
            .primary_position(&new_primary, remote_timeout)
            .await
            .map_err(|e| ReparentError::JournalWrite {
                tablet: new_primary.alias.clone(),
                reason: format!("could not read primary position: {e}"),
            })?;
        self.tmc
            .populate_reparent_journal(
                &new_primary,
                term_counter,
                &opts.lock_action(),
                &new_primary.alias,
                &primary_position,
                now_ns,
                remote_timeout,
            )
            .await
            .map_err(|e| ReparentError::JournalWrite {
                tablet: new_primary.alias.clone(),
                reason: e.to_string(),
            })?;

        let survivors: Vec<Tablet> = tablet_map
            .values()
            .filter(|t| t.alias != new_primary.alias)
            .filter(|t| !opts.ignore_replicas.contains(&t.alias))
            .cloned()
            .collect();
        let reparented = self
            .reparent_replicas(&new_primary, &survivors, &status_maps, wait_timeout)
            .await;
        // Survivors that were already unreachable at snapshot time cannot
        // veto the reparent; failing every reachable one can.
        let reachable_survivors = survivors
            .iter()
            .filter(|t| status_maps.is_reachable(&t.alias))
            .count();
        if reachable_survivors > 0 && reparented.is_empty() {
            return Err(ReparentError::AllReplicasFailed(new_primary.alias.clone()).into());
        }
        rec.advance(
            ReparentPhase::Reparented,
            format!(
                "{}/{} surviving replicas reparented",
                reparented.len(),
                survivors.len()
            ),
        );
        guard.check_still_held()?;

        // G→H: install the new primary in the topology.
        let mut record = shard_record;
        record.primary_alias = Some(new_primary.alias.clone());
        record.is_primary_serving = true;
        record.primary_term_start_time = Some(now_ns);
        self.topo.update_shard(keyspace, shard, record).await?;

        let mut promoted = new_primary.clone();
        promoted.role = TabletRole::Primary;
        promoted.primary_term_start = Some(now_ns);
        self.topo.update_tablet(promoted).await?;

        tracing::info!(
            keyspace,
            shard,
            new_primary = %new_primary.alias,
            term_counter,
            "emergency reparent complete"
        );
        Ok(new_primary.alias)
    }

    /// Wait for every waiting candidate to apply relay logs up to the
    /// maximal snapshot position. Slow tablets drop out of the candidate
    /// pool (never out of the tablet map); a returned primary has no relay
    /// logs and does not wait. The waits are joined, so cancelling the
    /// reparent aborts them.
    async fn wait_for_relay_logs(
        &self,
        candidates: &mut BTreeMap<TabletAlias, Position>,
        status_maps: &StatusMaps,
        tablet_map: &TabletMap,
        deadline: Duration,
    ) -> KestrelResult<usize> {
        let waiting: Vec<TabletAlias> = candidates
            .keys()
            .filter(|alias| status_maps.status_map.contains_key(*alias))
            .cloned()
            .collect();
        if waiting.is_empty() {
            return Ok(0);
        }

        let mut target: Option<Position> = None;
        for alias in &waiting {
            let position = &candidates[alias];
            target = Some(match target.take() {
                None => position.clone(),
                Some(best) => {
                    if position.at_least(&best) {
                        position.clone()
                    } else {
                        best
                    }
                }
            });
        }
        let target = match target {
            Some(t) => t,
            None => return Ok(0),
        };

        let mut tasks: JoinSet<(TabletAlias, bool)> = JoinSet::new();
        for alias in &waiting {
            let Some(tablet) = tablet_map.get(alias).cloned() else {
                continue;
            };
            let tmc = Arc::clone(&self.tmc);
            let target = target.clone();
            tasks.spawn(async move {
                let alias = tablet.alias.clone();
                let result = tmc.wait_for_position(&tablet, &target, deadline).await;
                (alias, result.is_ok())
            });
        }

        let mut caught_up = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let Ok((alias, ok)) = joined else {
                continue;
            };
            if ok {
                caught_up += 1;
            } else {
                tracing::warn!(
                    tablet = %alias,
                    "relay logs did not apply within the deadline; dropped from candidacy"
                );
                candidates.remove(&alias);
            }
        }
        if candidates.is_empty() {
            return Err(ReparentError::RelayLogsDidNotApply.into());
        }
        Ok(caught_up)
    }

    /// Point `targets` at `source` concurrently during the intermediate
    /// phase.
    ///
    /// The tasks live and die with this call: cancelling the reparent drops
    /// the `JoinSet` and aborts the in-flight RPCs. Only the final phase
    /// (`reparent_replicas`) may leave CHANGE SOURCE running after the
    /// caller is gone. Returns the aliases that attached; per-tablet
    /// failures are logged, never fatal here.
    async fn attach_replicas(
        &self,
        source: &Tablet,
        targets: &[Tablet],
        status_maps: &StatusMaps,
        deadline: Duration,
    ) -> BTreeSet<TabletAlias> {
        let mut tasks: JoinSet<(TabletAlias, Result<(), TmcError>)> = JoinSet::new();
        for tablet in targets.iter().cloned() {
            let tmc = Arc::clone(&self.tmc);
            let host = source.hostname.clone();
            let port = source.mysql_port;
            let force_start = Self::was_replicating(status_maps, &tablet.alias);
            tasks.spawn(async move {
                let alias = tablet.alias.clone();
                let result = tmc
                    .set_source(&tablet, &host, port, true, force_start, deadline)
                    .await;
                (alias, result)
            });
        }

        let mut attached = BTreeSet::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((alias, result)) = joined else {
                continue;
            };
            match result {
                Ok(()) => {
                    attached.insert(alias);
                }
                Err(e) => {
                    tracing::warn!(tablet = %alias, error = %e, "set_source failed");
                }
            }
        }
        attached
    }

    /// Point `targets` at `new_primary` concurrently during the final
    /// reparent phase.
    ///
    /// Unlike every earlier fan-out, these tasks are detached from the
    /// caller's cancellation: aborting a CHANGE SOURCE mid-flight here can
    /// leave a replica in an indeterminate state, so abandoned RPCs run to
    /// their own deadline even after the reparent's caller is gone. Returns
    /// the aliases confirmed within the collection window; per-tablet
    /// failures are logged, never fatal here.
    async fn reparent_replicas(
        &self,
        new_primary: &Tablet,
        targets: &[Tablet],
        status_maps: &StatusMaps,
        deadline: Duration,
    ) -> BTreeSet<TabletAlias> {
        let (tx, mut rx) = mpsc::channel(targets.len().max(1));
        for tablet in targets.iter().cloned() {
            let tmc = Arc::clone(&self.tmc);
            let tx = tx.clone();
            let host = new_primary.hostname.clone();
            let port = new_primary.mysql_port;
            let force_start = Self::was_replicating(status_maps, &tablet.alias);
            tokio::spawn(async move {
                let alias = tablet.alias.clone();
                let result = tmc
                    .set_source(&tablet, &host, port, true, force_start, deadline)
                    .await;
                let _ = tx.send((alias, result)).await;
            });
        }
        drop(tx);

        let mut attached = BTreeSet::new();
        let window = deadline + Duration::from_millis(100);
        let collect = async {
            while let Some((alias, result)) = rx.recv().await {
                match result {
                    Ok(()) => {
                        attached.insert(alias);
                    }
                    Err(e) => {
                        tracing::warn!(tablet = %alias, error = %e, "set_source failed");
                    }
                }
            }
        };
        if tokio::time::timeout(window, collect).await.is_err() {
            tracing::warn!("collection window elapsed; in-flight set_source tasks abandoned");
        }
        attached
    }

    /// Restart replication forcefully only where it was running when the
    /// snapshot was taken.
    fn was_replicating(status_maps: &StatusMaps, alias: &TabletAlias) -> bool {
        status_maps
            .status_map
            .get(alias)
            .map(|s| s.before.replication_running())
            .unwrap_or(false)
    }
}

/// Per-run event recorder: mirrors every transition into the shared sink,
/// the structured log, and the phase-duration histogram.
struct Recorder<'a> {
    keyspace: String,
    shard: String,
    sink: &'a EventSink,
    log: EventLog,
    phase_started: Instant,
}

impl<'a> Recorder<'a> {
    fn new(keyspace: &str, shard: &str, sink: &'a EventSink) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            sink,
            log: EventLog::default(),
            phase_started: Instant::now(),
        }
    }

    fn advance(&mut self, phase: ReparentPhase, detail: impl Into<String>) {
        let detail = detail.into();
        kestrel_observability::record_reparent_phase_duration(
            &phase.to_string(),
            self.phase_started.elapsed().as_secs_f64(),
        );
        self.phase_started = Instant::now();
        tracing::info!(
            keyspace = %self.keyspace,
            shard = %self.shard,
            phase = %phase,
            detail = %detail,
            "reparent phase"
        );
        let event = ReparentEvent {
            keyspace: self.keyspace.clone(),
            shard: self.shard.clone(),
            phase,
            detail,
            at: SystemTime::now(),
        };
        self.sink.emit(event.clone());
        self.log.push(event);
    }

    fn into_log(self) -> EventLog {
        self.log
    }
}
