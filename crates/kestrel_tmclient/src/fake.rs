//! Programmable in-process tablet-manager client.
//!
//! Simulates a fleet of tablets with per-tablet replication state and armed
//! faults (unreachable, RPC errors, journal read/write failures, stuck relay
//! logs). Drives the orchestrator test suites; not compiled out of the crate
//! because downstream integration tests need it too.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use kestrel_common::error::TmcError;
use kestrel_common::types::{Tablet, TabletAlias};
use kestrel_mysql::{Position, SourceUuid};

use crate::client::TabletManagerClient;
use crate::replication::{
    PrimaryStatus, ReplicationState, ReplicationStatus, StopReplicationMode,
    StopReplicationStatus,
};

/// One appended reparent-journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub term_counter: i64,
    pub action_name: String,
    pub primary_alias: TabletAlias,
    pub position: Position,
    pub time_created_ns: u64,
}

/// One observed `set_source` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSourceCall {
    pub tablet: TabletAlias,
    pub host: String,
    pub port: u16,
    pub start_replication: bool,
    pub force_start: bool,
}

#[derive(Debug, Clone, Default)]
struct TabletSim {
    position: Position,
    source_uuid: Option<SourceUuid>,
    server_uuid: Option<SourceUuid>,
    replication_running: bool,
    claims_primary: bool,
    journal_counter: i64,
    journal: Vec<JournalEntry>,
    unreachable: bool,
    stop_delay: Option<Duration>,
    set_source_delay: Option<Duration>,
    set_source_error: Option<String>,
    promote_error: Option<String>,
    journal_write_error: Option<String>,
    journal_read_error: Option<String>,
    wait_times_out: bool,
    promote_count: u64,
    source: Option<(String, u16)>,
}

/// Fake fleet, keyed by tablet alias.
pub struct FakeTabletClient {
    sims: Mutex<BTreeMap<TabletAlias, TabletSim>>,
    set_source_calls: Mutex<Vec<SetSourceCall>>,
}

impl FakeTabletClient {
    pub fn new() -> Self {
        Self {
            sims: Mutex::new(BTreeMap::new()),
            set_source_calls: Mutex::new(Vec::new()),
        }
    }

    // ── Fleet construction ──

    /// Register a replica with the given relay-log position.
    pub fn add_replica(
        &self,
        alias: &TabletAlias,
        position: Position,
        source_uuid: Option<SourceUuid>,
        journal_counter: i64,
    ) {
        self.sims.lock().insert(
            alias.clone(),
            TabletSim {
                position,
                source_uuid,
                replication_running: true,
                journal_counter,
                ..TabletSim::default()
            },
        );
    }

    /// Register a tablet that claims PRIMARY: `stop_replication` returns the
    /// not-a-replica soft error and `primary_status` reports `position`.
    pub fn add_returned_primary(
        &self,
        alias: &TabletAlias,
        position: Position,
        server_uuid: Option<SourceUuid>,
        journal_counter: i64,
    ) {
        self.sims.lock().insert(
            alias.clone(),
            TabletSim {
                position,
                server_uuid,
                claims_primary: true,
                journal_counter,
                ..TabletSim::default()
            },
        );
    }

    /// Register a tablet every RPC to which fails with a connect error.
    pub fn add_unreachable(&self, alias: &TabletAlias) {
        self.sims.lock().insert(
            alias.clone(),
            TabletSim {
                unreachable: true,
                ..TabletSim::default()
            },
        );
    }

    // ── Armed faults ──

    pub fn fail_set_source(&self, alias: &TabletAlias, message: &str) {
        self.with_sim(alias, |sim| sim.set_source_error = Some(message.to_string()));
    }

    pub fn fail_promote(&self, alias: &TabletAlias, message: &str) {
        self.with_sim(alias, |sim| sim.promote_error = Some(message.to_string()));
    }

    pub fn fail_journal_write(&self, alias: &TabletAlias, message: &str) {
        self.with_sim(alias, |sim| {
            sim.journal_write_error = Some(message.to_string())
        });
    }

    pub fn fail_journal_read(&self, alias: &TabletAlias, message: &str) {
        self.with_sim(alias, |sim| {
            sim.journal_read_error = Some(message.to_string())
        });
    }

    /// Relay logs never finish applying on this tablet.
    pub fn fail_wait_for_position(&self, alias: &TabletAlias) {
        self.with_sim(alias, |sim| sim.wait_times_out = true);
    }

    /// Delay the stop-replication RPC; delays past the deadline time out.
    pub fn delay_stop(&self, alias: &TabletAlias, delay: Duration) {
        self.with_sim(alias, |sim| sim.stop_delay = Some(delay));
    }

    /// Delay the set-source RPC; delays past the deadline time out.
    pub fn delay_set_source(&self, alias: &TabletAlias, delay: Duration) {
        self.with_sim(alias, |sim| sim.set_source_delay = Some(delay));
    }

    // ── Introspection ──

    pub fn set_source_calls(&self) -> Vec<SetSourceCall> {
        self.set_source_calls.lock().clone()
    }

    pub fn journal_entries(&self, alias: &TabletAlias) -> Vec<JournalEntry> {
        self.read_sim(alias, |sim| sim.journal.clone())
    }

    pub fn journal_counter(&self, alias: &TabletAlias) -> i64 {
        self.read_sim(alias, |sim| sim.journal_counter)
    }

    pub fn promote_count(&self, alias: &TabletAlias) -> u64 {
        self.read_sim(alias, |sim| sim.promote_count)
    }

    pub fn current_source(&self, alias: &TabletAlias) -> Option<(String, u16)> {
        self.read_sim(alias, |sim| sim.source.clone())
    }

    /// Whether the simulated replication threads are currently running.
    pub fn replication_running(&self, alias: &TabletAlias) -> bool {
        self.read_sim(alias, |sim| sim.replication_running)
    }

    fn with_sim(&self, alias: &TabletAlias, f: impl FnOnce(&mut TabletSim)) {
        let mut sims = self.sims.lock();
        let sim = sims
            .get_mut(alias)
            .unwrap_or_else(|| panic!("tablet {alias} not registered in fake"));
        f(sim);
    }

    fn read_sim<T>(&self, alias: &TabletAlias, f: impl FnOnce(&TabletSim) -> T) -> T {
        let sims = self.sims.lock();
        let sim = sims
            .get(alias)
            .unwrap_or_else(|| panic!("tablet {alias} not registered in fake"));
        f(sim)
    }

    /// Connect-level check shared by every RPC.
    fn check_reachable(&self, tablet: &Tablet) -> Result<(), TmcError> {
        let sims = self.sims.lock();
        match sims.get(&tablet.alias) {
            None => Err(TmcError::Connect {
                tablet: tablet.alias.clone(),
                reason: "unknown tablet".to_string(),
            }),
            Some(sim) if sim.unreachable => Err(TmcError::Connect {
                tablet: tablet.alias.clone(),
                reason: "connection refused".to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn status_snapshot(sim: &TabletSim, running: bool) -> ReplicationStatus {
        let state = if running {
            ReplicationState::Running
        } else {
            ReplicationState::Stopped
        };
        ReplicationStatus {
            position: sim.position.clone(),
            relay_log_position: sim.position.clone(),
            source_uuid: sim.source_uuid,
            source_host: sim
                .source
                .as_ref()
                .map(|(h, _)| h.clone())
                .unwrap_or_default(),
            source_port: sim.source.as_ref().map(|(_, p)| *p).unwrap_or(0),
            io_state: state,
            sql_state: state,
        }
    }
}

impl Default for FakeTabletClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TabletManagerClient for FakeTabletClient {
    async fn stop_replication_and_get_status(
        &self,
        tablet: &Tablet,
        _mode: StopReplicationMode,
        deadline: Duration,
    ) -> Result<StopReplicationStatus, TmcError> {
        self.check_reachable(tablet)?;
        let delay = self.read_sim(&tablet.alias, |sim| sim.stop_delay);
        if let Some(delay) = delay {
            if delay >= deadline {
                tokio::time::sleep(deadline).await;
                return Err(TmcError::Timeout {
                    rpc: "stop_replication_and_get_status",
                    tablet: tablet.alias.clone(),
                    timeout_ms: deadline.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay).await;
        }
        let mut sims = self.sims.lock();
        let Some(sim) = sims.get_mut(&tablet.alias) else {
            return Err(TmcError::Connect {
                tablet: tablet.alias.clone(),
                reason: "unknown tablet".to_string(),
            });
        };
        if sim.claims_primary {
            return Err(TmcError::NotReplica(tablet.alias.clone()));
        }
        let was_running = sim.replication_running;
        sim.replication_running = false;
        Ok(StopReplicationStatus {
            before: Self::status_snapshot(sim, was_running),
            after: Self::status_snapshot(sim, false),
        })
    }

    async fn set_source(
        &self,
        tablet: &Tablet,
        host: &str,
        port: u16,
        start_replication: bool,
        force_start: bool,
        deadline: Duration,
    ) -> Result<(), TmcError> {
        self.check_reachable(tablet)?;
        let delay = self.read_sim(&tablet.alias, |sim| sim.set_source_delay);
        if let Some(delay) = delay {
            if delay >= deadline {
                tokio::time::sleep(deadline).await;
                return Err(TmcError::Timeout {
                    rpc: "set_source",
                    tablet: tablet.alias.clone(),
                    timeout_ms: deadline.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay).await;
        }
        {
            let mut sims = self.sims.lock();
            // Hostnames default to the alias rendering, so the source's
            // simulated position is resolvable for catch-up modelling.
            let source_position = host
                .parse::<TabletAlias>()
                .ok()
                .and_then(|source_alias| sims.get(&source_alias))
                .map(|source| source.position.clone());
            let Some(sim) = sims.get_mut(&tablet.alias) else {
                return Err(TmcError::Connect {
                    tablet: tablet.alias.clone(),
                    reason: "unknown tablet".to_string(),
                });
            };
            if let Some(reason) = sim.set_source_error.clone() {
                return Err(TmcError::Remote {
                    tablet: tablet.alias.clone(),
                    reason,
                });
            }
            sim.source = Some((host.to_string(), port));
            sim.claims_primary = false;
            sim.replication_running = start_replication;
            // Streaming from the new source brings the replica up to the
            // source's position.
            if start_replication {
                if let Some(source_position) = source_position {
                    if let Ok(merged) = sim.position.union(&source_position) {
                        sim.position = merged;
                    }
                }
            }
        }
        self.set_source_calls.lock().push(SetSourceCall {
            tablet: tablet.alias.clone(),
            host: host.to_string(),
            port,
            start_replication,
            force_start,
        });
        Ok(())
    }

    async fn promote_replica(
        &self,
        tablet: &Tablet,
        _deadline: Duration,
    ) -> Result<Position, TmcError> {
        self.check_reachable(tablet)?;
        let mut sims = self.sims.lock();
        let Some(sim) = sims.get_mut(&tablet.alias) else {
            return Err(TmcError::Connect {
                tablet: tablet.alias.clone(),
                reason: "unknown tablet".to_string(),
            });
        };
        if let Some(reason) = sim.promote_error.clone() {
            return Err(TmcError::Remote {
                tablet: tablet.alias.clone(),
                reason,
            });
        }
        sim.promote_count += 1;
        sim.claims_primary = true;
        sim.replication_running = false;
        sim.source = None;
        Ok(sim.position.clone())
    }

    async fn demote_primary(
        &self,
        tablet: &Tablet,
        _deadline: Duration,
    ) -> Result<Position, TmcError> {
        self.check_reachable(tablet)?;
        let mut sims = self.sims.lock();
        let Some(sim) = sims.get_mut(&tablet.alias) else {
            return Err(TmcError::Connect {
                tablet: tablet.alias.clone(),
                reason: "unknown tablet".to_string(),
            });
        };
        sim.claims_primary = false;
        Ok(sim.position.clone())
    }

    async fn undo_demote_primary(
        &self,
        tablet: &Tablet,
        _deadline: Duration,
    ) -> Result<(), TmcError> {
        self.check_reachable(tablet)?;
        self.with_sim(&tablet.alias, |sim| sim.claims_primary = true);
        Ok(())
    }

    async fn wait_for_position(
        &self,
        tablet: &Tablet,
        position: &Position,
        deadline: Duration,
    ) -> Result<(), TmcError> {
        self.check_reachable(tablet)?;
        let (times_out, caught_up) = self.read_sim(&tablet.alias, |sim| {
            (sim.wait_times_out, sim.position.at_least(position))
        });
        if times_out || !caught_up {
            return Err(TmcError::Timeout {
                rpc: "wait_for_position",
                tablet: tablet.alias.clone(),
                timeout_ms: deadline.as_millis() as u64,
            });
        }
        Ok(())
    }

    async fn populate_reparent_journal(
        &self,
        tablet: &Tablet,
        term_counter: i64,
        action_name: &str,
        primary_alias: &TabletAlias,
        position: &Position,
        time_created_ns: u64,
        _deadline: Duration,
    ) -> Result<(), TmcError> {
        self.check_reachable(tablet)?;
        let mut sims = self.sims.lock();
        let Some(sim) = sims.get_mut(&tablet.alias) else {
            return Err(TmcError::Connect {
                tablet: tablet.alias.clone(),
                reason: "unknown tablet".to_string(),
            });
        };
        if let Some(reason) = sim.journal_write_error.clone() {
            return Err(TmcError::Remote {
                tablet: tablet.alias.clone(),
                reason,
            });
        }
        sim.journal.push(JournalEntry {
            term_counter,
            action_name: action_name.to_string(),
            primary_alias: primary_alias.clone(),
            position: position.clone(),
            time_created_ns,
        });
        sim.journal_counter = sim.journal_counter.max(term_counter);
        Ok(())
    }

    async fn read_reparent_journal_info(
        &self,
        tablet: &Tablet,
        _deadline: Duration,
    ) -> Result<i64, TmcError> {
        self.check_reachable(tablet)?;
        let sims = self.sims.lock();
        let Some(sim) = sims.get(&tablet.alias) else {
            return Err(TmcError::Connect {
                tablet: tablet.alias.clone(),
                reason: "unknown tablet".to_string(),
            });
        };
        if let Some(reason) = sim.journal_read_error.clone() {
            return Err(TmcError::Remote {
                tablet: tablet.alias.clone(),
                reason,
            });
        }
        Ok(sim.journal_counter)
    }

    async fn primary_status(
        &self,
        tablet: &Tablet,
        _deadline: Duration,
    ) -> Result<PrimaryStatus, TmcError> {
        self.check_reachable(tablet)?;
        let sims = self.sims.lock();
        let Some(sim) = sims.get(&tablet.alias) else {
            return Err(TmcError::Connect {
                tablet: tablet.alias.clone(),
                reason: "unknown tablet".to_string(),
            });
        };
        if !sim.claims_primary {
            return Err(TmcError::Remote {
                tablet: tablet.alias.clone(),
                reason: "tablet is not a primary".to_string(),
            });
        }
        Ok(PrimaryStatus {
            position: sim.position.clone(),
            server_uuid: sim.server_uuid,
        })
    }

    async fn primary_position(
        &self,
        tablet: &Tablet,
        _deadline: Duration,
    ) -> Result<Position, TmcError> {
        self.check_reachable(tablet)?;
        Ok(self.read_sim(&tablet.alias, |sim| sim.position.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::types::TabletRole;

    const U1: &str = "00000000-0000-0000-0000-000000000001";

    fn tablet(uid: u32) -> Tablet {
        Tablet::new(
            TabletAlias::new("zone1", uid),
            "commerce",
            "-",
            TabletRole::Replica,
        )
    }

    fn pos(s: &str) -> Position {
        s.parse().unwrap()
    }

    const DEADLINE: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_stop_reports_before_running_and_after_stopped() {
        let fake = FakeTabletClient::new();
        let t = tablet(101);
        fake.add_replica(&t.alias, pos(&format!("MySQL56/{U1}:1-21")), None, 1);

        let status = fake
            .stop_replication_and_get_status(&t, StopReplicationMode::IoAndSqlThread, DEADLINE)
            .await
            .unwrap();
        assert!(status.before.replication_running());
        assert!(!status.after.replication_running());
        assert_eq!(
            status.after.relay_log_position,
            pos(&format!("MySQL56/{U1}:1-21"))
        );
    }

    #[tokio::test]
    async fn test_returned_primary_yields_not_replica_then_status() {
        let fake = FakeTabletClient::new();
        let t = tablet(100);
        fake.add_returned_primary(&t.alias, pos(&format!("MySQL56/{U1}:1-26")), None, 2);

        let err = fake
            .stop_replication_and_get_status(&t, StopReplicationMode::IoAndSqlThread, DEADLINE)
            .await
            .unwrap_err();
        assert!(matches!(err, TmcError::NotReplica(_)));

        let status = fake.primary_status(&t, DEADLINE).await.unwrap();
        assert_eq!(status.position, pos(&format!("MySQL56/{U1}:1-26")));
    }

    #[tokio::test]
    async fn test_promote_makes_tablet_primary() {
        let fake = FakeTabletClient::new();
        let t = tablet(102);
        fake.add_replica(&t.alias, pos(&format!("MySQL56/{U1}:1-26")), None, 1);

        let promoted_at = fake.promote_replica(&t, DEADLINE).await.unwrap();
        assert_eq!(promoted_at, pos(&format!("MySQL56/{U1}:1-26")));
        assert_eq!(fake.promote_count(&t.alias), 1);
        // Now claims primary on the next stop.
        let err = fake
            .stop_replication_and_get_status(&t, StopReplicationMode::IoAndSqlThread, DEADLINE)
            .await
            .unwrap_err();
        assert!(matches!(err, TmcError::NotReplica(_)));
    }

    #[tokio::test]
    async fn test_wait_for_position_requires_coverage() {
        let fake = FakeTabletClient::new();
        let t = tablet(101);
        fake.add_replica(&t.alias, pos(&format!("MySQL56/{U1}:1-20")), None, 1);

        fake.wait_for_position(&t, &pos(&format!("MySQL56/{U1}:1-20")), DEADLINE)
            .await
            .unwrap();
        let err = fake
            .wait_for_position(&t, &pos(&format!("MySQL56/{U1}:1-21")), DEADLINE)
            .await
            .unwrap_err();
        assert!(matches!(err, TmcError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_journal_append_and_read() {
        let fake = FakeTabletClient::new();
        let t = tablet(102);
        fake.add_replica(&t.alias, pos(&format!("MySQL56/{U1}:1-26")), None, 3);
        assert_eq!(fake.read_reparent_journal_info(&t, DEADLINE).await.unwrap(), 3);

        fake.populate_reparent_journal(
            &t,
            4,
            "EmergencyReparentShard",
            &t.alias,
            &pos(&format!("MySQL56/{U1}:1-26")),
            1,
            DEADLINE,
        )
        .await
        .unwrap();
        assert_eq!(fake.read_reparent_journal_info(&t, DEADLINE).await.unwrap(), 4);
        assert_eq!(fake.journal_entries(&t.alias).len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_fails_every_rpc() {
        let fake = FakeTabletClient::new();
        let t = tablet(103);
        fake.add_unreachable(&t.alias);
        let err = fake.primary_position(&t, DEADLINE).await.unwrap_err();
        assert!(matches!(err, TmcError::Connect { .. }));
    }
}
