//! Core identity types shared by every crate: tablet aliases, tablet records,
//! roles, and per-shard metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Globally unique tablet address: a failure-domain label plus an integer uid.
///
/// Rendered as `cell-<uid zero-padded to 10>`, e.g. `zone1-0000000100`. The
/// padded form sorts lexicographically in uid order within a cell, which keeps
/// log output and map iteration deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

impl FromStr for TabletAlias {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cell, uid) = s
            .rsplit_once('-')
            .ok_or_else(|| format!("invalid tablet alias {s:?}: expected <cell>-<uid>"))?;
        if cell.is_empty() {
            return Err(format!("invalid tablet alias {s:?}: empty cell"));
        }
        let uid = uid
            .parse::<u32>()
            .map_err(|e| format!("invalid tablet alias {s:?}: bad uid: {e}"))?;
        Ok(Self::new(cell, uid))
    }
}

/// Role a tablet plays within its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TabletRole {
    Primary,
    Replica,
    Rdonly,
    Spare,
    Drained,
    Backup,
    Restore,
}

impl TabletRole {
    /// Roles that stream replication and therefore participate in the
    /// stop-and-snapshot phase. Whether they may be *promoted* is a
    /// durability-policy decision, not a role decision.
    pub fn is_replicating(self) -> bool {
        !matches!(self, TabletRole::Primary)
    }
}

impl fmt::Display for TabletRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TabletRole::Primary => "PRIMARY",
            TabletRole::Replica => "REPLICA",
            TabletRole::Rdonly => "RDONLY",
            TabletRole::Spare => "SPARE",
            TabletRole::Drained => "DRAINED",
            TabletRole::Backup => "BACKUP",
            TabletRole::Restore => "RESTORE",
        };
        f.write_str(s)
    }
}

/// One MySQL process managed by one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub alias: TabletAlias,
    pub keyspace: String,
    pub shard: String,
    pub role: TabletRole,
    pub hostname: String,
    pub mysql_port: u16,
    /// Port the tablet-manager agent listens on for coordinator RPCs.
    #[serde(default)]
    pub agent_port: u16,
    /// Nanosecond wall-clock timestamp of the start of the current primary
    /// term. Only meaningful when `role == Primary`.
    #[serde(default)]
    pub primary_term_start: Option<u64>,
    /// Set while the tablet's agent is running a backup. Backup-taking
    /// tablets are dispreferred (not excluded) as promotion candidates.
    #[serde(default)]
    pub is_backing_up: bool,
}

impl Tablet {
    pub fn new(
        alias: TabletAlias,
        keyspace: impl Into<String>,
        shard: impl Into<String>,
        role: TabletRole,
    ) -> Self {
        let hostname = alias.to_string();
        Self {
            alias,
            keyspace: keyspace.into(),
            shard: shard.into(),
            role,
            hostname,
            mysql_port: 3306,
            agent_port: 16000,
            primary_term_start: None,
            is_backing_up: false,
        }
    }
}

/// Per-shard metadata stored in the topology store.
///
/// Invariant: at most one primary alias per shard at any instant. The
/// emergency reparenter enforces this while holding the shard lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub primary_alias: Option<TabletAlias>,
    #[serde(default)]
    pub is_primary_serving: bool,
    /// Nanosecond wall-clock timestamp of the current primary term start.
    #[serde(default)]
    pub primary_term_start_time: Option<u64>,
}

/// Tablet map for one shard, keyed by alias. Built once at the start of a
/// reparent and treated as immutable for that run.
pub type TabletMap = BTreeMap<TabletAlias, Tablet>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_display_zero_pads_to_ten() {
        assert_eq!(TabletAlias::new("zone1", 100).to_string(), "zone1-0000000100");
        assert_eq!(TabletAlias::new("z", 0).to_string(), "z-0000000000");
    }

    #[test]
    fn test_alias_round_trip() {
        let alias: TabletAlias = "zone1-0000000100".parse().unwrap();
        assert_eq!(alias, TabletAlias::new("zone1", 100));
        assert_eq!(alias.to_string().parse::<TabletAlias>().unwrap(), alias);
    }

    #[test]
    fn test_alias_parse_cell_with_dashes() {
        let alias: TabletAlias = "us-east-1a-0000000007".parse().unwrap();
        assert_eq!(alias.cell, "us-east-1a");
        assert_eq!(alias.uid, 7);
    }

    #[test]
    fn test_alias_parse_rejects_garbage() {
        assert!("".parse::<TabletAlias>().is_err());
        assert!("zone1".parse::<TabletAlias>().is_err());
        assert!("zone1-notanumber".parse::<TabletAlias>().is_err());
        assert!("-100".parse::<TabletAlias>().is_err());
    }

    #[test]
    fn test_alias_ordering_is_cell_then_uid() {
        let mut aliases = vec![
            TabletAlias::new("zone2", 1),
            TabletAlias::new("zone1", 200),
            TabletAlias::new("zone1", 3),
        ];
        aliases.sort();
        assert_eq!(
            aliases,
            vec![
                TabletAlias::new("zone1", 3),
                TabletAlias::new("zone1", 200),
                TabletAlias::new("zone2", 1),
            ]
        );
    }

    #[test]
    fn test_role_serde_uppercase() {
        let json = serde_json::to_string(&TabletRole::Rdonly).unwrap();
        assert_eq!(json, "\"RDONLY\"");
        let role: TabletRole = serde_json::from_str("\"PRIMARY\"").unwrap();
        assert_eq!(role, TabletRole::Primary);
    }

    #[test]
    fn test_primary_does_not_replicate() {
        assert!(!TabletRole::Primary.is_replicating());
        assert!(TabletRole::Replica.is_replicating());
        assert!(TabletRole::Rdonly.is_replicating());
    }
}
