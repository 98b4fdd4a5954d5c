use serde::{Deserialize, Serialize};

/// Coordinator configuration, loaded from the `[reparent]` section of the
/// deployment config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Deadline applied to the stop-replication and relay-log-apply phases,
    /// and to each fan-out RPC within them.
    #[serde(default = "default_wait_replicas_timeout_ms")]
    pub wait_replicas_timeout_ms: u64,
    /// Deadline for single remote mutations (promote, demote, journal write).
    /// Independent from the caller's cancellation.
    #[serde(default = "default_remote_operation_timeout_ms")]
    pub remote_operation_timeout_ms: u64,
    /// Name of the durability policy to enforce when the caller does not
    /// override it: `none`, `semi_sync`, `cross_cell`, `cross_cell_semi_sync`.
    #[serde(default = "default_durability_policy")]
    pub durability_policy: String,
    /// Prometheus metrics listen address. Empty disables the exporter.
    #[serde(default)]
    pub metrics_listen_addr: String,
}

fn default_wait_replicas_timeout_ms() -> u64 {
    10_000
}

fn default_remote_operation_timeout_ms() -> u64 {
    15_000
}

fn default_durability_policy() -> String {
    "none".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            wait_replicas_timeout_ms: default_wait_replicas_timeout_ms(),
            remote_operation_timeout_ms: default_remote_operation_timeout_ms(),
            durability_policy: default_durability_policy(),
            metrics_listen_addr: String::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn wait_replicas_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.wait_replicas_timeout_ms)
    }

    pub fn remote_operation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.remote_operation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.wait_replicas_timeout_ms, 10_000);
        assert_eq!(config.remote_operation_timeout_ms, 15_000);
        assert_eq!(config.durability_policy, "none");
        assert!(config.metrics_listen_addr.is_empty());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"durability_policy": "semi_sync"}"#).unwrap();
        assert_eq!(config.durability_policy, "semi_sync");
        assert_eq!(config.wait_replicas_timeout_ms, 10_000);
    }
}
