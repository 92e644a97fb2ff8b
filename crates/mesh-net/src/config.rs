use std::time::Duration;

use mesh_store::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};

/// Replication settings of a networked store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// How long an update waits for the lock to arrive from a peer, in
    /// milliseconds.
    pub lock_timeout_ms: u64,
    /// Whether new replicas hand the lock over when a peer asks for it.
    pub will_give_up_lock: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            will_give_up_lock: true,
        }
    }
}

impl ReplicationConfig {
    pub fn from_toml_str(s: &str) -> MeshResult<Self> {
        toml::from_str(s).map_err(|e| MeshError::Config(e.to_string()))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ReplicationConfig::default();
        assert_eq!(c.lock_timeout(), Duration::from_secs(5));
        assert!(c.will_give_up_lock);
    }

    #[test]
    fn from_toml() {
        let c = ReplicationConfig::from_toml_str("will_give_up_lock = false").unwrap();
        assert!(!c.will_give_up_lock);
        assert_eq!(c.lock_timeout_ms, 5_000);
        assert!(ReplicationConfig::from_toml_str("lock_timeout_ms = -1").is_err());
    }

    #[test]
    fn json_roundtrip() {
        let c = ReplicationConfig {
            lock_timeout_ms: 10,
            ..Default::default()
        };
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(serde_json::from_str::<ReplicationConfig>(&json).unwrap(), c);
    }
}
