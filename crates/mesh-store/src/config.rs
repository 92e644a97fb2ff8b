use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

/// Configuration for a [`MeshBase`](crate::MeshBase).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshBaseConfig {
    /// How often `create_transaction_asap` tries before giving up.
    pub asap_attempts: u32,
    /// Pause between two `create_transaction_asap` attempts, in milliseconds.
    pub asap_interval_ms: u64,
    /// Upper bound on the retries of `execute_now` / `execute_asap`,
    /// whatever the action asks for.
    pub max_commit_retries: u32,
    /// How often `die` checks for an unfinished transaction.
    pub die_attempts: u32,
    /// Pause between two `die` checks, in milliseconds.
    pub die_interval_ms: u64,
}

impl Default for MeshBaseConfig {
    fn default() -> Self {
        Self {
            asap_attempts: 10,
            asap_interval_ms: 200,
            max_commit_retries: 5,
            die_attempts: 10,
            die_interval_ms: 100,
        }
    }
}

impl MeshBaseConfig {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> MeshResult<Self> {
        toml::from_str(s).map_err(|e| MeshError::Config(e.to_string()))
    }

    pub fn asap_interval(&self) -> Duration {
        Duration::from_millis(self.asap_interval_ms)
    }

    pub fn die_interval(&self) -> Duration {
        Duration::from_millis(self.die_interval_ms)
    }
}
