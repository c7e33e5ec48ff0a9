// Taskdeck Configuration
// Tunables for autonomy gating, working-set bounds, and the sync cadence.

use serde::{Deserialize, Serialize};

/// Configuration for one taskdeck instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeckConfig {
    /// Minimum gap between autonomous actions, shared across action kinds
    pub cooldown_ms: u64,
    /// Identical-signature error count that opens the recovery circuit
    pub max_consecutive_errors: u32,
    /// Normalized error signatures are truncated to this many characters
    pub error_signature_max_len: usize,
    /// Sessions kept hot when parent == active (one extra slot otherwise)
    pub working_set_limit: usize,
    /// Sync bridge polling cadence
    pub sync_interval_ms: u64,
    /// Default autonomous step budget per activation
    pub max_steps: u32,
    /// Whether new instances start with auto-approval enabled
    pub auto_approval_default: bool,
}

impl Default for DeckConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 3000,
            max_consecutive_errors: 3,
            error_signature_max_len: 100,
            working_set_limit: 2,
            sync_interval_ms: 150,
            max_steps: 25,
            auto_approval_default: false,
        }
    }
}

impl DeckConfig {
    /// Build a config from defaults plus `TASKDECK_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_u64("TASKDECK_COOLDOWN_MS") {
            config.cooldown_ms = v;
        }
        if let Some(v) = env_u64("TASKDECK_MAX_CONSECUTIVE_ERRORS") {
            config.max_consecutive_errors = v as u32;
        }
        if let Some(v) = env_u64("TASKDECK_WORKING_SET_LIMIT") {
            config.working_set_limit = v as usize;
        }
        if let Some(v) = env_u64("TASKDECK_SYNC_INTERVAL_MS") {
            config.sync_interval_ms = v.max(1);
        }
        if let Some(v) = env_u64("TASKDECK_MAX_STEPS") {
            config.max_steps = v as u32;
        }
        if let Some(v) = env_flag("TASKDECK_AUTO_APPROVAL") {
            config.auto_approval_default = v;
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

/// Parse a boolean-ish env flag the same way across the crate.
pub fn env_flag(key: &str) -> Option<bool> {
    match std::env::var(key) {
        Ok(v) => Some(matches!(
            v.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )),
        Err(_) => None,
    }
}
