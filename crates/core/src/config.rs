use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HostSyncError;

/// Prefix shared by every env override.
const ENV_PREFIX: &str = "HOSTSYNC";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_HOSTSYNC_{KEY} first, falls back to HOSTSYNC_{KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}_{}", profile, ENV_PREFIX, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(&format!("{}_{}", ENV_PREFIX, key))
}

fn parse_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, "ignoring unparsable config override");
            None
        }
    }
}

// ── Syncer config ─────────────────────────────────────────────

/// Tuning knobs for the changeset sync registry and its per-host schedulers.
///
/// Parsed from TOML (every field optional) with `HOSTSYNC_*` environment
/// overrides applied on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncerConfig {
    /// How often the registry re-reads the code host list, in seconds.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// How often each host scheduler recomputes its schedule, in seconds.
    #[serde(default = "default_schedule_interval")]
    pub schedule_interval_secs: u64,
    /// Buffered urgent-sync batches accepted by the registry.
    #[serde(default = "default_urgent_capacity")]
    pub urgent_capacity: usize,
    /// Buffered urgent-sync batches per host scheduler.
    #[serde(default = "default_urgent_capacity")]
    pub host_urgent_capacity: usize,
    /// Upper bound for resolving urgent changeset ids to hosts, in seconds.
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_secs: u64,
    /// When false, schedules are never computed and only urgent syncs run.
    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,
    /// Shortest delay between two syncs of the same changeset, in seconds.
    #[serde(default = "default_min_sync_delay")]
    pub min_sync_delay_secs: u64,
    /// Longest delay between two syncs of the same changeset, in seconds.
    #[serde(default = "default_max_sync_delay")]
    pub max_sync_delay_secs: u64,
}

fn default_reconcile_interval() -> u64 { 60 }
fn default_schedule_interval() -> u64 { 120 }
fn default_urgent_capacity() -> usize { 500 }
fn default_lookup_timeout() -> u64 { 10 }
fn default_auto_sync() -> bool { true }
fn default_min_sync_delay() -> u64 { 2 * 60 }
fn default_max_sync_delay() -> u64 { 8 * 60 * 60 }

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            schedule_interval_secs: default_schedule_interval(),
            urgent_capacity: default_urgent_capacity(),
            host_urgent_capacity: default_urgent_capacity(),
            lookup_timeout_secs: default_lookup_timeout(),
            auto_sync: default_auto_sync(),
            min_sync_delay_secs: default_min_sync_delay(),
            max_sync_delay_secs: default_max_sync_delay(),
        }
    }
}

impl SyncerConfig {
    /// Parse config from a TOML string, then apply env overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, HostSyncError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, HostSyncError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Build config from defaults and environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, HostSyncError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `HOSTSYNC_*` overrides from the process environment.
    ///
    /// Profile is read from `HOSTSYNC_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `PROD_HOSTSYNC_{KEY}`.
    pub fn apply_env_overrides(&mut self) {
        let profile = env_opt("HOSTSYNC_PROFILE").unwrap_or_default().to_uppercase();
        self.apply_overrides_from(|key| profiled_env_opt(&profile, key));
    }

    /// Apply overrides from an arbitrary key lookup (keys without the prefix).
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_override(&lookup, "RECONCILE_INTERVAL_SECS") {
            self.reconcile_interval_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "SCHEDULE_INTERVAL_SECS") {
            self.schedule_interval_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "URGENT_CAPACITY") {
            self.urgent_capacity = v;
        }
        if let Some(v) = parse_override(&lookup, "HOST_URGENT_CAPACITY") {
            self.host_urgent_capacity = v;
        }
        if let Some(v) = parse_override(&lookup, "LOOKUP_TIMEOUT_SECS") {
            self.lookup_timeout_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "AUTO_SYNC") {
            self.auto_sync = v;
        }
        if let Some(v) = parse_override(&lookup, "MIN_SYNC_DELAY_SECS") {
            self.min_sync_delay_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "MAX_SYNC_DELAY_SECS") {
            self.max_sync_delay_secs = v;
        }
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), HostSyncError> {
        let nonzero = [
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("schedule_interval_secs", self.schedule_interval_secs),
            ("lookup_timeout_secs", self.lookup_timeout_secs),
            ("urgent_capacity", self.urgent_capacity as u64),
            ("host_urgent_capacity", self.host_urgent_capacity as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(HostSyncError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.min_sync_delay_secs > self.max_sync_delay_secs {
            return Err(HostSyncError::Config(format!(
                "min_sync_delay_secs ({}) exceeds max_sync_delay_secs ({})",
                self.min_sync_delay_secs, self.max_sync_delay_secs
            )));
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    pub fn min_sync_delay(&self) -> Duration {
        Duration::from_secs(self.min_sync_delay_secs)
    }

    pub fn max_sync_delay(&self) -> Duration {
        Duration::from_secs(self.max_sync_delay_secs)
    }

    /// Print the effective config for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Syncer config:");
        tracing::info!(
            "  intervals:  reconcile={}s, schedule={}s",
            self.reconcile_interval_secs, self.schedule_interval_secs
        );
        tracing::info!(
            "  urgent:     capacity={}, per_host={}, lookup_timeout={}s",
            self.urgent_capacity, self.host_urgent_capacity, self.lookup_timeout_secs
        );
        tracing::info!(
            "  policy:     auto_sync={}, delay={}s..{}s",
            self.auto_sync, self.min_sync_delay_secs, self.max_sync_delay_secs
        );
    }
}
