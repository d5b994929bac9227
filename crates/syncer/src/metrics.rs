use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-host scheduler counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostMetrics {
    pub syncs_succeeded: u64,
    pub syncs_failed: u64,
    /// Urgent ids absorbed into the queue.
    pub urgent_queued: u64,
    /// Rolling average sync duration.
    pub avg_sync_duration: Duration,
    pub last_sync: Option<DateTime<Utc>>,
    /// Duration of the last successful schedule computation.
    pub last_schedule_duration: Option<Duration>,
    pub schedule_failures: u64,
    /// Items currently queued.
    pub schedule_size: usize,
    /// Items of the last computed schedule that were already overdue.
    pub behind_schedule: usize,
}

/// Syncer operational metrics, keyed by code host.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncerMetrics {
    pub hosts: HashMap<String, HostMetrics>,
}

/// Thread-safe handle to syncer metrics.
pub type SharedSyncerMetrics = Arc<RwLock<SyncerMetrics>>;

pub fn new_shared_metrics() -> SharedSyncerMetrics {
    Arc::new(RwLock::new(SyncerMetrics::default()))
}

impl SyncerMetrics {
    fn host(&mut self, host: &str) -> &mut HostMetrics {
        self.hosts.entry(host.to_string()).or_default()
    }

    /// Record one executed sync.
    pub fn record_sync(&mut self, host: &str, duration: Duration, success: bool) {
        let m = self.host(host);
        if success {
            m.syncs_succeeded += 1;
        } else {
            m.syncs_failed += 1;
        }
        m.last_sync = Some(Utc::now());

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let count = m.syncs_succeeded + m.syncs_failed;
        m.avg_sync_duration = if count == 1 {
            duration
        } else {
            let prev_nanos = m.avg_sync_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }

    pub fn record_schedule(&mut self, host: &str, duration: Duration, behind_schedule: usize) {
        let m = self.host(host);
        m.last_schedule_duration = Some(duration);
        m.behind_schedule = behind_schedule;
    }

    pub fn record_schedule_failure(&mut self, host: &str) {
        self.host(host).schedule_failures += 1;
    }

    pub fn record_urgent(&mut self, host: &str, count: usize) {
        self.host(host).urgent_queued += count as u64;
    }

    pub fn set_schedule_size(&mut self, host: &str, size: usize) {
        self.host(host).schedule_size = size;
    }

    /// Drop all counters of a host whose scheduler was removed.
    pub fn remove_host(&mut self, host: &str) {
        self.hosts.remove(host);
    }

    pub fn total_syncs(&self) -> u64 {
        self.hosts
            .values()
            .map(|m| m.syncs_succeeded + m.syncs_failed)
            .sum()
    }
}
