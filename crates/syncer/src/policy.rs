//! Policies deriving a changeset's next sync time from its sync history.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use hostsync_core::{SyncData, SyncerConfig};

/// Decides when a changeset should be synced next.
pub trait SyncPolicy: Send + Sync {
    fn next_sync(&self, now: DateTime<Utc>, data: &SyncData) -> DateTime<Utc>;
}

/// Linear backoff: the longer a changeset has been quiet, the longer we wait
/// before looking at it again, bounded by `[min_delay, max_delay]`.
///
/// - never synced: due now
/// - changed after the last sync (or pending webhook events): due `min_delay`
///   after the change, so bursts of activity settle first
/// - otherwise: `last_sync + clamp(last_sync - last_change)`
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    min_delay: TimeDelta,
    max_delay: TimeDelta,
}

impl BackoffPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        let min_delay = TimeDelta::from_std(min_delay).unwrap_or(TimeDelta::zero());
        let max_delay = TimeDelta::from_std(max_delay).unwrap_or_else(|_| TimeDelta::days(365));
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    pub fn from_config(config: &SyncerConfig) -> Self {
        Self::new(config.min_sync_delay(), config.max_sync_delay())
    }

    /// Most recent moment the changeset is known to have changed on the code host.
    fn last_change(&self, last_sync: DateTime<Utc>, data: &SyncData) -> Option<DateTime<Utc>> {
        match data.latest_event {
            // Event timestamps are rewritten by every sync, so an event right next
            // to the last sync carries no information.
            Some(event) if (event - last_sync).abs() < self.min_delay => data.external_updated_at,
            event => event.max(data.external_updated_at),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&SyncerConfig::default())
    }
}

impl SyncPolicy for BackoffPolicy {
    fn next_sync(&self, now: DateTime<Utc>, data: &SyncData) -> DateTime<Utc> {
        let Some(last_sync) = data.updated_at else {
            return now;
        };

        let last_change = self.last_change(last_sync, data);

        if data.pending_events > 0 {
            let changed = last_change.map_or(last_sync, |c| c.max(last_sync));
            return changed + self.min_delay;
        }

        let Some(last_change) = last_change else {
            return last_sync + self.max_delay;
        };

        let quiet_for = last_sync - last_change;
        if quiet_for < TimeDelta::zero() {
            return last_change + self.min_delay;
        }

        last_sync + quiet_for.clamp(self.min_delay, self.max_delay)
    }
}
