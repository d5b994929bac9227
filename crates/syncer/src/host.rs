//! Per-code-host scheduler loop.
//!
//! Each [`HostScheduler`] owns one [`ChangesetQueue`] and waits on four
//! events: cancellation, the periodic recompute ticker, the due timer of the
//! queue head, and urgent requests forwarded by the registry.

use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use hostsync_core::{ChangesetId, SyncerConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::ChangesetSyncer;
use crate::metrics::{SharedSyncerMetrics, SyncerMetrics};
use crate::policy::SyncPolicy;
use crate::queue::{ChangesetQueue, ScheduledSync, SyncPriority};
use crate::store::{SyncDataFilter, SyncStore};

/// Collaborators shared by every host scheduler of a registry.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub store: Arc<dyn SyncStore>,
    pub syncer: Arc<dyn ChangesetSyncer>,
    pub policy: Arc<dyn SyncPolicy>,
    pub metrics: SharedSyncerMetrics,
}

pub struct HostScheduler {
    host: String,
    deps: SchedulerDeps,
    schedule_interval: Duration,
    auto_sync: bool,
    queue: ChangesetQueue,
    urgent_rx: mpsc::Receiver<Vec<ChangesetId>>,
    cancel: CancellationToken,
}

impl HostScheduler {
    /// Build a scheduler for `host`, stopped by `cancel`. The returned sender
    /// feeds its urgent intake.
    pub fn new(
        host: impl Into<String>,
        deps: SchedulerDeps,
        config: &SyncerConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Sender<Vec<ChangesetId>>) {
        let (urgent_tx, urgent_rx) = mpsc::channel(config.host_urgent_capacity.max(1));
        let scheduler = Self {
            host: host.into(),
            deps,
            schedule_interval: config.schedule_interval().max(Duration::from_millis(1)),
            auto_sync: config.auto_sync,
            queue: ChangesetQueue::new(),
            urgent_rx,
            cancel,
        };
        (scheduler, urgent_tx)
    }

    /// Run until cancelled or every urgent sender is dropped.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        info!(host = %self.host, auto_sync = self.auto_sync, "host scheduler started");

        if self.auto_sync {
            self.refresh_schedule().await;
        }

        let start = tokio::time::Instant::now() + self.schedule_interval;
        let mut ticker = tokio::time::interval_at(start, self.schedule_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let head = self.queue.peek();
            let wait = head.map(|item| item.due_in(self.deps.store.now()));
            let due = async move {
                match wait {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                _ = ticker.tick() => {
                    if self.auto_sync {
                        self.refresh_schedule().await;
                    }
                }
                _ = due => {
                    // Cancellation wins over a timer that elapsed in the same poll.
                    if let Some(item) = head.filter(|_| !cancel.is_cancelled()) {
                        self.fire(item).await;
                    }
                }
                ids = self.urgent_rx.recv() => {
                    match ids {
                        Some(ids) => self.absorb_urgent(ids),
                        None => {
                            debug!(host = %self.host, "urgent channel closed");
                            break;
                        }
                    }
                }
            }
        }

        info!(host = %self.host, pending = self.queue.len(), "host scheduler stopped");
    }

    /// Recompute `next_sync` for every syncable changeset of this host and
    /// merge the result into the queue. On store errors the previous
    /// schedule is kept.
    async fn refresh_schedule(&mut self) {
        let started = Instant::now();
        let data = match self
            .deps
            .store
            .list_sync_data(SyncDataFilter::Host(self.host.clone()))
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!(host = %self.host, error = %e, "failed to list sync data, keeping previous schedule");
                self.record_metrics(|m, host| m.record_schedule_failure(host));
                return;
            }
        };

        let now = self.deps.store.now();
        let schedule: Vec<ScheduledSync> = data
            .iter()
            .filter(|d| {
                if d.external_service_id != self.host {
                    warn!(
                        host = %self.host,
                        changeset_id = d.changeset_id,
                        owner = %d.external_service_id,
                        "ignoring changeset of another code host"
                    );
                    return false;
                }
                true
            })
            .map(|d| ScheduledSync::normal(d.changeset_id, self.deps.policy.next_sync(now, d)))
            .collect();

        let behind = schedule.iter().filter(|s| s.next_sync < now).count();
        let computed = schedule.len();
        self.queue.merge_schedule(schedule);

        debug!(host = %self.host, computed, behind, queued = self.queue.len(), "schedule refreshed");
        let (elapsed, size) = (started.elapsed(), self.queue.len());
        self.record_metrics(|m, host| {
            m.record_schedule(host, elapsed, behind);
            m.set_schedule_size(host, size);
        });
    }

    /// Sync a due item and drop it from the queue whatever the outcome.
    async fn fire(&mut self, item: ScheduledSync) {
        let id = item.changeset_id;
        let started = Instant::now();
        let result = self.deps.syncer.sync(id).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(()) => debug!(host = %self.host, changeset_id = id, urgent = item.priority == SyncPriority::High, "changeset synced"),
            Err(e) => warn!(host = %self.host, changeset_id = id, error = %e, "changeset sync failed"),
        }

        self.queue.remove(id);

        let (success, size) = (result.is_ok(), self.queue.len());
        self.record_metrics(|m, host| {
            m.record_sync(host, elapsed, success);
            m.set_schedule_size(host, size);
        });
    }

    /// Mark every id as due immediately, keeping any known `next_sync`.
    fn absorb_urgent(&mut self, ids: Vec<ChangesetId>) {
        let count = ids.len();
        let items: Vec<ScheduledSync> = ids
            .into_iter()
            .map(|id| {
                let mut item = self.queue.get(id).unwrap_or_else(|| ScheduledSync::urgent(id));
                item.priority = SyncPriority::High;
                item
            })
            .collect();
        self.queue.upsert(items);

        debug!(host = %self.host, count, "urgent syncs queued");
        let size = self.queue.len();
        self.record_metrics(|m, host| {
            m.record_urgent(host, count);
            m.set_schedule_size(host, size);
        });
    }

    /// Update this host's metrics unless the scheduler has been cancelled.
    ///
    /// The check happens under the metrics lock: the registry cancels a
    /// removed host's scheduler before dropping its entry, so a late write
    /// from a sync still in flight never brings the entry back.
    fn record_metrics(&self, f: impl FnOnce(&mut SyncerMetrics, &str)) {
        let mut metrics = self.deps.metrics.write().unwrap_or_else(PoisonError::into_inner);
        if !self.cancel.is_cancelled() {
            f(&mut metrics, &self.host);
        }
    }
}

// ── HostHandle ──────────────────────────────────────────────────────

/// Registry-side handle to a running [`HostScheduler`].
pub struct HostHandle {
    host: String,
    urgent_tx: mpsc::Sender<Vec<ChangesetId>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HostHandle {
    /// Spawn a fresh scheduler for `host`, cancelled by `cancel`.
    pub fn spawn(
        host: impl Into<String>,
        deps: SchedulerDeps,
        config: &SyncerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let host = host.into();
        let (scheduler, urgent_tx) = HostScheduler::new(host.clone(), deps, config, cancel.clone());
        let task = tokio::spawn(scheduler.run());
        Self {
            host,
            urgent_tx,
            cancel,
            task,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Forward urgent ids without waiting for channel capacity.
    pub fn try_enqueue(
        &self,
        ids: Vec<ChangesetId>,
    ) -> Result<(), mpsc::error::TrySendError<Vec<ChangesetId>>> {
        self.urgent_tx.try_send(ids)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}
