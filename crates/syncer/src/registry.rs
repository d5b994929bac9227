//! Registry of host schedulers.
//!
//! [`SyncRegistry`] keeps exactly one [`HostScheduler`](crate::host::HostScheduler)
//! running per supported code host, and routes "sync now" requests to the
//! scheduler owning each changeset.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hostsync_core::{ChangesetId, SyncerConfig};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncerError;
use crate::executor::ChangesetSyncer;
use crate::host::{HostHandle, SchedulerDeps};
use crate::metrics::{new_shared_metrics, SyncerMetrics};
use crate::policy::{BackoffPolicy, SyncPolicy};
use crate::store::{SyncDataFilter, SyncStore};

/// Hosts whose schedulers were started or stopped by one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct SyncRegistry {
    deps: SchedulerDeps,
    config: SyncerConfig,
    cancel: CancellationToken,
    urgent_tx: mpsc::Sender<Vec<ChangesetId>>,
    /// Taken by `start`.
    urgent_rx: Mutex<Option<mpsc::Receiver<Vec<ChangesetId>>>>,
    schedulers: Mutex<HashMap<String, HostHandle>>,
    /// Held for a whole reconciliation so host lists are applied in the order they were read.
    reconcile_lock: tokio::sync::Mutex<()>,
    /// Registry loops and schedulers of removed hosts, awaited by `join`.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncRegistry {
    /// Registry scheduling with a [`BackoffPolicy`] built from `config`.
    pub fn new(
        store: Arc<dyn SyncStore>,
        syncer: Arc<dyn ChangesetSyncer>,
        config: SyncerConfig,
    ) -> Arc<Self> {
        let policy = Arc::new(BackoffPolicy::from_config(&config));
        Self::with_policy(store, syncer, policy, config)
    }

    pub fn with_policy(
        store: Arc<dyn SyncStore>,
        syncer: Arc<dyn ChangesetSyncer>,
        policy: Arc<dyn SyncPolicy>,
        config: SyncerConfig,
    ) -> Arc<Self> {
        let (urgent_tx, urgent_rx) = mpsc::channel(config.urgent_capacity.max(1));
        Arc::new(Self {
            deps: SchedulerDeps {
                store,
                syncer,
                policy,
                metrics: new_shared_metrics(),
            },
            config,
            cancel: CancellationToken::new(),
            urgent_tx,
            urgent_rx: Mutex::new(Some(urgent_rx)),
            schedulers: Mutex::new(HashMap::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Reconcile once, then spawn the reconciliation and urgent fan-out loops.
    ///
    /// A failing first reconciliation is logged; the periodic loop retries it.
    pub async fn start(self: &Arc<Self>) {
        let Some(urgent_rx) = self.urgent_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            warn!("sync registry already started");
            return;
        };

        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "initial code host reconciliation failed");
        }

        let fan_out = tokio::spawn(Arc::clone(self).fan_out_loop(urgent_rx));
        let reconciler = tokio::spawn(Arc::clone(self).reconcile_loop());
        self.lock_tasks().extend([fan_out, reconciler]);

        info!(
            hosts = self.lock_schedulers().len(),
            reconcile_interval = ?self.config.reconcile_interval(),
            "sync registry started"
        );
    }

    /// Cancel the registry loops and every host scheduler.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("stopping sync registry");
        }
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for every spawned task to exit. Only returns after [`stop`](Self::stop).
    pub async fn join(&self) {
        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        tasks.extend(self.lock_schedulers().drain().map(|(_, handle)| handle.into_task()));

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sync task ended abnormally");
            }
        }
        debug!("sync registry joined");
    }

    /// Request an immediate sync of `ids`.
    ///
    /// Never blocks: fails with [`SyncerError::CapacityReached`] when the
    /// intake is full.
    pub fn enqueue_urgent_sync(&self, ids: Vec<ChangesetId>) -> Result<(), SyncerError> {
        if self.cancel.is_cancelled() {
            return Err(SyncerError::Stopped);
        }
        if ids.is_empty() {
            return Ok(());
        }
        self.urgent_tx.try_send(ids).map_err(|e| match e {
            TrySendError::Full(_) => SyncerError::CapacityReached,
            TrySendError::Closed(_) => SyncerError::Stopped,
        })
    }

    /// Start a scheduler for every new supported code host and stop those of
    /// hosts that disappeared. Unchanged hosts keep their scheduler.
    ///
    /// Concurrent calls run one after another. Fails with
    /// [`SyncerError::Stopped`] once the registry is stopped, including when
    /// `stop` happens while the host list is being fetched.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome, SyncerError> {
        let _serial = self.reconcile_lock.lock().await;
        if self.cancel.is_cancelled() {
            return Err(SyncerError::Stopped);
        }

        let hosts = self.deps.store.list_code_hosts().await?;
        let mut wanted = BTreeSet::new();
        for host in hosts {
            if !host.is_supported() {
                info!(host = %host.external_service_id, kind = %host.kind, "skipping unsupported code host");
                continue;
            }
            wanted.insert(host.external_service_id);
        }

        let mut outcome = ReconcileOutcome::default();
        let mut stopped = Vec::new();
        {
            let mut schedulers = self.lock_schedulers();
            // `join` drains the map after `stop`; nothing may be spawned past that point.
            if self.cancel.is_cancelled() {
                return Err(SyncerError::Stopped);
            }

            for host in &wanted {
                if schedulers.contains_key(host) {
                    continue;
                }
                let handle = HostHandle::spawn(
                    host.clone(),
                    self.deps.clone(),
                    &self.config,
                    self.cancel.child_token(),
                );
                schedulers.insert(host.clone(), handle);
                outcome.added.push(host.clone());
            }

            let mut gone: Vec<String> = schedulers
                .keys()
                .filter(|host| !wanted.contains(*host))
                .cloned()
                .collect();
            gone.sort();
            for host in gone {
                if let Some(handle) = schedulers.remove(&host) {
                    handle.cancel();
                    stopped.push(handle.into_task());
                    outcome.removed.push(host);
                }
            }
        }

        if !outcome.removed.is_empty() {
            let mut metrics = self.lock_metrics();
            for host in &outcome.removed {
                metrics.remove_host(host);
            }
        }

        {
            let mut tasks = self.lock_tasks();
            tasks.retain(|task| !task.is_finished());
            tasks.extend(stopped);
        }

        if !outcome.is_empty() {
            info!(added = ?outcome.added, removed = ?outcome.removed, "reconciled host schedulers");
        }
        Ok(outcome)
    }

    /// Keys of the code hosts with a running scheduler, sorted.
    pub fn host_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock_schedulers().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of the per-host metrics.
    pub fn metrics(&self) -> SyncerMetrics {
        self.lock_metrics().clone()
    }

    async fn reconcile_loop(self: Arc<Self>) {
        let period = self.config.reconcile_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "code host reconciliation failed");
                    }
                }
            }
        }
        debug!("reconcile loop stopped");
    }

    async fn fan_out_loop(self: Arc<Self>, mut urgent_rx: mpsc::Receiver<Vec<ChangesetId>>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                ids = urgent_rx.recv() => {
                    let Some(ids) = ids else { break };
                    if let Err(e) = self.route_urgent(ids).await {
                        warn!(error = %e, "failed to route urgent syncs");
                    }
                }
            }
        }
        debug!("urgent fan-out loop stopped");
    }

    /// Resolve the owning host of each id and forward the ids to its
    /// scheduler. Returns how many ids were forwarded; ids of unknown
    /// changesets, hosts without a scheduler, or full schedulers are dropped.
    async fn route_urgent(&self, ids: Vec<ChangesetId>) -> Result<usize, SyncerError> {
        let timeout = self.config.lookup_timeout();
        let lookup = self.deps.store.list_sync_data(SyncDataFilter::Changesets(ids));
        let data = tokio::time::timeout(timeout, lookup)
            .await
            .map_err(|_| SyncerError::Timeout(timeout))??;

        let mut by_host: BTreeMap<String, Vec<ChangesetId>> = BTreeMap::new();
        for d in data {
            by_host.entry(d.external_service_id).or_default().push(d.changeset_id);
        }

        let mut forwarded = 0;
        let schedulers = self.lock_schedulers();
        for (host, ids) in by_host {
            let Some(handle) = schedulers.get(&host) else {
                debug!(host = %host, count = ids.len(), "no scheduler for code host, dropping urgent syncs");
                continue;
            };
            let count = ids.len();
            match handle.try_enqueue(ids) {
                Ok(()) => forwarded += count,
                Err(TrySendError::Full(_)) => {
                    debug!(host = %host, count, "host scheduler intake full, dropping urgent syncs");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(host = %host, count, "host scheduler stopped, dropping urgent syncs");
                }
            }
        }
        Ok(forwarded)
    }

    fn lock_schedulers(&self) -> MutexGuard<'_, HashMap<String, HostHandle>> {
        self.schedulers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_metrics(&self) -> std::sync::RwLockWriteGuard<'_, SyncerMetrics> {
        self.deps.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }
}
