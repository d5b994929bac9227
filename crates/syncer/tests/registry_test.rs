//! Integration tests for the SyncRegistry.
//!
//! These tests run real host scheduler tasks against a `MemorySyncStore`
//! and observe which changesets get synced through a recording syncer.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::time::timeout;

use hostsync_core::{
    Changeset, ChangesetId, CodeHost, CodeHostKind, HostSyncError, PublicationState,
    ReconcilerState, SyncData, SyncerConfig,
};
use hostsync_syncer::{
    ChangesetSyncer, EchoSource, GetChangesetOpts, MemorySyncStore, SourcedSyncer, SyncDataFilter,
    SyncPolicy, SyncRegistry, SyncStore, SyncerError,
};

const GITHUB: &str = "https://github.com/";
const GITLAB: &str = "https://gitlab.com/";
const PERFORCE: &str = "https://p4.example.com/";

const TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(200);
const QUIET: Duration = Duration::from_millis(400);
const SLOW_SYNC: Duration = Duration::from_millis(300);

struct RecordingSyncer {
    tx: mpsc::UnboundedSender<ChangesetId>,
}

#[async_trait]
impl ChangesetSyncer for RecordingSyncer {
    async fn sync(&self, id: ChangesetId) -> Result<(), SyncerError> {
        let _ = self.tx.send(id);
        Ok(())
    }
}

/// Reports each sync as it starts, then takes `SLOW_SYNC` to finish.
struct SlowSyncer {
    tx: mpsc::UnboundedSender<ChangesetId>,
}

#[async_trait]
impl ChangesetSyncer for SlowSyncer {
    async fn sync(&self, id: ChangesetId) -> Result<(), SyncerError> {
        let _ = self.tx.send(id);
        tokio::time::sleep(SLOW_SYNC).await;
        Ok(())
    }
}

/// Wraps a `MemorySyncStore` with one-shot delays.
struct SlowStore {
    inner: Arc<MemorySyncStore>,
    /// The next host listing returns the hosts present at call time, `SLOW_SYNC` later.
    slow_host_list: AtomicBool,
    /// The next changeset lookup hangs for several seconds.
    stall_lookup: AtomicBool,
}

impl SlowStore {
    fn new(inner: Arc<MemorySyncStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            slow_host_list: AtomicBool::new(false),
            stall_lookup: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SyncStore for SlowStore {
    async fn list_code_hosts(&self) -> Result<Vec<CodeHost>, HostSyncError> {
        let hosts = self.inner.list_code_hosts().await?;
        if self.slow_host_list.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(SLOW_SYNC).await;
        }
        Ok(hosts)
    }

    async fn list_sync_data(&self, filter: SyncDataFilter) -> Result<Vec<SyncData>, HostSyncError> {
        if matches!(filter, SyncDataFilter::Changesets(_))
            && self.stall_lookup.swap(false, Ordering::SeqCst)
        {
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        self.inner.list_sync_data(filter).await
    }

    async fn get_changeset(&self, opts: GetChangesetOpts) -> Result<Option<Changeset>, HostSyncError> {
        self.inner.get_changeset(opts).await
    }

    async fn update_changeset(&self, changeset: &Changeset) -> Result<(), HostSyncError> {
        self.inner.update_changeset(changeset).await
    }
}

/// Every changeset is always overdue.
struct AlwaysDue;

impl SyncPolicy for AlwaysDue {
    fn next_sync(&self, now: DateTime<Utc>, _data: &SyncData) -> DateTime<Utc> {
        now - TimeDelta::seconds(1)
    }
}

fn changeset(id: ChangesetId, host: &str, state: ReconcilerState) -> Changeset {
    Changeset {
        id,
        external_service_id: host.into(),
        reconciler_state: state,
        publication_state: PublicationState::Published,
        sync_error: None,
        deleted_at: None,
        updated_at: None,
    }
}

/// Store with a GitHub, a GitLab and an unsupported Perforce host.
fn store() -> Arc<MemorySyncStore> {
    let store = Arc::new(MemorySyncStore::new());
    store.set_code_hosts(vec![
        CodeHost::new(GITHUB, CodeHostKind::GitHub),
        CodeHost::new(GITLAB, CodeHostKind::GitLab),
        CodeHost::new(PERFORCE, CodeHostKind::Other("perforce".into())),
    ]);
    store
}

fn recorder() -> (Arc<RecordingSyncer>, mpsc::UnboundedReceiver<ChangesetId>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingSyncer { tx }), rx)
}

async fn next_synced(rx: &mut mpsc::UnboundedReceiver<ChangesetId>) -> ChangesetId {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a sync")
        .expect("syncer dropped")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<ChangesetId>, window: Duration) {
    let res = timeout(window, rx.recv()).await;
    assert!(res.is_err(), "unexpected sync: {:?}", res);
}

async fn shutdown(registry: &SyncRegistry) {
    registry.stop();
    timeout(TIMEOUT, registry.join())
        .await
        .expect("registry did not shut down");
}

#[tokio::test]
async fn reconcile_is_idempotent_and_skips_unsupported_hosts() {
    let (syncer, _rx) = recorder();
    let registry = SyncRegistry::new(store(), syncer, SyncerConfig::default());

    let first = registry.reconcile().await.unwrap();
    assert_eq!(first.added, vec![GITHUB.to_string(), GITLAB.to_string()]);
    assert!(first.removed.is_empty());

    let second = registry.reconcile().await.unwrap();
    assert!(second.is_empty());
    assert_eq!(registry.host_keys(), vec![GITHUB.to_string(), GITLAB.to_string()]);

    shutdown(&registry).await;
}

#[tokio::test]
async fn removed_host_stops_syncing_and_readded_host_starts_fresh() {
    let store = store();
    store.insert_changeset(changeset(1, GITHUB, ReconcilerState::Completed), None);
    let config = SyncerConfig {
        schedule_interval_secs: 1,
        ..SyncerConfig::default()
    };
    let (syncer, mut rx) = recorder();
    let registry = SyncRegistry::with_policy(store.clone(), syncer, Arc::new(AlwaysDue), config);
    registry.start().await;

    assert_eq!(next_synced(&mut rx).await, 1);

    store.set_code_hosts(vec![CodeHost::new(GITLAB, CodeHostKind::GitLab)]);
    let outcome = registry.reconcile().await.unwrap();
    assert_eq!(outcome.removed, vec![GITHUB.to_string()]);
    assert!(outcome.added.is_empty());
    assert_eq!(registry.host_keys(), vec![GITLAB.to_string()]);

    // Let an in-flight sync finish, then nothing more may arrive across
    // several schedule intervals.
    tokio::time::sleep(SETTLE).await;
    while rx.try_recv().is_ok() {}
    assert_quiet(&mut rx, Duration::from_millis(2500)).await;

    store.set_code_hosts(vec![
        CodeHost::new(GITHUB, CodeHostKind::GitHub),
        CodeHost::new(GITLAB, CodeHostKind::GitLab),
    ]);
    let outcome = registry.reconcile().await.unwrap();
    assert_eq!(outcome.added, vec![GITHUB.to_string()]);
    assert_eq!(next_synced(&mut rx).await, 1);

    shutdown(&registry).await;
}

#[tokio::test]
async fn urgent_sync_reaches_owning_host() {
    let store = store();
    let synced_at = Utc::now();
    for (id, host) in [(1, GITHUB), (2, GITHUB), (3, GITLAB)] {
        let mut cs = changeset(id, host, ReconcilerState::Completed);
        cs.updated_at = Some(synced_at);
        store.insert_changeset(cs, None);
    }
    let (syncer, mut rx) = recorder();
    let registry = SyncRegistry::new(store, syncer, SyncerConfig::default());
    registry.start().await;

    // Freshly synced changesets are not due for hours.
    assert_quiet(&mut rx, QUIET).await;

    registry.enqueue_urgent_sync(vec![3, 2]).unwrap();
    let mut got = vec![next_synced(&mut rx).await, next_synced(&mut rx).await];
    got.sort();
    assert_eq!(got, vec![2, 3]);
    assert_quiet(&mut rx, QUIET).await;

    let metrics = registry.metrics();
    assert_eq!(metrics.hosts[GITHUB].urgent_queued, 1);
    assert_eq!(metrics.hosts[GITLAB].urgent_queued, 1);

    shutdown(&registry).await;
}

#[tokio::test]
async fn enqueue_beyond_capacity_fails_fast() {
    let (syncer, _rx) = recorder();
    let registry = SyncRegistry::new(store(), syncer, SyncerConfig::default());

    // Not started: nothing drains the intake.
    for id in 0..500 {
        registry.enqueue_urgent_sync(vec![id]).unwrap();
    }
    let overflow = timeout(Duration::from_millis(100), async {
        registry.enqueue_urgent_sync(vec![500])
    })
    .await
    .expect("enqueue blocked");
    assert!(matches!(overflow, Err(SyncerError::CapacityReached)));
}

#[tokio::test]
async fn stopped_registry_rejects_work() {
    let store = store();
    store.insert_changeset(changeset(1, GITHUB, ReconcilerState::Completed), None);
    let (syncer, _rx) = recorder();
    let registry = SyncRegistry::new(store, syncer, SyncerConfig::default());
    registry.start().await;
    assert_eq!(registry.host_keys().len(), 2);

    shutdown(&registry).await;

    assert!(registry.host_keys().is_empty());
    assert!(matches!(
        registry.enqueue_urgent_sync(vec![1]),
        Err(SyncerError::Stopped)
    ));
    assert!(matches!(registry.reconcile().await, Err(SyncerError::Stopped)));
}

#[tokio::test]
async fn changesets_owned_by_reconciler_are_never_synced() {
    let store = store();
    store.insert_changeset(changeset(1, GITHUB, ReconcilerState::Completed), None);
    store.insert_changeset(changeset(2, GITHUB, ReconcilerState::Processing), None);
    let (syncer, mut rx) = recorder();
    let registry = SyncRegistry::new(store, syncer, SyncerConfig::default());
    registry.start().await;

    // Never synced, so due immediately.
    assert_eq!(next_synced(&mut rx).await, 1);

    registry.enqueue_urgent_sync(vec![2]).unwrap();
    assert_quiet(&mut rx, QUIET).await;

    shutdown(&registry).await;
}

#[tokio::test]
async fn stop_during_host_fetch_spawns_no_schedulers() {
    let store = SlowStore::new(store());
    store.slow_host_list.store(true, Ordering::SeqCst);
    let (syncer, _rx) = recorder();
    let registry = SyncRegistry::new(store, syncer, SyncerConfig::default());

    let pending = tokio::spawn({
        let registry = registry.clone();
        async move { registry.reconcile().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown(&registry).await;

    let res = timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(res, Err(SyncerError::Stopped)), "unexpected result: {:?}", res);
    assert!(registry.host_keys().is_empty());
}

#[tokio::test]
async fn concurrent_reconciles_apply_in_call_order() {
    let inner = store();
    let store = SlowStore::new(inner.clone());
    store.slow_host_list.store(true, Ordering::SeqCst);
    let (syncer, _rx) = recorder();
    let registry = SyncRegistry::new(store, syncer, SyncerConfig::default());

    // The first call reads GitHub and GitLab, then stalls.
    let first = tokio::spawn({
        let registry = registry.clone();
        async move { registry.reconcile().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    inner.set_code_hosts(vec![CodeHost::new(GITHUB, CodeHostKind::GitHub)]);

    let second = registry.reconcile().await.unwrap();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.added, vec![GITHUB.to_string(), GITLAB.to_string()]);
    assert_eq!(second.removed, vec![GITLAB.to_string()]);
    assert_eq!(registry.host_keys(), vec![GITHUB.to_string()]);

    shutdown(&registry).await;
}

#[tokio::test]
async fn in_flight_sync_does_not_revive_removed_host_metrics() {
    let store = store();
    store.insert_changeset(changeset(1, GITHUB, ReconcilerState::Completed), None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let registry = SyncRegistry::with_policy(
        store.clone(),
        Arc::new(SlowSyncer { tx }),
        Arc::new(AlwaysDue),
        SyncerConfig::default(),
    );
    registry.start().await;

    // GitHub is now mid-sync.
    assert_eq!(next_synced(&mut rx).await, 1);
    store.set_code_hosts(vec![CodeHost::new(GITLAB, CodeHostKind::GitLab)]);
    let outcome = registry.reconcile().await.unwrap();
    assert_eq!(outcome.removed, vec![GITHUB.to_string()]);

    tokio::time::sleep(SLOW_SYNC * 2).await;
    assert!(!registry.metrics().hosts.contains_key(GITHUB));

    shutdown(&registry).await;
}

#[tokio::test]
async fn urgent_fan_out_survives_lookup_timeout() {
    let inner = store();
    let synced_at = Utc::now();
    for id in [1, 2] {
        let mut cs = changeset(id, GITHUB, ReconcilerState::Completed);
        cs.updated_at = Some(synced_at);
        inner.insert_changeset(cs, None);
    }
    let store = SlowStore::new(inner);
    store.stall_lookup.store(true, Ordering::SeqCst);
    let config = SyncerConfig {
        lookup_timeout_secs: 1,
        ..SyncerConfig::default()
    };
    let (syncer, mut rx) = recorder();
    let registry = SyncRegistry::new(store, syncer, config);
    registry.start().await;
    assert_quiet(&mut rx, QUIET).await;

    // The lookup for 1 times out and the batch is dropped; the next batch still routes.
    registry.enqueue_urgent_sync(vec![1]).unwrap();
    registry.enqueue_urgent_sync(vec![2]).unwrap();
    assert_eq!(next_synced(&mut rx).await, 2);
    assert_quiet(&mut rx, QUIET).await;

    shutdown(&registry).await;
}

#[tokio::test]
async fn fixture_worker_syncs_changesets() {
    let fixture = r#"{
        "code_hosts": [
            {"external_service_id": "https://github.com/", "kind": "gitHub"},
            {"external_service_id": "https://p4.example.com/", "kind": {"other": "perforce"}}
        ],
        "changesets": [
            {"id": 10, "external_service_id": "https://github.com/",
             "reconciler_state": "completed", "publication_state": "published",
             "sync_error": "rate limited"}
        ]
    }"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(fixture.as_bytes()).unwrap();

    let store = Arc::new(MemorySyncStore::from_file(file.path()).unwrap());
    let syncer = Arc::new(SourcedSyncer::new(store.clone(), Arc::new(EchoSource)));
    let registry = SyncRegistry::new(store.clone(), syncer, SyncerConfig::default());
    registry.start().await;
    assert_eq!(registry.host_keys(), vec![GITHUB.to_string()]);

    let synced = timeout(TIMEOUT, async {
        loop {
            match store.changeset(10) {
                Some(cs) if cs.updated_at.is_some() => return cs,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .expect("changeset was never synced");
    assert!(synced.sync_error.is_none());

    shutdown(&registry).await;
    assert_eq!(registry.metrics().total_syncs(), 1);
}
