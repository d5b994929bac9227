//! In-memory [`SyncStore`], used by tests and the `sync-worker` binary.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use hostsync_core::{Changeset, ChangesetId, CodeHost, HostSyncError, SyncData};
use serde::{Deserialize, Serialize};

use super::{GetChangesetOpts, SyncDataFilter, SyncStore};

/// JSON snapshot of hosts and changesets loaded into a [`MemorySyncStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFixture {
    #[serde(default)]
    pub code_hosts: Vec<CodeHost>,
    #[serde(default)]
    pub changesets: Vec<Changeset>,
    /// Extra sync history. Changesets without an entry get one derived from
    /// their own `updated_at`.
    #[serde(default)]
    pub sync_data: Vec<SyncData>,
}

#[derive(Debug, Default)]
struct MemoryState {
    code_hosts: Vec<CodeHost>,
    changesets: BTreeMap<ChangesetId, Changeset>,
    sync_data: BTreeMap<ChangesetId, SyncData>,
}

#[derive(Debug, Default)]
pub struct MemorySyncStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: MemoryFixture) -> Self {
        let store = Self::new();
        store.set_code_hosts(fixture.code_hosts);
        let mut extra: BTreeMap<ChangesetId, SyncData> = fixture
            .sync_data
            .into_iter()
            .map(|d| (d.changeset_id, d))
            .collect();
        for changeset in fixture.changesets {
            let data = extra.remove(&changeset.id);
            store.insert_changeset(changeset, data);
        }
        store
    }

    pub fn from_json(json: &str) -> Result<Self, HostSyncError> {
        let fixture: MemoryFixture =
            serde_json::from_str(json).map_err(|e| HostSyncError::Serialize(e.to_string()))?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, HostSyncError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Replace the set of code hosts.
    pub fn set_code_hosts(&self, hosts: Vec<CodeHost>) {
        self.write().code_hosts = hosts;
    }

    /// Insert or replace a changeset and its sync history.
    pub fn insert_changeset(&self, changeset: Changeset, sync_data: Option<SyncData>) {
        let data = sync_data.unwrap_or_else(|| SyncData {
            changeset_id: changeset.id,
            updated_at: changeset.updated_at,
            latest_event: None,
            external_updated_at: None,
            pending_events: 0,
            external_service_id: changeset.external_service_id.clone(),
        });
        let mut state = self.write();
        state.sync_data.insert(changeset.id, data);
        state.changesets.insert(changeset.id, changeset);
    }

    pub fn changeset(&self, id: ChangesetId) -> Option<Changeset> {
        self.read().changesets.get(&id).cloned()
    }

    /// Make every call fail with a store error, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), HostSyncError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(HostSyncError::Store("store unavailable".into()));
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn list_code_hosts(&self) -> Result<Vec<CodeHost>, HostSyncError> {
        self.check_available()?;
        Ok(self.read().code_hosts.clone())
    }

    async fn list_sync_data(&self, filter: SyncDataFilter) -> Result<Vec<SyncData>, HostSyncError> {
        self.check_available()?;
        let state = self.read();
        let syncable = |data: &&SyncData| {
            state
                .changesets
                .get(&data.changeset_id)
                .is_some_and(|cs| cs.is_ready_to_sync() && !cs.is_deleted())
        };

        let data = match filter {
            SyncDataFilter::Host(host) => state
                .sync_data
                .values()
                .filter(|d| d.external_service_id == host)
                .filter(syncable)
                .cloned()
                .collect(),
            SyncDataFilter::Changesets(ids) => ids
                .iter()
                .filter_map(|id| state.sync_data.get(id))
                .filter(syncable)
                .cloned()
                .collect(),
        };
        Ok(data)
    }

    async fn get_changeset(&self, opts: GetChangesetOpts) -> Result<Option<Changeset>, HostSyncError> {
        self.check_available()?;
        Ok(self
            .read()
            .changesets
            .get(&opts.id)
            .filter(|cs| opts.matches(cs))
            .cloned())
    }

    async fn update_changeset(&self, changeset: &Changeset) -> Result<(), HostSyncError> {
        self.check_available()?;
        let mut state = self.write();
        if !state.changesets.contains_key(&changeset.id) {
            return Err(HostSyncError::ChangesetNotFound(changeset.id));
        }
        if let Some(data) = state.sync_data.get_mut(&changeset.id) {
            data.updated_at = changeset.updated_at;
            if changeset.sync_error.is_none() {
                data.pending_events = 0;
            }
        }
        state.changesets.insert(changeset.id, changeset.clone());
        Ok(())
    }
}
