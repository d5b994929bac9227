//! Data source trait consumed by the registry and host schedulers.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostsync_core::{
    Changeset, ChangesetId, CodeHost, HostSyncError, PublicationState, ReconcilerState, SyncData,
};

pub use memory::{MemoryFixture, MemorySyncStore};

/// Which changesets to list sync data for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDataFilter {
    /// Every syncable changeset on the code host with this key.
    Host(String),
    /// Exactly these changesets (unknown or unsyncable ids are skipped).
    Changesets(Vec<ChangesetId>),
}

/// Lookup of a single changeset, optionally constrained by state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChangesetOpts {
    pub id: ChangesetId,
    pub reconciler_state: Option<ReconcilerState>,
    pub publication_state: Option<PublicationState>,
}

impl GetChangesetOpts {
    /// Only match the changeset if the reconciler is done with it and it is published.
    pub fn ready_to_sync(id: ChangesetId) -> Self {
        Self {
            id,
            reconciler_state: Some(ReconcilerState::Completed),
            publication_state: Some(PublicationState::Published),
        }
    }

    pub fn matches(&self, changeset: &Changeset) -> bool {
        changeset.id == self.id
            && self.reconciler_state.map_or(true, |s| s == changeset.reconciler_state)
            && self.publication_state.map_or(true, |s| s == changeset.publication_state)
    }
}

/// Persistence layer holding changesets and code host configuration.
///
/// Sync data listings only ever include changesets that are ready to sync,
/// i.e. not still being processed by the reconciler.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// All code hosts changesets may live on.
    async fn list_code_hosts(&self) -> Result<Vec<CodeHost>, HostSyncError>;

    async fn list_sync_data(&self, filter: SyncDataFilter) -> Result<Vec<SyncData>, HostSyncError>;

    /// Returns `Ok(None)` when no changeset matches the id and constraints.
    async fn get_changeset(&self, opts: GetChangesetOpts) -> Result<Option<Changeset>, HostSyncError>;

    /// Persist refreshed changeset state. Expected to be atomic.
    async fn update_changeset(&self, changeset: &Changeset) -> Result<(), HostSyncError>;

    /// Clock of the data source.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
