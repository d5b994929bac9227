//! Executors that perform the sync of a single changeset.

use std::sync::Arc;

use async_trait::async_trait;
use hostsync_core::{Changeset, ChangesetId};
use thiserror::Error;
use tracing::debug;

use crate::error::SyncerError;
use crate::store::{GetChangesetOpts, SyncStore};

/// Syncs one changeset: fetch its state from the code host and persist it.
///
/// Host schedulers call this for every due item. Implementations should be
/// idempotent; the scheduler never retries a failed sync inline.
#[async_trait]
pub trait ChangesetSyncer: Send + Sync {
    async fn sync(&self, id: ChangesetId) -> Result<(), SyncerError>;
}

/// Failure loading a changeset from its code host.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("changeset no longer exists on the code host")]
    NotFound,

    #[error("code host request failed: {0}")]
    Request(String),
}

/// Client for the code host a changeset lives on.
#[async_trait]
pub trait ChangesetSource: Send + Sync {
    /// Refresh `changeset` in place with the state found on the code host.
    async fn load_changeset(&self, changeset: &mut Changeset) -> Result<(), SourceError>;
}

/// A source that reports every changeset as unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoSource;

#[async_trait]
impl ChangesetSource for EchoSource {
    async fn load_changeset(&self, _changeset: &mut Changeset) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Default executor: reads the changeset from the store, refreshes it from
/// its [`ChangesetSource`] and writes it back.
pub struct SourcedSyncer {
    store: Arc<dyn SyncStore>,
    source: Arc<dyn ChangesetSource>,
}

impl SourcedSyncer {
    pub fn new(store: Arc<dyn SyncStore>, source: Arc<dyn ChangesetSource>) -> Self {
        Self { store, source }
    }
}

#[async_trait]
impl ChangesetSyncer for SourcedSyncer {
    async fn sync(&self, id: ChangesetId) -> Result<(), SyncerError> {
        // Changesets still owned by the reconciler must not be touched.
        let Some(mut changeset) = self
            .store
            .get_changeset(GetChangesetOpts::ready_to_sync(id))
            .await?
        else {
            debug!(changeset_id = id, "changeset not found or not ready to sync");
            return Ok(());
        };

        match self.source.load_changeset(&mut changeset).await {
            Ok(()) => {}
            Err(SourceError::NotFound) => {
                if !changeset.is_deleted() {
                    changeset.set_deleted(self.store.now());
                }
            }
            Err(e) => {
                changeset.sync_error = Some(e.to_string());
                let reason = match self.store.update_changeset(&changeset).await {
                    Ok(()) => e.to_string(),
                    Err(store_err) => format!("{}; recording it failed: {}", e, store_err),
                };
                return Err(SyncerError::Sync { id, reason });
            }
        }

        changeset.sync_error = None;
        changeset.updated_at = Some(self.store.now());
        self.store.update_changeset(&changeset).await?;
        Ok(())
    }
}
