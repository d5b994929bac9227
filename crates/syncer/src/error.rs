//! Syncer error types.

use std::time::Duration;

use hostsync_core::{ChangesetId, HostSyncError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncerError {
    #[error(transparent)]
    Core(#[from] HostSyncError),

    #[error("high priority sync capacity reached")]
    CapacityReached,

    #[error("sync registry stopped")]
    Stopped,

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("syncing changeset {id} failed: {reason}")]
    Sync { id: ChangesetId, reason: String },
}
