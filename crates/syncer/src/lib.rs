pub mod error;
pub mod executor;
pub mod host;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod store;

pub use error::SyncerError;
pub use executor::{ChangesetSource, ChangesetSyncer, EchoSource, SourceError, SourcedSyncer};
pub use host::{HostHandle, HostScheduler, SchedulerDeps};
pub use metrics::{HostMetrics, SharedSyncerMetrics, SyncerMetrics};
pub use policy::{BackoffPolicy, SyncPolicy};
pub use queue::{ChangesetQueue, ScheduledSync, SyncPriority};
pub use registry::{ReconcileOutcome, SyncRegistry};
pub use store::{GetChangesetOpts, MemoryFixture, MemorySyncStore, SyncDataFilter, SyncStore};
