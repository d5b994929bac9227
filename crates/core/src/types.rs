use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Database identifier of a changeset.
pub type ChangesetId = i64;

/// Kind of code host a changeset lives on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CodeHostKind {
    GitHub,
    GitLab,
    BitbucketServer,
    BitbucketCloud,
    /// Any host type the syncer does not know how to talk to.
    Other(String),
}

impl CodeHostKind {
    /// Whether changesets on this kind of host can be synced at all.
    pub fn is_supported(&self) -> bool {
        !matches!(self, CodeHostKind::Other(_))
    }
}

impl std::fmt::Display for CodeHostKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeHostKind::GitHub => write!(f, "github"),
            CodeHostKind::GitLab => write!(f, "gitlab"),
            CodeHostKind::BitbucketServer => write!(f, "bitbucketServer"),
            CodeHostKind::BitbucketCloud => write!(f, "bitbucketCloud"),
            CodeHostKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

/// A code host known to the data source.
///
/// `external_service_id` is the normalized service URL and doubles as the
/// key of the host's scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeHost {
    pub external_service_id: String,
    pub kind: CodeHostKind,
}

impl CodeHost {
    pub fn new(external_service_id: impl Into<String>, kind: CodeHostKind) -> Self {
        Self {
            external_service_id: external_service_id.into(),
            kind,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.kind.is_supported()
    }
}

/// Historical sync information for one changeset, used to derive its next sync time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncData {
    pub changeset_id: ChangesetId,
    /// Last time the changeset was synced. `None` if it never was.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Timestamp of the newest event we know of on the code host.
    #[serde(default)]
    pub latest_event: Option<DateTime<Utc>>,
    /// Last-modified time reported by the code host itself.
    #[serde(default)]
    pub external_updated_at: Option<DateTime<Utc>>,
    /// External update events (webhooks) received since the last sync.
    #[serde(default)]
    pub pending_events: u32,
    /// Key of the code host owning the changeset.
    pub external_service_id: String,
}

/// Where a changeset is in the reconciler's processing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerState {
    Queued,
    Processing,
    Errored,
    Failed,
    Completed,
}

/// Whether a changeset has been pushed to its code host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationState {
    Unpublished,
    Published,
}

/// Locally stored metadata of a changeset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: ChangesetId,
    pub external_service_id: String,
    pub reconciler_state: ReconcilerState,
    pub publication_state: PublicationState,
    /// Error from the most recent failed sync, cleared on success.
    #[serde(default)]
    pub sync_error: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Last successful sync.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Changeset {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn set_deleted(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
    }

    /// Whether the changeset is in a state the syncer may act on.
    pub fn is_ready_to_sync(&self) -> bool {
        self.reconciler_state == ReconcilerState::Completed
            && self.publication_state == PublicationState::Published
    }
}
