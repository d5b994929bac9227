//! Due-time ordered queue of pending changeset syncs.
//!
//! The queue is owned by exactly one host scheduler loop. All methods take
//! `&mut self`, so there is no internal locking.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hostsync_core::ChangesetId;
use serde::{Deserialize, Serialize};

/// Sync priority. Lower variant = serviced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncPriority {
    /// Requested out-of-band, due immediately.
    High = 0,
    /// Regular scheduled sync, due at `next_sync`.
    Normal = 1,
}

/// One pending unit of sync work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSync {
    pub changeset_id: ChangesetId,
    pub next_sync: DateTime<Utc>,
    pub priority: SyncPriority,
}

impl ScheduledSync {
    pub fn normal(changeset_id: ChangesetId, next_sync: DateTime<Utc>) -> Self {
        Self {
            changeset_id,
            next_sync,
            priority: SyncPriority::Normal,
        }
    }

    /// An urgent entry for a changeset without any known schedule.
    pub fn urgent(changeset_id: ChangesetId) -> Self {
        Self {
            changeset_id,
            next_sync: DateTime::<Utc>::UNIX_EPOCH,
            priority: SyncPriority::High,
        }
    }

    /// How long to wait before this item is due, measured from `now`.
    ///
    /// High priority items are always due immediately.
    pub fn due_in(&self, now: DateTime<Utc>) -> Duration {
        match self.priority {
            SyncPriority::High => Duration::ZERO,
            SyncPriority::Normal => (self.next_sync - now).to_std().unwrap_or(Duration::ZERO),
        }
    }

    fn order_key(&self) -> OrderKey {
        (self.priority, self.next_sync, self.changeset_id)
    }
}

type OrderKey = (SyncPriority, DateTime<Utc>, ChangesetId);

/// Priority queue of [`ScheduledSync`] items keyed by changeset id.
///
/// Items are ordered by priority, then `next_sync`, then id. Every
/// operation is O(log n).
#[derive(Debug, Default)]
pub struct ChangesetQueue {
    items: HashMap<ChangesetId, ScheduledSync>,
    order: BTreeSet<OrderKey>,
}

impl ChangesetQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert items, replacing any existing entry with the same id.
    pub fn upsert(&mut self, items: impl IntoIterator<Item = ScheduledSync>) {
        for item in items {
            if let Some(previous) = self.items.insert(item.changeset_id, item) {
                self.order.remove(&previous.order_key());
            }
            self.order.insert(item.order_key());
        }
    }

    /// Upsert freshly computed schedule entries.
    ///
    /// Entries already marked urgent keep their High priority; only their
    /// natural `next_sync` is refreshed. Entries not in `items` are untouched.
    pub fn merge_schedule(&mut self, items: impl IntoIterator<Item = ScheduledSync>) {
        let merged: Vec<ScheduledSync> = items
            .into_iter()
            .map(|mut item| {
                if let Some(existing) = self.items.get(&item.changeset_id) {
                    if existing.priority == SyncPriority::High {
                        item.priority = SyncPriority::High;
                    }
                }
                item
            })
            .collect();
        self.upsert(merged);
    }

    /// The next item due, without removing it.
    pub fn peek(&self) -> Option<ScheduledSync> {
        let (_, _, id) = self.order.first()?;
        self.items.get(id).copied()
    }

    pub fn get(&self, changeset_id: ChangesetId) -> Option<ScheduledSync> {
        self.items.get(&changeset_id).copied()
    }

    /// Remove an item. Absent ids are ignored.
    pub fn remove(&mut self, changeset_id: ChangesetId) -> Option<ScheduledSync> {
        let item = self.items.remove(&changeset_id)?;
        self.order.remove(&item.order_key());
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
