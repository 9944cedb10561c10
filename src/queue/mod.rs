//! Durable mutation queue and the offline write path.
//!
//! Every write made while offline goes through [`MutationQueue`]. An entry is appended
//! with `pending` status and, when an optimistic update is supplied, the cache snapshot
//! for the same owner is rewritten in the same SQLite transaction, so readers see both
//! or neither.

mod entry;

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::event::{Event, EventBus};
use crate::store::{CacheKey, CachePatch, LocalStore};

pub use entry::{
  is_temp_id, new_temp_id, Adjustment, ChildRows, CompoundMeta, Mutation, NewQueueEntry,
  OperationKind, QueueEntry, QueueStatus, DEFAULT_MATCH_COLUMN, TEMP_ID_PREFIX,
};

/// Where a mutation lands: the cache collection it patches and the remote table it
/// replays against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  pub collection: String,
  pub table: String,
  pub owner_id: String,
}

impl Target {
  pub fn new(
    collection: impl Into<String>,
    table: impl Into<String>,
    owner_id: impl Into<String>,
  ) -> Self {
    Self {
      collection: collection.into(),
      table: table.into(),
      owner_id: owner_id.into(),
    }
  }

  /// Target whose cache collection has the same name as the remote table.
  pub fn table(table: impl Into<String>, owner_id: impl Into<String>) -> Self {
    let table = table.into();
    Self::new(table.clone(), table, owner_id)
  }

  pub fn cache_key(&self) -> CacheKey {
    CacheKey::new(&self.collection, &self.owner_id)
  }
}

/// Write path for offline mutations.
pub struct MutationQueue<S: LocalStore> {
  store: Arc<S>,
  events: EventBus,
}

impl<S: LocalStore> MutationQueue<S> {
  pub fn new(store: Arc<S>, events: EventBus) -> Self {
    Self { store, events }
  }

  /// Append a mutation without touching the cache.
  pub fn enqueue(&self, target: &Target, mutation: Mutation) -> Result<QueueEntry> {
    self.append(target, mutation, None)
  }

  /// Append a mutation and apply `update` to the cached collection atomically.
  ///
  /// `update` receives the current snapshot and returns the full replacement. A missing
  /// snapshot, or one that no longer decodes as `T`, is passed as empty: the entry is
  /// still appended and the snapshot starts over from what `update` returns.
  pub fn enqueue_with_update<T, F>(
    &self,
    target: &Target,
    mutation: Mutation,
    update: F,
  ) -> Result<QueueEntry>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Vec<T>) -> Vec<T>,
  {
    let key = target.cache_key();
    let patch = CachePatch {
      key: key.clone(),
      apply: Box::new(move |current: Vec<Value>| {
        let current = current
          .into_iter()
          .map(serde_json::from_value)
          .collect::<std::result::Result<Vec<T>, _>>()
          .unwrap_or_else(|e| {
            tracing::warn!(cache_key = %key, error = %e, "cached records no longer decode, replacing");
            Vec::new()
          });

        update(current)
          .iter()
          .map(serde_json::to_value)
          .collect::<std::result::Result<Vec<Value>, _>>()
          .map_err(|e| eyre!("Failed to encode cached records: {}", e))
      }),
    };

    self.append(target, mutation, Some(patch))
  }

  fn append(
    &self,
    target: &Target,
    mutation: Mutation,
    patch: Option<CachePatch<'_>>,
  ) -> Result<QueueEntry> {
    let new_entry = NewQueueEntry::new(&target.table, &target.owner_id, mutation);
    let entry = self.store.add_queue_entry(&new_entry, patch)?;

    tracing::debug!(
      entry_id = entry.id,
      table = %entry.table,
      operation = %entry.mutation.kind(),
      "mutation enqueued"
    );
    self.events.emit(Event::MutationEnqueued {
      id: entry.id,
      table: entry.table.clone(),
    });

    Ok(entry)
  }

  /// Entries waiting for the next drain, oldest first.
  pub fn pending(&self) -> Result<Vec<QueueEntry>> {
    self.store.queue_entries(QueueStatus::Pending)
  }

  /// Entries with the given status, or all entries, oldest first.
  pub fn entries(&self, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>> {
    match status {
      Some(status) => self.store.queue_entries(status),
      None => self.store.all_queue_entries(),
    }
  }

  /// Drop entries parked as `failed`. Returns how many were removed.
  pub fn discard_failed(&self) -> Result<usize> {
    let removed = self.store.purge_queue_entries(QueueStatus::Failed)?;
    if removed > 0 {
      tracing::info!(removed, "discarded failed queue entries");
    }
    Ok(removed)
  }
}

impl<S: LocalStore> Clone for MutationQueue<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      events: self.events.clone(),
    }
  }
}
