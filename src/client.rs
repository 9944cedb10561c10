//! Offline-aware client that wraps the remote backend with caching and queued writes.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::cache::{CacheLayer, CacheResult};
use crate::event::EventBus;
use crate::queue::{Mutation, MutationQueue, QueueEntry, Target};
use crate::remote::RemoteBackend;
use crate::store::LocalStore;
use crate::sync::{Connectivity, SyncEngine};

/// How a write was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
  /// Written to the backend; the cached collection was refetched
  Applied,
  /// Queued for replay; the optimistic update is already in the cache
  Queued(QueueEntry),
}

/// Client with transparent caching and offline writes.
///
/// Reads are cache-first. Writes go straight to the backend while online and through
/// the mutation queue otherwise, or when the direct write fails.
pub struct OfflineClient<S: LocalStore, R: RemoteBackend> {
  engine: Arc<SyncEngine<S, R>>,
  cache: CacheLayer<S>,
  queue: MutationQueue<S>,
  connectivity: Connectivity,
  /// Column that scopes backend rows to an owner, if any
  owner_column: Option<String>,
}

impl<S: LocalStore, R: RemoteBackend> OfflineClient<S, R> {
  pub fn new(
    store: Arc<S>,
    engine: Arc<SyncEngine<S, R>>,
    events: EventBus,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      engine,
      cache: CacheLayer::new(Arc::clone(&store)),
      queue: MutationQueue::new(store, events),
      connectivity,
      owner_column: None,
    }
  }

  pub fn with_stale_time(mut self, stale_time: chrono::Duration) -> Self {
    self.cache = self.cache.with_stale_time(stale_time);
    self
  }

  /// Filter fetched rows on `column = owner_id`.
  pub fn with_owner_column(mut self, column: impl Into<String>) -> Self {
    self.owner_column = Some(column.into());
    self
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  pub fn queue(&self) -> &MutationQueue<S> {
    &self.queue
  }

  async fn fetch_rows<T: DeserializeOwned>(&self, target: &Target) -> Result<Vec<T>> {
    if !self.connectivity.is_online() {
      return Err(eyre!("Offline, not fetching {}", target.table));
    }

    let owner = Value::String(target.owner_id.clone());
    let filter = self.owner_column.as_deref().map(|column| (column, &owner));
    let rows = self.engine.remote().select(&target.table, filter).await?;

    rows
      .into_iter()
      .map(serde_json::from_value)
      .collect::<std::result::Result<Vec<T>, _>>()
      .map_err(|e| eyre!("Failed to decode rows of {}: {}", target.table, e))
  }

  /// Get a collection, from cache when fresh, from the backend otherwise.
  pub async fn list<T>(&self, target: &Target) -> Result<CacheResult<Vec<T>>>
  where
    T: Serialize + DeserializeOwned,
  {
    self
      .cache
      .fetch_list(&target.collection, &target.owner_id, || {
        self.fetch_rows(target)
      })
      .await
  }

  /// Refetch a collection and overwrite its cache entry, dropping optimistic records.
  pub async fn reconcile<T>(&self, target: &Target) -> Result<Vec<T>>
  where
    T: Serialize + DeserializeOwned,
  {
    self
      .cache
      .refresh(&target.collection, &target.owner_id, || {
        self.fetch_rows(target)
      })
      .await
  }

  /// Write `mutation`, online if possible, queued otherwise.
  ///
  /// `update` is the optimistic cache update applied when the write is queued.
  pub async fn write<T, F>(&self, target: &Target, mutation: Mutation, update: F) -> Result<WriteOutcome>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Vec<T>) -> Vec<T>,
  {
    if self.connectivity.is_online() {
      match self.engine.apply_direct(&target.table, &mutation).await {
        Ok(()) => {
          if let Err(e) = self.reconcile::<T>(target).await {
            tracing::warn!(collection = %target.collection, error = %e, "refetch after write failed");
          }
          return Ok(WriteOutcome::Applied);
        }
        Err(e) => {
          tracing::warn!(table = %target.table, error = %e, "direct write failed, queueing");
        }
      }
    }

    let entry = self.queue.enqueue_with_update(target, mutation, update)?;
    Ok(WriteOutcome::Queued(entry))
  }
}
