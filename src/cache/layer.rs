//! Cache layer over the local store.

use chrono::{Duration, Utc};
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::result::{CacheResult, CachedRecords};
use crate::store::{CacheEntry, CacheKey, LocalStore};

/// Read/write access to whole-collection snapshots.
///
/// Reads and writes never fail: a storage error is logged and reads as a miss, or the
/// write is dropped. The queue, not the cache, is what makes offline writes durable.
pub struct CacheLayer<S: LocalStore> {
  store: Arc<S>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl<S: LocalStore> CacheLayer<S> {
  /// Create a new cache layer with the given store.
  pub fn new(store: Arc<S>) -> Self {
    Self {
      store,
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  fn is_stale(&self, cached_at: chrono::DateTime<Utc>) -> bool {
    Utc::now() - cached_at > self.stale_time
  }

  /// Snapshot for `(collection, owner_id)`, or `None` on a miss or any storage error.
  pub fn get_cached_data<T: DeserializeOwned>(
    &self,
    collection: &str,
    owner_id: &str,
  ) -> Option<CachedRecords<T>> {
    let key = CacheKey::new(collection, owner_id);
    let entry = match self.store.get_cache(&key) {
      Ok(entry) => entry?,
      Err(e) => {
        tracing::warn!(cache_key = %key, error = %e, "cache read failed");
        return None;
      }
    };

    let records = entry
      .records
      .into_iter()
      .map(serde_json::from_value)
      .collect::<std::result::Result<Vec<T>, _>>();

    match records {
      Ok(records) => Some(CachedRecords {
        records,
        cached_at: entry.cached_at,
      }),
      Err(e) => {
        tracing::warn!(cache_key = %key, error = %e, "cached records no longer decode");
        None
      }
    }
  }

  /// Replace the snapshot for `(collection, owner_id)`. Failures are logged and dropped.
  pub fn set_cached_data<T: Serialize>(&self, collection: &str, owner_id: &str, records: &[T]) {
    let key = CacheKey::new(collection, owner_id);
    let records = match records
      .iter()
      .map(serde_json::to_value)
      .collect::<std::result::Result<Vec<Value>, _>>()
    {
      Ok(records) => records,
      Err(e) => {
        tracing::warn!(cache_key = %key, error = %e, "failed to encode records for cache");
        return;
      }
    };

    let entry = CacheEntry {
      key,
      records,
      cached_at: Utc::now(),
    };
    if let Err(e) = self.store.put_cache(&entry) {
      tracing::warn!(cache_key = %entry.key, error = %e, "cache write failed");
    }
  }

  /// Drop one snapshot.
  pub fn invalidate(&self, collection: &str, owner_id: &str) {
    let key = CacheKey::new(collection, owner_id);
    if let Err(e) = self.store.delete_cache(&key) {
      tracing::warn!(cache_key = %key, error = %e, "cache delete failed");
    }
  }

  /// Drop every snapshot, or those of one owner (logout).
  pub fn clear(&self, owner_id: Option<&str>) -> usize {
    match self.store.clear_cache(owner_id) {
      Ok(removed) => removed,
      Err(e) => {
        tracing::warn!(error = %e, "cache clear failed");
        0
      }
    }
  }

  /// Fetch a collection with a cache-first strategy.
  ///
  /// 1. Fresh snapshot: return it without touching the network
  /// 2. Stale or missing: fetch, overwrite the snapshot wholesale, return fresh data
  /// 3. Fetch failed but a snapshot exists: return it as offline data
  pub async fn fetch_list<T, F, Fut>(
    &self,
    collection: &str,
    owner_id: &str,
    fetcher: F,
  ) -> Result<CacheResult<Vec<T>>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
  {
    match self.get_cached_data::<T>(collection, owner_id) {
      Some(cached) if !self.is_stale(cached.cached_at) => {
        Ok(CacheResult::from_cache(cached.records, cached.cached_at))
      }
      Some(cached) => match fetcher().await {
        Ok(data) => {
          self.set_cached_data(collection, owner_id, &data);
          Ok(CacheResult::from_network(data))
        }
        Err(e) => {
          tracing::debug!(collection, error = %e, "refresh failed, serving cached data");
          Ok(CacheResult::offline(cached.records, cached.cached_at))
        }
      },
      None => {
        let data = fetcher().await?;
        self.set_cached_data(collection, owner_id, &data);
        Ok(CacheResult::from_network(data))
      }
    }
  }

  /// Refetch canonical state and replace the snapshot, discarding optimistic records.
  pub async fn refresh<T, F, Fut>(&self, collection: &str, owner_id: &str, fetcher: F) -> Result<Vec<T>>
  where
    T: Serialize,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
  {
    let data = fetcher().await?;
    self.set_cached_data(collection, owner_id, &data);
    Ok(data)
  }
}

impl<S: LocalStore> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      stale_time: self.stale_time,
    }
  }
}
