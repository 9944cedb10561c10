//! What a cached read hands back to the caller.

use chrono::{DateTime, Utc};

/// A decoded cache snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRecords<T> {
  pub records: Vec<T>,
  pub cached_at: DateTime<Utc>,
}

/// A collection read, tagged with where it was served from.
///
/// Callers use `source` to tell the user when they are looking at data that may be
/// behind the server, and `cached_at` to say how far behind.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// Snapshot time; `None` when the data was just fetched
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Rows fetched from the backend during this read.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// A snapshot young enough that the backend was not asked.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// A stale snapshot served because the backend could not be reached.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_from_network(&self) -> bool {
    self.source == CacheSource::Network
  }

  /// Whether the data may lag behind the backend.
  pub fn is_offline(&self) -> bool {
    self.source == CacheSource::Offline
  }
}

/// Where a collection read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  Network,
  /// Snapshot within the stale time
  CacheFresh,
  /// Snapshot past the stale time, refresh failed
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_offline_result_carries_snapshot_time() {
    let cached_at = Utc::now();
    let result = CacheResult::offline(vec![1, 2], cached_at);

    assert!(result.is_offline());
    assert!(!result.is_from_network());
    assert_eq!(result.cached_at, Some(cached_at));
  }

  #[test]
  fn test_network_result_has_no_snapshot_time() {
    let result = CacheResult::from_network(vec!["a"]);
    assert!(result.is_from_network());
    assert_eq!(result.cached_at, None);
  }
}
