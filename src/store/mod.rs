//! Persistent local store.
//!
//! Two logical tables live in one embedded SQLite database:
//! - `cache`: whole-collection snapshots keyed by `"{collection}:{owner_id}"`
//! - `sync_queue`: the durable mutation queue, keyed by a monotonic sequence and
//!   indexed by status

mod schema;
mod sqlite;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde_json::Value;
use std::fmt;

use crate::queue::{NewQueueEntry, QueueEntry, QueueStatus};

pub use schema::MIGRATIONS;
pub use sqlite::SqliteStore;

/// Address of a cache snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  pub collection: String,
  pub owner_id: String,
}

impl CacheKey {
  pub fn new(collection: impl Into<String>, owner_id: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      owner_id: owner_id.into(),
    }
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.collection, self.owner_id)
  }
}

/// The entire known collection for one owner.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub records: Vec<Value>,
  pub cached_at: DateTime<Utc>,
}

/// Cache rewrite applied in the same transaction as a queue append.
///
/// `apply` receives the current snapshot (empty when none exists) and returns the
/// replacement. Returning an error rolls back the append as well.
pub struct CachePatch<'a> {
  pub key: CacheKey,
  pub apply: Box<dyn FnOnce(Vec<Value>) -> Result<Vec<Value>> + 'a>,
}

/// Storage backend for the cache and the mutation queue.
pub trait LocalStore: Send + Sync {
  /// Get the snapshot stored under `key`.
  fn get_cache(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Replace the snapshot stored under `entry.key`.
  fn put_cache(&self, entry: &CacheEntry) -> Result<()>;

  /// Remove a single snapshot.
  fn delete_cache(&self, key: &CacheKey) -> Result<()>;

  /// Remove every snapshot, or only those of one owner. Returns how many were removed.
  fn clear_cache(&self, owner_id: Option<&str>) -> Result<usize>;

  /// Append an entry with `pending` status, optionally rewriting a cache snapshot
  /// atomically with the append.
  fn add_queue_entry(&self, entry: &NewQueueEntry, patch: Option<CachePatch<'_>>)
    -> Result<QueueEntry>;

  /// Get a queue entry by id.
  fn get_queue_entry(&self, id: i64) -> Result<Option<QueueEntry>>;

  /// Persist the status, retry count and error of an entry.
  fn update_queue_entry(&self, entry: &QueueEntry) -> Result<()>;

  /// Remove an entry from the queue.
  fn delete_queue_entry(&self, id: i64) -> Result<()>;

  /// Entries with the given status, oldest first.
  ///
  /// Reading `pending` entries parks any row that no longer decodes as `failed`.
  fn queue_entries(&self, status: QueueStatus) -> Result<Vec<QueueEntry>>;

  /// Every entry regardless of status, oldest first.
  fn all_queue_entries(&self) -> Result<Vec<QueueEntry>>;

  /// Number of entries with the given status.
  fn count_queue_entries(&self, status: QueueStatus) -> Result<usize>;

  /// Move every entry in `from` to `to`. Returns how many moved.
  fn transition_all(&self, from: QueueStatus, to: QueueStatus) -> Result<usize>;

  /// Remove every entry with the given status. Returns how many were removed.
  fn purge_queue_entries(&self, status: QueueStatus) -> Result<usize>;
}
