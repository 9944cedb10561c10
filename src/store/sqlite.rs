//! SQLite implementation of the local store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::schema;
use super::{CacheEntry, CacheKey, CachePatch, LocalStore};
use crate::queue::{CompoundMeta, Mutation, NewQueueEntry, QueueEntry, QueueStatus};

/// SQLite-based local store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(mut conn: Connection) -> Result<Self> {
    schema::migrate(&mut conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("outbox").join("outbox.db"))
  }

  /// Schema version currently recorded in the database.
  pub fn schema_version(&self) -> Result<u32> {
    let conn = self.lock()?;
    schema::version(&conn)
  }

  /// Run raw SQL against the database, for tests that need to damage stored rows.
  #[cfg(test)]
  pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
    self
      .lock()?
      .execute_batch(sql)
      .map_err(|e| eyre!("Failed to run {}: {}", sql, e))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const ENTRY_COLUMNS: &str = "id, table_name, operation, payload, match_column, meta, owner_id, \
   created_at, status, retry_count, error, idempotency_key";

/// Queue row as stored, before JSON and enum decoding.
struct RawEntry {
  id: i64,
  table: String,
  operation: String,
  payload: String,
  match_column: Option<String>,
  meta: Option<String>,
  owner_id: String,
  created_at: String,
  status: String,
  retry_count: u32,
  error: Option<String>,
  idempotency_key: String,
}

impl RawEntry {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      table: row.get(1)?,
      operation: row.get(2)?,
      payload: row.get(3)?,
      match_column: row.get(4)?,
      meta: row.get(5)?,
      owner_id: row.get(6)?,
      created_at: row.get(7)?,
      status: row.get(8)?,
      retry_count: row.get(9)?,
      error: row.get(10)?,
      idempotency_key: row.get(11)?,
    })
  }

  fn decode(self) -> Result<QueueEntry> {
    let row: Value = serde_json::from_str(&self.payload)
      .map_err(|e| eyre!("Failed to parse payload of entry {}: {}", self.id, e))?;
    let meta: Option<CompoundMeta> = self
      .meta
      .as_deref()
      .map(serde_json::from_str)
      .transpose()
      .map_err(|e| eyre!("Failed to parse meta of entry {}: {}", self.id, e))?;

    Ok(QueueEntry {
      id: self.id,
      table: self.table,
      mutation: Mutation::from_parts(self.operation.parse()?, row, self.match_column, meta),
      owner_id: self.owner_id,
      created_at: parse_datetime(&self.created_at)?,
      status: self.status.parse()?,
      retry_count: self.retry_count,
      error: self.error,
      idempotency_key: self.idempotency_key,
    })
  }
}

/// Queue rows read by a query, split into usable entries and rows that cannot be used.
struct Selected {
  entries: Vec<QueueEntry>,
  /// Row id and the reason it could not be read
  unreadable: Vec<(i64, String)>,
}

/// Run a queue query and decode the rows.
fn select_entries(
  conn: &Connection,
  sql: &str,
  params: impl rusqlite::Params,
) -> Result<Selected> {
  let mut stmt = conn
    .prepare(sql)
    .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

  let rows: Vec<(i64, rusqlite::Result<RawEntry>)> = stmt
    .query_map(params, |row| Ok((row.get(0)?, RawEntry::from_row(row))))
    .map_err(|e| eyre!("Failed to query queue: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read queue row id: {}", e))?;

  let mut selected = Selected {
    entries: Vec::with_capacity(rows.len()),
    unreadable: Vec::new(),
  };
  for (id, raw) in rows {
    let decoded = raw
      .map_err(|e| eyre!("Failed to read queue entry {}: {}", id, e))
      .and_then(RawEntry::decode);
    match decoded {
      Ok(entry) => selected.entries.push(entry),
      Err(e) => {
        tracing::warn!(entry_id = id, error = %e, "unreadable queue entry");
        selected.unreadable.push((id, e.to_string()));
      }
    }
  }
  Ok(selected)
}

/// Mark pending rows that can never be replayed as failed, so they stop counting as
/// backlog. Mirrors how the engine treats a malformed entry.
fn park_unreadable(conn: &Connection, unreadable: &[(i64, String)]) -> Result<()> {
  for (id, error) in unreadable {
    conn
      .execute(
        "UPDATE sync_queue SET status = ?, retry_count = retry_count + 1, error = ?
         WHERE id = ? AND status = ?",
        params![
          QueueStatus::Failed.as_str(),
          error,
          id,
          QueueStatus::Pending.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to park queue entry {}: {}", id, e))?;
    tracing::error!(entry_id = id, error = %error, "queue entry cannot be decoded, parked as failed");
  }
  Ok(())
}

fn read_cache(conn: &Connection, key: &CacheKey) -> Result<Option<CacheEntry>> {
  let row: Option<(String, String)> = conn
    .query_row(
      "SELECT records, cached_at FROM cache WHERE cache_key = ?",
      params![key.to_string()],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(|e| eyre!("Failed to read cache {}: {}", key, e))?;

  match row {
    Some((records, cached_at)) => {
      let records: Vec<Value> = serde_json::from_str(&records)
        .map_err(|e| eyre!("Failed to parse cached records for {}: {}", key, e))?;
      Ok(Some(CacheEntry {
        key: key.clone(),
        records,
        cached_at: parse_datetime(&cached_at)?,
      }))
    }
    None => Ok(None),
  }
}

fn write_cache(conn: &Connection, entry: &CacheEntry) -> Result<()> {
  let records = serde_json::to_string(&entry.records)
    .map_err(|e| eyre!("Failed to serialize records for {}: {}", entry.key, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache (cache_key, collection, owner_id, records, cached_at)
       VALUES (?, ?, ?, ?, ?)",
      params![
        entry.key.to_string(),
        entry.key.collection,
        entry.key.owner_id,
        records,
        entry.cached_at.to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to write cache {}: {}", entry.key, e))?;

  Ok(())
}

impl LocalStore for SqliteStore {
  fn get_cache(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;
    read_cache(&conn, key)
  }

  fn put_cache(&self, entry: &CacheEntry) -> Result<()> {
    let conn = self.lock()?;
    write_cache(&conn, entry)
  }

  fn delete_cache(&self, key: &CacheKey) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM cache WHERE cache_key = ?",
        params![key.to_string()],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", key, e))?;
    Ok(())
  }

  fn clear_cache(&self, owner_id: Option<&str>) -> Result<usize> {
    let conn = self.lock()?;
    let removed = match owner_id {
      Some(owner) => conn.execute("DELETE FROM cache WHERE owner_id = ?", params![owner]),
      None => conn.execute("DELETE FROM cache", []),
    }
    .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(removed)
  }

  fn add_queue_entry(
    &self,
    entry: &NewQueueEntry,
    patch: Option<CachePatch<'_>>,
  ) -> Result<QueueEntry> {
    let mut conn = self.lock()?;

    let payload = serde_json::to_string(entry.mutation.payload())
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
    let meta = entry
      .mutation
      .meta()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize meta: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT INTO sync_queue (table_name, operation, payload, match_column, meta, owner_id,
                               created_at, status, retry_count, error, idempotency_key)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?)",
      params![
        entry.table,
        entry.mutation.kind().as_str(),
        payload,
        entry.mutation.match_column(),
        meta,
        entry.owner_id,
        entry.created_at.to_rfc3339(),
        QueueStatus::Pending.as_str(),
        entry.idempotency_key,
      ],
    )
    .map_err(|e| eyre!("Failed to append queue entry: {}", e))?;
    let id = tx.last_insert_rowid();

    if let Some(patch) = patch {
      let current = read_cache(&tx, &patch.key)?
        .map(|cached| cached.records)
        .unwrap_or_default();
      let records = (patch.apply)(current)?;
      write_cache(
        &tx,
        &CacheEntry {
          key: patch.key,
          records,
          cached_at: Utc::now(),
        },
      )?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit queue entry: {}", e))?;

    Ok(QueueEntry {
      id,
      table: entry.table.clone(),
      mutation: entry.mutation.clone(),
      owner_id: entry.owner_id.clone(),
      created_at: entry.created_at,
      status: QueueStatus::Pending,
      retry_count: 0,
      error: None,
      idempotency_key: entry.idempotency_key.clone(),
    })
  }

  fn get_queue_entry(&self, id: i64) -> Result<Option<QueueEntry>> {
    let conn = self.lock()?;
    let raw = conn
      .query_row(
        &format!("SELECT {} FROM sync_queue WHERE id = ?", ENTRY_COLUMNS),
        params![id],
        RawEntry::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read queue entry {}: {}", id, e))?;

    raw.map(RawEntry::decode).transpose()
  }

  fn update_queue_entry(&self, entry: &QueueEntry) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE sync_queue SET status = ?, retry_count = ?, error = ? WHERE id = ?",
        params![
          entry.status.as_str(),
          entry.retry_count,
          entry.error,
          entry.id
        ],
      )
      .map_err(|e| eyre!("Failed to update queue entry {}: {}", entry.id, e))?;
    Ok(())
  }

  fn delete_queue_entry(&self, id: i64) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete queue entry {}: {}", id, e))?;
    Ok(())
  }

  fn queue_entries(&self, status: QueueStatus) -> Result<Vec<QueueEntry>> {
    let conn = self.lock()?;
    let selected = select_entries(
      &conn,
      &format!(
        "SELECT {} FROM sync_queue WHERE status = ? ORDER BY id",
        ENTRY_COLUMNS
      ),
      params![status.as_str()],
    )?;
    if status == QueueStatus::Pending {
      park_unreadable(&conn, &selected.unreadable)?;
    }
    Ok(selected.entries)
  }

  fn all_queue_entries(&self) -> Result<Vec<QueueEntry>> {
    let conn = self.lock()?;
    let selected = select_entries(
      &conn,
      &format!("SELECT {} FROM sync_queue ORDER BY id", ENTRY_COLUMNS),
      params![],
    )?;
    Ok(selected.entries)
  }

  fn count_queue_entries(&self, status: QueueStatus) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status = ?",
        params![status.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count {} entries: {}", status, e))?;
    Ok(count as usize)
  }

  fn transition_all(&self, from: QueueStatus, to: QueueStatus) -> Result<usize> {
    let conn = self.lock()?;
    let moved = conn
      .execute(
        "UPDATE sync_queue SET status = ? WHERE status = ?",
        params![to.as_str(), from.as_str()],
      )
      .map_err(|e| eyre!("Failed to move {} entries to {}: {}", from, to, e))?;
    Ok(moved)
  }

  fn purge_queue_entries(&self, status: QueueStatus) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM sync_queue WHERE status = ?",
        params![status.as_str()],
      )
      .map_err(|e| eyre!("Failed to purge {} entries: {}", status, e))?;
    Ok(removed)
  }
}

/// Parse an RFC 3339 timestamp written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store() -> SqliteStore {
    SqliteStore::open_in_memory().unwrap()
  }

  fn entry(table: &str, mutation: Mutation) -> NewQueueEntry {
    NewQueueEntry::new(table, "user1", mutation)
  }

  #[test]
  fn test_cache_put_replaces_whole_snapshot() {
    let store = store();
    let key = CacheKey::new("orders", "user1");

    store
      .put_cache(&CacheEntry {
        key: key.clone(),
        records: vec![json!({"id": 1}), json!({"id": 2})],
        cached_at: Utc::now(),
      })
      .unwrap();
    store
      .put_cache(&CacheEntry {
        key: key.clone(),
        records: vec![json!({"id": 3})],
        cached_at: Utc::now(),
      })
      .unwrap();

    let cached = store.get_cache(&key).unwrap().unwrap();
    assert_eq!(cached.records, vec![json!({"id": 3})]);
  }

  #[test]
  fn test_cache_keys_are_per_owner() {
    let store = store();
    store
      .put_cache(&CacheEntry {
        key: CacheKey::new("orders", "user1"),
        records: vec![json!({"id": 1})],
        cached_at: Utc::now(),
      })
      .unwrap();

    assert!(store
      .get_cache(&CacheKey::new("orders", "user2"))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_clear_cache_by_owner() {
    let store = store();
    for owner in ["user1", "user2"] {
      store
        .put_cache(&CacheEntry {
          key: CacheKey::new("orders", owner),
          records: vec![],
          cached_at: Utc::now(),
        })
        .unwrap();
    }

    assert_eq!(store.clear_cache(Some("user1")).unwrap(), 1);
    assert!(store
      .get_cache(&CacheKey::new("orders", "user2"))
      .unwrap()
      .is_some());
    assert_eq!(store.clear_cache(None).unwrap(), 1);
  }

  #[test]
  fn test_queue_entries_keep_insertion_order() {
    let store = store();
    let tables = ["orders", "inventory", "sessions", "orders"];
    for table in tables {
      store
        .add_queue_entry(&entry(table, Mutation::upsert(json!({}))), None)
        .unwrap();
    }

    let pending = store.queue_entries(QueueStatus::Pending).unwrap();
    let order: Vec<&str> = pending.iter().map(|e| e.table.as_str()).collect();
    assert_eq!(order, tables);
    assert!(pending.windows(2).all(|w| w[0].id < w[1].id));
  }

  #[test]
  fn test_queue_entry_round_trips_compound_meta() {
    let store = store();
    let meta: CompoundMeta = serde_json::from_value(json!({
      "children": [{"table": "order_items", "rows": [{"sku": "A1"}], "parent_column": "order_id"}],
      "adjustments": [{"table": "inventory", "match_column": "sku", "match_value": "A1",
                       "column": "stock", "delta": -2.0}]
    }))
    .unwrap();
    let added = store
      .add_queue_entry(
        &entry("orders", Mutation::compound(json!({"id": "offline-1"}), meta)),
        None,
      )
      .unwrap();

    let loaded = store.get_queue_entry(added.id).unwrap().unwrap();
    assert_eq!(loaded, added);
  }

  #[test]
  fn test_update_and_count_by_status() {
    let store = store();
    let mut first = store
      .add_queue_entry(&entry("orders", Mutation::insert(json!({}))), None)
      .unwrap();
    store
      .add_queue_entry(&entry("orders", Mutation::insert(json!({}))), None)
      .unwrap();

    first.status = QueueStatus::Failed;
    first.retry_count = 3;
    first.error = Some("boom".to_string());
    store.update_queue_entry(&first).unwrap();

    assert_eq!(store.count_queue_entries(QueueStatus::Pending).unwrap(), 1);
    assert_eq!(store.count_queue_entries(QueueStatus::Failed).unwrap(), 1);
    let loaded = store.get_queue_entry(first.id).unwrap().unwrap();
    assert_eq!(loaded.error.as_deref(), Some("boom"));
    assert_eq!(loaded.retry_count, 3);
  }

  #[test]
  fn test_failed_patch_rolls_back_append() {
    let store = store();
    let key = CacheKey::new("orders", "user1");
    let patch = CachePatch {
      key: key.clone(),
      apply: Box::new(|_| Err(eyre!("patch failed"))),
    };

    let result = store.add_queue_entry(&entry("orders", Mutation::insert(json!({}))), Some(patch));

    assert!(result.is_err());
    assert!(store.all_queue_entries().unwrap().is_empty());
    assert!(store.get_cache(&key).unwrap().is_none());
  }

  #[test]
  fn test_transition_and_purge() {
    let store = store();
    let mut a = store
      .add_queue_entry(&entry("orders", Mutation::insert(json!({}))), None)
      .unwrap();
    a.status = QueueStatus::Syncing;
    store.update_queue_entry(&a).unwrap();

    assert_eq!(
      store
        .transition_all(QueueStatus::Syncing, QueueStatus::Pending)
        .unwrap(),
      1
    );
    assert_eq!(store.purge_queue_entries(QueueStatus::Pending).unwrap(), 1);
    assert!(store.all_queue_entries().unwrap().is_empty());
  }

  #[test]
  fn test_undecodable_pending_rows_are_parked_as_failed() {
    let store = store();
    let bad_payload = store
      .add_queue_entry(&entry("orders", Mutation::insert(json!({}))), None)
      .unwrap();
    let bad_operation = store
      .add_queue_entry(&entry("orders", Mutation::insert(json!({}))), None)
      .unwrap();
    let good = store
      .add_queue_entry(&entry("orders", Mutation::insert(json!({}))), None)
      .unwrap();
    store
      .execute_batch(&format!(
        "UPDATE sync_queue SET payload = '{{not json' WHERE id = {};
         UPDATE sync_queue SET operation = 'merge' WHERE id = {};",
        bad_payload.id, bad_operation.id
      ))
      .unwrap();

    let pending = store.queue_entries(QueueStatus::Pending).unwrap();

    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, good.id);
    assert_eq!(store.count_queue_entries(QueueStatus::Pending).unwrap(), 1);
    assert_eq!(store.count_queue_entries(QueueStatus::Failed).unwrap(), 2);

    let conn = store.lock().unwrap();
    let (retry_count, error): (u32, Option<String>) = conn
      .query_row(
        "SELECT retry_count, error FROM sync_queue WHERE id = ?",
        params![bad_payload.id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .unwrap();
    assert_eq!(retry_count, 1);
    assert!(error.unwrap().contains("payload"));
  }

  #[test]
  fn test_listing_all_entries_does_not_park() {
    let store = store();
    let added = store
      .add_queue_entry(&entry("orders", Mutation::insert(json!({}))), None)
      .unwrap();
    store
      .execute_batch(&format!(
        "UPDATE sync_queue SET created_at = 'yesterday' WHERE id = {}",
        added.id
      ))
      .unwrap();

    assert!(store.all_queue_entries().unwrap().is_empty());
    assert_eq!(store.count_queue_entries(QueueStatus::Pending).unwrap(), 1);
  }

  #[test]
  fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("outbox.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store
        .add_queue_entry(
          &entry("orders", Mutation::insert(json!({"id": "offline-1"}))),
          None,
        )
        .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let pending = store.queue_entries(QueueStatus::Pending).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].mutation.payload(), &json!({"id": "offline-1"}));
    assert_eq!(
      store.schema_version().unwrap() as usize,
      schema::MIGRATIONS.len()
    );
  }
}
