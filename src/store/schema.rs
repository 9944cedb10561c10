//! Versioned schema for the local store.
//!
//! Each migration is applied once and recorded in `PRAGMA user_version`. Migrations only
//! ever add tables and indexes; existing data is never rewritten.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;

/// Ordered migrations. Index `i` upgrades the schema from version `i` to `i + 1`.
pub const MIGRATIONS: &[&str] = &[
  // v1: whole-collection snapshots
  r#"
CREATE TABLE IF NOT EXISTS cache (
    cache_key TEXT PRIMARY KEY,
    collection TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    records TEXT NOT NULL,
    cached_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_owner ON cache(owner_id);
"#,
  // v2: durable mutation queue
  r#"
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    match_column TEXT,
    meta TEXT,
    owner_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    idempotency_key TEXT NOT NULL UNIQUE
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status, id);
"#,
];

/// Current schema version of a connection.
pub fn version(conn: &Connection) -> Result<u32> {
  conn
    .pragma_query_value(None, "user_version", |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))
}

/// Apply every migration newer than the connection's recorded version.
pub fn migrate(conn: &mut Connection) -> Result<()> {
  let current = version(conn)? as usize;

  for (index, sql) in MIGRATIONS.iter().enumerate().skip(current) {
    let target = index + 1;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin migration transaction: {}", e))?;

    tx.execute_batch(sql)
      .map_err(|e| eyre!("Failed to apply migration v{}: {}", target, e))?;
    tx.pragma_update(None, "user_version", target as u32)
      .map_err(|e| eyre!("Failed to record schema version v{}: {}", target, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit migration v{}: {}", target, e))?;

    tracing::debug!(version = target, "applied local store migration");
  }

  Ok(())
}
