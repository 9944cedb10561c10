//! Queue entry types: the mutation variants and their lifecycle status.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Prefix carried by ids generated on the client for rows the server has not confirmed yet.
pub const TEMP_ID_PREFIX: &str = "offline-";

/// Identity column used when a mutation does not name its own match column.
pub const DEFAULT_MATCH_COLUMN: &str = "id";

/// Generate a fresh client-side id for a row created while offline.
pub fn new_temp_id() -> String {
  format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4())
}

/// Whether a value is a client-generated temp id.
pub fn is_temp_id(value: &Value) -> bool {
  value
    .as_str()
    .map(|s| s.starts_with(TEMP_ID_PREFIX))
    .unwrap_or(false)
}

/// Lifecycle status of a queue entry.
///
/// `pending -> syncing -> (removed | pending | failed)`. Removal is not a status: a
/// synced entry is deleted from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
  Pending,
  Syncing,
  Failed,
}

impl QueueStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Syncing => "syncing",
      Self::Failed => "failed",
    }
  }
}

impl fmt::Display for QueueStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for QueueStatus {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "syncing" => Ok(Self::Syncing),
      "failed" => Ok(Self::Failed),
      other => Err(eyre!("Unknown queue status '{}'", other)),
    }
  }
}

/// Operation kind, as persisted in the `operation` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
  Insert,
  Update,
  Delete,
  Upsert,
  Compound,
}

impl OperationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Insert => "insert",
      Self::Update => "update",
      Self::Delete => "delete",
      Self::Upsert => "upsert",
      Self::Compound => "compound",
    }
  }
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for OperationKind {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "insert" => Ok(Self::Insert),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      "upsert" => Ok(Self::Upsert),
      "compound" => Ok(Self::Compound),
      other => Err(eyre!("Unknown operation '{}'", other)),
    }
  }
}

/// Rows to insert into a child table after the primary write of a compound mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRows {
  pub table: String,
  pub rows: Vec<Value>,
  /// Column on each child row that references the primary row. When set it is
  /// overwritten with the identity the server returned for the primary insert.
  #[serde(default)]
  pub parent_column: Option<String>,
}

/// A numeric side effect, e.g. decrementing stock for a sold item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
  pub table: String,
  pub match_column: String,
  pub match_value: Value,
  pub column: String,
  pub delta: f64,
}

/// Side data of a compound mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompoundMeta {
  #[serde(default)]
  pub children: Vec<ChildRows>,
  #[serde(default)]
  pub adjustments: Vec<Adjustment>,
}

/// A queued write, one variant per operation kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  /// Insert a row. A temp id in the identity column is stripped before sending.
  Insert { row: Value },
  /// Update the row whose `match_column` equals the payload's value for it.
  Update {
    row: Value,
    match_column: Option<String>,
  },
  /// Delete the row whose `match_column` equals the payload's value for it.
  Delete {
    row: Value,
    match_column: Option<String>,
  },
  /// Passed through to the backend unchanged.
  Upsert { row: Value },
  /// Primary insert plus best-effort child rows and numeric adjustments.
  Compound { row: Value, meta: CompoundMeta },
}

impl Mutation {
  pub fn insert(row: Value) -> Self {
    Self::Insert { row }
  }

  pub fn update(row: Value) -> Self {
    Self::Update {
      row,
      match_column: None,
    }
  }

  pub fn delete(row: Value) -> Self {
    Self::Delete {
      row,
      match_column: None,
    }
  }

  pub fn upsert(row: Value) -> Self {
    Self::Upsert { row }
  }

  pub fn compound(row: Value, meta: CompoundMeta) -> Self {
    Self::Compound { row, meta }
  }

  /// Override the match column of an update or delete. No-op for other kinds.
  pub fn matching(mut self, column: impl Into<String>) -> Self {
    if let Self::Update { match_column, .. } | Self::Delete { match_column, .. } = &mut self {
      *match_column = Some(column.into());
    }
    self
  }

  pub fn kind(&self) -> OperationKind {
    match self {
      Self::Insert { .. } => OperationKind::Insert,
      Self::Update { .. } => OperationKind::Update,
      Self::Delete { .. } => OperationKind::Delete,
      Self::Upsert { .. } => OperationKind::Upsert,
      Self::Compound { .. } => OperationKind::Compound,
    }
  }

  pub fn payload(&self) -> &Value {
    match self {
      Self::Insert { row }
      | Self::Update { row, .. }
      | Self::Delete { row, .. }
      | Self::Upsert { row }
      | Self::Compound { row, .. } => row,
    }
  }

  pub fn match_column(&self) -> Option<&str> {
    match self {
      Self::Update { match_column, .. } | Self::Delete { match_column, .. } => {
        match_column.as_deref()
      }
      _ => None,
    }
  }

  pub fn meta(&self) -> Option<&CompoundMeta> {
    match self {
      Self::Compound { meta, .. } => Some(meta),
      _ => None,
    }
  }

  /// Rebuild a mutation from its persisted columns.
  pub fn from_parts(
    kind: OperationKind,
    row: Value,
    match_column: Option<String>,
    meta: Option<CompoundMeta>,
  ) -> Self {
    match kind {
      OperationKind::Insert => Self::Insert { row },
      OperationKind::Update => Self::Update { row, match_column },
      OperationKind::Delete => Self::Delete { row, match_column },
      OperationKind::Upsert => Self::Upsert { row },
      OperationKind::Compound => Self::Compound {
        row,
        meta: meta.unwrap_or_default(),
      },
    }
  }
}

/// An entry about to be appended to the queue. The store assigns the sequence id.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
  pub table: String,
  pub mutation: Mutation,
  pub owner_id: String,
  pub created_at: DateTime<Utc>,
  pub idempotency_key: String,
}

impl NewQueueEntry {
  pub fn new(table: impl Into<String>, owner_id: impl Into<String>, mutation: Mutation) -> Self {
    Self {
      table: table.into(),
      mutation,
      owner_id: owner_id.into(),
      created_at: Utc::now(),
      idempotency_key: uuid::Uuid::new_v4().to_string(),
    }
  }
}

/// A persisted queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
  /// Monotonic sequence assigned at enqueue; drains replay in ascending order.
  pub id: i64,
  pub table: String,
  pub mutation: Mutation,
  pub owner_id: String,
  pub created_at: DateTime<Utc>,
  pub status: QueueStatus,
  pub retry_count: u32,
  pub error: Option<String>,
  pub idempotency_key: String,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_status_round_trips_through_str() {
    for status in [QueueStatus::Pending, QueueStatus::Syncing, QueueStatus::Failed] {
      assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
    }
    assert!("done".parse::<QueueStatus>().is_err());
  }

  #[test]
  fn test_matching_only_applies_to_update_and_delete() {
    let update = Mutation::update(json!({"sku": "A1"})).matching("sku");
    assert_eq!(update.match_column(), Some("sku"));

    let insert = Mutation::insert(json!({"sku": "A1"})).matching("sku");
    assert_eq!(insert.match_column(), None);
  }

  #[test]
  fn test_temp_ids() {
    let id = new_temp_id();
    assert!(id.starts_with(TEMP_ID_PREFIX));
    assert!(is_temp_id(&json!(id)));
    assert!(!is_temp_id(&json!("8f14e45f")));
    assert!(!is_temp_id(&json!(42)));
  }

  #[test]
  fn test_new_entries_get_distinct_idempotency_keys() {
    let a = NewQueueEntry::new("orders", "user1", Mutation::insert(json!({})));
    let b = NewQueueEntry::new("orders", "user1", Mutation::insert(json!({})));
    assert_ne!(a.idempotency_key, b.idempotency_key);
  }

  #[test]
  fn test_compound_meta_defaults_missing_sections() {
    let meta: CompoundMeta = serde_json::from_value(json!({
      "children": [{"table": "order_items", "rows": [{"sku": "A1"}]}]
    }))
    .unwrap();
    assert_eq!(meta.children.len(), 1);
    assert!(meta.children[0].parent_column.is_none());
    assert!(meta.adjustments.is_empty());
  }
}
