//! Drain and replay of the mutation queue.

use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::queue::{
  is_temp_id, Adjustment, CompoundMeta, Mutation, QueueEntry, QueueStatus, DEFAULT_MATCH_COLUMN,
};
use crate::remote::{RemoteBackend, WriteContext};
use crate::store::LocalStore;

/// Attempts an entry gets before it is parked as `failed`.
pub const MAX_RETRIES: u32 = 3;

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Entries applied and removed from the queue
  pub synced: usize,
  /// Entries that failed this pass, whether requeued or parked
  pub failed: usize,
}

impl SyncReport {
  pub fn is_empty(&self) -> bool {
    self.synced == 0 && self.failed == 0
  }
}

/// Why an entry could not be applied.
enum EntryError {
  /// The entry itself is unusable; retrying cannot help
  Malformed(String),
  /// The backend rejected the write or could not be reached
  Remote(color_eyre::Report),
}

impl EntryError {
  fn message(&self) -> String {
    match self {
      Self::Malformed(msg) => msg.clone(),
      Self::Remote(e) => e.to_string(),
    }
  }
}

/// Clears the in-flight flag when a drain ends, however it ends.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Replays queued mutations against the remote backend.
pub struct SyncEngine<S: LocalStore, R: RemoteBackend> {
  store: Arc<S>,
  remote: Arc<R>,
  max_retries: u32,
  in_flight: AtomicBool,
  /// Temp id -> server identity, learned from confirmed inserts
  confirmed_ids: Mutex<HashMap<String, Value>>,
}

impl<S: LocalStore, R: RemoteBackend> SyncEngine<S, R> {
  pub fn new(store: Arc<S>, remote: Arc<R>) -> Self {
    Self {
      store,
      remote,
      max_retries: MAX_RETRIES,
      in_flight: AtomicBool::new(false),
      confirmed_ids: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries.max(1);
    self
  }

  pub fn remote(&self) -> &Arc<R> {
    &self.remote
  }

  /// Whether a drain is running right now.
  pub fn is_syncing(&self) -> bool {
    self.in_flight.load(Ordering::Acquire)
  }

  /// Reset entries left in `syncing` by an interrupted process back to `pending`.
  ///
  /// Must only run while no drain is in flight, normally once at startup.
  pub fn recover(&self) -> Result<usize> {
    let reset = self
      .store
      .transition_all(QueueStatus::Syncing, QueueStatus::Pending)?;
    if reset > 0 {
      tracing::warn!(reset, "requeued entries interrupted mid-sync");
    }
    Ok(reset)
  }

  /// Drain every pending entry, oldest first.
  ///
  /// A call made while another drain is running returns an empty report without
  /// touching the queue.
  pub async fn process_sync_queue(&self) -> SyncReport {
    self.try_process_sync_queue().await.unwrap_or_default()
  }

  /// Like [`SyncEngine::process_sync_queue`], but returns `None` when the call was
  /// coalesced into a drain already in flight.
  pub async fn try_process_sync_queue(&self) -> Option<SyncReport> {
    let Some(_guard) = self.begin() else {
      tracing::debug!("drain already in progress, skipping");
      return None;
    };

    let entries = match self.store.queue_entries(QueueStatus::Pending) {
      Ok(entries) => entries,
      Err(e) => {
        tracing::warn!(error = %e, "failed to load pending entries");
        return Some(SyncReport::default());
      }
    };
    if entries.is_empty() {
      return Some(SyncReport::default());
    }

    tracing::info!(pending = entries.len(), "draining mutation queue");
    let mut report = SyncReport::default();
    for entry in entries {
      if self.sync_entry(entry).await {
        report.synced += 1;
      } else {
        report.failed += 1;
      }
    }

    self.forget_confirmed_ids();
    tracing::info!(
      synced = report.synced,
      failed = report.failed,
      "drain complete"
    );
    Some(report)
  }

  pub(crate) fn begin(&self) -> Option<InFlight<'_>> {
    self
      .in_flight
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| InFlight(&self.in_flight))
  }

  async fn sync_entry(&self, mut entry: QueueEntry) -> bool {
    entry.status = QueueStatus::Syncing;
    if let Err(e) = self.store.update_queue_entry(&entry) {
      tracing::warn!(entry_id = entry.id, error = %e, "failed to mark entry syncing");
    }

    match self.apply(&entry).await {
      Ok(()) => {
        if let Err(e) = self.store.delete_queue_entry(entry.id) {
          tracing::error!(entry_id = entry.id, error = %e, "failed to remove synced entry");
        }
        tracing::debug!(
          entry_id = entry.id,
          table = %entry.table,
          operation = %entry.mutation.kind(),
          "entry synced"
        );
        true
      }
      Err(err) => {
        self.record_failure(entry, err);
        false
      }
    }
  }

  fn record_failure(&self, mut entry: QueueEntry, err: EntryError) {
    let exhausted = match err {
      EntryError::Malformed(_) => true,
      EntryError::Remote(_) => entry.retry_count + 1 >= self.max_retries,
    };

    entry.retry_count += 1;
    entry.status = if exhausted {
      QueueStatus::Failed
    } else {
      QueueStatus::Pending
    };
    entry.error = Some(err.message());

    if exhausted {
      tracing::error!(
        entry_id = entry.id,
        table = %entry.table,
        operation = %entry.mutation.kind(),
        retry_count = entry.retry_count,
        error = %err.message(),
        "entry failed permanently"
      );
    } else {
      tracing::warn!(
        entry_id = entry.id,
        table = %entry.table,
        operation = %entry.mutation.kind(),
        retry_count = entry.retry_count,
        error = %err.message(),
        "entry failed, will retry"
      );
    }

    if let Err(e) = self.store.update_queue_entry(&entry) {
      tracing::error!(entry_id = entry.id, error = %e, "failed to record entry failure");
    }
  }

  /// Apply a mutation straight to the backend, bypassing the queue.
  ///
  /// Used for writes made while online. Follows the same rules as a replayed entry,
  /// including temp id stripping and best-effort compound side effects.
  pub async fn apply_direct(&self, table: &str, mutation: &Mutation) -> Result<()> {
    let key = uuid::Uuid::new_v4().to_string();
    self
      .write(None, table, mutation, &key)
      .await
      .map_err(|e| match e {
        EntryError::Malformed(msg) => eyre!(msg),
        EntryError::Remote(e) => e,
      })
  }

  async fn apply(&self, entry: &QueueEntry) -> std::result::Result<(), EntryError> {
    self
      .write(
        Some(entry.id),
        &entry.table,
        &entry.mutation,
        &entry.idempotency_key,
      )
      .await
  }

  async fn write(
    &self,
    entry_id: Option<i64>,
    table: &str,
    mutation: &Mutation,
    idempotency_key: &str,
  ) -> std::result::Result<(), EntryError> {
    let ctx = WriteContext::new(idempotency_key);

    match mutation {
      Mutation::Insert { row } => {
        let row = self.remap(row);
        let stored = self
          .remote
          .insert(table, &strip_temp_id(&row), &ctx)
          .await
          .map_err(EntryError::Remote)?;
        self.confirm(&row, &stored);
        Ok(())
      }
      Mutation::Update { row, match_column } => {
        let row = self.remap(row);
        let (column, value) = match_target(&row, match_column.as_deref())?;
        self
          .remote
          .update(table, column, value, &row, &ctx)
          .await
          .map_err(EntryError::Remote)
      }
      Mutation::Delete { row, match_column } => {
        let row = self.remap(row);
        let (column, value) = match_target(&row, match_column.as_deref())?;
        self
          .remote
          .delete(table, column, value, &ctx)
          .await
          .map_err(EntryError::Remote)
      }
      Mutation::Upsert { row } => self
        .remote
        .upsert(table, row, &ctx)
        .await
        .map(drop)
        .map_err(EntryError::Remote),
      Mutation::Compound { row, meta } => {
        let row = self.remap(row);
        let stored = self
          .remote
          .insert(table, &strip_temp_id(&row), &ctx)
          .await
          .map_err(EntryError::Remote)?;
        self.confirm(&row, &stored);
        self
          .apply_side_effects(entry_id, idempotency_key, &stored, meta)
          .await;
        Ok(())
      }
    }
  }

  /// Child rows and adjustments of a compound entry whose primary write landed.
  ///
  /// Side effects are at-least-once: a failure is logged and neither fails the entry nor
  /// undoes the primary write.
  async fn apply_side_effects(
    &self,
    entry_id: Option<i64>,
    idempotency_key: &str,
    primary: &Value,
    meta: &CompoundMeta,
  ) {
    let parent_id = primary.get(DEFAULT_MATCH_COLUMN).cloned();
    let mut step = 0usize;

    for child in &meta.children {
      for row in &child.rows {
        step += 1;
        let mut row = strip_temp_id(&self.remap(row));
        if let (Some(column), Some(id), Some(fields)) =
          (&child.parent_column, &parent_id, row.as_object_mut())
        {
          fields.insert(column.clone(), id.clone());
        }

        let ctx = WriteContext::new(dedup_key(idempotency_key, step));
        if let Err(e) = self.remote.insert(&child.table, &row, &ctx).await {
          tracing::warn!(
            entry_id,
            table = %child.table,
            error = %e,
            "child row insert failed"
          );
        }
      }
    }

    for adjustment in &meta.adjustments {
      step += 1;
      let ctx = WriteContext::new(dedup_key(idempotency_key, step));
      if let Err(e) = self.apply_adjustment(adjustment, &ctx).await {
        tracing::warn!(
          entry_id,
          table = %adjustment.table,
          column = %adjustment.column,
          error = %e,
          "side-effect adjustment failed"
        );
      }
    }
  }

  async fn apply_adjustment(&self, adjustment: &Adjustment, ctx: &WriteContext) -> Result<()> {
    let match_value = self.remap(&adjustment.match_value);
    let rows = self
      .remote
      .select(
        &adjustment.table,
        Some((adjustment.match_column.as_str(), &match_value)),
      )
      .await?;
    let current = rows.first().ok_or_else(|| {
      eyre!(
        "No {} row where {} = {}",
        adjustment.table,
        adjustment.match_column,
        match_value
      )
    })?;

    let adjusted = apply_delta(current.get(&adjustment.column), adjustment.delta)?;
    let mut patch = Map::new();
    patch.insert(adjustment.column.clone(), adjusted);

    self
      .remote
      .update(
        &adjustment.table,
        &adjustment.match_column,
        &match_value,
        &Value::Object(patch),
        ctx,
      )
      .await
  }

  /// Replace temp ids already confirmed by the server with their canonical identity.
  fn remap(&self, value: &Value) -> Value {
    match self.confirmed_ids.lock() {
      Ok(ids) if !ids.is_empty() => replace_ids(value, &ids),
      _ => value.clone(),
    }
  }

  /// Drop learned temp ids once nothing pending can still reference them.
  fn forget_confirmed_ids(&self) {
    match self.store.count_queue_entries(QueueStatus::Pending) {
      Ok(0) => {
        if let Ok(mut ids) = self.confirmed_ids.lock() {
          ids.clear();
        }
      }
      Ok(_) => {}
      Err(e) => tracing::warn!(error = %e, "failed to count pending entries"),
    }
  }

  fn confirm(&self, sent: &Value, stored: &Value) {
    let (Some(temp), Some(id)) = (sent.get(DEFAULT_MATCH_COLUMN), stored.get(DEFAULT_MATCH_COLUMN))
    else {
      return;
    };
    if !is_temp_id(temp) {
      return;
    }
    if let (Some(temp), Ok(mut ids)) = (temp.as_str(), self.confirmed_ids.lock()) {
      ids.insert(temp.to_string(), id.clone());
    }
  }
}

/// Drop a client temp id from the identity column so the server assigns one.
fn strip_temp_id(row: &Value) -> Value {
  let mut row = row.clone();
  if let Some(fields) = row.as_object_mut() {
    if fields.get(DEFAULT_MATCH_COLUMN).map(is_temp_id).unwrap_or(false) {
      fields.remove(DEFAULT_MATCH_COLUMN);
    }
  }
  row
}

/// Column and value an update or delete filters on.
fn match_target<'a>(
  row: &'a Value,
  match_column: Option<&'a str>,
) -> std::result::Result<(&'a str, &'a Value), EntryError> {
  let column = match_column.unwrap_or(DEFAULT_MATCH_COLUMN);
  match row.get(column) {
    Some(value) if !value.is_null() => Ok((column, value)),
    _ => Err(EntryError::Malformed(format!(
      "Payload has no value for match column '{}'",
      column
    ))),
  }
}

fn replace_ids(value: &Value, ids: &HashMap<String, Value>) -> Value {
  match value {
    Value::String(s) => ids.get(s).cloned().unwrap_or_else(|| value.clone()),
    Value::Array(items) => Value::Array(items.iter().map(|v| replace_ids(v, ids)).collect()),
    Value::Object(fields) => Value::Object(
      fields
        .iter()
        .map(|(k, v)| (k.clone(), replace_ids(v, ids)))
        .collect(),
    ),
    other => other.clone(),
  }
}

/// Add `delta` to a numeric column, keeping integers integral when possible.
fn apply_delta(current: Option<&Value>, delta: f64) -> Result<Value> {
  let current = current.cloned().unwrap_or(Value::from(0));
  let integral = delta.fract() == 0.0 && delta.abs() < i64::MAX as f64;
  if let Some(sum) = current
    .as_i64()
    .filter(|_| integral)
    .and_then(|n| n.checked_add(delta as i64))
  {
    return Ok(Value::from(sum));
  }
  let n = current
    .as_f64()
    .ok_or_else(|| eyre!("Column value {} is not numeric", current))?;
  serde_json::Number::from_f64(n + delta)
    .map(Value::Number)
    .ok_or_else(|| eyre!("Adjusted value is not a finite number"))
}

/// Deterministic key for the `step`th side effect of an entry.
fn dedup_key(idempotency_key: &str, step: usize) -> String {
  let mut hasher = Sha256::new();
  hasher.update(idempotency_key.as_bytes());
  hasher.update(b":");
  hasher.update(step.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::EventBus;
  use crate::queue::{ChildRows, MutationQueue, Target};
  use crate::remote::{MemoryRemote, RemoteCall};
  use crate::store::SqliteStore;
  use serde_json::json;

  struct Harness {
    store: Arc<SqliteStore>,
    remote: Arc<MemoryRemote>,
    queue: MutationQueue<SqliteStore>,
    engine: SyncEngine<SqliteStore, MemoryRemote>,
  }

  fn harness() -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let remote = Arc::new(MemoryRemote::new());
    Harness {
      queue: MutationQueue::new(Arc::clone(&store), EventBus::default()),
      engine: SyncEngine::new(Arc::clone(&store), Arc::clone(&remote)),
      store,
      remote,
    }
  }

  fn orders() -> Target {
    Target::table("orders", "user1")
  }

  fn sale_meta() -> CompoundMeta {
    CompoundMeta {
      children: vec![ChildRows {
        table: "order_items".to_string(),
        rows: vec![json!({"sku": "A1", "qty": 2}), json!({"sku": "B2", "qty": 1})],
        parent_column: Some("order_id".to_string()),
      }],
      adjustments: vec![Adjustment {
        table: "inventory".to_string(),
        match_column: "sku".to_string(),
        match_value: json!("A1"),
        column: "stock".to_string(),
        delta: -2.0,
      }],
    }
  }

  #[tokio::test]
  async fn test_empty_queue_is_noop() {
    let h = harness();
    assert_eq!(h.engine.process_sync_queue().await, SyncReport::default());
    assert!(h.remote.calls().is_empty());
  }

  #[tokio::test]
  async fn test_offline_session_replays_in_order() {
    let h = harness();
    h.queue
      .enqueue(&orders(), Mutation::insert(json!({"id": "offline-1", "status": "new"})))
      .unwrap();
    h.queue
      .enqueue(&orders(), Mutation::insert(json!({"id": "offline-2", "status": "new"})))
      .unwrap();
    h.queue
      .enqueue(
        &orders(),
        Mutation::update(json!({"id": "offline-1", "status": "ready"})).matching("id"),
      )
      .unwrap();
    assert_eq!(h.queue.pending().unwrap().len(), 3);

    let report = h.engine.process_sync_queue().await;

    assert_eq!(report, SyncReport { synced: 3, failed: 0 });
    assert!(h.store.all_queue_entries().unwrap().is_empty());
    let kinds: Vec<&str> = h
      .remote
      .calls()
      .iter()
      .map(|call| match call {
        RemoteCall::Insert { .. } => "insert",
        RemoteCall::Update { .. } => "update",
        RemoteCall::Delete { .. } => "delete",
        RemoteCall::Upsert { .. } => "upsert",
      })
      .collect();
    assert_eq!(kinds, ["insert", "insert", "update"]);
  }

  #[tokio::test]
  async fn test_insert_strips_temp_id_and_later_update_targets_server_id() {
    let h = harness();
    h.queue
      .enqueue(&orders(), Mutation::insert(json!({"id": "offline-1", "status": "new"})))
      .unwrap();
    h.queue
      .enqueue(&orders(), Mutation::update(json!({"id": "offline-1", "status": "ready"})))
      .unwrap();

    h.engine.process_sync_queue().await;

    let rows = h.remote.rows("orders");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "ready");
    assert!(!is_temp_id(&rows[0]["id"]));
  }

  #[tokio::test]
  async fn test_canonical_ids_are_kept_on_insert() {
    let h = harness();
    h.queue
      .enqueue(&orders(), Mutation::insert(json!({"id": "ord-77"})))
      .unwrap();
    h.engine.process_sync_queue().await;
    assert_eq!(h.remote.rows("orders"), vec![json!({"id": "ord-77"})]);
  }

  #[tokio::test]
  async fn test_missing_match_value_fails_only_that_entry() {
    let h = harness();
    h.queue
      .enqueue(&orders(), Mutation::insert(json!({"id": "offline-1"})))
      .unwrap();
    let bad = h
      .queue
      .enqueue(&orders(), Mutation::update(json!({"status": "ready"})))
      .unwrap();
    h.queue
      .enqueue(&Target::table("sessions", "user1"), Mutation::upsert(json!({"id": "s1"})))
      .unwrap();

    let report = h.engine.process_sync_queue().await;

    assert_eq!(report, SyncReport { synced: 2, failed: 1 });
    let remaining = h.store.all_queue_entries().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, bad.id);
    assert_eq!(remaining[0].status, QueueStatus::Failed);
    assert_eq!(remaining[0].retry_count, 1);
    assert!(remaining[0].error.as_deref().unwrap().contains("id"));
  }

  #[tokio::test]
  async fn test_custom_match_column_is_used() {
    let h = harness();
    h.remote.seed("inventory", vec![json!({"id": 1, "sku": "A1", "stock": 5})]);
    h.queue
      .enqueue(
        &Target::table("inventory", "user1"),
        Mutation::delete(json!({"sku": "A1"})).matching("sku"),
      )
      .unwrap();

    let report = h.engine.process_sync_queue().await;

    assert_eq!(report.synced, 1);
    assert!(h.remote.rows("inventory").is_empty());
  }

  #[tokio::test]
  async fn test_retry_budget_parks_entry() {
    let h = harness();
    h.remote.fail_table("orders");
    let entry = h
      .queue
      .enqueue(&orders(), Mutation::insert(json!({"id": "offline-1"})))
      .unwrap();

    for attempt in 1..MAX_RETRIES {
      let report = h.engine.process_sync_queue().await;
      assert_eq!(report, SyncReport { synced: 0, failed: 1 });
      let stored = h.store.get_queue_entry(entry.id).unwrap().unwrap();
      assert_eq!(stored.status, QueueStatus::Pending);
      assert_eq!(stored.retry_count, attempt);
    }

    let report = h.engine.process_sync_queue().await;
    assert_eq!(report.failed, 1);
    let stored = h.store.get_queue_entry(entry.id).unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Failed);
    assert_eq!(stored.retry_count, MAX_RETRIES);

    // Parked entries are not retried automatically.
    h.remote.restore("orders");
    assert_eq!(h.engine.process_sync_queue().await, SyncReport::default());
    assert_eq!(h.remote.calls().len(), MAX_RETRIES as usize);
  }

  #[tokio::test]
  async fn test_failure_does_not_halt_later_entries() {
    let h = harness();
    h.remote.fail_table("orders");
    h.queue
      .enqueue(&orders(), Mutation::insert(json!({})))
      .unwrap();
    h.queue
      .enqueue(&Target::table("sessions", "user1"), Mutation::insert(json!({})))
      .unwrap();

    let report = h.engine.process_sync_queue().await;

    assert_eq!(report, SyncReport { synced: 1, failed: 1 });
    assert_eq!(h.remote.rows("sessions").len(), 1);
  }

  #[tokio::test]
  async fn test_compound_applies_children_and_adjustments() {
    let h = harness();
    h.remote.seed("inventory", vec![json!({"id": 1, "sku": "A1", "stock": 10})]);
    h.queue
      .enqueue(
        &orders(),
        Mutation::compound(json!({"id": "offline-9", "total": 30}), sale_meta()),
      )
      .unwrap();

    let report = h.engine.process_sync_queue().await;

    assert_eq!(report, SyncReport { synced: 1, failed: 0 });
    let order = &h.remote.rows("orders")[0];
    let items = h.remote.rows("order_items");
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|item| item["order_id"] == order["id"]));
    assert_eq!(h.remote.rows("inventory")[0]["stock"], 8);
  }

  #[tokio::test]
  async fn test_compound_primary_failure_skips_side_effects() {
    let h = harness();
    h.remote.seed("inventory", vec![json!({"id": 1, "sku": "A1", "stock": 10})]);
    h.remote.fail_table("orders");
    h.queue
      .enqueue(&orders(), Mutation::compound(json!({"total": 30}), sale_meta()))
      .unwrap();

    let report = h.engine.process_sync_queue().await;

    assert_eq!(report.failed, 1);
    assert!(h.remote.calls().iter().all(|call| call.table() == "orders"));
    assert_eq!(h.remote.rows("inventory")[0]["stock"], 10);
  }

  #[tokio::test]
  async fn test_compound_side_effect_failure_keeps_primary() {
    let h = harness();
    h.remote.fail_table("order_items");
    h.queue
      .enqueue(&orders(), Mutation::compound(json!({"total": 30}), sale_meta()))
      .unwrap();

    let report = h.engine.process_sync_queue().await;

    // The adjustment target row does not exist either; both are logged, not fatal.
    assert_eq!(report, SyncReport { synced: 1, failed: 0 });
    assert_eq!(h.remote.rows("orders").len(), 1);
    assert!(h.store.all_queue_entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_idempotency_key_forwarded_dedups_retried_insert() {
    let h = harness();
    let entry = h
      .queue
      .enqueue(&orders(), Mutation::insert(json!({"total": 5})))
      .unwrap();
    // A previous attempt reached the server but the response was lost.
    h.remote
      .insert(
        "orders",
        &json!({"total": 5}),
        &WriteContext::new(&entry.idempotency_key),
      )
      .await
      .unwrap();

    h.engine.process_sync_queue().await;

    assert_eq!(h.remote.rows("orders").len(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_drains_are_coalesced() {
    let h = harness();
    h.queue
      .enqueue(&orders(), Mutation::insert(json!({})))
      .unwrap();

    let guard = h.engine.begin().unwrap();
    assert!(h.engine.is_syncing());
    assert_eq!(h.engine.process_sync_queue().await, SyncReport::default());
    assert_eq!(h.queue.pending().unwrap().len(), 1);

    drop(guard);
    assert!(!h.engine.is_syncing());
    assert_eq!(h.engine.process_sync_queue().await.synced, 1);
  }

  #[tokio::test]
  async fn test_recover_resets_stuck_entries() {
    let h = harness();
    let mut entry = h
      .queue
      .enqueue(&orders(), Mutation::insert(json!({})))
      .unwrap();
    entry.status = QueueStatus::Syncing;
    h.store.update_queue_entry(&entry).unwrap();

    assert_eq!(h.engine.recover().unwrap(), 1);
    assert_eq!(h.engine.process_sync_queue().await.synced, 1);
  }

  #[tokio::test]
  async fn test_apply_direct_bypasses_queue() {
    let h = harness();
    h.remote.seed("inventory", vec![json!({"sku": "A1", "stock": 10})]);

    h.engine
      .apply_direct("orders", &Mutation::compound(json!({"id": "offline-9"}), sale_meta()))
      .await
      .unwrap();

    assert!(h.store.all_queue_entries().unwrap().is_empty());
    assert_eq!(h.remote.rows("order_items").len(), 2);
    assert_eq!(h.remote.rows("inventory")[0]["stock"], 8);
  }

  #[tokio::test]
  async fn test_apply_direct_reports_malformed_mutation() {
    let h = harness();
    let result = h
      .engine
      .apply_direct("orders", &Mutation::delete(json!({"status": "x"})))
      .await;
    assert!(result.is_err());
    assert!(h.remote.calls().is_empty());
  }

  #[test]
  fn test_apply_delta() {
    assert_eq!(apply_delta(Some(&json!(10)), -2.0).unwrap(), json!(8));
    assert_eq!(apply_delta(Some(&json!(1.5)), 0.25).unwrap(), json!(1.75));
    assert_eq!(apply_delta(None, 3.0).unwrap(), json!(3));
    assert!(apply_delta(Some(&json!("ten")), 1.0).is_err());
  }

  #[test]
  fn test_apply_delta_past_integer_range_falls_back_to_float() {
    let adjusted = apply_delta(Some(&json!(i64::MAX)), 10.0).unwrap();
    assert!(adjusted.is_f64());
    assert!(adjusted.as_f64().unwrap() >= i64::MAX as f64);

    let huge = apply_delta(Some(&json!(1)), 1e300).unwrap();
    assert_eq!(huge.as_f64(), Some(1e300));
  }

  #[tokio::test]
  async fn test_corrupt_entry_fails_alone() {
    let h = harness();
    let corrupt = h
      .queue
      .enqueue(&orders(), Mutation::insert(json!({"id": "offline-1"})))
      .unwrap();
    h.queue
      .enqueue(&orders(), Mutation::insert(json!({"id": "offline-2"})))
      .unwrap();
    h.store
      .execute_batch(&format!(
        "UPDATE sync_queue SET payload = '{{not json' WHERE id = {}",
        corrupt.id
      ))
      .unwrap();

    let report = h.engine.process_sync_queue().await;

    assert_eq!(report.synced, 1);
    assert_eq!(h.remote.rows("orders").len(), 1);
    assert_eq!(h.store.count_queue_entries(QueueStatus::Pending).unwrap(), 0);
    assert_eq!(h.store.count_queue_entries(QueueStatus::Failed).unwrap(), 1);
    assert_eq!(h.engine.process_sync_queue().await, SyncReport::default());
  }

  #[tokio::test]
  async fn test_learned_ids_are_kept_while_entries_remain() {
    let h = harness();
    h.remote.fail_table("sessions");
    h.queue
      .enqueue(&orders(), Mutation::insert(json!({"id": "offline-1"})))
      .unwrap();
    h.queue
      .enqueue(
        &Target::table("sessions", "user1"),
        Mutation::insert(json!({"order_id": "offline-1"})),
      )
      .unwrap();

    h.engine.process_sync_queue().await;
    assert_eq!(h.engine.confirmed_ids.lock().unwrap().len(), 1);

    h.remote.restore("sessions");
    h.engine.process_sync_queue().await;

    assert_eq!(h.remote.rows("sessions")[0]["order_id"], json!(1));
    assert!(h.engine.confirmed_ids.lock().unwrap().is_empty());
  }

  #[test]
  fn test_dedup_key_is_deterministic_per_step() {
    assert_eq!(dedup_key("k", 1), dedup_key("k", 1));
    assert_ne!(dedup_key("k", 1), dedup_key("k", 2));
    assert_eq!(dedup_key("k", 1).len(), 64);
  }
}
