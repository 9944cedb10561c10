//! In-process backend.
//!
//! Behaves like a permissive relational backend: updates and deletes that match nothing
//! succeed, inserts without an `id` get a sequential one, and a repeated insert with the
//! same idempotency key returns the row stored the first time. Tables can be switched
//! into a failing mode to simulate outages.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{RemoteBackend, WriteContext};
use crate::queue::DEFAULT_MATCH_COLUMN;

/// A write observed by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
  Insert { table: String, row: Value },
  Update { table: String, column: String, value: Value, patch: Value },
  Delete { table: String, column: String, value: Value },
  Upsert { table: String, row: Value },
}

impl RemoteCall {
  pub fn table(&self) -> &str {
    match self {
      Self::Insert { table, .. }
      | Self::Update { table, .. }
      | Self::Delete { table, .. }
      | Self::Upsert { table, .. } => table,
    }
  }
}

#[derive(Default)]
struct State {
  tables: HashMap<String, Vec<Value>>,
  next_id: i64,
  failing: HashSet<String>,
  calls: Vec<RemoteCall>,
  stored_by_key: HashMap<String, Value>,
}

impl State {
  fn check(&self, table: &str) -> Result<()> {
    if self.failing.contains(table) {
      return Err(eyre!("Table {} is unavailable", table));
    }
    Ok(())
  }

  fn assign_id(&mut self, row: &Value) -> Result<Value> {
    let mut row = row
      .as_object()
      .cloned()
      .ok_or_else(|| eyre!("Row must be a JSON object"))?;
    if !row.contains_key(DEFAULT_MATCH_COLUMN) {
      self.next_id += 1;
      row.insert(DEFAULT_MATCH_COLUMN.to_string(), Value::from(self.next_id));
    }
    Ok(Value::Object(row))
  }
}

/// In-memory [`RemoteBackend`].
#[derive(Default)]
pub struct MemoryRemote {
  state: Mutex<State>,
}

impl MemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, State>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Make every write to `table` fail until [`MemoryRemote::restore`] is called.
  pub fn fail_table(&self, table: &str) {
    if let Ok(mut state) = self.lock() {
      state.failing.insert(table.to_string());
    }
  }

  pub fn restore(&self, table: &str) {
    if let Ok(mut state) = self.lock() {
      state.failing.remove(table);
    }
  }

  /// Seed `table` with rows, bypassing call recording.
  pub fn seed(&self, table: &str, rows: Vec<Value>) {
    if let Ok(mut state) = self.lock() {
      state.tables.insert(table.to_string(), rows);
    }
  }

  /// Current rows of `table`.
  pub fn rows(&self, table: &str) -> Vec<Value> {
    self
      .lock()
      .map(|state| state.tables.get(table).cloned().unwrap_or_default())
      .unwrap_or_default()
  }

  /// Every write attempted so far, including failed ones, in order.
  pub fn calls(&self) -> Vec<RemoteCall> {
    self
      .lock()
      .map(|state| state.calls.clone())
      .unwrap_or_default()
  }
}

fn merge(row: &mut Value, patch: &Value) {
  if let (Some(row), Some(patch)) = (row.as_object_mut(), patch.as_object()) {
    for (key, value) in patch {
      row.insert(key.clone(), value.clone());
    }
  }
}

fn matches(row: &Value, column: &str, value: &Value) -> bool {
  row.get(column) == Some(value)
}

impl RemoteBackend for MemoryRemote {
  async fn insert(&self, table: &str, row: &Value, ctx: &WriteContext) -> Result<Value> {
    let mut state = self.lock()?;
    state.calls.push(RemoteCall::Insert {
      table: table.to_string(),
      row: row.clone(),
    });
    state.check(table)?;

    if let Some(stored) = ctx
      .idempotency_key
      .as_ref()
      .and_then(|key| state.stored_by_key.get(key))
    {
      return Ok(stored.clone());
    }

    let stored = state.assign_id(row)?;
    state
      .tables
      .entry(table.to_string())
      .or_default()
      .push(stored.clone());
    if let Some(key) = &ctx.idempotency_key {
      state.stored_by_key.insert(key.clone(), stored.clone());
    }
    Ok(stored)
  }

  async fn update(
    &self,
    table: &str,
    column: &str,
    value: &Value,
    patch: &Value,
    _ctx: &WriteContext,
  ) -> Result<()> {
    let mut state = self.lock()?;
    state.calls.push(RemoteCall::Update {
      table: table.to_string(),
      column: column.to_string(),
      value: value.clone(),
      patch: patch.clone(),
    });
    state.check(table)?;

    if let Some(rows) = state.tables.get_mut(table) {
      rows
        .iter_mut()
        .filter(|row| matches(row, column, value))
        .for_each(|row| merge(row, patch));
    }
    Ok(())
  }

  async fn delete(
    &self,
    table: &str,
    column: &str,
    value: &Value,
    _ctx: &WriteContext,
  ) -> Result<()> {
    let mut state = self.lock()?;
    state.calls.push(RemoteCall::Delete {
      table: table.to_string(),
      column: column.to_string(),
      value: value.clone(),
    });
    state.check(table)?;

    if let Some(rows) = state.tables.get_mut(table) {
      rows.retain(|row| !matches(row, column, value));
    }
    Ok(())
  }

  async fn upsert(&self, table: &str, row: &Value, _ctx: &WriteContext) -> Result<Value> {
    let mut state = self.lock()?;
    state.calls.push(RemoteCall::Upsert {
      table: table.to_string(),
      row: row.clone(),
    });
    state.check(table)?;

    let stored = state.assign_id(row)?;
    let id = stored.get(DEFAULT_MATCH_COLUMN).cloned().unwrap_or(Value::Null);
    let rows = state.tables.entry(table.to_string()).or_default();
    match rows
      .iter_mut()
      .find(|existing| matches(existing, DEFAULT_MATCH_COLUMN, &id))
    {
      Some(existing) => *existing = stored.clone(),
      None => rows.push(stored.clone()),
    }
    Ok(stored)
  }

  async fn select(&self, table: &str, filter: Option<(&str, &Value)>) -> Result<Vec<Value>> {
    let state = self.lock()?;
    state.check(table)?;

    let rows = state.tables.get(table).cloned().unwrap_or_default();
    Ok(match filter {
      Some((column, value)) => rows
        .into_iter()
        .filter(|row| matches(row, column, value))
        .collect(),
      None => rows,
    })
  }
}
