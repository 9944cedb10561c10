//! Remote backend contract.
//!
//! The sync engine only needs table-oriented CRUD. Rows are JSON objects; filters are a
//! single `column = value` equality.

mod http;
mod memory;

use color_eyre::Result;
use serde_json::Value;
use std::future::Future;

pub use http::HttpRemote;
pub use memory::{MemoryRemote, RemoteCall};

/// Per-write metadata forwarded to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteContext {
  /// Lets a cooperating backend drop duplicate submissions of the same write
  pub idempotency_key: Option<String>,
}

impl WriteContext {
  pub fn new(idempotency_key: impl Into<String>) -> Self {
    Self {
      idempotency_key: Some(idempotency_key.into()),
    }
  }
}

/// Table-oriented CRUD surface of the remote relational backend.
pub trait RemoteBackend: Send + Sync {
  /// Insert a row and return it as stored, including server-assigned identity.
  fn insert(
    &self,
    table: &str,
    row: &Value,
    ctx: &WriteContext,
  ) -> impl Future<Output = Result<Value>> + Send;

  /// Apply `patch` to every row where `column = value`.
  fn update(
    &self,
    table: &str,
    column: &str,
    value: &Value,
    patch: &Value,
    ctx: &WriteContext,
  ) -> impl Future<Output = Result<()>> + Send;

  /// Delete every row where `column = value`.
  fn delete(
    &self,
    table: &str,
    column: &str,
    value: &Value,
    ctx: &WriteContext,
  ) -> impl Future<Output = Result<()>> + Send;

  /// Insert or replace a row by primary key and return it as stored.
  fn upsert(
    &self,
    table: &str,
    row: &Value,
    ctx: &WriteContext,
  ) -> impl Future<Output = Result<Value>> + Send;

  /// Rows of `table`, optionally filtered by `column = value`.
  fn select(
    &self,
    table: &str,
    filter: Option<(&str, &Value)>,
  ) -> impl Future<Output = Result<Vec<Value>>> + Send;
}
