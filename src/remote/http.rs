//! REST backend speaking the PostgREST dialect.

use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{RemoteBackend, WriteContext};
use crate::config::RemoteConfig;
use crate::sync::ConnectivityProbe;

/// Remote backend over HTTP.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
  api_key: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, api_key: Option<String>) -> Result<Self> {
    let base = format!(
      "{}/{}/",
      config.url.trim_end_matches('/'),
      config.rest_path.trim_matches('/')
    );
    let base = Url::parse(&base).map_err(|e| eyre!("Invalid remote url {}: {}", base, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      api_key,
    })
  }

  fn table_url(&self, table: &str, filter: Option<(&str, &Value)>) -> Result<Url> {
    let mut url = self
      .base
      .join(table)
      .map_err(|e| eyre!("Invalid table name {}: {}", table, e))?;
    if let Some((column, value)) = filter {
      url
        .query_pairs_mut()
        .append_pair(column, &format!("eq.{}", filter_value(value)));
    }
    Ok(url)
  }

  fn request(&self, method: Method, url: Url, ctx: Option<&WriteContext>) -> RequestBuilder {
    let mut builder = self.client.request(method, url);
    if let Some(key) = &self.api_key {
      builder = builder
        .header("apikey", key)
        .header("Authorization", format!("Bearer {}", key));
    }
    if let Some(key) = ctx.and_then(|ctx| ctx.idempotency_key.as_deref()) {
      builder = builder.header("Idempotency-Key", key);
    }
    builder
  }

  async fn send(builder: RequestBuilder, action: &str, table: &str) -> Result<Response> {
    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to {} {}: {}", action, table, e))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(eyre!(
        "Failed to {} {}: server returned {}: {}",
        action,
        table,
        status,
        body
      ));
    }
    Ok(response)
  }

  async fn write_returning(
    &self,
    table: &str,
    row: &Value,
    ctx: &WriteContext,
    prefer: &str,
    action: &str,
  ) -> Result<Value> {
    let builder = self
      .request(Method::POST, self.table_url(table, None)?, Some(ctx))
      .header("Prefer", prefer)
      .json(row);

    let rows: Vec<Value> = Self::send(builder, action, table)
      .await?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} response for {}: {}", action, table, e))?;

    rows
      .into_iter()
      .next()
      .ok_or_else(|| eyre!("Server returned no row for {} {}", action, table))
  }
}

/// Render a filter value the way PostgREST expects it after `eq.`.
fn filter_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

impl RemoteBackend for HttpRemote {
  async fn insert(&self, table: &str, row: &Value, ctx: &WriteContext) -> Result<Value> {
    self
      .write_returning(table, row, ctx, "return=representation", "insert into")
      .await
  }

  async fn update(
    &self,
    table: &str,
    column: &str,
    value: &Value,
    patch: &Value,
    ctx: &WriteContext,
  ) -> Result<()> {
    let url = self.table_url(table, Some((column, value)))?;
    let builder = self.request(Method::PATCH, url, Some(ctx)).json(patch);
    Self::send(builder, "update", table).await?;
    Ok(())
  }

  async fn delete(
    &self,
    table: &str,
    column: &str,
    value: &Value,
    ctx: &WriteContext,
  ) -> Result<()> {
    let url = self.table_url(table, Some((column, value)))?;
    Self::send(self.request(Method::DELETE, url, Some(ctx)), "delete from", table).await?;
    Ok(())
  }

  async fn upsert(&self, table: &str, row: &Value, ctx: &WriteContext) -> Result<Value> {
    self
      .write_returning(
        table,
        row,
        ctx,
        "resolution=merge-duplicates,return=representation",
        "upsert into",
      )
      .await
  }

  async fn select(&self, table: &str, filter: Option<(&str, &Value)>) -> Result<Vec<Value>> {
    let mut url = self.table_url(table, filter)?;
    url.query_pairs_mut().append_pair("select", "*");

    Self::send(self.request(Method::GET, url, None), "select from", table)
      .await?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse rows of {}: {}", table, e))
  }
}

impl ConnectivityProbe for HttpRemote {
  /// Any HTTP response, even an error status, means the backend is reachable.
  async fn is_reachable(&self) -> bool {
    self
      .request(Method::HEAD, self.base.clone(), None)
      .timeout(Duration::from_secs(5))
      .send()
      .await
      .is_ok()
  }
}
