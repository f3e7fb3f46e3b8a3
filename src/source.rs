//! Reading transaction rows out of one logical day's data file.

use std::path::Path;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, QueryBuilder, Sqlite};
use tracing::debug;
use crate::error::{PipelineError, Result};
use crate::models::{non_empty, TaskFilter};
use crate::window::Window;

const SQL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct Transaction {
  pub id: i64,
  pub branch: String,
  pub gate: i64,
  pub station: String,
  pub shift: String,
  pub occurred_at: String,
  pub class: String,
  pub serial: String,
  pub status: String,
  pub method: String,
  pub origin_gate: i64,
  pub card_number: String,
  #[serde(skip)]
  pub first_image: Option<Vec<u8>>,
  #[serde(skip)]
  pub second_image: Option<Vec<u8>>,
}

/// Row selection for one window. `limit == 0` means unlimited.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionQuery {
  pub window: Window,
  pub gate_id: Option<i64>,
  pub origin_gate_ids: Vec<i64>,
  pub status: Option<String>,
  pub limit: u32,
}

impl TransactionQuery {
  pub fn new(window: Window, filter: &TaskFilter) -> Self {
    Self {
      window,
      gate_id: filter.gate_id.filter(|g| *g > 0),
      origin_gate_ids: filter.origin_gate_ids.clone(),
      status: non_empty(&filter.transaction_status).map(str::to_string),
      limit: filter.limit.unwrap_or(0),
    }
  }

  fn build(&self) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new(
      "SELECT id, branch, gate, station, shift, occurred_at, class, serial, status, method, origin_gate, \
       card_number, first_image, second_image FROM transactions WHERE occurred_at BETWEEN ",
    );
    qb.push_bind(self.window.start.format(SQL_TIME_FORMAT).to_string());
    qb.push(" AND ");
    qb.push_bind(self.window.last_second().format(SQL_TIME_FORMAT).to_string());
    if let Some(gate) = self.gate_id {
      qb.push(" AND gate = ").push_bind(gate);
    }
    if !self.origin_gate_ids.is_empty() {
      qb.push(" AND origin_gate IN (");
      let mut ids = qb.separated(", ");
      for id in &self.origin_gate_ids {
        ids.push_bind(*id);
      }
      ids.push_unseparated(")");
    }
    if let Some(status) = &self.status {
      qb.push(" AND status = ").push_bind(status.clone());
    }
    qb.push(" ORDER BY id");
    if self.limit > 0 {
      qb.push(" LIMIT ").push_bind(self.limit as i64);
    }
    qb
  }
}

#[async_trait]
pub trait TransactionSource: Send + Sync {
  async fn load(&self, path: &Path, query: &TransactionQuery) -> Result<Vec<Transaction>>;
}

/// Reads the `transactions` table of a per-day SQLite file, opened read-only.
#[derive(Debug, Clone, Default)]
pub struct SqliteTransactionSource;

#[async_trait]
impl TransactionSource for SqliteTransactionSource {
  async fn load(&self, path: &Path, query: &TransactionQuery) -> Result<Vec<Transaction>> {
    let source_err = |e: sqlx::Error| PipelineError::Source(format!("{}: {}", path.display(), e));
    if !tokio::fs::try_exists(path).await? {
      return Err(PipelineError::Source(format!("{} does not exist", path.display())));
    }

    let mut conn = SqliteConnectOptions::new()
      .filename(path)
      .read_only(true)
      .connect()
      .await
      .map_err(source_err)?;
    let rows = query
      .build()
      .build_query_as::<Transaction>()
      .fetch_all(&mut conn)
      .await
      .map_err(source_err)?;
    conn.close().await.map_err(source_err)?;

    debug!(path = %path.display(), rows = rows.len(), "Loaded transactions");
    Ok(rows)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::NaiveDate;
  use sqlx::SqliteConnection;
  use crate::window::{resolve_window, DayStart};

  async fn write_fixture(path: &Path, rows: &[(i64, &str, i64, i64, &str)]) {
    let mut conn = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .connect()
      .await
      .unwrap();
    sqlx::query(
      "CREATE TABLE transactions (id INTEGER PRIMARY KEY, branch TEXT NOT NULL DEFAULT '', gate INTEGER NOT NULL,
         station TEXT NOT NULL DEFAULT '', shift TEXT NOT NULL DEFAULT '', occurred_at TEXT NOT NULL,
         class TEXT NOT NULL DEFAULT '', serial TEXT NOT NULL DEFAULT '', status TEXT NOT NULL,
         method TEXT NOT NULL DEFAULT '', origin_gate INTEGER NOT NULL, card_number TEXT NOT NULL DEFAULT '',
         first_image BLOB, second_image BLOB)",
    )
      .execute(&mut conn)
      .await
      .unwrap();
    for &(id, at, gate, origin, status) in rows {
      sqlx::query("INSERT INTO transactions (id, occurred_at, gate, origin_gate, status, first_image) VALUES (?, ?, ?, ?, ?, ?)")
        .bind(id)
        .bind(at)
        .bind(gate)
        .bind(origin)
        .bind(status)
        .bind(vec![0u8; 16])
        .execute(&mut conn)
        .await
        .unwrap();
    }
    SqliteConnection::close(conn).await.unwrap();
  }

  fn window_at(day_start: &str) -> Window {
    resolve_window(NaiveDate::from_ymd_opt(2024, 2, 5).unwrap(), DayStart::parse(day_start).unwrap())
  }

  #[tokio::test]
  async fn loads_rows_inside_the_window_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("05022024.db");
    write_fixture(&path, &[
      (1, "2024-02-05 01:59:59", 1, 1, "OK"),
      (2, "2024-02-05 02:00:00", 1, 1, "OK"),
      (3, "2024-02-06 01:59:59", 1, 2, "OK"),
      (4, "2024-02-06 02:00:00", 1, 1, "OK"),
    ]).await;

    let query = TransactionQuery::new(window_at("02:00"), &TaskFilter::default());
    let rows = SqliteTransactionSource.load(&path, &query).await.unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![2, 3]);
    assert_eq!(rows[0].first_image.as_ref().map(Vec::len), Some(16));
  }

  #[tokio::test]
  async fn optional_filters_narrow_the_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("day.db");
    write_fixture(&path, &[
      (1, "2024-02-05 08:00:00", 1, 1, "OK"),
      (2, "2024-02-05 09:00:00", 2, 3, "OK"),
      (3, "2024-02-05 10:00:00", 2, 4, "VOID"),
      (4, "2024-02-05 11:00:00", 2, 3, "OK"),
    ]).await;

    let filter = TaskFilter {
      gate_id: Some(2),
      origin_gate_ids: vec![3, 4],
      transaction_status: Some("OK".into()),
      limit: Some(1),
      ..Default::default()
    };
    let rows = SqliteTransactionSource.load(&path, &TransactionQuery::new(window_at("00:00"), &filter)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, 2);
  }

  #[tokio::test]
  async fn missing_file_is_a_source_error() {
    let dir = tempfile::tempdir().unwrap();
    let query = TransactionQuery::new(window_at("00:00"), &TaskFilter::default());
    let err = SqliteTransactionSource.load(&dir.path().join("nope.db"), &query).await.unwrap_err();
    assert!(matches!(err, PipelineError::Source(_)));
    assert!(err.is_retryable());
  }
}
