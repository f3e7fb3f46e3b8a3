//! String-keyed runtime settings backed by the `settings` table, plus the
//! resolution of the values a report needs from stored settings and a task's
//! own override map.

use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::warn;
use crate::error::Result;

pub const SETTING_BRANCH_NAME: &str = "branch_name";
pub const SETTING_MANAGEMENT_COMPANY: &str = "management_company";
pub const SETTING_ANALYZER_OPERATOR_NAME: &str = "analyzer_operator_name";
pub const SETTING_PAGE_SIZE: &str = "page_size";
pub const SETTING_OUTPUT_FILENAME_FORMAT: &str = "output_filename_format";
pub const SETTING_DATASOURCE_PATH_FORMAT: &str = "datasource_path_format";
pub const SETTING_DAY_START_TIME: &str = "time_overlap";
pub const SETTING_MAX_OUTPUT_AGE_DAYS: &str = "max_output_age_days";
pub const SETTING_QUEUE_CONCURRENCY: &str = "queue_concurrency";
pub const SETTING_WAL_CHECKPOINT_INTERVAL: &str = "wal_checkpoint_interval";
pub const SETTING_WAL_MAX_SIZE_MB: &str = "wal_max_size_mb";

pub const DEFAULT_OUTPUT_FILENAME_FORMAT: &str = "{BranchID}_{GateID}_{DATE}";
pub const DEFAULT_DATASOURCE_PATH_FORMAT: &str = "{MM}{YYYY}/{StationID}/{DD}{MM}{YYYY}.mdb";
pub const DEFAULT_DAY_START_TIME: &str = "00:00";

pub fn default_settings() -> Vec<(&'static str, &'static str)> {
  vec![
    (SETTING_BRANCH_NAME, "BRANCH"),
    (SETTING_MANAGEMENT_COMPANY, "PT Company"),
    (SETTING_ANALYZER_OPERATOR_NAME, "Analyzer Operator"),
    (SETTING_PAGE_SIZE, "A4"),
    (SETTING_OUTPUT_FILENAME_FORMAT, DEFAULT_OUTPUT_FILENAME_FORMAT),
    (SETTING_DATASOURCE_PATH_FORMAT, DEFAULT_DATASOURCE_PATH_FORMAT),
    (SETTING_DAY_START_TIME, DEFAULT_DAY_START_TIME),
    (SETTING_QUEUE_CONCURRENCY, "1"),
    (SETTING_WAL_CHECKPOINT_INTERVAL, "30"),
    (SETTING_WAL_MAX_SIZE_MB, "20"),
    (SETTING_MAX_OUTPUT_AGE_DAYS, "7"),
  ]
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
  pool: SqlitePool,
}

impl SettingsStore {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Inserts missing defaults; existing values are left alone.
  pub async fn seed_defaults(&self) -> Result<()> {
    for (key, value) in default_settings() {
      sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
    }
    Ok(())
  }

  pub async fn get(&self, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
      .bind(key)
      .fetch_optional(&self.pool)
      .await?;
    Ok(value)
  }

  pub async fn set(&self, key: &str, value: &str) -> Result<()> {
    sqlx::query(
      "INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
      .bind(key)
      .bind(value)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  /// Lookup with a default; read failures and blank values yield the default.
  pub async fn get_or(&self, key: &str, default: &str) -> String {
    match self.get(key).await {
      Ok(Some(value)) if !value.trim().is_empty() => value,
      Ok(_) => default.to_string(),
      Err(e) => {
        warn!("Failed to read setting {}: {:?}", key, e);
        default.to_string()
      }
    }
  }

  pub async fn get_u64(&self, key: &str, default: u64) -> u64 {
    self.get_or(key, "").await.trim().parse().unwrap_or(default)
  }

  pub async fn get_f64(&self, key: &str, default: f64) -> f64 {
    self.get_or(key, "").await.trim().parse().unwrap_or(default)
  }

  /// Number of queue workers; anything but a positive integer means 1.
  pub async fn queue_concurrency(&self) -> usize {
    match self.get_or(SETTING_QUEUE_CONCURRENCY, "1").await.trim().parse::<usize>() {
      Ok(n) if n > 0 => n,
      _ => 1,
    }
  }
}

/// Settings a single report is rendered with.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSettings {
  pub branch_name: String,
  pub management_company: String,
  pub analyzer_operator_name: String,
  pub page_size: String,
  pub output_filename_format: String,
  pub datasource_path_format: String,
  pub day_start_time: String,
}

impl ReportSettings {
  pub async fn resolve(store: &SettingsStore, branch_id: i64, overrides: &Map<String, Value>) -> Self {
    let pick = |key: &str, stored: String| override_str(overrides, key).unwrap_or(stored);
    Self {
      branch_name: pick(SETTING_BRANCH_NAME, store.get_or(SETTING_BRANCH_NAME, &branch_id.to_string()).await),
      management_company: pick(SETTING_MANAGEMENT_COMPANY, store.get_or(SETTING_MANAGEMENT_COMPANY, "PT Company").await),
      analyzer_operator_name: pick(
        SETTING_ANALYZER_OPERATOR_NAME,
        store.get_or(SETTING_ANALYZER_OPERATOR_NAME, "Analyzer Operator").await,
      ),
      page_size: pick(SETTING_PAGE_SIZE, store.get_or(SETTING_PAGE_SIZE, "A4").await),
      output_filename_format: pick(
        SETTING_OUTPUT_FILENAME_FORMAT,
        store.get_or(SETTING_OUTPUT_FILENAME_FORMAT, DEFAULT_OUTPUT_FILENAME_FORMAT).await,
      ),
      datasource_path_format: pick(
        SETTING_DATASOURCE_PATH_FORMAT,
        store.get_or(SETTING_DATASOURCE_PATH_FORMAT, DEFAULT_DATASOURCE_PATH_FORMAT).await,
      ),
      day_start_time: override_str(overrides, "day_start_time")
        .unwrap_or(store.get_or(SETTING_DAY_START_TIME, DEFAULT_DAY_START_TIME).await),
    }
  }
}

impl Default for ReportSettings {
  fn default() -> Self {
    Self {
      branch_name: "BRANCH".into(),
      management_company: "PT Company".into(),
      analyzer_operator_name: "Analyzer Operator".into(),
      page_size: "A4".into(),
      output_filename_format: DEFAULT_OUTPUT_FILENAME_FORMAT.into(),
      datasource_path_format: DEFAULT_DATASOURCE_PATH_FORMAT.into(),
      day_start_time: DEFAULT_DAY_START_TIME.into(),
    }
  }
}

fn override_str(overrides: &Map<String, Value>, key: &str) -> Option<String> {
  overrides
    .get(key)
    .and_then(Value::as_str)
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .map(str::to_string)
}
