use std::fmt;
use std::str::FromStr;
use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Queued,
  Pending,
  Running,
  Completed,
  Failed,
  Cancelled,
  Removed,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Queued => "queued",
      TaskStatus::Pending => "pending",
      TaskStatus::Running => "running",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
      TaskStatus::Cancelled => "cancelled",
      TaskStatus::Removed => "removed",
    }
  }

  /// `pending` is an alias of `queued`: neither has been claimed by a worker.
  pub fn is_waiting(&self) -> bool {
    matches!(self, TaskStatus::Queued | TaskStatus::Pending)
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Removed
    )
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "queued" => Ok(TaskStatus::Queued),
      "pending" => Ok(TaskStatus::Pending),
      "running" => Ok(TaskStatus::Running),
      "completed" => Ok(TaskStatus::Completed),
      "failed" => Ok(TaskStatus::Failed),
      "cancelled" => Ok(TaskStatus::Cancelled),
      "removed" => Ok(TaskStatus::Removed),
      other => Err(format!("unknown task status '{}'", other)),
    }
  }
}

/// Which transaction rows a task reads. `range_start` + `range_end` selects one
/// report per calendar day; otherwise a single logical day is produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub date: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub day_start_time: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub range_start: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub range_end: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub transaction_status: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gate_id: Option<i64>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub origin_gate_ids: Vec<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub limit: Option<u32>,
}

impl TaskFilter {
  pub fn is_range(&self) -> bool {
    non_empty(&self.range_start).is_some() && non_empty(&self.range_end).is_some()
  }
}

pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
  value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Everything a worker needs to run a task; this is the job payload and the
/// serialized template stored on a schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
  #[serde(default)]
  pub root_folder: String,
  #[serde(default)]
  pub branch_id: i64,
  #[serde(default)]
  pub gate_id: i64,
  #[serde(default)]
  pub station_id: i64,
  #[serde(default)]
  pub filter: TaskFilter,
  #[serde(default, skip_serializing_if = "Map::is_empty")]
  pub settings: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
  pub id: String,
  pub schedule_id: Option<String>,
  pub status: TaskStatus,
  pub error_message: String,
  pub root_folder: String,
  pub branch_id: i64,
  pub gate_id: i64,
  pub station_id: i64,
  pub filter: TaskFilter,
  pub settings: Map<String, Value>,
  pub progress_stage: String,
  pub progress_current: i64,
  pub progress_total: i64,
  pub output_file_path: String,
  pub output_file_size: i64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Task {
  pub fn queued(metadata: &TaskMetadata, schedule_id: Option<String>) -> Self {
    let now = Utc::now();
    Self {
      id: Uuid::new_v4().to_string(),
      schedule_id,
      status: TaskStatus::Queued,
      error_message: String::new(),
      root_folder: metadata.root_folder.clone(),
      branch_id: metadata.branch_id,
      gate_id: metadata.gate_id,
      station_id: metadata.station_id,
      filter: metadata.filter.clone(),
      settings: metadata.settings.clone(),
      progress_stage: String::new(),
      progress_current: 0,
      progress_total: 0,
      output_file_path: String::new(),
      output_file_size: 0,
      created_at: now,
      updated_at: now,
    }
  }

  pub fn metadata(&self) -> TaskMetadata {
    TaskMetadata {
      root_folder: self.root_folder.clone(),
      branch_id: self.branch_id,
      gate_id: self.gate_id,
      station_id: self.station_id,
      filter: self.filter.clone(),
      settings: self.settings.clone(),
    }
  }

  /// Output paths of a completed task; range tasks store them comma-joined.
  pub fn output_paths(&self) -> Vec<&str> {
    self.output_file_path
      .split(',')
      .map(str::trim)
      .filter(|p| !p.is_empty())
      .collect()
  }

  pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<TaskStatus>().map_err(|e| sqlx::Error::ColumnDecode {
      index: "status".into(),
      source: e.into(),
    })?;
    let filter_json: String = row.try_get("filter_json")?;
    let settings_json: String = row.try_get("settings_json")?;
    Ok(Self {
      id: row.try_get("id")?,
      schedule_id: row.try_get("schedule_id")?,
      status,
      error_message: row.try_get("error_message")?,
      root_folder: row.try_get("root_folder")?,
      branch_id: row.try_get("branch_id")?,
      gate_id: row.try_get("gate_id")?,
      station_id: row.try_get("station_id")?,
      filter: decode_json("filter_json", &filter_json)?,
      settings: decode_json("settings_json", &settings_json)?,
      progress_stage: row.try_get("progress_stage")?,
      progress_current: row.try_get("progress_current")?,
      progress_total: row.try_get("progress_total")?,
      output_file_path: row.try_get("output_file_path")?,
      output_file_size: row.try_get("output_file_size")?,
      created_at: row.try_get("created_at")?,
      updated_at: row.try_get("updated_at")?,
    })
  }
}

fn decode_json<T: for<'de> Deserialize<'de> + Default>(column: &str, raw: &str) -> Result<T, sqlx::Error> {
  if raw.trim().is_empty() {
    return Ok(T::default());
  }
  serde_json::from_str(raw).map_err(|e| sqlx::Error::ColumnDecode {
    index: column.to_string(),
    source: Box::new(e),
  })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
  pub id: String,
  pub cron: String,
  /// JSON of `TaskMetadata`.
  pub task_payload: String,
  pub active: bool,
  pub last_run: Option<DateTime<Utc>>,
  pub next_run: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Schedule {
  pub fn new(cron: &str, task_payload: String) -> Self {
    let now = Utc::now();
    Self {
      id: Uuid::new_v4().to_string(),
      cron: cron.to_string(),
      task_payload,
      active: true,
      last_run: None,
      next_run: None,
      created_at: now,
      updated_at: now,
    }
  }

  pub fn metadata(&self) -> Result<TaskMetadata, serde_json::Error> {
    serde_json::from_str(&self.task_payload)
  }

  pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
    Ok(Self {
      id: row.try_get("id")?,
      cron: row.try_get("cron")?,
      task_payload: row.try_get("task_payload")?,
      active: row.try_get("active")?,
      last_run: row.try_get("last_run")?,
      next_run: row.try_get("next_run")?,
      created_at: row.try_get("created_at")?,
      updated_at: row.try_get("updated_at")?,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskTransition {
  pub task_id: String,
  pub from: TaskStatus,
  pub to: TaskStatus,
  pub attempt: i64,
  pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_round_trips_through_its_column_text() {
    for status in [
      TaskStatus::Queued,
      TaskStatus::Pending,
      TaskStatus::Running,
      TaskStatus::Completed,
      TaskStatus::Failed,
      TaskStatus::Cancelled,
      TaskStatus::Removed,
    ] {
      assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
    }
    assert!("done".parse::<TaskStatus>().is_err());
  }

  #[test]
  fn filter_accepts_the_legacy_json_shape() {
    let filter: TaskFilter = serde_json::from_str(
      r#"{"range_start":"2024-02-05","range_end":"2024-02-07","gate_id":5,"origin_gate_ids":[1,2]}"#,
    ).unwrap();
    assert!(filter.is_range());
    assert_eq!(filter.gate_id, Some(5));
    assert_eq!(filter.origin_gate_ids, vec![1, 2]);

    let single = TaskFilter { date: Some("2024-02-05".into()), range_start: Some("  ".into()), ..Default::default() };
    assert!(!single.is_range());
  }

  #[test]
  fn output_paths_split_comma_joined_values() {
    let mut task = Task::queued(&TaskMetadata::default(), None);
    assert!(task.output_paths().is_empty());
    task.output_file_path = "out/a.json,out/b.json".into();
    assert_eq!(task.output_paths(), vec!["out/a.json", "out/b.json"]);
  }
}
