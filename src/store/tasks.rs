use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use crate::error::{PipelineError, Result};
use crate::models::{Task, TaskStatus, TaskTransition};
use crate::progress::ProgressRecord;

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
  pub status: Option<TaskStatus>,
  pub page: u32,
  pub limit: u32,
}

/// Fields written together with a status change. `None` leaves a column as is.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
  pub error_message: Option<String>,
  pub output_file_path: Option<String>,
  pub output_file_size: Option<i64>,
  pub progress_stage: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskRepository {
  pool: SqlitePool,
}

impl TaskRepository {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  pub async fn create(&self, task: &Task) -> Result<()> {
    sqlx::query(
      "INSERT INTO tasks (id, schedule_id, status, error_message, root_folder, branch_id, gate_id, station_id,
         filter_json, settings_json, progress_stage, progress_current, progress_total,
         output_file_path, output_file_size, created_at, updated_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
      .bind(&task.id)
      .bind(&task.schedule_id)
      .bind(task.status.as_str())
      .bind(&task.error_message)
      .bind(&task.root_folder)
      .bind(task.branch_id)
      .bind(task.gate_id)
      .bind(task.station_id)
      .bind(serde_json::to_string(&task.filter)?)
      .bind(serde_json::to_string(&task.settings)?)
      .bind(&task.progress_stage)
      .bind(task.progress_current)
      .bind(task.progress_total)
      .bind(&task.output_file_path)
      .bind(task.output_file_size)
      .bind(task.created_at)
      .bind(task.updated_at)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  pub async fn find(&self, id: &str) -> Result<Option<Task>> {
    let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.as_ref().map(Task::from_row).transpose()?)
  }

  pub async fn get(&self, id: &str) -> Result<Task> {
    self.find(id).await?.ok_or_else(|| PipelineError::TaskNotFound(id.to_string()))
  }

  pub async fn update_progress(&self, id: &str, progress: &ProgressRecord) -> Result<()> {
    sqlx::query(
      "UPDATE tasks SET progress_stage = ?, progress_current = ?, progress_total = ?, updated_at = ? WHERE id = ?",
    )
      .bind(&progress.stage)
      .bind(progress.current as i64)
      .bind(progress.total as i64)
      .bind(Utc::now())
      .bind(id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  /// Moves `id` from `expected` to `to` only if the row is still in
  /// `expected`. Returns false when another writer got there first. The
  /// status change and its transition row commit together or not at all.
  pub async fn compare_and_set_status(
    &self,
    id: &str,
    expected: TaskStatus,
    to: TaskStatus,
    attempt: i64,
    update: StatusUpdate,
  ) -> Result<bool> {
    let now = Utc::now();
    let mut tx = self.pool.begin().await?;
    let result = sqlx::query(
      "UPDATE tasks SET status = ?,
         error_message = COALESCE(?, error_message),
         output_file_path = COALESCE(?, output_file_path),
         output_file_size = COALESCE(?, output_file_size),
         progress_stage = COALESCE(?, progress_stage),
         updated_at = ?
       WHERE id = ? AND status = ?",
    )
      .bind(to.as_str())
      .bind(update.error_message)
      .bind(update.output_file_path)
      .bind(update.output_file_size)
      .bind(update.progress_stage)
      .bind(now)
      .bind(id)
      .bind(expected.as_str())
      .execute(&mut *tx)
      .await?;
    if result.rows_affected() == 0 {
      return Ok(false);
    }

    sqlx::query(
      "INSERT INTO task_transitions (task_id, from_status, to_status, attempt, created_at) VALUES (?, ?, ?, ?, ?)",
    )
      .bind(id)
      .bind(expected.as_str())
      .bind(to.as_str())
      .bind(attempt)
      .bind(now)
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;
    Ok(true)
  }

  pub async fn transitions(&self, id: &str) -> Result<Vec<TaskTransition>> {
    let rows = sqlx::query(
      "SELECT task_id, from_status, to_status, attempt, created_at FROM task_transitions WHERE task_id = ? ORDER BY id",
    )
      .bind(id)
      .fetch_all(&self.pool)
      .await?;
    rows
      .iter()
      .map(|row| -> Result<TaskTransition> {
        let from: String = row.try_get("from_status")?;
        let to: String = row.try_get("to_status")?;
        Ok(TaskTransition {
          task_id: row.try_get("task_id")?,
          from: from.parse().map_err(PipelineError::InvalidInput)?,
          to: to.parse().map_err(PipelineError::InvalidInput)?,
          attempt: row.try_get("attempt")?,
          created_at: row.try_get("created_at")?,
        })
      })
      .collect()
  }

  /// Newest first, with the total count of matching rows.
  pub async fn list(&self, query: &ListQuery) -> Result<(Vec<Task>, i64)> {
    let limit = match query.limit {
      0 => 10,
      n => n.min(100) as i64,
    };
    let page = query.page.max(1) as i64;
    let status = query.status.map(|s| s.as_str());

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE (?1 IS NULL OR status = ?1)")
      .bind(status)
      .fetch_one(&self.pool)
      .await?;
    let rows = sqlx::query(
      "SELECT * FROM tasks WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
    )
      .bind(status)
      .bind(limit)
      .bind((page - 1) * limit)
      .fetch_all(&self.pool)
      .await?;
    let tasks = rows.iter().map(Task::from_row).collect::<Result<Vec<_>, _>>()?;
    Ok((tasks, total))
  }

  pub async fn count_by_status(&self, status: TaskStatus) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = ?")
      .bind(status.as_str())
      .fetch_one(&self.pool)
      .await?;
    Ok(count)
  }

  /// 1-based position among queued tasks, oldest first.
  pub async fn queue_position(&self, id: &str) -> Result<i64> {
    let task = self.get(id).await?;
    let ahead: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = ? AND created_at < ?")
      .bind(TaskStatus::Queued.as_str())
      .bind(task.created_at)
      .fetch_one(&self.pool)
      .await?;
    Ok(ahead + 1)
  }

  pub async fn find_completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
    let rows = sqlx::query("SELECT * FROM tasks WHERE status = ? AND updated_at < ? ORDER BY updated_at")
      .bind(TaskStatus::Completed.as_str())
      .bind(cutoff)
      .fetch_all(&self.pool)
      .await?;
    Ok(rows.iter().map(Task::from_row).collect::<Result<Vec<_>, _>>()?)
  }

  /// Whether a task spawned by `schedule_id` is still waiting or running.
  pub async fn has_active_for_schedule(&self, schedule_id: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
      "SELECT COUNT(*) FROM tasks WHERE schedule_id = ? AND status IN ('queued', 'pending', 'running')",
    )
      .bind(schedule_id)
      .fetch_one(&self.pool)
      .await?;
    Ok(count > 0)
  }
}
