use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use crate::error::{PipelineError, Result};
use crate::models::Schedule;

#[derive(Debug, Clone)]
pub struct ScheduleRepository {
  pool: SqlitePool,
}

impl ScheduleRepository {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  pub async fn create(&self, schedule: &Schedule) -> Result<()> {
    sqlx::query(
      "INSERT INTO schedules (id, cron, task_payload, active, last_run, next_run, created_at, updated_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
      .bind(&schedule.id)
      .bind(&schedule.cron)
      .bind(&schedule.task_payload)
      .bind(schedule.active)
      .bind(schedule.last_run)
      .bind(schedule.next_run)
      .bind(schedule.created_at)
      .bind(schedule.updated_at)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  pub async fn get(&self, id: &str) -> Result<Schedule> {
    let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
      .bind(id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| PipelineError::ScheduleNotFound(id.to_string()))?;
    Ok(Schedule::from_row(&row)?)
  }

  pub async fn list(&self) -> Result<Vec<Schedule>> {
    let rows = sqlx::query("SELECT * FROM schedules ORDER BY created_at")
      .fetch_all(&self.pool)
      .await?;
    Ok(rows.iter().map(Schedule::from_row).collect::<Result<Vec<_>, _>>()?)
  }

  pub async fn list_active(&self) -> Result<Vec<Schedule>> {
    let rows = sqlx::query("SELECT * FROM schedules WHERE active = 1 ORDER BY created_at")
      .fetch_all(&self.pool)
      .await?;
    Ok(rows.iter().map(Schedule::from_row).collect::<Result<Vec<_>, _>>()?)
  }

  pub async fn stamp_run(&self, id: &str, last_run: DateTime<Utc>, next_run: Option<DateTime<Utc>>) -> Result<()> {
    sqlx::query("UPDATE schedules SET last_run = ?, next_run = ?, updated_at = ? WHERE id = ?")
      .bind(last_run)
      .bind(next_run)
      .bind(Utc::now())
      .bind(id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  pub async fn set_next_run(&self, id: &str, next_run: Option<DateTime<Utc>>) -> Result<()> {
    sqlx::query("UPDATE schedules SET next_run = ?, updated_at = ? WHERE id = ?")
      .bind(next_run)
      .bind(Utc::now())
      .bind(id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  pub async fn delete(&self, id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
      .bind(id)
      .execute(&self.pool)
      .await?;
    if result.rows_affected() == 0 {
      return Err(PipelineError::ScheduleNotFound(id.to_string()));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::database::setup_in_memory;

  #[tokio::test]
  async fn schedule_lifecycle() {
    let schedules = ScheduleRepository::new(setup_in_memory().await.unwrap());
    let schedule = Schedule::new("0 2 * * *", r#"{"branch_id":1}"#.into());
    schedules.create(&schedule).await.unwrap();

    assert_eq!(schedules.list_active().await.unwrap().len(), 1);
    let now = Utc::now();
    schedules.stamp_run(&schedule.id, now, None).await.unwrap();
    let loaded = schedules.get(&schedule.id).await.unwrap();
    assert!(loaded.last_run.is_some());
    assert_eq!(loaded.metadata().unwrap().branch_id, 1);

    schedules.delete(&schedule.id).await.unwrap();
    assert!(matches!(schedules.get(&schedule.id).await, Err(PipelineError::ScheduleNotFound(_))));
    assert!(schedules.delete(&schedule.id).await.is_err());
  }
}
