//! Durable at-least-once job queue on the `jobs` table.
//!
//! A job is claimed with a single `UPDATE ... RETURNING` so only one
//! dispatcher can take it. Claims carry a fresh token and expire after
//! `release_after` (never sooner than the job timeout plus `CLAIM_MARGIN`);
//! a crashed owner's job becomes visible again once its claim expires.

pub mod backoff;
pub mod pool;
pub mod wake;

use std::time::Duration;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;
use crate::error::Result;
use crate::models::TaskMetadata;

pub use backoff::RetryPolicy;
pub use pool::{JobHandler, WorkerPool};

pub const REPORT_QUEUE: &str = "generate_report";

/// Time past the job timeout a claim stays held, so the owner can still
/// record its outcome before the job is redelivered.
pub const CLAIM_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct QueueConfig {
  pub concurrency: usize,
  pub job_timeout: Duration,
  pub release_after: Duration,
  pub wake_interval: Duration,
  pub retry: RetryPolicy,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      concurrency: 1,
      job_timeout: Duration::from_secs(600),
      release_after: Duration::from_secs(1800),
      wake_interval: Duration::from_secs(1),
      retry: RetryPolicy::default(),
    }
  }
}

impl QueueConfig {
  /// How long a claim is held. A live owner is bounded by `job_timeout`, so
  /// the claim must outlast it or the job runs twice at once.
  pub fn claim_duration(&self) -> Duration {
    self.release_after.max(self.job_timeout + CLAIM_MARGIN)
  }
}

/// A claimed job. `attempts` counts this delivery.
#[derive(Debug, Clone)]
pub struct JobEnvelope {
  pub id: String,
  pub task_id: String,
  pub payload: String,
  pub attempts: i64,
  pub max_attempts: i64,
  pub claim_token: String,
}

impl JobEnvelope {
  pub fn metadata(&self) -> Result<TaskMetadata> {
    Ok(serde_json::from_str(&self.payload)?)
  }
}

#[derive(Debug, Clone)]
pub struct JobQueue {
  pool: SqlitePool,
  name: String,
  config: QueueConfig,
  waker: broadcast::Sender<()>,
}

fn now_ms() -> i64 {
  Utc::now().timestamp_millis()
}

impl JobQueue {
  pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
    let (waker, _) = broadcast::channel(16);
    Self { pool, name: REPORT_QUEUE.to_string(), config, waker }
  }

  pub fn config(&self) -> &QueueConfig {
    &self.config
  }

  /// Persists one job for `task_id` and nudges idle dispatchers.
  pub async fn enqueue(&self, task_id: &str, metadata: &TaskMetadata) -> Result<Vec<String>> {
    let id = Uuid::new_v4().to_string();
    let now = now_ms();
    sqlx::query(
      "INSERT INTO jobs (id, queue, task_id, payload, attempts, max_attempts, state, visible_at, created_at, updated_at)
       VALUES (?, ?, ?, ?, 0, ?, 'ready', ?, ?, ?)",
    )
      .bind(&id)
      .bind(&self.name)
      .bind(task_id)
      .bind(serde_json::to_string(metadata)?)
      .bind(self.config.retry.max_attempts)
      .bind(now)
      .bind(now)
      .bind(now)
      .execute(&self.pool)
      .await?;
    info!(job_id = %id, task_id, "Job enqueued");
    self.wake();
    Ok(vec![id])
  }

  /// Claims the oldest visible job, if any.
  pub async fn dequeue(&self, worker: &str) -> Result<Option<JobEnvelope>> {
    let now = now_ms();
    let token = Uuid::new_v4().to_string();
    let claimed_until = now + self.config.claim_duration().as_millis() as i64;
    let row = sqlx::query(
      "UPDATE jobs SET state = 'claimed', attempts = attempts + 1, claim_token = ?1, claimed_by = ?2,
         claimed_until = ?3, updated_at = ?4
       WHERE id = (
         SELECT id FROM jobs
         WHERE queue = ?5
           AND ((state = 'ready' AND visible_at <= ?4) OR (state = 'claimed' AND claimed_until <= ?4))
         ORDER BY visible_at, created_at
         LIMIT 1
       )
       RETURNING id, task_id, payload, attempts, max_attempts, claim_token",
    )
      .bind(&token)
      .bind(worker)
      .bind(claimed_until)
      .bind(now)
      .bind(&self.name)
      .fetch_optional(&self.pool)
      .await?;

    let Some(row) = row else {
      return Ok(None);
    };
    let job = JobEnvelope {
      id: row.try_get("id")?,
      task_id: row.try_get("task_id")?,
      payload: row.try_get("payload")?,
      attempts: row.try_get("attempts")?,
      max_attempts: row.try_get("max_attempts")?,
      claim_token: row.try_get("claim_token")?,
    };
    debug!(job_id = %job.id, task_id = %job.task_id, attempt = job.attempts, worker, "Job claimed");
    Ok(Some(job))
  }

  /// Finished: the envelope is deleted. False when the claim was lost.
  pub async fn ack(&self, job: &JobEnvelope) -> Result<bool> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = ? AND claim_token = ?")
      .bind(&job.id)
      .bind(&job.claim_token)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() == 1)
  }

  /// Makes the job visible again after `delay`.
  pub async fn retry(&self, job: &JobEnvelope, delay: Duration, error: &str) -> Result<bool> {
    let now = now_ms();
    let result = sqlx::query(
      "UPDATE jobs SET state = 'ready', visible_at = ?, claim_token = NULL, claimed_by = NULL,
         claimed_until = NULL, last_error = ?, updated_at = ?
       WHERE id = ? AND claim_token = ?",
    )
      .bind(now + delay.as_millis() as i64)
      .bind(error)
      .bind(now)
      .bind(&job.id)
      .bind(&job.claim_token)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() == 1)
  }

  /// Parks the job for good; the row is kept for inspection.
  pub async fn abandon(&self, job: &JobEnvelope, error: &str) -> Result<bool> {
    let result = sqlx::query(
      "UPDATE jobs SET state = 'abandoned', claim_token = NULL, claimed_by = NULL, claimed_until = NULL,
         last_error = ?, updated_at = ?
       WHERE id = ? AND claim_token = ?",
    )
      .bind(error)
      .bind(now_ms())
      .bind(&job.id)
      .bind(&job.claim_token)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() == 1)
  }

  /// Deletes abandoned envelopes last touched before `older_than`.
  pub async fn purge_abandoned(&self, older_than: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM jobs WHERE queue = ? AND state = 'abandoned' AND updated_at < ?")
      .bind(&self.name)
      .bind(older_than.timestamp_millis())
      .execute(&self.pool)
      .await?;
    if result.rows_affected() > 0 {
      info!(purged = result.rows_affected(), "Purged abandoned jobs");
    }
    Ok(result.rows_affected())
  }

  /// Jobs that are waiting or being worked on.
  pub async fn pending_count(&self) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND state IN ('ready', 'claimed')")
      .bind(&self.name)
      .fetch_one(&self.pool)
      .await?;
    Ok(count)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<()> {
    self.waker.subscribe()
  }

  pub fn wake(&self) {
    // no subscribers just means nobody is idle
    let _ = self.waker.send(());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::database::setup_in_memory;

  async fn queue_with(config: QueueConfig) -> JobQueue {
    JobQueue::new(setup_in_memory().await.unwrap(), config)
  }

  #[tokio::test]
  async fn a_job_is_delivered_to_one_worker() {
    let queue = queue_with(QueueConfig::default()).await;
    let ids = queue.enqueue("task-1", &TaskMetadata::default()).await.unwrap();
    assert_eq!(ids.len(), 1);

    let (a, b) = tokio::join!(queue.dequeue("w1"), queue.dequeue("w2"));
    let delivered: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].task_id, "task-1");
    assert_eq!(delivered[0].attempts, 1);
    assert_eq!(delivered[0].id, ids[0]);
  }

  #[tokio::test]
  async fn retry_counts_attempts_and_respects_delay() {
    let queue = queue_with(QueueConfig::default()).await;
    queue.enqueue("task-1", &TaskMetadata::default()).await.unwrap();

    let job = queue.dequeue("w1").await.unwrap().unwrap();
    assert!(queue.retry(&job, Duration::from_secs(60), "locked").await.unwrap());
    assert!(queue.dequeue("w1").await.unwrap().is_none());

    let job = {
      let now = now_ms();
      sqlx::query("UPDATE jobs SET visible_at = ?").bind(now).execute(&queue.pool).await.unwrap();
      queue.dequeue("w1").await.unwrap().unwrap()
    };
    assert_eq!(job.attempts, 2);
    assert!(queue.ack(&job).await.unwrap());
    assert_eq!(queue.pending_count().await.unwrap(), 0);
  }

  async fn expire_claims(queue: &JobQueue) {
    sqlx::query("UPDATE jobs SET claimed_until = ?").bind(now_ms()).execute(&queue.pool).await.unwrap();
  }

  #[tokio::test]
  async fn expired_claim_is_redelivered_and_old_token_is_dead() {
    let queue = queue_with(QueueConfig::default()).await;
    queue.enqueue("task-1", &TaskMetadata::default()).await.unwrap();

    let first = queue.dequeue("w1").await.unwrap().unwrap();
    expire_claims(&queue).await;
    let second = queue.dequeue("w2").await.unwrap().unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.attempts, 2);
    assert_ne!(first.claim_token, second.claim_token);

    assert!(!queue.ack(&first).await.unwrap());
    assert!(!queue.abandon(&first, "late").await.unwrap());
    assert!(queue.ack(&second).await.unwrap());
  }

  #[tokio::test]
  async fn claim_outlives_the_job_timeout() {
    let config = QueueConfig {
      job_timeout: Duration::from_secs(5),
      release_after: Duration::from_millis(50),
      ..Default::default()
    };
    assert_eq!(config.claim_duration(), Duration::from_secs(5) + CLAIM_MARGIN);
    let queue = queue_with(config).await;
    queue.enqueue("task-1", &TaskMetadata::default()).await.unwrap();

    let first = queue.dequeue("w1").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(queue.dequeue("w2").await.unwrap().is_none());
    assert!(queue.ack(&first).await.unwrap());
  }

  #[tokio::test]
  async fn abandoned_jobs_are_not_delivered() {
    let queue = queue_with(QueueConfig::default()).await;
    queue.enqueue("task-1", &TaskMetadata::default()).await.unwrap();
    let job = queue.dequeue("w1").await.unwrap().unwrap();
    assert!(queue.abandon(&job, "bad payload").await.unwrap());
    assert!(queue.dequeue("w1").await.unwrap().is_none());
    assert_eq!(queue.pending_count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn purge_drops_only_old_abandoned_jobs() {
    let queue = queue_with(QueueConfig::default()).await;
    for task in ["old", "fresh", "ready"] {
      queue.enqueue(task, &TaskMetadata::default()).await.unwrap();
    }
    for _ in 0..2 {
      let job = queue.dequeue("w1").await.unwrap().unwrap();
      assert!(queue.abandon(&job, "bad payload").await.unwrap());
    }
    let week_ago = Utc::now() - chrono::TimeDelta::days(7);
    sqlx::query("UPDATE jobs SET updated_at = ? WHERE task_id = 'old'")
      .bind(week_ago.timestamp_millis())
      .execute(&queue.pool)
      .await
      .unwrap();

    assert_eq!(queue.purge_abandoned(Utc::now() - chrono::TimeDelta::days(1)).await.unwrap(), 1);
    let left: Vec<String> = sqlx::query_scalar("SELECT task_id FROM jobs ORDER BY task_id")
      .fetch_all(&queue.pool)
      .await
      .unwrap();
    assert_eq!(left, vec!["fresh", "ready"]);
  }

  #[tokio::test]
  async fn enqueue_wakes_subscribers() {
    let queue = queue_with(QueueConfig::default()).await;
    let mut rx = queue.subscribe();
    queue.enqueue("task-1", &TaskMetadata::default()).await.unwrap();
    tokio_test::assert_ok!(rx.try_recv());
  }

  #[tokio::test]
  async fn payload_carries_task_metadata() {
    let queue = queue_with(QueueConfig::default()).await;
    let metadata = TaskMetadata { branch_id: 7, root_folder: "/data".into(), ..Default::default() };
    queue.enqueue("task-1", &metadata).await.unwrap();
    let job = queue.dequeue("w1").await.unwrap().unwrap();
    assert_eq!(job.metadata().unwrap(), metadata);
    assert_eq!(job.max_attempts, 3);
  }
}
