//! Task status state machine.
//!
//! ```text
//! queued|pending -> running -> completed -> removed
//!        |             |
//!        |             +-> failed -> running   (retry attempt > 1)
//!        +-> cancelled
//!        +-> failed                          (enqueue or payload failure)
//! ```
//!
//! Every move is a compare-and-set on the status column, so a cancel and a
//! claim racing on the same queued task cannot both win.

use tracing::{debug, info};
use crate::error::{PipelineError, Result};
use crate::models::{Task, TaskStatus};
use crate::store::{StatusUpdate, TaskRepository};

pub const STAGE_COMPLETED: &str = "completed";

/// Outcome of a worker trying to take ownership of a task.
#[derive(Debug)]
pub enum Claim {
  Started(Task),
  Skipped(TaskStatus),
}

pub fn can_transition(from: TaskStatus, to: TaskStatus, attempt: i64) -> bool {
  use TaskStatus::*;
  match (from, to) {
    (from, Running | Cancelled | Failed) if from.is_waiting() => true,
    (Failed | Running, Running) => attempt > 1,
    (Running, Completed | Failed) => true,
    (Completed, Removed) => true,
    _ => false,
  }
}

#[derive(Debug, Clone)]
pub struct TaskLifecycle {
  tasks: TaskRepository,
}

impl TaskLifecycle {
  pub fn new(tasks: TaskRepository) -> Self {
    Self { tasks }
  }

  pub fn tasks(&self) -> &TaskRepository {
    &self.tasks
  }

  /// Moves the task to running for job attempt `attempt`, or reports the
  /// status that made it ineligible (cancelled, completed, removed...).
  pub async fn claim(&self, task_id: &str, attempt: i64) -> Result<Claim> {
    loop {
      let task = self.tasks.get(task_id).await?;
      if !can_transition(task.status, TaskStatus::Running, attempt) {
        debug!(task_id, status = %task.status, attempt, "Task not claimable");
        return Ok(Claim::Skipped(task.status));
      }
      let update = StatusUpdate { error_message: Some(String::new()), ..Default::default() };
      if self.tasks.compare_and_set_status(task_id, task.status, TaskStatus::Running, attempt, update).await? {
        let task = self.tasks.get(task_id).await?;
        info!(task_id, attempt, "Task claimed");
        return Ok(Claim::Started(task));
      }
      // lost a race; look again
    }
  }

  pub async fn complete(&self, task_id: &str, output_path: &str, output_size: i64, attempt: i64) -> Result<()> {
    let update = StatusUpdate {
      error_message: Some(String::new()),
      output_file_path: Some(output_path.to_string()),
      output_file_size: Some(output_size),
      progress_stage: Some(STAGE_COMPLETED.to_string()),
    };
    self.transition(task_id, TaskStatus::Completed, attempt, update).await
  }

  /// Records a failure. A task that already reached a terminal status is left
  /// alone and `false` is returned.
  pub async fn fail(&self, task_id: &str, message: &str, attempt: i64) -> Result<bool> {
    loop {
      let task = self.tasks.get(task_id).await?;
      if !can_transition(task.status, TaskStatus::Failed, attempt) {
        return Ok(false);
      }
      let update = StatusUpdate { error_message: Some(message.to_string()), ..Default::default() };
      if self.tasks.compare_and_set_status(task_id, task.status, TaskStatus::Failed, attempt, update).await? {
        return Ok(true);
      }
    }
  }

  /// Only a task no worker has claimed yet can be cancelled.
  pub async fn cancel(&self, task_id: &str) -> Result<()> {
    let update = StatusUpdate { error_message: Some("cancelled by request".into()), ..Default::default() };
    self.transition(task_id, TaskStatus::Cancelled, 0, update).await
  }

  /// Retention: drops the output fields of a completed task.
  pub async fn remove(&self, task_id: &str) -> Result<()> {
    let update = StatusUpdate {
      output_file_path: Some(String::new()),
      output_file_size: Some(0),
      ..Default::default()
    };
    self.transition(task_id, TaskStatus::Removed, 0, update).await
  }

  async fn transition(&self, task_id: &str, to: TaskStatus, attempt: i64, update: StatusUpdate) -> Result<()> {
    let task = self.tasks.get(task_id).await?;
    let rejected = |from| PipelineError::InvalidTransition { task_id: task_id.to_string(), from, to };
    if !can_transition(task.status, to, attempt) {
      return Err(rejected(task.status));
    }
    if self.tasks.compare_and_set_status(task_id, task.status, to, attempt, update).await? {
      return Ok(());
    }
    let current = self.tasks.get(task_id).await?.status;
    Err(rejected(current))
  }
}
