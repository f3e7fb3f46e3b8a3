use std::time::Duration;
use thiserror::Error;
use crate::models::TaskStatus;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("invalid input: {0}")]
  InvalidInput(String),

  #[error("task {0} not found")]
  TaskNotFound(String),

  #[error("schedule {0} not found")]
  ScheduleNotFound(String),

  #[error("task {task_id} cannot move from {from} to {to}")]
  InvalidTransition {
    task_id: String,
    from: TaskStatus,
    to: TaskStatus,
  },

  #[error("malformed payload: {0}")]
  Payload(#[from] serde_json::Error),

  #[error("transaction source failed: {0}")]
  Source(String),

  #[error("render failed: {0}")]
  Render(String),

  #[error("no report generated for any of {days} day(s): {reasons}")]
  AllDaysFailed { days: usize, reasons: String },

  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("job timed out after {0:?}")]
  Timeout(Duration),

  #[error("job handler panicked: {0}")]
  Panicked(String),
}

impl PipelineError {
  pub fn invalid(message: impl Into<String>) -> Self {
    PipelineError::InvalidInput(message.into())
  }

  /// Whether the job queue should schedule another attempt for this error.
  pub fn is_retryable(&self) -> bool {
    match self {
      PipelineError::Source(_)
      | PipelineError::Render(_)
      | PipelineError::AllDaysFailed { .. }
      | PipelineError::Database(_)
      | PipelineError::Io(_)
      | PipelineError::Timeout(_)
      | PipelineError::Panicked(_) => true,
      PipelineError::InvalidInput(_)
      | PipelineError::TaskNotFound(_)
      | PipelineError::ScheduleNotFound(_)
      | PipelineError::InvalidTransition { .. }
      | PipelineError::Payload(_)
      | PipelineError::Migrate(_) => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn input_errors_are_permanent() {
    assert!(!PipelineError::invalid("bad date").is_retryable());
    assert!(!PipelineError::TaskNotFound("t1".into()).is_retryable());
    let payload = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    assert!(!PipelineError::from(payload).is_retryable());
  }

  #[test]
  fn io_style_errors_are_retried() {
    assert!(PipelineError::Source("file locked".into()).is_retryable());
    assert!(PipelineError::Render("disk full".into()).is_retryable());
    assert!(PipelineError::Timeout(Duration::from_secs(600)).is_retryable());
    assert!(PipelineError::AllDaysFailed { days: 3, reasons: "x".into() }.is_retryable());
  }
}
