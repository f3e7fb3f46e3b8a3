use std::io::ErrorKind;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};
use crate::error::Result;
use crate::lifecycle::TaskLifecycle;
use crate::settings::{SettingsStore, SETTING_MAX_OUTPUT_AGE_DAYS};

const DEFAULT_MAX_OUTPUT_AGE_DAYS: u64 = 7;

/// Deletes the output files of old completed tasks and marks them removed.
#[derive(Debug, Clone)]
pub struct Retention {
  lifecycle: TaskLifecycle,
  settings: SettingsStore,
}

impl Retention {
  pub fn new(lifecycle: TaskLifecycle, settings: SettingsStore) -> Self {
    Self { lifecycle, settings }
  }

  pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
    let days = self.settings.get_u64(SETTING_MAX_OUTPUT_AGE_DAYS, DEFAULT_MAX_OUTPUT_AGE_DAYS).await;
    let cutoff = now - TimeDelta::days(days as i64);
    let expired = self.lifecycle.tasks().find_completed_before(cutoff).await?;

    let mut removed = 0;
    for task in expired {
      for path in task.output_paths() {
        match tokio::fs::remove_file(path).await {
          Ok(()) => {}
          Err(e) if e.kind() == ErrorKind::NotFound => {}
          Err(e) => warn!(task_id = %task.id, path, "Failed to delete output file: {:?}", e),
        }
      }
      match self.lifecycle.remove(&task.id).await {
        Ok(()) => removed += 1,
        Err(e) => warn!(task_id = %task.id, "Failed to mark task removed: {}", e),
      }
    }
    if removed > 0 {
      info!(removed, max_age_days = days, "Retention sweep finished");
    }
    Ok(removed)
  }
}
