use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Local;
use tracing::{error, info, warn};
use crate::error::Result;
use crate::generator::{GeneratedReport, ReportGenerator};
use crate::lifecycle::{Claim, TaskLifecycle};
use crate::models::{Task, TaskMetadata};
use crate::progress::{ProgressReporter, ProgressSink, ProgressTracker};
use crate::queue::{JobHandler, JobEnvelope};
use crate::settings::{ReportSettings, SettingsStore};
use crate::window::resolve_windows;

pub const STAGE_INITIALIZING: &str = "initializing";

/// Runs `generate_report` jobs: claim the task, resolve its days, generate,
/// and write the outcome back to the task row.
pub struct ReportTaskHandler {
  lifecycle: TaskLifecycle,
  settings: SettingsStore,
  progress: Arc<ProgressTracker>,
  generator: ReportGenerator,
  flush_every: Duration,
}

impl ReportTaskHandler {
  pub fn new(
    lifecycle: TaskLifecycle,
    settings: SettingsStore,
    progress: Arc<ProgressTracker>,
    generator: ReportGenerator,
  ) -> Self {
    Self { lifecycle, settings, progress, generator, flush_every: Duration::from_secs(1) }
  }

  pub fn with_flush_interval(mut self, flush_every: Duration) -> Self {
    self.flush_every = flush_every;
    self
  }

  async fn run(&self, task: &Task, metadata: &TaskMetadata) -> Result<GeneratedReport> {
    let settings = ReportSettings::resolve(&self.settings, metadata.branch_id, &metadata.settings).await;
    let windows = resolve_windows(&metadata.filter, &settings.day_start_time, Local::now().date_naive())?;

    let reporter = ProgressReporter::start(
      &task.id,
      self.progress.clone(),
      self.lifecycle.tasks().clone(),
      self.flush_every,
    );
    reporter.report(STAGE_INITIALIZING, 0, windows.len() as u64);
    let outcome = self.generator.generate(&task.id, metadata, &settings, &windows, &reporter).await;
    reporter.finish().await;
    outcome
  }
}

#[async_trait]
impl JobHandler for ReportTaskHandler {
  async fn handle(&self, job: &JobEnvelope) -> Result<()> {
    let metadata = job.metadata()?;
    let attempt = job.attempts;
    let task = match self.lifecycle.claim(&job.task_id, attempt).await? {
      Claim::Started(task) => task,
      Claim::Skipped(status) => {
        info!(task_id = %job.task_id, %status, "Skipping job for task that is no longer runnable");
        return Ok(());
      }
    };

    info!(task_id = %task.id, attempt, "Generating report");
    let outcome = self.run(&task, &metadata).await;
    let result = match outcome {
      Ok(report) => {
        self.lifecycle
          .complete(&task.id, &report.joined_paths(), report.total_size as i64, attempt)
          .await
      }
      Err(e) => {
        if let Err(update_err) = self.lifecycle.fail(&task.id, &e.to_string(), attempt).await {
          error!(task_id = %task.id, "Failed to record task failure: {:?}", update_err);
        }
        Err(e)
      }
    };
    self.progress.clear(&task.id);
    result
  }

  async fn on_attempt_failed(&self, job: &JobEnvelope, reason: &str) {
    self.progress.clear(&job.task_id);
    match self.lifecycle.fail(&job.task_id, reason, job.attempts).await {
      Ok(true) => warn!(task_id = %job.task_id, attempt = job.attempts, "Attempt cut short: {}", reason),
      Ok(false) => {}
      Err(e) => error!(task_id = %job.task_id, "Failed to record interrupted attempt: {:?}", e),
    }
  }

  async fn on_abandoned(&self, job: &JobEnvelope, reason: &str) {
    self.progress.clear(&job.task_id);
    match self.lifecycle.fail(&job.task_id, reason, job.attempts).await {
      Ok(true) => warn!(task_id = %job.task_id, "Task failed after the queue gave up: {}", reason),
      Ok(false) => {}
      Err(e) => error!(task_id = %job.task_id, "Failed to mark abandoned task: {:?}", e),
    }
  }
}
