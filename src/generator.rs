//! One report pass per logical day. A range task runs its days one after the
//! other; a day that fails is logged and skipped, and the task only fails
//! when no day produced a file.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use crate::error::{PipelineError, Result};
use crate::models::TaskMetadata;
use crate::path_format::{datasource_path, format_path, identifies_day, PathParams};
use crate::progress::ProgressSink;
use crate::render::{RenderRequest, RenderedFile, Renderer};
use crate::settings::ReportSettings;
use crate::source::{TransactionQuery, TransactionSource};
use crate::window::Window;

pub const STAGE_CONNECTING: &str = "Connecting to data source";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedReport {
  pub paths: Vec<PathBuf>,
  pub total_size: u64,
}

impl GeneratedReport {
  /// Form stored in the task's output path column.
  pub fn joined_paths(&self) -> String {
    self.paths
      .iter()
      .map(|p| p.to_string_lossy().into_owned())
      .collect::<Vec<_>>()
      .join(",")
  }
}

/// Tags every stage with the day it belongs to.
struct DaySink<'a> {
  prefix: String,
  inner: &'a dyn ProgressSink,
}

impl ProgressSink for DaySink<'_> {
  fn report(&self, stage: &str, current: u64, total: u64) {
    self.inner.report(&format!("{} {}", self.prefix, stage), current, total);
  }
}

#[derive(Clone)]
pub struct ReportGenerator {
  source: Arc<dyn TransactionSource>,
  renderer: Arc<dyn Renderer>,
}

impl ReportGenerator {
  pub fn new(source: Arc<dyn TransactionSource>, renderer: Arc<dyn Renderer>) -> Self {
    Self { source, renderer }
  }

  pub async fn generate_day(
    &self,
    metadata: &TaskMetadata,
    settings: &ReportSettings,
    window: Window,
    progress: &dyn ProgressSink,
  ) -> Result<RenderedFile> {
    progress.report(STAGE_CONNECTING, 0, 0);
    let params = PathParams {
      time: window.start,
      branch_id: metadata.branch_id,
      station_id: metadata.station_id,
      gate_id: metadata.gate_id,
    };
    let path = datasource_path(&metadata.root_folder, &settings.datasource_path_format, &params);
    let rows = self.source.load(&path, &TransactionQuery::new(window, &metadata.filter)).await?;
    progress.report(&format!("Loaded {} transactions", rows.len()), 0, rows.len() as u64);

    let request = RenderRequest {
      rows: &rows,
      settings,
      window,
      file_stem: format_path(&settings.output_filename_format, &params),
    };
    self.renderer.render(request, progress).await
  }

  pub async fn generate(
    &self,
    task_id: &str,
    metadata: &TaskMetadata,
    settings: &ReportSettings,
    windows: &[Window],
    progress: &dyn ProgressSink,
  ) -> Result<GeneratedReport> {
    match windows {
      [] => Err(PipelineError::invalid("filter resolves to no days")),
      [window] => {
        let file = self.generate_day(metadata, settings, *window, progress).await?;
        Ok(GeneratedReport { paths: vec![file.path], total_size: file.size })
      }
      _ => self.generate_range(task_id, metadata, settings, windows, progress).await,
    }
  }

  async fn generate_range(
    &self,
    task_id: &str,
    metadata: &TaskMetadata,
    settings: &ReportSettings,
    windows: &[Window],
    progress: &dyn ProgressSink,
  ) -> Result<GeneratedReport> {
    // every day needs its own file name or later days overwrite earlier ones
    let dated;
    let settings = if identifies_day(&settings.output_filename_format) {
      settings
    } else {
      warn!(task_id, format = %settings.output_filename_format, "Output name has no date; appending one per day");
      dated = ReportSettings {
        output_filename_format: format!("{}_{{DATE}}", settings.output_filename_format),
        ..settings.clone()
      };
      &dated
    };

    let days = windows.len();
    let mut report = GeneratedReport::default();
    let mut failures = Vec::new();

    for (i, window) in windows.iter().enumerate() {
      progress.report(&format!("Processing date {} of {}", i + 1, days), i as u64, days as u64);
      let sink = DaySink { prefix: format!("[{}]", window.date), inner: progress };
      match self.generate_day(metadata, settings, *window, &sink).await {
        Ok(file) => {
          info!(task_id, date = %window.date, path = %file.path.display(), "Day generated");
          report.total_size += file.size;
          report.paths.push(file.path);
        }
        Err(e) => {
          warn!(task_id, date = %window.date, "Skipping day: {}", e);
          failures.push(format!("{}: {}", window.date, e));
        }
      }
    }

    if report.paths.is_empty() {
      return Err(PipelineError::AllDaysFailed { days, reasons: failures.join("; ") });
    }
    info!(task_id, generated = report.paths.len(), skipped = failures.len(), "Range generated");
    Ok(report)
  }
}
