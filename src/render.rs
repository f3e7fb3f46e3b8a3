use std::path::PathBuf;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;
use crate::error::{PipelineError, Result};
use crate::progress::ProgressSink;
use crate::settings::ReportSettings;
use crate::source::Transaction;
use crate::window::Window;

pub const STAGE_WRITING: &str = "Writing file to disk";
pub const STAGE_DONE: &str = "Completed";

pub struct RenderRequest<'a> {
  pub rows: &'a [Transaction],
  pub settings: &'a ReportSettings,
  pub window: Window,
  /// Output file name without extension.
  pub file_stem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
  pub path: PathBuf,
  pub size: u64,
}

#[async_trait]
pub trait Renderer: Send + Sync {
  async fn render(&self, request: RenderRequest<'_>, progress: &dyn ProgressSink) -> Result<RenderedFile>;
}

/// Writes the report as a JSON document: a header block plus one entry per
/// transaction, images reduced to their byte length.
#[derive(Debug, Clone)]
pub struct JsonReportRenderer {
  output_dir: PathBuf,
}

impl JsonReportRenderer {
  pub fn new(output_dir: impl Into<PathBuf>) -> Self {
    Self { output_dir: output_dir.into() }
  }

}

fn image_len(image: &Option<Vec<u8>>) -> usize {
  image.as_ref().map_or(0, Vec::len)
}

fn row_entry(row: &Transaction) -> Result<Value> {
  let mut entry = serde_json::to_value(row)?;
  if let Value::Object(map) = &mut entry {
    map.insert("first_image_bytes".into(), json!(image_len(&row.first_image)));
    map.insert("second_image_bytes".into(), json!(image_len(&row.second_image)));
  }
  Ok(entry)
}

#[async_trait]
impl Renderer for JsonReportRenderer {
  async fn render(&self, request: RenderRequest<'_>, progress: &dyn ProgressSink) -> Result<RenderedFile> {
    let total = request.rows.len() as u64;
    let mut entries = Vec::with_capacity(request.rows.len());
    for (i, row) in request.rows.iter().enumerate() {
      let n = i as u64 + 1;
      progress.report(&format!("Appending transaction {} of {}", n, total), n, total);
      entries.push(row_entry(row)?);
    }

    let settings = request.settings;
    let document = json!({
      "header": {
        "branch_name": settings.branch_name,
        "management_company": settings.management_company,
        "analyzer_operator_name": settings.analyzer_operator_name,
        "page_size": settings.page_size,
        "date": request.window.date.to_string(),
        "window_start": request.window.start.to_string(),
        "window_end": request.window.last_second().to_string(),
        "generated_at": Utc::now().to_rfc3339(),
        "transactions": total,
      },
      "rows": entries,
    });

    progress.report(STAGE_WRITING, total, total);
    let bytes = serde_json::to_vec_pretty(&document)?;
    let path = self.output_dir.join(format!("{}.json", request.file_stem));
    let write = async {
      tokio::fs::create_dir_all(&self.output_dir).await?;
      tokio::fs::write(&path, &bytes).await?;
      tokio::fs::metadata(&path).await
    };
    let size = write
      .await
      .map_err(|e| PipelineError::Render(format!("{}: {}", path.display(), e)))?
      .len();

    progress.report(STAGE_DONE, total, total);
    debug!(path = %path.display(), size, "Report written");
    Ok(RenderedFile { path, size })
  }
}
