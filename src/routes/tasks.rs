use std::sync::Arc;
use chrono::Local;
use serde::Serialize;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::Filter;
use crate::error::PipelineError;
use crate::models::{Task, TaskMetadata, TaskStatus};
use crate::progress::ProgressRecord;
use crate::window::validate_filter;
use super::{with_state, AppState};

const MAX_ID: i64 = 100;

#[derive(Serialize)]
pub struct TaskResponse {
  pub task_id: String,
  pub status: TaskStatus,
  pub queue_position: i64,
  pub queue_size: i64,
  pub sse_url: String,
}

#[derive(Serialize)]
pub struct TaskView {
  #[serde(flatten)]
  pub task: Task,
  /// Live record from the worker, when it is still running.
  pub live_progress: Option<ProgressRecord>,
}

fn validate_metadata(metadata: &TaskMetadata) -> Result<(), PipelineError> {
  for (name, id) in [
    ("branch_id", metadata.branch_id),
    ("gate_id", metadata.gate_id),
    ("station_id", metadata.station_id),
  ] {
    if !(0..=MAX_ID).contains(&id) {
      return Err(PipelineError::invalid(format!("{} must be between 0 and {}", name, MAX_ID)));
    }
  }
  validate_filter(&metadata.filter, Local::now().date_naive())
}

pub fn submit_route(state: Arc<AppState>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("tasks")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_submit_task)
}

pub fn get_route(state: Arc<AppState>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("tasks")
    .and(warp::path::param::<String>())
    .and(warp::path::end())
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_get_task)
}

pub fn cancel_route(state: Arc<AppState>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("tasks")
    .and(warp::path::param::<String>())
    .and(warp::path::end())
    .and(warp::delete())
    .and(with_state(state))
    .and_then(handle_cancel_task)
}

async fn handle_submit_task(metadata: TaskMetadata, state: Arc<AppState>) -> Result<impl warp::Reply, warp::Rejection> {
  validate_metadata(&metadata)?;

  let task = Task::queued(&metadata, None);
  state.tasks.create(&task).await?;
  if let Err(e) = state.queue.enqueue(&task.id, &metadata).await {
    error!(task_id = %task.id, "Failed to enqueue task: {:?}", e);
    state.lifecycle.fail(&task.id, &format!("enqueue failed: {}", e), 0).await?;
    return Err(e.into());
  }

  let response = TaskResponse {
    queue_position: state.tasks.queue_position(&task.id).await?,
    queue_size: state.tasks.count_by_status(TaskStatus::Queued).await?,
    sse_url: format!("/sse?task_id={}", task.id),
    status: task.status,
    task_id: task.id,
  };
  info!(task_id = %response.task_id, "Task {} submitted successfully", response.task_id);
  Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::ACCEPTED))
}

async fn handle_get_task(task_id: String, state: Arc<AppState>) -> Result<impl warp::Reply, warp::Rejection> {
  let mut task = state.tasks.get(&task_id).await?;
  let live_progress = state.progress.get(&task_id);
  if let Some(live) = &live_progress {
    task.progress_stage = live.stage.clone();
    task.progress_current = live.current as i64;
    task.progress_total = live.total as i64;
  }
  Ok(warp::reply::json(&TaskView { task, live_progress }))
}

async fn handle_cancel_task(task_id: String, state: Arc<AppState>) -> Result<impl warp::Reply, warp::Rejection> {
  state.lifecycle.cancel(&task_id).await?;
  info!(task_id = %task_id, "Task cancelled");
  Ok(warp::reply::json(&serde_json::json!({ "task_id": task_id, "status": TaskStatus::Cancelled })))
}
