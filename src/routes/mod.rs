use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use serde_json::json;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};
use crate::error::PipelineError;
use crate::lifecycle::TaskLifecycle;
use crate::progress::ProgressTracker;
use crate::queue::JobQueue;
use crate::scheduler::Scheduler;
use crate::store::TaskRepository;

pub mod tasks;
pub mod sse;
pub mod schedules;

/// Everything the handlers need, shared behind one `Arc`.
pub struct AppState {
  pub tasks: TaskRepository,
  pub lifecycle: TaskLifecycle,
  pub queue: JobQueue,
  pub progress: Arc<ProgressTracker>,
  pub scheduler: Arc<Scheduler>,
  pub sse_interval: Duration,
}

#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl warp::reject::Reject for ApiError {}

impl From<PipelineError> for Rejection {
  fn from(err: PipelineError) -> Self {
    warp::reject::custom(ApiError(err))
  }
}

pub fn routes(state: Arc<AppState>) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  tasks::submit_route(state.clone())
    .or(tasks::get_route(state.clone()))
    .or(tasks::cancel_route(state.clone()))
    .or(sse::sse_route(state.clone()))
    .or(schedules::create_route(state.clone()))
    .or(schedules::delete_route(state))
    .recover(handle_rejection)
}

pub(crate) fn with_state(state: Arc<AppState>) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

fn status_for(err: &PipelineError) -> StatusCode {
  match err {
    PipelineError::InvalidInput(_) | PipelineError::Payload(_) => StatusCode::BAD_REQUEST,
    PipelineError::TaskNotFound(_) | PipelineError::ScheduleNotFound(_) => StatusCode::NOT_FOUND,
    PipelineError::InvalidTransition { .. } => StatusCode::CONFLICT,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, message) = if let Some(ApiError(e)) = err.find::<ApiError>() {
    let status = status_for(e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
      error!("Request failed: {:?}", e);
    }
    (status, e.to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status))
}
