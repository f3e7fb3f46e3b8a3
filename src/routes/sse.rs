use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use serde_json::json;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::warn;
use warp::sse::Event;
use warp::Filter;
use crate::error::PipelineError;
use super::{with_state, AppState};

pub fn sse_route(state: Arc<AppState>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<HashMap<String, String>>())
    .and(with_state(state))
    .and_then(handle_sse)
}

/// One `progress` event, and whether the task has reached a terminal status.
async fn snapshot(state: &AppState, task_id: &str) -> (Event, bool) {
  match state.tasks.get(task_id).await {
    Ok(task) => {
      let (stage, current, total) = match state.progress.get(task_id) {
        Some(live) => (live.stage, live.current as i64, live.total as i64),
        None => (task.progress_stage.clone(), task.progress_current, task.progress_total),
      };
      let data = json!({
        "task_id": task_id,
        "status": task.status,
        "stage": stage,
        "current": current,
        "total": total,
        "error_message": task.error_message,
        "output_file_path": task.output_file_path,
        "output_file_size": task.output_file_size,
      });
      (Event::default().event("progress").data(data.to_string()), task.status.is_terminal())
    }
    Err(PipelineError::TaskNotFound(_)) => {
      let data = json!({ "task_id": task_id, "error": "task not found" });
      (Event::default().event("error").data(data.to_string()), true)
    }
    Err(e) => {
      warn!(task_id, "Error fetching task status: {:?}", e);
      let data = json!({ "task_id": task_id, "error": e.to_string() });
      (Event::default().event("error").data(data.to_string()), false)
    }
  }
}

async fn handle_sse(query: HashMap<String, String>, state: Arc<AppState>) -> Result<impl warp::Reply, warp::Rejection> {
  let task_id = query
    .get("task_id")
    .filter(|id| !id.trim().is_empty())
    .ok_or_else(|| PipelineError::invalid("missing task_id"))?
    .clone();
  state.tasks.get(&task_id).await?;

  let interval = IntervalStream::new(tokio::time::interval(state.sse_interval));
  let mut finished = false;
  let stream = interval
    .then(move |_| {
      let state = state.clone();
      let task_id = task_id.clone();
      async move { snapshot(&state, &task_id).await }
    })
    // emit the terminal event, then stop
    .take_while(move |(_, terminal)| {
      let keep = !finished;
      finished = *terminal;
      keep
    })
    .map(|(event, _)| Ok::<_, Infallible>(event));

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
