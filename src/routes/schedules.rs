use std::sync::Arc;
use chrono::Local;
use serde::Deserialize;
use warp::http::StatusCode;
use warp::Filter;
use crate::models::TaskMetadata;
use super::{with_state, AppState};

#[derive(Deserialize)]
pub struct NewSchedule {
  pub cron: String,
  pub task: TaskMetadata,
}

pub fn create_route(state: Arc<AppState>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("schedules")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_create_schedule)
}

pub fn delete_route(state: Arc<AppState>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("schedules")
    .and(warp::path::param::<String>())
    .and(warp::path::end())
    .and(warp::delete())
    .and(with_state(state))
    .and_then(handle_delete_schedule)
}

async fn handle_create_schedule(body: NewSchedule, state: Arc<AppState>) -> Result<impl warp::Reply, warp::Rejection> {
  let schedule = state.scheduler.create_schedule(&body.cron, &body.task, Local::now()).await?;
  Ok(warp::reply::with_status(warp::reply::json(&schedule), StatusCode::CREATED))
}

async fn handle_delete_schedule(schedule_id: String, state: Arc<AppState>) -> Result<impl warp::Reply, warp::Rejection> {
  state.scheduler.remove_schedule(&schedule_id).await?;
  Ok(warp::reply::json(&serde_json::json!({ "schedule_id": schedule_id, "status": "deleted" })))
}
