use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use reportq::config::Config;
use reportq::database::{run_wal_checkpoints, setup_database, wal_path};
use reportq::generator::ReportGenerator;
use reportq::lifecycle::TaskLifecycle;
use reportq::progress::ProgressTracker;
use reportq::queue::{JobQueue, WorkerPool};
use reportq::render::JsonReportRenderer;
use reportq::retention::Retention;
use reportq::routes::{routes, AppState};
use reportq::scheduler::Scheduler;
use reportq::settings::SettingsStore;
use reportq::source::SqliteTransactionSource;
use reportq::store::{ScheduleRepository, TaskRepository};
use reportq::worker_processing::ReportTaskHandler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env()?;
  if let Some(dir) = wal_path(&config.database_url).as_deref().and_then(|p| p.parent()) {
    if !dir.as_os_str().is_empty() {
      tokio::fs::create_dir_all(dir).await.context("creating database directory")?;
    }
  }
  tokio::fs::create_dir_all(&config.output_dir).await.context("creating output directory")?;

  let db_pool = setup_database(&config.database_url).await?;
  let settings = SettingsStore::new(db_pool.clone());
  settings.seed_defaults().await?;

  let tasks = TaskRepository::new(db_pool.clone());
  let lifecycle = TaskLifecycle::new(tasks.clone());
  let progress = Arc::new(ProgressTracker::new());
  let queue = JobQueue::new(db_pool.clone(), config.queue_config(settings.queue_concurrency().await));
  let token = CancellationToken::new();

  let generator = ReportGenerator::new(
    Arc::new(SqliteTransactionSource),
    Arc::new(JsonReportRenderer::new(&config.output_dir)),
  );
  let handler = ReportTaskHandler::new(lifecycle.clone(), settings.clone(), progress.clone(), generator);
  let pool = WorkerPool::new(queue.clone(), Arc::new(handler));
  let dispatcher = pool.start(token.clone())?;

  let scheduler = Arc::new(Scheduler::new(
    ScheduleRepository::new(db_pool.clone()),
    lifecycle.clone(),
    queue.clone(),
    Retention::new(lifecycle.clone(), settings.clone()),
    config.schedule_overlap,
  ));
  scheduler.load(Local::now()).await?;
  tokio::spawn(scheduler.clone().run(token.clone()));
  tokio::spawn(run_wal_checkpoints(
    db_pool.clone(),
    settings.clone(),
    wal_path(&config.database_url),
    token.clone(),
  ));

  let state = Arc::new(AppState {
    tasks,
    lifecycle,
    queue,
    progress,
    scheduler,
    sse_interval: Duration::from_secs(1),
  });

  let shutdown = token.clone();
  let (addr, server) = warp::serve(routes(state))
    .try_bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async move {
      shutdown.cancelled().await
    })?;
  info!("Listening on {}", addr);
  let server = tokio::spawn(server);

  if let Err(e) = tokio::signal::ctrl_c().await {
    error!("Failed to listen for shutdown signal: {:?}", e);
  }
  info!("Shutting down");
  token.cancel();
  let _ = server.await;
  let _ = dispatcher.await;
  db_pool.close().await;
  Ok(())
}
