use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tokio::time::Instant;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::error::Result;
use crate::settings::{SettingsStore, SETTING_WAL_CHECKPOINT_INTERVAL, SETTING_WAL_MAX_SIZE_MB};

static MIGRATOR: Migrator = sqlx::migrate!();
static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

pub async fn setup_database(database_url: &str) -> Result<SqlitePool> {
  let options = SqliteConnectOptions::from_str(database_url)?
    .create_if_missing(true)
    .journal_mode(SqliteJournalMode::Wal)
    .synchronous(SqliteSynchronous::Normal)
    .busy_timeout(Duration::from_secs(5));

  let pool = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options.clone())
  })
    .await?;

  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}

/// Single-connection in-memory database; the connection is never recycled so
/// the schema lives as long as the pool.
pub async fn setup_in_memory() -> Result<SqlitePool> {
  let pool = SqlitePoolOptions::new()
    .max_connections(1)
    .idle_timeout(None)
    .max_lifetime(None)
    .connect("sqlite::memory:")
    .await?;
  MIGRATOR.run(&pool).await?;
  Ok(pool)
}

/// Path of the `-wal` side file for a `sqlite://` url, if it names a file.
pub fn wal_path(database_url: &str) -> Option<PathBuf> {
  let path = database_url
    .strip_prefix("sqlite://")
    .or_else(|| database_url.strip_prefix("sqlite:"))?;
  let path = path.split('?').next().unwrap_or_default();
  if path.is_empty() || path.starts_with(":memory:") {
    return None;
  }
  Some(PathBuf::from(format!("{}-wal", path)))
}

/// Forces a WAL checkpoint when the configured interval has elapsed or the WAL
/// file has grown beyond the configured size. Checks once a minute.
pub async fn run_wal_checkpoints(
  pool: SqlitePool,
  settings: SettingsStore,
  wal_file: Option<PathBuf>,
  shutdown: CancellationToken,
) {
  let mut ticker = tokio::time::interval(Duration::from_secs(60));
  let mut last_checkpoint = Instant::now();

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = ticker.tick() => {}
    }

    let interval_minutes = settings.get_u64(SETTING_WAL_CHECKPOINT_INTERVAL, 30).await;
    let max_size_mb = settings.get_f64(SETTING_WAL_MAX_SIZE_MB, 20.0).await;

    let mut due = last_checkpoint.elapsed() >= Duration::from_secs(interval_minutes * 60);
    if !due {
      if let Some(path) = &wal_file {
        if let Ok(meta) = tokio::fs::metadata(path).await {
          due = meta.len() as f64 / 1024.0 / 1024.0 >= max_size_mb;
        }
      }
    }

    if due {
      match sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&pool).await {
        Ok(_) => debug!("WAL checkpoint complete"),
        Err(e) => warn!("WAL checkpoint failed: {:?}", e),
      }
      last_checkpoint = Instant::now();
    }
  }
}
