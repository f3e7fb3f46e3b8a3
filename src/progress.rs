//! Live progress of running tasks.
//!
//! `ProgressTracker` is the fast in-memory read model shared by workers and
//! readers. `ProgressReporter` is what a worker hands to the renderer: every
//! report updates the tracker immediately and is mirrored to the task row at
//! most once per `flush_every`, so a restarted process can still show
//! approximate progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;
use crate::store::TaskRepository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressRecord {
  pub stage: String,
  pub current: u64,
  pub total: u64,
}

impl ProgressRecord {
  /// `current` is clamped to `total` once a total is known.
  pub fn new(stage: impl Into<String>, current: u64, total: u64) -> Self {
    let current = if total > 0 { current.min(total) } else { current };
    Self { stage: stage.into(), current, total }
  }
}

/// Receives progress from the renderer and report generator.
pub trait ProgressSink: Send + Sync {
  fn report(&self, stage: &str, current: u64, total: u64);
}

impl<F> ProgressSink for F
where
  F: Fn(&str, u64, u64) + Send + Sync,
{
  fn report(&self, stage: &str, current: u64, total: u64) {
    self(stage, current, total)
  }
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
  table: RwLock<HashMap<String, ProgressRecord>>,
}

impl ProgressTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&self, task_id: &str, stage: &str, current: u64, total: u64) {
    let record = ProgressRecord::new(stage, current, total);
    self.table.write().insert(task_id.to_string(), record);
  }

  pub fn get(&self, task_id: &str) -> Option<ProgressRecord> {
    self.table.read().get(task_id).cloned()
  }

  pub fn clear(&self, task_id: &str) {
    self.table.write().remove(task_id);
  }

  pub fn len(&self) -> usize {
    self.table.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.table.read().is_empty()
  }
}

pub struct ProgressReporter {
  task_id: String,
  tracker: Arc<ProgressTracker>,
  latest: watch::Sender<Option<ProgressRecord>>,
  mirror: Option<JoinHandle<()>>,
}

impl ProgressReporter {
  pub fn start(task_id: &str, tracker: Arc<ProgressTracker>, tasks: TaskRepository, flush_every: Duration) -> Self {
    let (latest, rx) = watch::channel(None);
    let mirror = tokio::spawn(mirror_progress(task_id.to_string(), tasks, rx, flush_every));
    Self {
      task_id: task_id.to_string(),
      tracker,
      latest,
      mirror: Some(mirror),
    }
  }

  /// Stops the durable mirror and waits for any in-flight write, so nothing
  /// lands on the row after the caller's terminal update.
  pub async fn finish(mut self) {
    self.latest.send_replace(None);
    let mirror = self.mirror.take();
    drop(self);
    if let Some(handle) = mirror {
      let _ = handle.await;
    }
  }
}

impl ProgressSink for ProgressReporter {
  fn report(&self, stage: &str, current: u64, total: u64) {
    self.tracker.set(&self.task_id, stage, current, total);
    self.latest.send_replace(Some(ProgressRecord::new(stage, current, total)));
  }
}

impl Drop for ProgressReporter {
  fn drop(&mut self) {
    if let Some(handle) = self.mirror.take() {
      handle.abort();
    }
  }
}

async fn mirror_progress(
  task_id: String,
  tasks: TaskRepository,
  mut rx: watch::Receiver<Option<ProgressRecord>>,
  flush_every: Duration,
) {
  while rx.changed().await.is_ok() {
    let record = rx.borrow_and_update().clone();
    let Some(record) = record else {
      continue;
    };
    if let Err(e) = tasks.update_progress(&task_id, &record).await {
      warn!("Failed to mirror progress for task {}: {:?}", task_id, e);
    }
    tokio::time::sleep(flush_every).await;
  }
}
