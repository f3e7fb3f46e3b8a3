use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use crate::error::{PipelineError, Result};
use super::{wake, JobEnvelope, JobQueue};

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
  async fn handle(&self, job: &JobEnvelope) -> Result<()>;

  /// Called when `handle` was cut short by a timeout or a panic and could not
  /// record the failure itself. Runs before the retry or abandon decision.
  async fn on_attempt_failed(&self, job: &JobEnvelope, reason: &str);

  /// Called once the queue gives up on a job, whatever the reason.
  async fn on_abandoned(&self, job: &JobEnvelope, reason: &str);
}

pub struct WorkerPool {
  queue: JobQueue,
  handler: Arc<dyn JobHandler>,
  started: AtomicBool,
}

impl WorkerPool {
  pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>) -> Self {
    Self { queue, handler, started: AtomicBool::new(false) }
  }

  /// Spawns the wake ticker and the dispatcher and returns immediately. The
  /// dispatcher handle resolves after cancellation once in-flight jobs are done.
  pub fn start(&self, token: CancellationToken) -> Result<JoinHandle<()>> {
    if self.started.swap(true, Ordering::SeqCst) {
      return Err(PipelineError::invalid("worker pool already started"));
    }
    let config = self.queue.config();
    let concurrency = config.concurrency.max(1);
    info!(concurrency, timeout = ?config.job_timeout, "Starting worker pool");

    wake::spawn_ticker(self.queue.clone(), config.wake_interval, token.clone());
    Ok(tokio::spawn(dispatch(self.queue.clone(), self.handler.clone(), concurrency, token)))
  }
}

async fn dispatch(queue: JobQueue, handler: Arc<dyn JobHandler>, concurrency: usize, token: CancellationToken) {
  let worker_id = format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]);
  let semaphore = Arc::new(Semaphore::new(concurrency));
  let mut wake = queue.subscribe();

  loop {
    let permit = tokio::select! {
      _ = token.cancelled() => break,
      permit = semaphore.clone().acquire_owned() => match permit {
        Ok(permit) => permit,
        Err(_) => break,
      },
    };

    match queue.dequeue(&worker_id).await {
      Ok(Some(job)) => {
        let queue = queue.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
          execute(&queue, handler, job).await;
          drop(permit);
        });
        continue;
      }
      Ok(None) => drop(permit),
      Err(e) => {
        error!("Failed to dequeue: {:?}", e);
        drop(permit);
      }
    }

    tokio::select! {
      _ = token.cancelled() => break,
      _ = wake.recv() => {}
    }
  }

  info!("Dispatcher stopping; waiting for in-flight jobs");
  let _ = semaphore.acquire_many(concurrency as u32).await;
}

async fn execute(queue: &JobQueue, handler: Arc<dyn JobHandler>, job: JobEnvelope) {
  let config = queue.config();
  let attempt = job.attempts;

  // a claim that expired on the last attempt comes back with one too many
  if attempt > job.max_attempts {
    give_up(queue, handler.as_ref(), &job, "attempts exhausted").await;
    return;
  }

  let runner = handler.clone();
  let envelope = job.clone();
  let mut handle = tokio::spawn(async move { runner.handle(&envelope).await });
  let outcome = match tokio::time::timeout(config.job_timeout, &mut handle).await {
    Ok(Ok(result)) => result,
    Ok(Err(join_err)) => Err(PipelineError::Panicked(panic_message(join_err))),
    Err(_) => {
      handle.abort();
      // wait until the aborted handler is gone so it cannot write after us
      let _ = handle.await;
      Err(PipelineError::Timeout(config.job_timeout))
    }
  };

  if let Err(e @ (PipelineError::Timeout(_) | PipelineError::Panicked(_))) = &outcome {
    handler.on_attempt_failed(&job, &e.to_string()).await;
  }

  match outcome {
    Ok(()) => match queue.ack(&job).await {
      Ok(true) => info!(job_id = %job.id, task_id = %job.task_id, attempt, "Job finished"),
      Ok(false) => warn!(job_id = %job.id, "Job finished after its claim was released"),
      Err(e) => error!(job_id = %job.id, "Failed to ack job: {:?}", e),
    },
    Err(e) if e.is_retryable() && config.retry.allows_another(attempt) => {
      let delay = config.retry.delay_for(attempt);
      warn!(job_id = %job.id, task_id = %job.task_id, attempt, ?delay, "Job failed, retrying: {}", e);
      if let Err(err) = queue.retry(&job, delay, &e.to_string()).await {
        error!(job_id = %job.id, "Failed to schedule retry: {:?}", err);
      }
    }
    Err(e) => {
      error!(job_id = %job.id, task_id = %job.task_id, attempt, "Job failed permanently: {}", e);
      give_up(queue, handler.as_ref(), &job, &e.to_string()).await;
    }
  }
}

async fn give_up(queue: &JobQueue, handler: &dyn JobHandler, job: &JobEnvelope, reason: &str) {
  match queue.abandon(job, reason).await {
    Ok(true) => handler.on_abandoned(job, reason).await,
    Ok(false) => warn!(job_id = %job.id, "Claim lost before the job could be abandoned"),
    Err(e) => error!(job_id = %job.id, "Failed to abandon job: {:?}", e),
  }
}

fn panic_message(err: tokio::task::JoinError) -> String {
  if !err.is_panic() {
    return err.to_string();
  }
  let payload: Box<dyn Any + Send> = err.into_panic();
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;
  use parking_lot::Mutex;
  use crate::database::setup_in_memory;
  use crate::models::TaskMetadata;
  use crate::queue::{QueueConfig, RetryPolicy};

  enum Behaviour {
    FailTimes(usize),
    Permanent,
    Panic,
    Hang,
  }

  struct Scripted {
    behaviour: Behaviour,
    calls: AtomicUsize,
    abandoned: Mutex<Vec<String>>,
    cut_short: Mutex<Vec<String>>,
  }

  impl Scripted {
    fn new(behaviour: Behaviour) -> Arc<Self> {
      Arc::new(Self {
        behaviour,
        calls: AtomicUsize::new(0),
        abandoned: Mutex::new(Vec::new()),
        cut_short: Mutex::new(Vec::new()),
      })
    }
  }

  #[async_trait]
  impl JobHandler for Scripted {
    async fn handle(&self, _job: &JobEnvelope) -> Result<()> {
      let call = self.calls.fetch_add(1, Ordering::SeqCst);
      match self.behaviour {
        Behaviour::FailTimes(n) if call < n => Err(PipelineError::Source("locked".into())),
        Behaviour::FailTimes(_) => Ok(()),
        Behaviour::Permanent => Err(PipelineError::invalid("bad filter")),
        Behaviour::Panic => panic!("renderer exploded"),
        Behaviour::Hang => {
          tokio::time::sleep(Duration::from_secs(3600)).await;
          Ok(())
        }
      }
    }

    async fn on_attempt_failed(&self, job: &JobEnvelope, reason: &str) {
      self.cut_short.lock().push(format!("{}#{}: {}", job.task_id, job.attempts, reason));
    }

    async fn on_abandoned(&self, job: &JobEnvelope, reason: &str) {
      self.abandoned.lock().push(format!("{}: {}", job.task_id, reason));
    }
  }

  fn fast_config() -> QueueConfig {
    QueueConfig {
      concurrency: 2,
      job_timeout: Duration::from_millis(200),
      release_after: Duration::from_secs(60),
      wake_interval: Duration::from_millis(10),
      retry: RetryPolicy { max_attempts: 3, base_delay: Duration::ZERO, max_delay: Duration::ZERO },
    }
  }

  async fn run_until_idle(handler: Arc<Scripted>, expect_abandoned: usize) -> (Arc<Scripted>, JobQueue) {
    let queue = JobQueue::new(setup_in_memory().await.unwrap(), fast_config());
    queue.enqueue("task-1", &TaskMetadata::default()).await.unwrap();
    let pool = WorkerPool::new(queue.clone(), handler.clone());
    let token = CancellationToken::new();
    let dispatcher = pool.start(token.clone()).unwrap();

    for _ in 0..500 {
      if queue.pending_count().await.unwrap() == 0 && handler.abandoned.lock().len() == expect_abandoned {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    token.cancel();
    dispatcher.await.unwrap();
    (handler, queue)
  }

  #[tokio::test]
  async fn transient_failures_are_retried_until_success() {
    let (handler, queue) = run_until_idle(Scripted::new(Behaviour::FailTimes(2)), 0).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert!(handler.abandoned.lock().is_empty());
    assert!(handler.cut_short.lock().is_empty());
    assert_eq!(queue.pending_count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn retries_stop_at_the_attempt_cap() {
    let (handler, _) = run_until_idle(Scripted::new(Behaviour::FailTimes(10)), 1).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(handler.abandoned.lock().len(), 1);
  }

  #[tokio::test]
  async fn permanent_errors_are_not_retried() {
    let (handler, _) = run_until_idle(Scripted::new(Behaviour::Permanent), 1).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert!(handler.abandoned.lock()[0].contains("bad filter"));
  }

  #[tokio::test]
  async fn panics_are_contained_and_retried() {
    let (handler, _) = run_until_idle(Scripted::new(Behaviour::Panic), 1).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert!(handler.abandoned.lock()[0].contains("renderer exploded"));
    let cut_short = handler.cut_short.lock();
    assert_eq!(cut_short.len(), 3);
    assert!(cut_short[0].starts_with("task-1#1: "));
  }

  #[tokio::test]
  async fn hung_jobs_time_out() {
    let (handler, _) = run_until_idle(Scripted::new(Behaviour::Hang), 1).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert!(handler.abandoned.lock()[0].contains("timed out"));
    assert_eq!(handler.cut_short.lock().len(), 3);
  }

  #[tokio::test]
  async fn start_is_once_only() {
    let queue = JobQueue::new(setup_in_memory().await.unwrap(), fast_config());
    let pool = WorkerPool::new(queue, Scripted::new(Behaviour::FailTimes(0)));
    let token = CancellationToken::new();
    let dispatcher = pool.start(token.clone()).unwrap();
    assert!(pool.start(token.clone()).is_err());
    token.cancel();
    dispatcher.await.unwrap();
  }
}
