use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Local, TimeDelta, Utc};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use crate::cron::CronExpr;
use crate::error::{PipelineError, Result};
use crate::lifecycle::TaskLifecycle;
use crate::models::{Schedule, Task, TaskMetadata};
use crate::queue::JobQueue;
use crate::retention::Retention;
use crate::store::ScheduleRepository;
use crate::window::validate_filter;

pub const MAINTENANCE_CRON: &str = "0 0 * * *";

/// Abandoned job envelopes are kept this long for inspection.
pub const ABANDONED_JOB_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TriggerKey {
  Maintenance,
  Schedule(String),
}

impl fmt::Display for TriggerKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TriggerKey::Maintenance => f.write_str("maintenance"),
      TriggerKey::Schedule(id) => write!(f, "schedule:{}", id),
    }
  }
}

/// What to do when a schedule fires while its previous task is unfinished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
  #[default]
  AlwaysFire,
  SkipIfInFlight,
}

impl FromStr for OverlapPolicy {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.trim() {
      "" | "always" => Ok(OverlapPolicy::AlwaysFire),
      "skip" => Ok(OverlapPolicy::SkipIfInFlight),
      other => Err(format!("unknown overlap policy '{}' (expected always or skip)", other)),
    }
  }
}

#[derive(Debug, Clone)]
struct CronEntry {
  next_fire: DateTime<Local>,
  key: TriggerKey,
}

impl Eq for CronEntry {}

impl PartialEq for CronEntry {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}

impl PartialOrd for CronEntry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for CronEntry {
  fn cmp(&self, other: &Self) -> Ordering {
    self.next_fire
      .cmp(&other.next_fire)
      .then_with(|| self.key.cmp(&other.key))
  }
}

/// Triggers ordered by next fire time, with keyed removal.
#[derive(Debug, Default)]
struct Timetable {
  due: BTreeSet<CronEntry>,
  triggers: HashMap<TriggerKey, (CronExpr, DateTime<Local>)>,
}

impl Timetable {
  fn insert(&mut self, key: TriggerKey, cron: CronExpr, now: DateTime<Local>) -> Option<DateTime<Local>> {
    self.remove(&key);
    let next_fire = cron.next_after(&now)?;
    self.due.insert(CronEntry { next_fire, key: key.clone() });
    self.triggers.insert(key, (cron, next_fire));
    Some(next_fire)
  }

  fn remove(&mut self, key: &TriggerKey) -> bool {
    match self.triggers.remove(key) {
      Some((_, next_fire)) => self.due.remove(&CronEntry { next_fire, key: key.clone() }),
      None => false,
    }
  }

  /// Takes the earliest trigger due at `now` and re-arms it after `now`, so a
  /// long pause fires each trigger once rather than replaying missed runs.
  fn pop_due(&mut self, now: DateTime<Local>) -> Option<(TriggerKey, Option<DateTime<Local>>)> {
    let first = self.due.first()?;
    if first.next_fire > now {
      return None;
    }
    let entry = self.due.pop_first()?;
    let (cron, _) = self.triggers.remove(&entry.key)?;
    let next = self.insert(entry.key.clone(), cron, now);
    Some((entry.key, next))
  }

  fn next_fire(&self, key: &TriggerKey) -> Option<DateTime<Local>> {
    self.triggers.get(key).map(|(_, next)| *next)
  }

  fn len(&self) -> usize {
    self.triggers.len()
  }
}

pub struct Scheduler {
  schedules: ScheduleRepository,
  lifecycle: TaskLifecycle,
  queue: JobQueue,
  retention: Retention,
  overlap: OverlapPolicy,
  timetable: Mutex<Timetable>,
}

impl Scheduler {
  pub fn new(
    schedules: ScheduleRepository,
    lifecycle: TaskLifecycle,
    queue: JobQueue,
    retention: Retention,
    overlap: OverlapPolicy,
  ) -> Self {
    Self {
      schedules,
      lifecycle,
      queue,
      retention,
      overlap,
      timetable: Mutex::new(Timetable::default()),
    }
  }

  /// Registers the maintenance trigger and one trigger per active schedule.
  /// Schedules with an unusable cron expression are logged and left out.
  pub async fn load(&self, now: DateTime<Local>) -> Result<usize> {
    let mut timetable = self.timetable.lock().await;
    timetable.insert(TriggerKey::Maintenance, CronExpr::parse(MAINTENANCE_CRON)?, now);

    for schedule in self.schedules.list_active().await? {
      let cron = match CronExpr::parse(&schedule.cron) {
        Ok(cron) => cron,
        Err(e) => {
          warn!(schedule_id = %schedule.id, "Not registering schedule: {}", e);
          continue;
        }
      };
      let next = timetable.insert(TriggerKey::Schedule(schedule.id.clone()), cron, now);
      self.schedules.set_next_run(&schedule.id, next.map(|t| t.with_timezone(&Utc))).await?;
    }
    info!(triggers = timetable.len(), "Scheduler loaded");
    Ok(timetable.len())
  }

  /// Validates and persists a new schedule, then registers its trigger.
  pub async fn create_schedule(&self, cron: &str, metadata: &TaskMetadata, now: DateTime<Local>) -> Result<Schedule> {
    let expr = CronExpr::parse(cron)?;
    validate_metadata(metadata, now)?;
    let mut schedule = Schedule::new(&expr.to_string(), serde_json::to_string(metadata)?);
    schedule.next_run = expr.next_after(&now).map(|t| t.with_timezone(&Utc));
    self.schedules.create(&schedule).await?;

    self.timetable.lock().await.insert(TriggerKey::Schedule(schedule.id.clone()), expr, now);
    info!(schedule_id = %schedule.id, cron = %schedule.cron, "Schedule created");
    Ok(schedule)
  }

  /// Deletes the schedule and its trigger; other triggers are untouched.
  pub async fn remove_schedule(&self, id: &str) -> Result<()> {
    self.schedules.delete(id).await?;
    let deregistered = self.timetable.lock().await.remove(&TriggerKey::Schedule(id.to_string()));
    info!(schedule_id = id, deregistered, "Schedule removed");
    Ok(())
  }

  pub async fn next_fire(&self, key: &TriggerKey) -> Option<DateTime<Local>> {
    self.timetable.lock().await.next_fire(key)
  }

  /// Fires every trigger due at `now`; returns the ids of tasks created.
  pub async fn fire_due(&self, now: DateTime<Local>) -> Vec<String> {
    let mut created = Vec::new();
    loop {
      // lock only while popping so firing can take its time
      let Some((key, next)) = self.timetable.lock().await.pop_due(now) else {
        break;
      };
      debug!(trigger = %key, "Trigger fired");
      match &key {
        TriggerKey::Maintenance => {
          let now_utc = now.with_timezone(&Utc);
          if let Err(e) = self.retention.sweep(now_utc).await {
            error!("Retention sweep failed: {}", e);
          }
          if let Err(e) = self.queue.purge_abandoned(now_utc - TimeDelta::hours(ABANDONED_JOB_TTL_HOURS)).await {
            error!("Purging abandoned jobs failed: {}", e);
          }
        }
        TriggerKey::Schedule(id) => match self.execute_schedule(id, now, next).await {
          Ok(Some(task_id)) => created.push(task_id),
          Ok(None) => {}
          Err(e) => error!(schedule_id = %id, "Scheduled run failed: {}", e),
        },
      }
    }
    created
  }

  async fn execute_schedule(
    &self,
    id: &str,
    now: DateTime<Local>,
    next: Option<DateTime<Local>>,
  ) -> Result<Option<String>> {
    let schedule = match self.schedules.get(id).await {
      Ok(schedule) => schedule,
      Err(PipelineError::ScheduleNotFound(_)) => {
        self.timetable.lock().await.remove(&TriggerKey::Schedule(id.to_string()));
        return Ok(None);
      }
      Err(e) => return Err(e),
    };
    if !schedule.active {
      return Ok(None);
    }

    let now_utc = now.with_timezone(&Utc);
    let next_utc = next.map(|t| t.with_timezone(&Utc));
    let metadata = schedule
      .metadata()
      .map_err(PipelineError::from)
      .and_then(|metadata| validate_metadata(&metadata, now).map(|()| metadata));
    let metadata = match metadata {
      Ok(metadata) => metadata,
      Err(e) => {
        // the trigger is re-armed regardless, keep the row in step with it
        self.schedules.set_next_run(id, next_utc).await?;
        return Err(e);
      }
    };

    if self.overlap == OverlapPolicy::SkipIfInFlight && self.lifecycle.tasks().has_active_for_schedule(id).await? {
      info!(schedule_id = id, "Previous run still in flight; skipping");
      self.schedules.set_next_run(id, next_utc).await?;
      return Ok(None);
    }

    let task = Task::queued(&metadata, Some(schedule.id.clone()));
    self.lifecycle.tasks().create(&task).await?;
    if let Err(e) = self.queue.enqueue(&task.id, &metadata).await {
      self.lifecycle.fail(&task.id, &format!("enqueue failed: {}", e), 0).await?;
      return Err(e);
    }
    self.schedules.stamp_run(id, now_utc, next_utc).await?;
    info!(schedule_id = id, task_id = %task.id, "Scheduled task queued");
    Ok(Some(task.id))
  }

  pub async fn run(self: Arc<Self>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
      tokio::select! {
        _ = token.cancelled() => break,
        _ = ticker.tick() => {
          self.fire_due(Local::now()).await;
        }
      }
    }
    info!("Scheduler stopped");
  }
}

fn validate_metadata(metadata: &TaskMetadata, now: DateTime<Local>) -> Result<()> {
  validate_filter(&metadata.filter, now.date_naive())
}
