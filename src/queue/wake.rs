use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use super::JobQueue;

/// Periodic nudge for idle dispatchers, in addition to the wake sent by
/// `JobQueue::enqueue`. Retries whose backoff elapsed are only noticed here.
pub fn spawn_ticker(queue: JobQueue, every: Duration, token: CancellationToken) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = token.cancelled() => break,
        _ = ticker.tick() => queue.wake(),
      }
    }
  })
}
