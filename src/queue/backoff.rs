use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: i64,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_secs(5),
      max_delay: Duration::from_secs(300),
    }
  }
}

impl RetryPolicy {
  /// Delay before the attempt that follows failed attempt `attempt` (1-based):
  /// `base`, `2 * base`, `4 * base`... capped at `max_delay`.
  pub fn delay_for(&self, attempt: i64) -> Duration {
    let step = attempt.max(1) as usize - 1;
    let half_base = self.base_delay.as_millis() as u64 / 2;
    ExponentialBackoff::from_millis(2)
      .factor(half_base)
      .max_delay(self.max_delay)
      .nth(step)
      .unwrap_or(self.max_delay)
  }

  pub fn allows_another(&self, attempt: i64) -> bool {
    attempt < self.max_attempts
  }
}
