use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use crate::queue::{QueueConfig, RetryPolicy};
use crate::scheduler::OverlapPolicy;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub server_port: u16,
  pub output_dir: PathBuf,
  pub job_timeout: Duration,
  pub job_max_attempts: i64,
  pub job_backoff: Duration,
  pub job_release_after: Duration,
  pub schedule_overlap: OverlapPolicy,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let num = |key: &str, default: u64| -> Result<u64> {
      match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(v) => v.trim().parse().with_context(|| format!("{} must be a non-negative integer, got '{}'", key, v)),
        None => Ok(default),
      }
    };

    let job_max_attempts = num("JOB_MAX_ATTEMPTS", 3)?;
    if job_max_attempts == 0 {
      return Err(anyhow!("JOB_MAX_ATTEMPTS must be at least 1"));
    }
    let job_timeout = Duration::from_secs(num("JOB_TIMEOUT_SECS", 600)?);
    let job_release_after = Duration::from_secs(num("JOB_RELEASE_AFTER_SECS", 1800)?);
    if job_release_after <= job_timeout {
      return Err(anyhow!(
        "JOB_RELEASE_AFTER_SECS ({}) must be greater than JOB_TIMEOUT_SECS ({})",
        job_release_after.as_secs(),
        job_timeout.as_secs()
      ));
    }
    let schedule_overlap = OverlapPolicy::from_str(&lookup("SCHEDULE_OVERLAP").unwrap_or_default())
      .map_err(|e| anyhow!("SCHEDULE_OVERLAP: {}", e))?;

    Ok(Self {
      database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://data/app.db".into()),
      server_port: u16::try_from(num("SERVER_PORT", 8080)?).context("SERVER_PORT is out of range")?,
      output_dir: PathBuf::from(lookup("OUTPUT_DIR").unwrap_or_else(|| "output".into())),
      job_timeout,
      job_max_attempts: job_max_attempts as i64,
      job_backoff: Duration::from_millis(num("JOB_BACKOFF_MS", 5000)?),
      job_release_after,
      schedule_overlap,
    })
  }

  /// Queue settings; concurrency comes from the settings table.
  pub fn queue_config(&self, concurrency: usize) -> QueueConfig {
    QueueConfig {
      concurrency,
      job_timeout: self.job_timeout,
      release_after: self.job_release_after,
      retry: RetryPolicy {
        max_attempts: self.job_max_attempts,
        base_delay: self.job_backoff,
        ..RetryPolicy::default()
      },
      ..QueueConfig::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn config(vars: &[(&str, &str)]) -> Result<Config> {
    let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Config::from_lookup(|key| vars.get(key).cloned())
  }

  #[test]
  fn defaults() {
    let c = config(&[]).unwrap();
    assert_eq!(c.database_url, "sqlite://data/app.db");
    assert_eq!(c.server_port, 8080);
    assert_eq!(c.job_timeout, Duration::from_secs(600));
    assert_eq!(c.schedule_overlap, OverlapPolicy::AlwaysFire);
    let q = c.queue_config(4);
    assert_eq!(q.concurrency, 4);
    assert_eq!(q.retry.max_attempts, 3);
    assert_eq!(q.retry.base_delay, Duration::from_secs(5));
    assert_eq!(q.release_after, Duration::from_secs(1800));
  }

  #[test]
  fn overrides_and_bad_values() {
    let c = config(&[("SERVER_PORT", "9000"), ("SCHEDULE_OVERLAP", "skip"), ("JOB_MAX_ATTEMPTS", "5")]).unwrap();
    assert_eq!(c.server_port, 9000);
    assert_eq!(c.schedule_overlap, OverlapPolicy::SkipIfInFlight);
    assert_eq!(c.job_max_attempts, 5);

    assert!(config(&[("SERVER_PORT", "eighty")]).is_err());
    assert!(config(&[("SERVER_PORT", "70000")]).is_err());
    assert!(config(&[("JOB_MAX_ATTEMPTS", "0")]).is_err());
    assert!(config(&[("SCHEDULE_OVERLAP", "sometimes")]).is_err());
  }

  #[test]
  fn claims_must_outlast_the_job_timeout() {
    assert!(config(&[("JOB_TIMEOUT_SECS", "600"), ("JOB_RELEASE_AFTER_SECS", "60")]).is_err());
    assert!(config(&[("JOB_TIMEOUT_SECS", "600"), ("JOB_RELEASE_AFTER_SECS", "600")]).is_err());
    let c = config(&[("JOB_TIMEOUT_SECS", "60"), ("JOB_RELEASE_AFTER_SECS", "120")]).unwrap();
    assert_eq!(c.queue_config(1).claim_duration(), Duration::from_secs(120));
  }
}
