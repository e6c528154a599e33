use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio_retry::strategy::ExponentialBackoff;
use tracing_subscriber::EnvFilter;

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

/// Backoff used when connecting to Postgres or RabbitMQ and when publishing.
pub fn retry_strategy() -> std::iter::Take<ExponentialBackoff> {
  ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES)
}

/// Installs the fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSettings {
  pub monitor_timeout: Duration,
  pub max_retries: u32,
  pub retry_delay: Duration,
  /// Tasks older than this are dropped without running.
  pub task_expiration: Option<Duration>,
  pub queue_wait_time: Duration,
}

impl Default for ProbeSettings {
  fn default() -> Self {
    Self {
      monitor_timeout: Duration::from_secs(30),
      max_retries: 2,
      retry_delay: Duration::from_secs(30),
      task_expiration: None,
      queue_wait_time: Duration::from_secs(20),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
  pub interval: Duration,
  pub lock_duration: Duration,
  pub lock_backoff: Duration,
  pub lock_name: String,
  pub use_lock: bool,
  pub nodes_path: PathBuf,
  pub resources_path: PathBuf,
}

impl Default for SchedulerSettings {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(300),
      lock_duration: Duration::from_secs(120),
      lock_backoff: Duration::from_secs(10),
      lock_name: "scheduler_lock".into(),
      use_lock: true,
      nodes_path: "config/nodes.json".into(),
      resources_path: "config/resources.json".into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReactorSettings {
  pub queue_name: String,
  pub queue_wait_time: Duration,
  pub handlers_path: PathBuf,
}

impl Default for ReactorSettings {
  fn default() -> Self {
    Self {
      queue_name: "vigil_reactor".into(),
      queue_wait_time: Duration::from_secs(20),
      handlers_path: "config/handlers.json".into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuppressSettings {
  pub cache_ttl: Duration,
}

impl Default for SuppressSettings {
  fn default() -> Self {
    Self { cache_ttl: Duration::from_secs(60) }
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_port: u16,
  pub task_queue: String,
  pub results_topic: String,
  pub state_domain: String,
  pub lock_domain: String,
  pub suppress_domain: String,
  pub results_domain: String,
  pub probe: ProbeSettings,
  pub scheduler: SchedulerSettings,
  pub reactor: ReactorSettings,
  pub suppress: SuppressSettings,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let env = Env { lookup: &lookup };

    let probe_defaults = ProbeSettings::default();
    let probe = ProbeSettings {
      monitor_timeout: env.secs("VIGIL_MONITOR_TIMEOUT", probe_defaults.monitor_timeout)?,
      max_retries: env.parse("VIGIL_MAX_RETRIES", probe_defaults.max_retries)?,
      retry_delay: env.secs("VIGIL_RETRY_DELAY", probe_defaults.retry_delay)?,
      task_expiration: match env.parse::<u64>("VIGIL_TASK_EXPIRATION", 0)? {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
      },
      queue_wait_time: env.secs("VIGIL_PROBE_QUEUE_WAIT", probe_defaults.queue_wait_time)?,
    };

    let scheduler_defaults = SchedulerSettings::default();
    let scheduler = SchedulerSettings {
      interval: env.secs("VIGIL_SCHEDULER_INTERVAL", scheduler_defaults.interval)?,
      lock_duration: env.secs("VIGIL_LOCK_DURATION", scheduler_defaults.lock_duration)?,
      lock_backoff: env.secs("VIGIL_LOCK_BACKOFF", scheduler_defaults.lock_backoff)?,
      lock_name: env.string("VIGIL_LOCK_NAME", &scheduler_defaults.lock_name),
      use_lock: env.flag("VIGIL_USE_LOCK", scheduler_defaults.use_lock)?,
      nodes_path: env.string("VIGIL_NODES_PATH", "config/nodes.json").into(),
      resources_path: env.string("VIGIL_RESOURCES_PATH", "config/resources.json").into(),
    };
    if scheduler.interval.is_zero() {
      return Err(anyhow!("VIGIL_SCHEDULER_INTERVAL must be greater than zero"));
    }

    let reactor_defaults = ReactorSettings::default();
    let reactor = ReactorSettings {
      queue_name: env.string("VIGIL_REACTOR_QUEUE", &reactor_defaults.queue_name),
      queue_wait_time: env.secs("VIGIL_REACTOR_QUEUE_WAIT", reactor_defaults.queue_wait_time)?,
      handlers_path: env.string("VIGIL_HANDLERS_PATH", "config/handlers.json").into(),
    };

    let suppress = SuppressSettings {
      cache_ttl: env.secs("VIGIL_SUPPRESS_CACHE_TTL", SuppressSettings::default().cache_ttl)?,
    };

    Ok(Self {
      database_url: env.required("DATABASE_URL")?,
      rabbitmq_url: env.required("RABBITMQ_URL")?,
      server_port: env.parse("SERVER_PORT", 8080)?,
      task_queue: env.string("VIGIL_TASK_QUEUE", "vigil_tasks"),
      results_topic: env.string("VIGIL_RESULTS_TOPIC", "vigil_results"),
      state_domain: env.string("VIGIL_STATE_DOMAIN", "vigil_state"),
      lock_domain: env.string("VIGIL_LOCK_DOMAIN", "vigil_locks"),
      suppress_domain: env.string("VIGIL_SUPPRESS_DOMAIN", "vigil_suppressions"),
      results_domain: env.string("VIGIL_RESULTS_DOMAIN", "vigil_results"),
      probe,
      scheduler,
      reactor,
      suppress,
    })
  }
}

struct Env<'a> {
  lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
  fn get(&self, key: &str) -> Option<String> {
    (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
  }

  fn required(&self, key: &str) -> Result<String> {
    self.get(key).ok_or_else(|| anyhow!("{} must be set", key))
  }

  fn string(&self, key: &str, default: &str) -> String {
    self.get(key).unwrap_or_else(|| default.to_string())
  }

  fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
    match self.get(key) {
      Some(raw) => raw.parse().map_err(|_| anyhow!("invalid value for {}: {:?}", key, raw)),
      None => Ok(default),
    }
  }

  fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
    self.parse(key, default.as_secs()).map(Duration::from_secs)
  }

  fn flag(&self, key: &str, default: bool) -> Result<bool> {
    match self.get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
      None => Ok(default),
      Some("1" | "true" | "yes" | "on") => Ok(true),
      Some("0" | "false" | "no" | "off") => Ok(false),
      Some(other) => Err(anyhow!("invalid value for {}: {:?}", key, other)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;
  use tokio_test::{assert_err, assert_ok};

  fn config(pairs: &[(&str, &str)]) -> Result<Config> {
    let mut vars: HashMap<String, String> = HashMap::from([
      ("DATABASE_URL".to_string(), "postgres://localhost/vigil".to_string()),
      ("RABBITMQ_URL".to_string(), "amqp://localhost".to_string()),
    ]);
    for (k, v) in pairs {
      vars.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(|key| vars.get(key).cloned())
  }

  #[test]
  fn defaults_apply_when_unset() {
    let config = assert_ok!(config(&[]));
    assert_eq!(config.server_port, 8080);
    assert_eq!(config.probe, ProbeSettings::default());
    assert_eq!(config.scheduler, SchedulerSettings::default());
    assert_eq!(config.reactor, ReactorSettings::default());
    assert_eq!(config.suppress.cache_ttl, Duration::from_secs(60));
    assert!(config.probe.task_expiration.is_none());
  }

  #[test]
  fn overrides_are_parsed() {
    let config = config(&[
      ("VIGIL_MAX_RETRIES", "5"),
      ("VIGIL_RETRY_DELAY", "0"),
      ("VIGIL_TASK_EXPIRATION", "600"),
      ("VIGIL_USE_LOCK", "false"),
      ("VIGIL_LOCK_NAME", "primary"),
      ("SERVER_PORT", "9000"),
    ]);
    let config = assert_ok!(config);
    assert_eq!(config.probe.max_retries, 5);
    assert_eq!(config.probe.retry_delay, Duration::ZERO);
    assert_eq!(config.probe.task_expiration, Some(Duration::from_secs(600)));
    assert!(!config.scheduler.use_lock);
    assert_eq!(config.scheduler.lock_name, "primary");
    assert_eq!(config.server_port, 9000);
  }

  #[test]
  fn invalid_values_are_errors() {
    assert_err!(config(&[("VIGIL_MAX_RETRIES", "-1")]));
    assert_err!(config(&[("VIGIL_USE_LOCK", "maybe")]));
    assert_err!(config(&[("VIGIL_SCHEDULER_INTERVAL", "0")]));
  }

  #[test]
  fn retry_strategy_is_bounded() {
    let delays: Vec<Duration> = retry_strategy().collect();
    assert_eq!(delays.len(), MAX_RETRIES);
    assert_eq!(delays[0], Duration::from_millis(DELAY));
    assert!(delays.windows(2).all(|w| w[0] < w[1]));
  }

  #[test]
  fn connection_urls_are_required() {
    assert_err!(Config::from_lookup(|_| None));
  }
}
