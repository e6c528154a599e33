//! Probe: runs checks pulled off the task queue and publishes their results.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::ProbeSettings;
use crate::executor::{CheckExecutor, CheckOutcome};
use crate::messaging::MessageBus;
use crate::models::{CheckResult, State, StateRecord, StateType, Task};
use crate::state::StateStore;

/// How a result should be typed and whether the task goes back on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
  pub state_type: StateType,
  pub resubmit: bool,
}

/// The SOFT/HARD state machine.
///
/// A recovery is SOFT only while the failure it recovers from was never
/// confirmed. A failure is SOFT and retried while attempts remain, unless the
/// check is already in a confirmed (HARD) failing state.
pub fn decide(state: State, previous: Option<&StateRecord>, attempt: u32, max_retries: u32) -> Verdict {
  if state == State::Ok {
    let soft = previous.is_some_and(|p| p.state != State::Ok && p.state_type == StateType::Soft);
    return Verdict { state_type: if soft { StateType::Soft } else { StateType::Hard }, resubmit: false };
  }

  let current_attempt = attempt.saturating_add(1);
  let may_soften = match previous {
    None => true,
    Some(p) => p.state_type == StateType::Soft || p.state == State::Ok,
  };
  if current_attempt <= max_retries && may_soften {
    Verdict { state_type: StateType::Soft, resubmit: true }
  } else {
    Verdict { state_type: StateType::Hard, resubmit: false }
  }
}

pub struct Probe {
  states: Arc<StateStore>,
  bus: Arc<dyn MessageBus>,
  executor: Arc<dyn CheckExecutor>,
  settings: ProbeSettings,
  task_queue: String,
  results_topic: String,
}

impl Probe {
  pub fn new(
    states: Arc<StateStore>,
    bus: Arc<dyn MessageBus>,
    executor: Arc<dyn CheckExecutor>,
    settings: ProbeSettings,
    task_queue: &str,
    results_topic: &str,
  ) -> Self {
    debug!("Probe initialized for queue {}", task_queue);
    Self {
      states,
      bus,
      executor,
      settings,
      task_queue: task_queue.to_string(),
      results_topic: results_topic.to_string(),
    }
  }

  /// Runs one task and publishes its result. Returns `None` when the task
  /// had expired and was dropped.
  pub async fn handle_task(&self, task: &Task) -> Result<Option<CheckResult>> {
    let now = Utc::now();
    if let Some(expiration) = self.settings.task_expiration {
      let age = task.age(now);
      if age.to_std().is_ok_and(|age| age > expiration) {
        warn!(check = %task.id, "Task is {}s old, dropping", age.num_seconds());
        return Ok(None);
      }
    }

    let previous = self.states.get(&task.id).await?;

    let timeout = task
      .context_u64("monitor_timeout")
      .map(Duration::from_secs)
      .unwrap_or(self.settings.monitor_timeout);
    let max_retries = task
      .context_u64("max_retries")
      .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
      .unwrap_or(self.settings.max_retries);
    let retry_delay = task
      .context_u64("retry_delay")
      .map(Duration::from_secs)
      .unwrap_or(self.settings.retry_delay);

    debug!(check = %task.id, "attempt {}, executing (timeout {}s)", task.attempt + 1, timeout.as_secs());
    let outcome = CheckOutcome::from_run(self.executor.run(&task.context, timeout).await);
    let verdict = decide(outcome.state, previous.as_ref(), task.attempt, max_retries);

    if verdict.resubmit {
      let mut retry = task.clone();
      retry.increment_attempt();
      debug!(check = %task.id, "resubmitting as attempt {} in {}s", retry.attempt + 1, retry_delay.as_secs());
      self
        .bus
        .send(&self.task_queue, &serde_json::to_vec(&retry)?, retry_delay)
        .await?;
    } else if outcome.state != State::Ok && verdict.state_type == StateType::Hard {
      debug!(check = %task.id, "retry limit hit or state already confirmed, not resubmitting");
    }

    let result = CheckResult {
      id: task.id.clone(),
      timestamp: Utc::now(),
      state: outcome.state,
      state_type: verdict.state_type,
      output: outcome.output,
      task_context: task.context.clone(),
    };
    self.bus.publish(&self.results_topic, &serde_json::to_vec(&result)?).await?;
    info!(check = %result.id, "result {}/{}", result.state, result.state_type);
    Ok(Some(result))
  }

  /// Pulls one message and handles it. Malformed tasks are acked and skipped;
  /// a task whose handling failed is rejected so it is redelivered.
  pub async fn poll(&self) -> Result<bool> {
    let Some(envelope) = self.bus.receive(&self.task_queue, self.settings.queue_wait_time).await? else {
      debug!("Task queue is empty");
      return Ok(false);
    };

    let task = match Task::from_slice(&envelope.body) {
      Ok(task) => task,
      Err(e) => {
        error!("Skipping malformed task: {}", e);
        envelope.ack().await?;
        return Ok(true);
      }
    };

    match self.handle_task(&task).await {
      Ok(_) => envelope.ack().await?,
      Err(e) => {
        error!(check = %task.id, "Failed to handle task: {:?}", e);
        envelope.reject().await?;
      }
    }
    Ok(true)
  }

  pub async fn run(&self) -> Result<()> {
    info!("Probe consuming from {}", self.task_queue);
    loop {
      if let Err(e) = self.poll().await {
        error!("Probe loop error: {:?}", e);
        tokio::time::sleep(Duration::from_secs(1)).await;
      }
    }
  }
}
