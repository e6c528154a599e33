//! Reactor: consumes published results, runs handlers and records state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::ReactorSettings;
use crate::handlers::ConfiguredHandler;
use crate::messaging::MessageBus;
use crate::models::{CheckResult, Suppression};
use crate::state::{SaveOutcome, StateStore};
use crate::suppress::SuppressionFilter;

pub struct Reactor {
  handlers: Vec<ConfiguredHandler>,
  states: Arc<StateStore>,
  suppressions: Arc<SuppressionFilter>,
  bus: Arc<dyn MessageBus>,
  settings: ReactorSettings,
  results_topic: String,
}

impl Reactor {
  pub fn new(
    handlers: Vec<ConfiguredHandler>,
    states: Arc<StateStore>,
    suppressions: Arc<SuppressionFilter>,
    bus: Arc<dyn MessageBus>,
    settings: ReactorSettings,
    results_topic: &str,
  ) -> Result<Self> {
    if handlers.is_empty() {
      bail!("no handlers loaded");
    }
    debug!("Reactor initialized with {} handlers", handlers.len());
    Ok(Self {
      handlers,
      states,
      suppressions,
      bus,
      settings,
      results_topic: results_topic.to_string(),
    })
  }

  async fn suppressed_by(&self, result: &CheckResult) -> Option<Suppression> {
    match self.suppressions.is_suppressed(&result.id, Utc::now()).await {
      Ok(found) => found,
      Err(e) => {
        // treated as not suppressed
        error!(check = %result.id, "Suppression lookup failed: {}", e);
        None
      }
    }
  }

  /// Runs every accepting handler, then saves the new state. A failing
  /// handler does not stop the others.
  pub async fn handle_result(&self, result: &CheckResult) -> Result<SaveOutcome> {
    let previous = self.states.get(&result.id).await?;

    let mut suppression: Option<Option<Suppression>> = None;
    for handler in &self.handlers {
      if !handler.accepts(result, previous.as_ref()) {
        continue;
      }
      if handler.suppress {
        if suppression.is_none() {
          suppression = Some(self.suppressed_by(result).await);
        }
        if let Some(Some(s)) = &suppression {
          debug!(check = %result.id, handler = %handler.name, "suppressed by {} ({})", s.rowkey, s.regex);
          continue;
        }
      }
      debug!(check = %result.id, handler = %handler.name, "reacting");
      if let Err(e) = handler.handler.process(result, previous.as_ref()).await {
        error!(check = %result.id, handler = %handler.name, "Unhandled handler error: {:?}", e);
      }
    }

    let outcome = self.states.save(&result.id, result, previous.as_ref()).await?;
    if let SaveOutcome::Stale(stale) = &outcome {
      warn!(
        check = %result.id,
        "Discarding out of date result ({} < {})",
        stale.current.last_update,
        stale.previous.last_update
      );
    }
    Ok(outcome)
  }

  /// Pulls one result. Malformed results are acked and skipped; a result
  /// whose handling failed is rejected so it is redelivered.
  pub async fn poll(&self) -> Result<bool> {
    let Some(envelope) = self.bus.receive(&self.settings.queue_name, self.settings.queue_wait_time).await? else {
      debug!("Result queue empty");
      return Ok(false);
    };

    let result = match CheckResult::from_slice(&envelope.body) {
      Ok(result) => result,
      Err(e) => {
        error!("Skipping malformed result: {}", e);
        envelope.ack().await?;
        return Ok(true);
      }
    };

    match self.handle_result(&result).await {
      Ok(_) => envelope.ack().await?,
      Err(e) => {
        error!(check = %result.id, "Failed to handle result: {:?}", e);
        envelope.reject().await?;
      }
    }
    Ok(true)
  }

  pub async fn run(&self) -> Result<()> {
    self.bus.subscribe(&self.results_topic, &self.settings.queue_name).await?;
    info!("Reactor consuming {} via {}", self.results_topic, self.settings.queue_name);
    loop {
      if let Err(e) = self.poll().await {
        error!("Reactor loop error: {:?}", e);
        tokio::time::sleep(Duration::from_secs(1)).await;
      }
    }
  }
}
