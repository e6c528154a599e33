//! Reactor handlers, their filters, and the table of built-in handler
//! classes.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{CheckResult, State, StateRecord, StateType};
use crate::store::{Expectation, Filter, Item, KeyValueStore, Select, encode_time, required, required_time};

#[async_trait]
pub trait Handler: Send + Sync {
  async fn process(&self, result: &CheckResult, previous: Option<&StateRecord>) -> Result<()>;
}

pub type Predicate = dyn Fn(&CheckResult, Option<&StateRecord>) -> bool + Send + Sync;

/// Decides whether a handler reacts to a result.
#[derive(Clone)]
pub enum ResultFilter {
  AlwaysTrue,
  HardState,
  /// New check, or state or state type differs from the previous record.
  ChangedState,
  OkState,
  WarningState,
  CriticalState,
  UnknownState,
  NotOkState,
  PassiveCommand,
  ActiveCommand,
  /// Rejects SOFT OK results that follow a SOFT state.
  NotSoftRecovery,
  Custom(String, Arc<Predicate>),
}

impl fmt::Debug for ResultFilter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ResultFilter::Custom(name, _) => write!(f, "Custom({})", name),
      other => f.write_str(other.name()),
    }
  }
}

impl ResultFilter {
  pub fn from_name(name: &str) -> Option<Self> {
    let filter = match name {
      "always_true" => ResultFilter::AlwaysTrue,
      "hard_state" => ResultFilter::HardState,
      "changed_state" => ResultFilter::ChangedState,
      "ok_state" => ResultFilter::OkState,
      "warning_state" => ResultFilter::WarningState,
      "critical_state" => ResultFilter::CriticalState,
      "unknown_state" => ResultFilter::UnknownState,
      "not_ok_state" => ResultFilter::NotOkState,
      "passive_command" => ResultFilter::PassiveCommand,
      "active_command" => ResultFilter::ActiveCommand,
      "not_soft_recovery" => ResultFilter::NotSoftRecovery,
      _ => return None,
    };
    Some(filter)
  }

  pub fn name(&self) -> &str {
    match self {
      ResultFilter::AlwaysTrue => "always_true",
      ResultFilter::HardState => "hard_state",
      ResultFilter::ChangedState => "changed_state",
      ResultFilter::OkState => "ok_state",
      ResultFilter::WarningState => "warning_state",
      ResultFilter::CriticalState => "critical_state",
      ResultFilter::UnknownState => "unknown_state",
      ResultFilter::NotOkState => "not_ok_state",
      ResultFilter::PassiveCommand => "passive_command",
      ResultFilter::ActiveCommand => "active_command",
      ResultFilter::NotSoftRecovery => "not_soft_recovery",
      ResultFilter::Custom(name, _) => name.as_str(),
    }
  }

  pub fn matches(&self, result: &CheckResult, previous: Option<&StateRecord>) -> bool {
    match self {
      ResultFilter::AlwaysTrue => true,
      ResultFilter::HardState => result.state_type == StateType::Hard,
      ResultFilter::ChangedState => {
        previous.is_none_or(|p| p.state != result.state || p.state_type != result.state_type)
      }
      ResultFilter::OkState => result.state == State::Ok,
      ResultFilter::WarningState => result.state == State::Warning,
      ResultFilter::CriticalState => result.state == State::Critical,
      ResultFilter::UnknownState => result.state.code() >= State::Unknown.code(),
      ResultFilter::NotOkState => result.state != State::Ok,
      ResultFilter::PassiveCommand => result.command_type() == Some("passive"),
      ResultFilter::ActiveCommand => result.command_type() != Some("passive"),
      ResultFilter::NotSoftRecovery => !(previous.is_some_and(|p| p.state_type == StateType::Soft)
        && result.state_type == StateType::Soft
        && result.state == State::Ok),
      ResultFilter::Custom(_, predicate) => predicate(result, previous),
    }
  }
}

fn default_suppress() -> bool {
  true
}

/// One entry of the handlers document.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerConfig {
  pub name: String,
  pub handler_class: String,
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub filters: Vec<String>,
  #[serde(default = "default_suppress")]
  pub suppress: bool,
  #[serde(flatten)]
  pub options: serde_json::Map<String, serde_json::Value>,
}

pub async fn load_handler_configs(path: &Path) -> Result<Vec<HandlerConfig>> {
  let raw = tokio::fs::read(path)
    .await
    .with_context(|| format!("reading handler config {}", path.display()))?;
  serde_json::from_slice(&raw).with_context(|| format!("parsing handler config {}", path.display()))
}

/// A handler ready to run: its filter chain (all must pass) and whether
/// suppressed results are skipped.
pub struct ConfiguredHandler {
  pub name: String,
  pub filters: Vec<ResultFilter>,
  pub suppress: bool,
  pub handler: Arc<dyn Handler>,
}

impl ConfiguredHandler {
  pub fn accepts(&self, result: &CheckResult, previous: Option<&StateRecord>) -> bool {
    self.filters.iter().all(|f| {
      let passed = f.matches(result, previous);
      if !passed {
        debug!(check = %result.id, handler = %self.name, "filter {} returned false", f.name());
      }
      passed
    })
  }
}

pub type HandlerFactory = Box<dyn Fn(&HandlerConfig) -> Result<Arc<dyn Handler>> + Send + Sync>;

/// Maps `handler_class` names onto constructors.
#[derive(Default)]
pub struct HandlerRegistry {
  factories: HashMap<String, HandlerFactory>,
  filters: HashMap<String, ResultFilter>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// `log` and `archive`, the latter writing into `results_domain`.
  pub fn with_builtins(store: Arc<dyn KeyValueStore>, results_domain: &str) -> Self {
    let mut registry = Self::new();
    registry.register("log", Box::new(|config: &HandlerConfig| Ok(Arc::new(LogHandler::new(config)) as Arc<dyn Handler>)));
    let archive = Arc::new(ResultArchive::new(store, results_domain));
    registry.register(
      "archive",
      Box::new(move |_: &HandlerConfig| Ok(Arc::new(ArchiveHandler::new(archive.clone())) as Arc<dyn Handler>)),
    );
    registry
  }

  pub fn register(&mut self, class: &str, factory: HandlerFactory) {
    self.factories.insert(class.to_string(), factory);
  }

  pub fn register_filter(&mut self, name: &str, predicate: Arc<Predicate>) {
    self.filters.insert(name.to_string(), ResultFilter::Custom(name.to_string(), predicate));
  }

  fn filter(&self, name: &str) -> Option<ResultFilter> {
    ResultFilter::from_name(name).or_else(|| self.filters.get(name).cloned())
  }

  /// Builds the enabled handlers. Unknown classes or filters are errors, as
  /// is a configuration with nothing enabled.
  pub fn build(&self, configs: &[HandlerConfig]) -> Result<Vec<ConfiguredHandler>> {
    let mut handlers = Vec::new();
    for config in configs {
      if !config.enabled {
        debug!("Handler {} 'enabled' is not set to true, skipping", config.name);
        continue;
      }
      let factory = self
        .factories
        .get(&config.handler_class)
        .ok_or_else(|| anyhow!("handler {}: unknown handler class {}", config.name, config.handler_class))?;
      let filters = config
        .filters
        .iter()
        .map(|name| self.filter(name).ok_or_else(|| anyhow!("handler {}: unknown filter {}", config.name, name)))
        .collect::<Result<Vec<_>>>()?;
      info!("Initializing handler {} ({})", config.name, config.handler_class);
      handlers.push(ConfiguredHandler {
        name: config.name.clone(),
        filters,
        suppress: config.suppress,
        handler: factory(config)?,
      });
    }
    if handlers.is_empty() {
      bail!("no handlers loaded");
    }
    Ok(handlers)
  }
}

/// Writes alert lines to the `vigil::alert` tracing target.
pub struct LogHandler {
  prefix: String,
}

impl LogHandler {
  pub fn new(config: &HandlerConfig) -> Self {
    let prefix = config
      .options
      .get("prefix")
      .and_then(|v| v.as_str())
      .unwrap_or("ALERT")
      .to_string();
    Self { prefix }
  }
}

#[async_trait]
impl Handler for LogHandler {
  async fn process(&self, result: &CheckResult, _previous: Option<&StateRecord>) -> Result<()> {
    let line = serde_json::to_string(result)?;
    info!(target: "vigil::alert", check = %result.id, "{} {}", self.prefix, line);
    Ok(())
  }
}

/// Archived non-OK results, read back by the HTTP API.
pub struct ResultArchive {
  store: Arc<dyn KeyValueStore>,
  domain: String,
}

impl ResultArchive {
  pub fn new(store: Arc<dyn KeyValueStore>, domain: &str) -> Self {
    Self { store, domain: domain.to_string() }
  }

  pub fn key(result: &CheckResult) -> String {
    format!("{}-{}", result.id, result.timestamp.timestamp_micros())
  }

  /// OK results are not archived. Returns the key when something was written.
  pub async fn record(&self, result: &CheckResult) -> Result<Option<String>> {
    if result.state == State::Ok {
      return Ok(None);
    }
    let key = Self::key(result);
    let mut item = Item::new();
    item.insert("id".into(), result.id.clone());
    item.insert("timestamp".into(), encode_time(result.timestamp));
    item.insert("state".into(), result.state.code().to_string());
    item.insert("state_type".into(), result.state_type.code().to_string());
    item.insert("output".into(), result.output.clone());
    item.insert("task_context".into(), serde_json::to_string(&result.task_context)?);
    self.store.put(&self.domain, &key, item, Expectation::Unconditional).await?;
    debug!("Added {} to {}", key, self.domain);
    Ok(Some(key))
  }

  /// Most recent first.
  pub async fn recent(&self, limit: usize) -> Result<Vec<CheckResult>, StoreError> {
    let select = Select::all()
      .filter(Filter::Present("timestamp".into()))
      .order_by("timestamp")
      .descending()
      .limit(limit);
    let rows = self.store.select(&self.domain, &select).await?;
    rows
      .into_iter()
      .map(|(key, item)| {
        decode_result(&item).map_err(|reason| StoreError::Decode { domain: self.domain.clone(), key, reason })
      })
      .collect()
  }
}

fn decode_result(item: &Item) -> Result<CheckResult, String> {
  let decode = || -> Result<CheckResult, crate::error::DataError> {
    Ok(CheckResult {
      id: required(item, "id")?.to_string(),
      timestamp: required_time(item, "timestamp")?,
      state: required(item, "state")?.parse()?,
      state_type: required(item, "state_type")?.parse()?,
      output: item.get("output").cloned().unwrap_or_default(),
      task_context: item
        .get("task_context")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default(),
    })
  };
  decode().map_err(|e| e.to_string())
}

pub struct ArchiveHandler {
  archive: Arc<ResultArchive>,
}

impl ArchiveHandler {
  pub fn new(archive: Arc<ResultArchive>) -> Self {
    Self { archive }
  }
}

#[async_trait]
impl Handler for ArchiveHandler {
  async fn process(&self, result: &CheckResult, _previous: Option<&StateRecord>) -> Result<()> {
    self.archive.record(result).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{SCHEMA_VERSION, TaskContext};
  use crate::store::MemoryStore;
  use chrono::{Duration, Utc};
  use serde_json::json;

  fn result(state: State, state_type: StateType) -> CheckResult {
    CheckResult {
      id: "n1:http".into(),
      timestamp: Utc::now(),
      state,
      state_type,
      output: "out".into(),
      task_context: TaskContext::new(),
    }
  }

  fn record(state: State, state_type: StateType) -> StateRecord {
    let now = Utc::now();
    StateRecord {
      id: "n1:http".into(),
      last_update: now,
      last_state_change: now,
      state,
      state_type,
      version: SCHEMA_VERSION,
    }
  }

  fn configs(value: serde_json::Value) -> Vec<HandlerConfig> {
    serde_json::from_value(value).unwrap()
  }

  #[test]
  fn state_filters() {
    let crit = result(State::Critical, StateType::Hard);
    assert!(ResultFilter::HardState.matches(&crit, None));
    assert!(ResultFilter::CriticalState.matches(&crit, None));
    assert!(ResultFilter::NotOkState.matches(&crit, None));
    assert!(!ResultFilter::OkState.matches(&crit, None));
    assert!(ResultFilter::UnknownState.matches(&result(State::Unknown, StateType::Soft), None));
    assert!(!ResultFilter::UnknownState.matches(&crit, None));
  }

  #[test]
  fn changed_state_compares_state_and_type() {
    let crit = result(State::Critical, StateType::Hard);
    assert!(ResultFilter::ChangedState.matches(&crit, None));
    assert!(ResultFilter::ChangedState.matches(&crit, Some(&record(State::Critical, StateType::Soft))));
    assert!(!ResultFilter::ChangedState.matches(&crit, Some(&record(State::Critical, StateType::Hard))));
  }

  #[test]
  fn soft_recovery_is_filtered() {
    let soft_ok = result(State::Ok, StateType::Soft);
    let prev = record(State::Critical, StateType::Soft);
    assert!(!ResultFilter::NotSoftRecovery.matches(&soft_ok, Some(&prev)));
    assert!(ResultFilter::NotSoftRecovery.matches(&result(State::Ok, StateType::Hard), Some(&prev)));
    assert!(ResultFilter::NotSoftRecovery.matches(&soft_ok, None));
  }

  #[test]
  fn command_type_filters_read_the_task_context() {
    let mut passive = result(State::Ok, StateType::Hard);
    passive.task_context.insert("command_type".into(), json!("passive"));
    assert!(ResultFilter::PassiveCommand.matches(&passive, None));
    assert!(!ResultFilter::ActiveCommand.matches(&passive, None));
    assert!(ResultFilter::ActiveCommand.matches(&result(State::Ok, StateType::Hard), None));
  }

  #[test]
  fn build_skips_disabled_and_rejects_unknown_names() {
    let registry = HandlerRegistry::with_builtins(Arc::new(MemoryStore::new()), "results");
    let handlers = registry
      .build(&configs(json!([
        {"name": "alerts", "handler_class": "log", "enabled": true, "filters": ["hard_state", "changed_state"]},
        {"name": "off", "handler_class": "log"},
        {"name": "archive", "handler_class": "archive", "enabled": true, "suppress": false},
      ])))
      .unwrap();
    assert_eq!(handlers.len(), 2);
    assert_eq!(handlers[0].filters.len(), 2);
    assert!(handlers[0].suppress);
    assert!(!handlers[1].suppress);

    assert!(registry.build(&configs(json!([{"name": "x", "handler_class": "pager", "enabled": true}]))).is_err());
    assert!(
      registry
        .build(&configs(json!([{"name": "x", "handler_class": "log", "enabled": true, "filters": ["nope"]}])))
        .is_err()
    );
    assert!(registry.build(&configs(json!([{"name": "off", "handler_class": "log"}]))).is_err());
  }

  #[test]
  fn custom_filters_can_be_registered() {
    let mut registry = HandlerRegistry::with_builtins(Arc::new(MemoryStore::new()), "results");
    registry.register_filter("web_only", Arc::new(|r: &CheckResult, _: Option<&StateRecord>| r.id.starts_with("www")));
    let handlers = registry
      .build(&configs(json!([{"name": "web", "handler_class": "log", "enabled": true, "filters": ["web_only"]}])))
      .unwrap();
    assert!(!handlers[0].accepts(&result(State::Critical, StateType::Hard), None));
  }

  #[tokio::test]
  async fn archive_keeps_only_non_ok_results() {
    let archive = ResultArchive::new(Arc::new(MemoryStore::new()), "results");
    assert!(archive.record(&result(State::Ok, StateType::Hard)).await.unwrap().is_none());

    let mut older = result(State::Warning, StateType::Soft);
    older.timestamp = Utc::now() - Duration::minutes(1);
    let newer = result(State::Critical, StateType::Hard);
    let key = archive.record(&older).await.unwrap().unwrap();
    assert!(key.starts_with("n1:http-"));
    archive.record(&newer).await.unwrap();

    let recent = archive.recent(10).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].state, State::Critical);
    assert_eq!(recent[1].state, State::Warning);
    assert_eq!(archive.recent(1).await.unwrap().len(), 1);
  }
}
