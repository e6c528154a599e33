use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::error::DataError;

/// Schema version stamped on state and suppression rows.
pub const SCHEMA_VERSION: i64 = 2;

pub type TaskContext = serde_json::Map<String, serde_json::Value>;

/// Outcome of a single check, encoded on the wire as its Nagios-style code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum State {
  Ok = 0,
  Warning = 1,
  Critical = 2,
  Unknown = 3,
}

impl State {
  pub fn code(self) -> i64 {
    self as i64
  }

  pub fn name(self) -> &'static str {
    match self {
      State::Ok => "ok",
      State::Warning => "warning",
      State::Critical => "critical",
      State::Unknown => "unknown",
    }
  }

  /// Maps a failing command's exit code onto a state. Anything outside the
  /// warning/critical codes is unknown.
  pub fn from_exit_code(code: i32) -> State {
    match code {
      0 => State::Ok,
      1 => State::Warning,
      2 => State::Critical,
      _ => State::Unknown,
    }
  }
}

impl TryFrom<i64> for State {
  type Error = DataError;

  fn try_from(code: i64) -> Result<Self, Self::Error> {
    match code {
      0 => Ok(State::Ok),
      1 => Ok(State::Warning),
      2 => Ok(State::Critical),
      3 => Ok(State::Unknown),
      other => Err(DataError::InvalidState(other)),
    }
  }
}

impl From<State> for i64 {
  fn from(state: State) -> i64 {
    state.code()
  }
}

impl FromStr for State {
  type Err = DataError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Ok(code) = s.trim().parse::<i64>() {
      return State::try_from(code);
    }
    match s.trim().to_ascii_lowercase().as_str() {
      "ok" => Ok(State::Ok),
      "warning" | "warn" => Ok(State::Warning),
      "critical" | "crit" => Ok(State::Critical),
      "unknown" => Ok(State::Unknown),
      _ => Err(DataError::invalid("state", s)),
    }
  }
}

impl fmt::Display for State {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// SOFT results are intermediate retry outcomes; HARD results are
/// authoritative for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum StateType {
  Soft = 0,
  Hard = 1,
}

impl StateType {
  pub fn code(self) -> i64 {
    self as i64
  }

  pub fn name(self) -> &'static str {
    match self {
      StateType::Soft => "soft",
      StateType::Hard => "hard",
    }
  }
}

impl TryFrom<i64> for StateType {
  type Error = DataError;

  fn try_from(code: i64) -> Result<Self, Self::Error> {
    match code {
      0 => Ok(StateType::Soft),
      1 => Ok(StateType::Hard),
      other => Err(DataError::InvalidStateType(other)),
    }
  }
}

impl From<StateType> for i64 {
  fn from(state_type: StateType) -> i64 {
    state_type.code()
  }
}

impl FromStr for StateType {
  type Err = DataError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Ok(code) = s.trim().parse::<i64>() {
      return StateType::try_from(code);
    }
    match s.trim().to_ascii_lowercase().as_str() {
      "soft" => Ok(StateType::Soft),
      "hard" => Ok(StateType::Hard),
      _ => Err(DataError::invalid("state_type", s)),
    }
  }
}

impl fmt::Display for StateType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

pub fn task_id(node: &str, monitor: &str) -> String {
  format!("{}:{}", node, monitor)
}

/// A unit of work on the task queue: run one monitor against one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: String,
  #[serde(default = "Utc::now")]
  pub created: DateTime<Utc>,
  #[serde(default)]
  pub attempt: u32,
  #[serde(default)]
  pub context: TaskContext,
}

impl Task {
  pub fn new(id: impl Into<String>, context: TaskContext) -> Self {
    Self {
      id: id.into(),
      created: Utc::now(),
      attempt: 0,
      context,
    }
  }

  /// Builds a task whose id is derived from `node.name` and `monitor.name`
  /// in the context.
  pub fn from_context(context: TaskContext) -> Result<Self, DataError> {
    let node = context_name(&context, "node")?;
    let monitor = context_name(&context, "monitor")?;
    let id = task_id(&node, &monitor);
    Ok(Task::new(id, context))
  }

  pub fn from_slice(body: &[u8]) -> Result<Self, DataError> {
    let task: Task = serde_json::from_slice(body).map_err(|e| DataError::Malformed(e.to_string()))?;
    if task.id.is_empty() {
      return Err(DataError::MissingField("id".into()));
    }
    Ok(task)
  }

  pub fn increment_attempt(&mut self) {
    self.attempt += 1;
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.created
  }

  /// Reads a non-negative integer override from the task context.
  pub fn context_u64(&self, key: &str) -> Option<u64> {
    let value = self.context.get(key)?;
    value
      .as_u64()
      .or_else(|| value.as_i64().map(|v| v.max(0) as u64))
      .or_else(|| value.as_f64().map(|v| v.max(0.0) as u64))
  }
}

fn context_name(context: &TaskContext, key: &str) -> Result<String, DataError> {
  context
    .get(key)
    .and_then(|v| v.get("name"))
    .and_then(|v| v.as_str())
    .map(str::to_string)
    .ok_or_else(|| DataError::MissingField(format!("{}.name", key)))
}

/// The outcome of one probe attempt, published on the results topic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckResult {
  pub id: String,
  pub timestamp: DateTime<Utc>,
  pub state: State,
  pub state_type: StateType,
  #[serde(default)]
  pub output: String,
  #[serde(default)]
  pub task_context: TaskContext,
}

impl CheckResult {
  pub fn from_slice(body: &[u8]) -> Result<Self, DataError> {
    let result: CheckResult = serde_json::from_slice(body).map_err(|e| DataError::Malformed(e.to_string()))?;
    if result.id.is_empty() {
      return Err(DataError::MissingField("id".into()));
    }
    Ok(result)
  }

  /// `command_type` is either set directly on the context or nested under
  /// the command resource.
  pub fn command_type(&self) -> Option<&str> {
    self
      .task_context
      .get("command_type")
      .or_else(|| self.task_context.get("command").and_then(|c| c.get("command_type")))
      .and_then(|v| v.as_str())
  }
}

impl Serialize for CheckResult {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut s = serializer.serialize_struct("CheckResult", 8)?;
    s.serialize_field("id", &self.id)?;
    s.serialize_field("timestamp", &self.timestamp)?;
    s.serialize_field("state", &self.state)?;
    s.serialize_field("state_name", self.state.name())?;
    s.serialize_field("state_type", &self.state_type)?;
    s.serialize_field("state_type_name", self.state_type.name())?;
    s.serialize_field("output", &self.output)?;
    s.serialize_field("task_context", &self.task_context)?;
    s.end()
  }
}

/// Last known state of a single check.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
  pub id: String,
  pub last_update: DateTime<Utc>,
  pub last_state_change: DateTime<Utc>,
  pub state: State,
  pub state_type: StateType,
  pub version: i64,
}

impl Serialize for StateRecord {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut s = serializer.serialize_struct("StateRecord", 8)?;
    s.serialize_field("id", &self.id)?;
    s.serialize_field("last_update", &self.last_update)?;
    s.serialize_field("last_state_change", &self.last_state_change)?;
    s.serialize_field("state", &self.state)?;
    s.serialize_field("state_name", self.state.name())?;
    s.serialize_field("state_type", &self.state_type)?;
    s.serialize_field("state_type_name", self.state_type.name())?;
    s.serialize_field("version", &self.version)?;
    s.end()
  }
}

/// Lease held by the active scheduler. `expiry` and `timestamp` are unix
/// seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
  pub lock_name: String,
  pub owner: Uuid,
  pub expiry: i64,
  pub timestamp: i64,
}

impl LockRecord {
  pub fn is_expired(&self, now: i64) -> bool {
    now > self.expiry
  }
}

fn default_version() -> i64 {
  SCHEMA_VERSION
}

/// Operator-defined mute rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suppression {
  #[serde(default = "Uuid::new_v4")]
  pub rowkey: Uuid,
  pub regex: String,
  #[serde(default = "Utc::now")]
  pub created: DateTime<Utc>,
  pub expires: DateTime<Utc>,
  #[serde(default)]
  pub disabled: Option<DateTime<Utc>>,
  pub ipaddr: IpAddr,
  pub userid: String,
  pub comment: String,
  #[serde(default = "default_version")]
  pub version: i64,
}

impl Suppression {
  pub fn is_active(&self, now: DateTime<Utc>) -> bool {
    self.disabled.is_none() && self.expires > now
  }

  pub fn status(&self, now: DateTime<Utc>) -> &'static str {
    if self.disabled.is_some() {
      "disabled"
    } else if self.expires <= now {
      "expired"
    } else {
      "active"
    }
  }

  pub fn compile(&self) -> Result<Regex, regex::Error> {
    Regex::new(&self.regex)
  }
}
