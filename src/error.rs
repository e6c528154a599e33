use thiserror::Error;

/// Errors surfaced by a `KeyValueStore` backend.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The precondition of a conditional put or delete did not hold.
  #[error("conditional check failed for {domain}/{key}")]
  ConditionalCheckFailed { domain: String, key: String },

  #[error("stored item {domain}/{key} could not be decoded: {reason}")]
  Decode { domain: String, key: String, reason: String },

  #[error("store backend error: {0}")]
  Backend(#[from] sqlx::Error),
}

impl StoreError {
  pub fn is_conditional_failure(&self) -> bool {
    matches!(self, StoreError::ConditionalCheckFailed { .. })
  }
}

/// Malformed or incomplete data found in a message, a stored row or a
/// configuration document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataError {
  #[error("required field is missing: {0}")]
  MissingField(String),

  #[error("invalid value {value:?} in field {field}")]
  InvalidField { field: String, value: String },

  #[error("invalid state code {0}")]
  InvalidState(i64),

  #[error("invalid state type code {0}")]
  InvalidStateType(i64),

  #[error("malformed message: {0}")]
  Malformed(String),
}

impl DataError {
  pub fn invalid(field: &str, value: impl ToString) -> Self {
    DataError::InvalidField { field: field.to_string(), value: value.to_string() }
  }
}

/// Failures while running a check command.
#[derive(Debug, Error)]
pub enum CommandError {
  #[error("command '{command}' took longer than {timeout_secs} seconds to execute")]
  Timeout { command: String, timeout_secs: u64 },

  #[error("command '{command}' exited with a return code of {code}")]
  Failure { command: String, code: i32, output: String },

  #[error("command context is missing '{0}'")]
  MissingContext(String),

  #[error("unable to run command '{command}': {source}")]
  Spawn { command: String, #[source] source: std::io::Error },
}

/// Problems building the resources registry.
#[derive(Debug, Error)]
pub enum ResourceError {
  #[error("{kind} '{name}' is already registered")]
  Duplicate { kind: &'static str, name: String },

  #[error("{kind} '{name}' referenced by '{referenced_by}' does not exist")]
  UnknownReference { kind: &'static str, name: String, referenced_by: String },

  #[error("reserved attributes cannot be used on '{name}': {attributes}")]
  Reserved { name: String, attributes: String },

  #[error("unable to read resources from {path}: {reason}")]
  Load { path: String, reason: String },
}
