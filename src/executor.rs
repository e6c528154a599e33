//! Running check commands.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::CommandError;
use crate::models::{State, TaskContext};

static PLACEHOLDER: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)\s*\}\}").expect("valid placeholder pattern"));

/// State and output of one check run.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
  pub state: State,
  pub output: String,
}

impl CheckOutcome {
  /// Maps a command run onto a check state. Timeouts and anything that kept
  /// the command from running are UNKNOWN.
  pub fn from_run(run: Result<String, CommandError>) -> Self {
    match run {
      Ok(output) => CheckOutcome { state: State::Ok, output },
      Err(CommandError::Failure { code, output, .. }) => CheckOutcome { state: State::from_exit_code(code), output },
      Err(e) => CheckOutcome { state: State::Unknown, output: e.to_string() },
    }
  }
}

#[async_trait]
pub trait CheckExecutor: Send + Sync {
  /// Returns the command output on a zero exit status.
  async fn run(&self, context: &TaskContext, timeout: Duration) -> Result<String, CommandError>;
}

fn lookup<'a>(context: &'a TaskContext, path: &str) -> Option<&'a Value> {
  let mut parts = path.split('.');
  let mut value = context.get(parts.next()?)?;
  for part in parts {
    value = value.get(part)?;
  }
  Some(value)
}

/// Renders `{{ key }}` and `{{ key.path }}` placeholders from the task
/// context. Missing or null values are an error.
pub fn render(template: &str, context: &TaskContext) -> Result<String, CommandError> {
  let mut missing = None;
  let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
    let path = &caps[1];
    match lookup(context, path) {
      Some(Value::String(s)) => s.clone(),
      Some(Value::Null) | None => {
        missing.get_or_insert_with(|| path.to_string());
        String::new()
      }
      Some(other) => other.to_string(),
    }
  });
  match missing {
    Some(path) => Err(CommandError::MissingContext(path)),
    None => Ok(rendered.into_owned()),
  }
}

/// Runs the context's `command.command_string` through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
  pub fn new() -> Self {
    ShellExecutor
  }

  pub fn format_command(&self, context: &TaskContext) -> Result<String, CommandError> {
    let template = lookup(context, "command.command_string")
      .or_else(|| context.get("command_string"))
      .and_then(Value::as_str)
      .ok_or_else(|| CommandError::MissingContext("command_string".into()))?;
    render(template, context)
  }
}

#[async_trait]
impl CheckExecutor for ShellExecutor {
  async fn run(&self, context: &TaskContext, timeout: Duration) -> Result<String, CommandError> {
    let command = self.format_command(context)?;
    debug!("Executing command (timeout: {}s): {}", timeout.as_secs(), command);

    let child = Command::new("sh")
      .arg("-c")
      .arg(&command)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| CommandError::Spawn { command: command.clone(), source })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
      Ok(Ok(output)) => output,
      Ok(Err(source)) => return Err(CommandError::Spawn { command, source }),
      Err(_) => {
        debug!("Command '{}' timed out, killing it", command);
        return Err(CommandError::Timeout { command, timeout_secs: timeout.as_secs() });
      }
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
      return Ok(text);
    }
    let code = output.status.code().unwrap_or(-1);
    debug!("Command '{}' failed with return code {}", command, code);
    Err(CommandError::Failure { command, code, output: text })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn context(command_string: &str) -> TaskContext {
    json!({
      "node": {"name": "www1", "address": "10.0.0.5"},
      "address": "10.0.0.5",
      "port": 8080,
      "command": {"name": "check", "command_string": command_string},
    })
    .as_object()
    .cloned()
    .unwrap()
  }

  #[test]
  fn placeholders_render_from_nested_and_flat_keys() {
    let ctx = context("");
    assert_eq!(
      render("check_http -H {{ node.address }} -p {{port}} {{ address }}", &ctx).unwrap(),
      "check_http -H 10.0.0.5 -p 8080 10.0.0.5"
    );
  }

  #[test]
  fn missing_placeholder_is_an_error() {
    let err = render("ping {{ node.realm }}", &context("")).unwrap_err();
    assert!(matches!(err, CommandError::MissingContext(ref path) if path == "node.realm"));
  }

  #[test]
  fn outcomes_follow_exit_codes() {
    let failure = |code| {
      CheckOutcome::from_run(Err(CommandError::Failure { command: "x".into(), code, output: "out".into() }))
    };
    assert_eq!(failure(1).state, State::Warning);
    assert_eq!(failure(2).state, State::Critical);
    assert_eq!(failure(9).state, State::Unknown);
    assert_eq!(failure(2).output, "out");

    let timeout = CheckOutcome::from_run(Err(CommandError::Timeout { command: "x".into(), timeout_secs: 5 }));
    assert_eq!(timeout.state, State::Unknown);
    assert!(timeout.output.contains("5 seconds"));
  }

  #[tokio::test]
  async fn shell_executor_captures_output() {
    let output = ShellExecutor::new()
      .run(&context("echo up {{ node.name }}"), Duration::from_secs(5))
      .await
      .unwrap();
    assert_eq!(output.trim(), "up www1");
  }

  #[tokio::test]
  async fn shell_executor_reports_failures() {
    let err = ShellExecutor::new()
      .run(&context("echo broken; exit 2"), Duration::from_secs(5))
      .await
      .unwrap_err();
    assert!(matches!(err, CommandError::Failure { code: 2, ref output, .. } if output.trim() == "broken"));
  }

  #[tokio::test]
  async fn shell_executor_times_out() {
    let err = ShellExecutor::new()
      .run(&context("sleep 5"), Duration::from_millis(100))
      .await
      .unwrap_err();
    assert!(matches!(err, CommandError::Timeout { .. }));
  }
}
