//! Subprocess step executor.
//!
//! Runs a configured command per action, pipes the `StepInvocation` as JSON
//! to stdin and reads the step output from stdout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{ExecutorError, StepExecutor, StepInvocation};

/// Default per-invocation timeout
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 300;

/// Command configured for one action (`executors:` section of the config)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to run
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECONDS
}

/// Step executor backed by a subprocess
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    step_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            step_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECONDS),
        }
    }

    pub fn from_spec(spec: &CommandSpec) -> Self {
        Self {
            program: spec.command.clone(),
            args: spec.args.clone(),
            step_timeout: Duration::from_secs(spec.timeout_seconds),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    async fn run(&self, invocation: &StepInvocation) -> Result<String, ExecutorError> {
        let payload = serde_json::to_vec(invocation)
            .map_err(|e| ExecutorError::Permanent(format!("cannot encode invocation: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("GOVFLOW_ACTION", &invocation.action)
            .env("GOVFLOW_IDEMPOTENCY_KEY", &invocation.idempotency_key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutorError::Permanent(format!(
                    "failed to spawn '{}' for action '{}': {}",
                    self.program, invocation.action, e
                ))
            })?;

        // The step timeout bounds the stdin write as well as the wait
        let stdin = child.stdin.take();
        let program = self.program.as_str();
        let exchange = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await.map_err(|e| {
                    ExecutorError::Transient(format!("failed to write to '{}' stdin: {}", program, e))
                })?;
                // Dropped here to signal EOF
            }
            child.wait_with_output().await.map_err(|e| {
                ExecutorError::Transient(format!("failed to wait for '{}': {}", program, e))
            })
        };

        let output = timeout(self.step_timeout, exchange).await.map_err(|_| {
            ExecutorError::Transient(format!(
                "action '{}' timed out after {:?}",
                invocation.action, self.step_timeout
            ))
        })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(ExecutorError::Transient(format!(
                "action '{}' failed with exit code {}: {}",
                invocation.action,
                exit_code,
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| ExecutorError::Permanent("command output is not valid UTF-8".to_string()))
    }
}

#[async_trait]
impl StepExecutor for CommandExecutor {
    async fn execute(&self, invocation: &StepInvocation) -> Result<serde_json::Value, ExecutorError> {
        debug!(
            program = %self.program,
            action = %invocation.action,
            attempt = invocation.attempt,
            "Running command executor"
        );
        let stdout = self.run(invocation).await?;
        Ok(parse_output(&stdout))
    }
}

/// JSON if stdout parses as JSON, otherwise the trimmed text
fn parse_output(stdout: &str) -> serde_json::Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Actor;
    use serde_json::json;
    use uuid::Uuid;

    fn invocation() -> StepInvocation {
        StepInvocation {
            intent_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            sequence: 1,
            action: "secret:rotate".to_string(),
            attempt: 1,
            idempotency_key: "k".to_string(),
            actor: Actor::agent("rotator", "service"),
            input: json!({"secret": "db"}),
            compensates: None,
        }
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output("{\"ok\": true}\n"), json!({"ok": true}));
        assert_eq!(parse_output("rotated\n"), json!("rotated"));
        assert_eq!(parse_output("  "), serde_json::Value::Null);
    }

    #[test]
    fn test_from_spec() {
        let spec: CommandSpec = serde_yaml::from_str("command: /usr/bin/rotate\nargs: [--dry-run]").unwrap();
        let executor = CommandExecutor::from_spec(&spec);
        assert_eq!(executor.program, "/usr/bin/rotate");
        assert_eq!(executor.args, vec!["--dry-run".to_string()]);
        assert_eq!(executor.step_timeout, Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECONDS));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_echoes_stdin() {
        let executor = CommandExecutor::new("cat");
        let output = executor.execute(&invocation()).await.unwrap();
        assert_eq!(output["action"], "secret:rotate");
        assert_eq!(output["input"], json!({"secret": "db"}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_transient() {
        let executor = CommandExecutor::new("sh").with_args(["-c", "cat >/dev/null; echo boom >&2; exit 3"]);
        let err = executor.execute(&invocation()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("exit code 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_ignoring_stdin_times_out() {
        let mut large = invocation();
        large.input = json!({"blob": "x".repeat(4 * 1024 * 1024)});

        let executor = CommandExecutor::new("sleep")
            .with_args(["30"])
            .with_timeout(Duration::from_millis(300));

        let started = std::time::Instant::now();
        let err = executor.execute(&large).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program_is_permanent() {
        let executor = CommandExecutor::new("/definitely/not/a/real/binary");
        let err = executor.execute(&invocation()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Permanent(_)));
    }
}
