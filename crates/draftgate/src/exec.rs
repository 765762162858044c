//! Command-backed executor and validator.
//!
//! Both speak JSON over stdio: the executor receives a `StepInput` on stdin
//! and must print a `StepArtifact`; the validator receives a `StepArtifact`
//! and must print a `ValidationReport`. A non-zero exit fails the call.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use draftgate_core::{
    ExecutorError, StepArtifact, StepExecutor, StepInput, StepValidator, ValidationReport,
    ValidatorError,
};

/// Split a command string into program and arguments.
fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

async fn run_command(command: &str, stdin_payload: &[u8]) -> Result<String, String> {
    let (program, args) =
        split_command(command).ok_or_else(|| "empty command".to_string())?;

    debug!(program = %program, "spawning pipeline command");
    let start = Instant::now();

    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| format!("failed to spawn '{program}': {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(stdin_payload)
            .await
            .map_err(|e| format!("failed to write stdin: {e}"))?;
        // Drop closes the pipe so the child sees EOF.
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("failed to wait for '{program}': {e}"))?;

    debug!(
        program = %program,
        exit_code = output.status.code().unwrap_or(-1),
        duration_ms = start.elapsed().as_millis(),
        "pipeline command completed"
    );

    if !output.status.success() {
        return Err(format!(
            "'{program}' exited with code {}",
            output.status.code().unwrap_or(-1)
        ));
    }

    String::from_utf8(output.stdout).map_err(|e| format!("non-utf8 output: {e}"))
}

/// Executor that shells out to an external command
pub struct CommandExecutor {
    command: String,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl StepExecutor for CommandExecutor {
    fn name(&self) -> &str {
        &self.command
    }

    async fn execute(&self, input: &StepInput) -> Result<StepArtifact, ExecutorError> {
        let payload = serde_json::to_vec(input)
            .map_err(|e| ExecutorError::ConfigError(e.to_string()))?;
        let stdout = run_command(&self.command, &payload)
            .await
            .map_err(ExecutorError::ProcessFailed)?;
        serde_json::from_str(&stdout).map_err(|e| ExecutorError::BadOutput(e.to_string()))
    }
}

/// Validator that shells out to an external command
pub struct CommandValidator {
    command: String,
}

impl CommandValidator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl StepValidator for CommandValidator {
    fn name(&self) -> &str {
        &self.command
    }

    async fn validate(&self, artifact: &StepArtifact) -> Result<ValidationReport, ValidatorError> {
        let payload = serde_json::to_vec(artifact)
            .map_err(|e| ValidatorError::BadReport(e.to_string()))?;
        let stdout = run_command(&self.command, &payload)
            .await
            .map_err(ValidatorError::ProcessFailed)?;
        serde_json::from_str(&stdout).map_err(|e| ValidatorError::BadReport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        let (program, args) = split_command("python3 validate.py --strict").unwrap();
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["validate.py", "--strict"]);

        assert!(split_command("   ").is_none());
    }

    #[tokio::test]
    async fn test_executor_round_trip_through_cat() {
        // `cat` echoes the StepInput back; that parses as a StepArtifact
        // because both carry an `items` array.
        let executor = CommandExecutor::new("cat");
        let input = StepInput::new(vec![draftgate_core::ContentItem {
            id: "a".to_string(),
            content: "hello".to_string(),
        }]);

        let artifact = executor.execute(&input).await.unwrap();
        assert_eq!(artifact.items.len(), 1);
        assert_eq!(artifact.items[0].id, "a");
    }

    #[tokio::test]
    async fn test_missing_program_is_a_process_error() {
        let executor = CommandExecutor::new("definitely-not-a-real-binary-37");
        let result = executor.execute(&StepInput::default()).await;
        assert!(matches!(result, Err(ExecutorError::ProcessFailed(_))));
    }
}
