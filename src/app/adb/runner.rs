use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::app::error::AppError;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub trace_id: String,
}

impl CommandSpec {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            stdin: None,
            timeout,
            trace_id: trace_id.into(),
        }
    }

    pub fn with_stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, AppError>;
}

/// Production executor backed by real subprocesses.
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, AppError> {
        run_command(spec).await
    }
}

pub async fn run_command(spec: &CommandSpec) -> Result<CommandOutput, AppError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if spec.stdin.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }

    let mut child = command.spawn().map_err(|err| {
        AppError::connection(
            format!("Failed to spawn {}: {err}", spec.program),
            &spec.trace_id,
        )
    })?;

    if let Some(data) = &spec.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            // Closing the pipe (drop) signals EOF to interactive tools.
            let _ = stdin.write_all(data).await;
        }
    }

    let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return Err(AppError::system(
                format!("Failed to run {}: {err}", spec.display()),
                &spec.trace_id,
            ));
        }
        Err(_) => {
            // Dropping the wait future kills the child via kill_on_drop.
            return Err(AppError::timeout(
                format!(
                    "Command timed out after {}s: {}",
                    spec.timeout.as_secs_f64(),
                    spec.display()
                ),
                &spec.trace_id,
            ));
        }
    };

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
    })
}

/// Maps a nonzero exit to the error taxonomy; returns stdout on success.
pub fn checked_stdout(
    output: CommandOutput,
    spec: &CommandSpec,
) -> Result<String, AppError> {
    if output.exit_code == Some(0) {
        return Ok(output.stdout);
    }

    let stderr_lower = output.stderr.to_lowercase();
    if stderr_lower.contains("device offline") || stderr_lower.contains("device not found") {
        return Err(AppError::connection(
            format!("Device connection failed: {}", output.stderr.trim()),
            &spec.trace_id,
        ));
    }
    if stderr_lower.contains("permission denied") {
        return Err(AppError::permission(
            format!("Permission denied: {}", output.stderr.trim()),
            &spec.trace_id,
        ));
    }
    let detail = if output.stderr.trim().is_empty() {
        output.stdout.trim().to_string()
    } else {
        format!("{} {}", output.stderr.trim(), output.stdout.trim())
    };
    Err(AppError::system(
        format!(
            "Command failed (exit {:?}): {} -> {}",
            output.exit_code,
            spec.display(),
            detail.trim()
        ),
        &spec.trace_id,
    ))
}

pub async fn run_checked(
    executor: &dyn CommandExecutor,
    spec: &CommandSpec,
) -> Result<String, AppError> {
    let output = executor.execute(spec).await?;
    checked_stdout(output, spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str], timeout_ms: u64) -> CommandSpec {
        CommandSpec::new(
            program,
            args.iter().map(|a| a.to_string()).collect(),
            Duration::from_millis(timeout_ms),
            "test-trace",
        )
    }

    #[tokio::test]
    async fn captures_large_stdout_without_stalling() {
        let output = run_command(&spec(
            "sh",
            &[
                "-c",
                "i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done",
            ],
            10_000,
        ))
        .await
        .expect("large-output command should complete");
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 1_000_000);
    }

    #[tokio::test]
    async fn raises_timeout_when_deadline_expires() {
        let err = run_command(&spec("sh", &["-c", "sleep 5"], 100))
            .await
            .expect_err("expected timeout");
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn missing_binary_is_a_connection_error() {
        let err = run_command(&spec("/nonexistent/adb-binary", &["devices"], 1_000))
            .await
            .expect_err("expected spawn failure");
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn forwards_stdin_payload() {
        let output = run_command(
            &spec("cat", &[], 5_000).with_stdin(b"hello pipe".to_vec()),
        )
        .await
        .expect("cat should echo stdin");
        assert_eq!(output.stdout, "hello pipe");
    }

    #[test]
    fn classifies_offline_stderr_as_connection() {
        let s = spec("adb", &["shell", "true"], 1_000);
        let err = checked_stdout(
            CommandOutput {
                stdout: String::new(),
                stderr: "error: device offline".to_string(),
                exit_code: Some(1),
            },
            &s,
        )
        .expect_err("nonzero exit");
        assert!(err.is_connection());
    }

    #[test]
    fn classifies_device_not_found_as_connection() {
        let s = spec("adb", &["shell", "true"], 1_000);
        let err = checked_stdout(
            CommandOutput {
                stdout: String::new(),
                stderr: "error: device not found".to_string(),
                exit_code: Some(1),
            },
            &s,
        )
        .expect_err("nonzero exit");
        assert!(err.is_connection());
    }

    #[test]
    fn classifies_permission_denied() {
        let s = spec("adb", &["shell", "settings"], 1_000);
        let err = checked_stdout(
            CommandOutput {
                stdout: String::new(),
                stderr: "Permission denied".to_string(),
                exit_code: Some(1),
            },
            &s,
        )
        .expect_err("nonzero exit");
        assert_eq!(err.code, crate::app::error::ERR_PERMISSION);
    }

    #[test]
    fn other_failures_carry_combined_diagnostics() {
        let s = spec("adb", &["shell", "true"], 1_000);
        let err = checked_stdout(
            CommandOutput {
                stdout: "partial output".to_string(),
                stderr: "something broke".to_string(),
                exit_code: Some(2),
            },
            &s,
        )
        .expect_err("nonzero exit");
        assert_eq!(err.code, crate::app::error::ERR_SYSTEM);
        assert!(err.error.contains("something broke"));
        assert!(err.error.contains("partial output"));
    }

    #[test]
    fn zero_exit_returns_stdout() {
        let s = spec("adb", &["devices"], 1_000);
        let out = checked_stdout(
            CommandOutput {
                stdout: "List of devices attached\n".to_string(),
                stderr: String::new(),
                exit_code: Some(0),
            },
            &s,
        )
        .expect("zero exit");
        assert!(out.contains("List of devices"));
    }
}
