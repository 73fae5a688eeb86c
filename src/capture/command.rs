use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{CaptureError, ErrorCategory, PlanCapture};
use crate::plan::CapturedPlan;

/// Captures plans by running an external helper.
///
/// The helper reads the statement on stdin and prints a [`CapturedPlan`] as
/// JSON on stdout. A non-zero exit means the engine rejected the statement.
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandCapture {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self, input: &str) -> Result<std::process::Output> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            // The helper may exit without reading its input.
            match stdin.write_all(input.as_bytes()).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    return Err(e).context("Failed to write statement to helper");
                }
                _ => {}
            }
        }

        let output = child.wait_with_output();
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, output)
                .await
                .map_err(|_| anyhow!("{} timed out after {:?}", self.program, limit))?
                .context("Failed to wait for helper"),
            None => output.await.context("Failed to wait for helper"),
        }
    }
}

#[async_trait]
impl PlanCapture for CommandCapture {
    fn name(&self) -> &str {
        &self.program
    }

    async fn ping(&self) -> Result<()> {
        let found = std::path::Path::new(&self.program).exists()
            || std::env::var_os("PATH").is_some_and(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(&self.program).is_file())
            });
        if !found {
            bail!("capture helper {} not found", self.program);
        }
        Ok(())
    }

    async fn capture(&self, text: &str) -> std::result::Result<CapturedPlan, CaptureError> {
        let output = self.run(text).await.map_err(CaptureError::Transient)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(program = %self.program, status = %output.status, "helper rejected statement");
            return Err(CaptureError::unexplainable(
                ErrorCategory::Semantic,
                format!("{} ({})", stderr.trim(), output.status),
            ));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            CaptureError::unexplainable(
                ErrorCategory::InvalidPlan,
                format!("{} printed an invalid plan: {}", self.program, e),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandCapture {
        CommandCapture::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_helper_output_is_parsed() {
        let capture = sh(
            r#"cat > /dev/null; echo '{"plan":{"operatorType":"ProduceResults","children":[{"operatorType":"AllNodesScan","identifiers":["n"]}]},"server":{"address":"db:7687","version":"5.1"}}'"#,
        );
        let captured = capture.capture("MATCH (n) RETURN n").await.unwrap();
        assert_eq!(captured.plan.operator_type, "ProduceResults");
        assert_eq!(captured.plan.children[0].identifiers, vec!["n".to_string()]);
        assert_eq!(captured.server.version.as_deref(), Some("5.1"));
    }

    #[tokio::test]
    async fn test_helper_receives_statement_on_stdin() {
        let capture = sh(
            r#"read q; printf '{"plan":{"operatorType":"%s"}}' "$q""#,
        );
        let captured = capture.capture("Echo\n").await.unwrap();
        assert_eq!(captured.plan.operator_type, "Echo");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_unexplainable() {
        let capture = sh("echo 'Invalid input' >&2; exit 2");
        let err = capture.capture("MATCH (").await.unwrap_err();
        match err {
            CaptureError::Unexplainable { message, .. } => assert!(message.contains("Invalid input")),
            other => panic!("expected unexplainable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_transient() {
        let capture = CommandCapture::new("planwatch-no-such-helper", Vec::new());
        assert!(matches!(
            capture.capture("RETURN 1").await,
            Err(CaptureError::Transient(_))
        ));
        assert!(capture.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_output_is_unexplainable() {
        let capture = sh("cat > /dev/null; echo not-json");
        assert!(matches!(
            capture.capture("RETURN 1").await,
            Err(CaptureError::Unexplainable {
                category: ErrorCategory::InvalidPlan,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_timeout() {
        let capture = sh("sleep 5").with_timeout(Duration::from_millis(50));
        assert!(matches!(
            capture.capture("RETURN 1").await,
            Err(CaptureError::Transient(_))
        ));
    }
}
