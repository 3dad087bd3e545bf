//! Lifecycle actions invoked on candidacy transitions.
//!
//! The reconciler treats actions as opaque: only the success/failure outcome
//! affects its state. Failures come in two flavors, a retryable failure that
//! re-enters the error path and an unrecoverable one that terminates the
//! elector.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Error type for action execution.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Normal, retryable failure (nonzero exit code, transient I/O).
    #[error("action failed: {0}")]
    Failed(String),
    /// The action can never succeed; the elector must terminate.
    #[error("unrecoverable action failure: {0}")]
    Unrecoverable(String),
}

impl ActionError {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, ActionError::Unrecoverable(_))
    }
}

/// A nullary side-effectful operation bound to a candidacy transition.
///
/// Actions may block for arbitrary time but are expected to finish; they run
/// serialized on the reconciler task, never overlapping.
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self) -> Result<(), ActionError>;
}

#[async_trait]
impl<T: Action + ?Sized> Action for std::sync::Arc<T> {
    async fn run(&self) -> Result<(), ActionError> {
        (**self).run().await
    }
}

// ============================================================================
// COMMAND ACTION
// ============================================================================

/// Executes a program located on the search path, with arguments split from
/// the configured command string. Succeeds iff the exit code is zero.
pub struct CommandAction {
    program: String,
    args: Vec<String>,
}

impl CommandAction {
    /// Parses a whitespace-separated command string.
    pub fn new(command: &str) -> Result<Self, ActionError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ActionError::Unrecoverable("empty command".to_string()))?;

        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl Action for CommandAction {
    async fn run(&self) -> Result<(), ActionError> {
        tracing::info!(program = %self.program, "Executing command");

        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    ActionError::Unrecoverable(format!(
                        "command {} not found on the search path",
                        self.program
                    ))
                } else {
                    ActionError::Failed(format!("failed to spawn {}: {}", self.program, err))
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() || !stderr.trim().is_empty() {
            tracing::info!(
                program = %self.program,
                stdout = %stdout.trim(),
                stderr = %stderr.trim(),
                "Command output"
            );
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(ActionError::Failed(format!(
                "{} exited with {}",
                self.program, output.status
            )))
        }
    }
}

// ============================================================================
// TIMEOUT ACTION
// ============================================================================

/// Sleeps for the configured duration, then succeeds. Used as the error
/// action to defer re-candidacy after a failure.
pub struct TimeoutAction {
    timeout: Duration,
}

impl TimeoutAction {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Action for TimeoutAction {
    async fn run(&self) -> Result<(), ActionError> {
        tracing::info!(timeout_ms = self.timeout.as_millis() as u64, "Waiting out error timeout");
        tokio::time::sleep(self.timeout).await;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
