use uuid::Uuid;

use crate::core::domain::{RunRequest, RunResult};

/// Executes learner code in an isolated context.
///
/// Learner-side failures (syntax errors, exceptions, timeouts) are reported
/// through [`RunResult::exit_status`]. `Err` is reserved for the sandbox
/// itself being broken.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Sandbox: std::fmt::Debug + Send + Sync {
    async fn execute(&self, request: &RunRequest) -> Result<RunResult, SandboxError>;

    /// Stops the given request if it is still executing and returns the
    /// stdout it produced so far. Unknown ids yield `None`.
    fn cancel(&self, request_id: &Uuid) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox unavailable: {msg}")]
    Unavailable { msg: String },
}
