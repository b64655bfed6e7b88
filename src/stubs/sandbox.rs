use std::time::Duration;

use uuid::Uuid;

use crate::core::{
    domain::{RunRequest, RunResult},
    traits::sandbox::{Sandbox, SandboxError},
};

/// Answers every request with a canned outcome after a fixed delay.
///
/// The canned result's `request_id` is replaced with the id of the request
/// being answered.
#[derive(Debug, Clone)]
pub struct SandboxStub {
    result: Result<RunResult, SandboxError>,
    delay: Duration,
    partial_stdout: Option<String>,
}

impl SandboxStub {
    pub fn new(result: Result<RunResult, SandboxError>, delay: Duration) -> Self {
        Self {
            result,
            delay,
            partial_stdout: None,
        }
    }

    /// Output handed back when a request is cancelled mid-run.
    pub fn with_partial_stdout(mut self, stdout: &str) -> Self {
        self.partial_stdout = Some(stdout.to_string());
        self
    }
}

#[async_trait::async_trait]
impl Sandbox for SandboxStub {
    #[tracing::instrument]
    async fn execute(&self, request: &RunRequest) -> Result<RunResult, SandboxError> {
        tracing::debug!("Start execution: request={:?}", request.id);
        tokio::time::sleep(self.delay).await;
        tracing::debug!("Execution result: {:?}", self.result);

        self.result.clone().map(|result| RunResult {
            request_id: request.id,
            ..result
        })
    }

    fn cancel(&self, request_id: &Uuid) -> Option<String> {
        tracing::debug!("Cancel ignored by stub: request={:?}", request_id);
        self.partial_stdout.clone()
    }
}
