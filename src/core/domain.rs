use serde::Serialize;
use uuid::Uuid;

use crate::constants::{
    DEFAULT_MAX_COLLECTION_LEN, DEFAULT_MAX_RECURSION_DEPTH, DEFAULT_STDERR_SIZE_BYTES,
    DEFAULT_STDOUT_SIZE_BYTES, DEFAULT_TIMEOUT_MS,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
}

/// Text currently held by one editor instance.
///
/// Only the owning editor mutates it; runs receive a [`SourceBuffer::snapshot`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceBuffer {
    text: String,
    language: Language,
}

impl SourceBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: Language::Python,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn replace(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn snapshot(&self) -> String {
        self.text.clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub time_ms: u64,
    pub stdout_size_bytes: usize,
    pub stderr_size_bytes: usize,
    pub max_recursion_depth: usize,
    pub max_collection_len: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            time_ms: DEFAULT_TIMEOUT_MS,
            stdout_size_bytes: DEFAULT_STDOUT_SIZE_BYTES,
            stderr_size_bytes: DEFAULT_STDERR_SIZE_BYTES,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            max_collection_len: DEFAULT_MAX_COLLECTION_LEN,
        }
    }
}

/// A single execution attempt. Immutable once created.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub source_snapshot: String,
    pub stdin: String,
    pub timeout_ms: u64,
    pub limits: ExecutionLimits,
}

impl RunRequest {
    pub fn new(source_snapshot: String, stdin: String, limits: ExecutionLimits) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: chrono::Utc::now(),
            source_snapshot,
            stdin,
            timeout_ms: limits.time_ms.max(1),
            limits,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitStatus {
    Ok,
    Error,
    Timeout,
    Cancelled,
}

/// Terminal outcome of a [`RunRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RunResult {
    pub request_id: Uuid,
    pub stdout: String,
    pub stderr: String,
    pub exit_status: ExitStatus,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn timed_out(request: &RunRequest, stdout: String, duration_ms: u64) -> Self {
        Self {
            request_id: request.id,
            stdout,
            stderr: format!(
                "TimeoutError: execution exceeded {} ms",
                request.timeout_ms
            ),
            exit_status: ExitStatus::Timeout,
            duration_ms,
        }
    }

    pub fn cancelled(request: &RunRequest, stdout: String, duration_ms: u64) -> Self {
        Self {
            request_id: request.id,
            stdout,
            stderr: String::new(),
            exit_status: ExitStatus::Cancelled,
            duration_ms,
        }
    }
}

/// States of the run controller.
///
/// `Completed`, `Failed`, `TimedOut`, `Cancelled` and `Unavailable` are
/// transient: the controller publishes them and then moves back to `Idle`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running {
        request_id: Uuid,
    },
    Completed(RunResult),
    Failed(RunResult),
    TimedOut(RunResult),
    Cancelled {
        request_id: Uuid,
    },
    Unavailable {
        request_id: Uuid,
        msg: String,
    },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Idle | RunState::Running { .. })
    }

    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            RunState::Idle => None,
            RunState::Running { request_id }
            | RunState::Cancelled { request_id }
            | RunState::Unavailable { request_id, .. } => Some(*request_id),
            RunState::Completed(result) | RunState::Failed(result) | RunState::TimedOut(result) => {
                Some(result.request_id)
            }
        }
    }
}

impl From<RunResult> for RunState {
    fn from(result: RunResult) -> Self {
        match result.exit_status {
            ExitStatus::Ok => RunState::Completed(result),
            ExitStatus::Error => RunState::Failed(result),
            ExitStatus::Timeout => RunState::TimedOut(result),
            ExitStatus::Cancelled => RunState::Cancelled {
                request_id: result.request_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_detached_from_buffer() {
        let mut buffer = SourceBuffer::new("print(1)");
        let snapshot = buffer.snapshot();
        buffer.replace("print(2)");

        assert_eq!(snapshot, "print(1)");
        assert_eq!(buffer.text(), "print(2)");
        assert_eq!(buffer.language(), Language::Python);
    }

    #[test]
    fn result_maps_to_terminal_state() {
        let request = RunRequest::new(String::new(), String::new(), ExecutionLimits::default());
        let ok = RunResult {
            request_id: request.id,
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_status: ExitStatus::Ok,
            duration_ms: 1,
        };

        assert!(matches!(RunState::from(ok.clone()), RunState::Completed(_)));
        assert!(matches!(
            RunState::from(RunResult::timed_out(&request, String::new(), 5)),
            RunState::TimedOut(_)
        ));
        assert_eq!(
            RunState::from(RunResult::cancelled(&request, String::new(), 5)),
            RunState::Cancelled {
                request_id: request.id
            }
        );
        assert!(RunState::from(ok).is_terminal());
        assert!(!RunState::Idle.is_terminal());
    }

    #[test]
    fn timeout_is_clamped_to_positive() {
        let limits = ExecutionLimits {
            time_ms: 0,
            ..ExecutionLimits::default()
        };
        let request = RunRequest::new(String::new(), String::new(), limits);
        assert_eq!(request.timeout_ms, 1);
    }
}
