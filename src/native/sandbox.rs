use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    constants::{INTERPRETER_FAILURE_MESSAGE, ISOLATE_REPORT_SLACK_MS, ISOLATE_STACK_SIZE_BYTES},
    core::{
        domain::{ExitStatus, RunRequest, RunResult},
        traits::sandbox::{Sandbox, SandboxError},
    },
    native::interpreter,
};

struct Job {
    request: RunRequest,
    stdout: Arc<Mutex<String>>,
    interrupt: Arc<AtomicBool>,
    reply: oneshot::Sender<RunResult>,
}

/// Handle to one isolate thread. Dropping it closes the job queue and the
/// thread exits once its current job stops.
#[derive(Debug)]
struct Isolate {
    id: u64,
    jobs: mpsc::Sender<Job>,
}

#[derive(Debug)]
struct InFlight {
    isolate_id: u64,
    interrupt: Arc<AtomicBool>,
    stdout: Arc<Mutex<String>>,
}

/// Runs learner code on a dedicated OS thread with the Python-subset
/// interpreter.
///
/// An isolate that timed out, got cancelled or crashed is never handed
/// another job; the next run spawns a fresh one.
#[derive(Debug, Default)]
pub struct IsolatedSandbox {
    isolate: Mutex<Option<Isolate>>,
    in_flight: DashMap<Uuid, InFlight>,
    isolates_spawned: AtomicU64,
}

impl IsolatedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of isolate threads started so far.
    #[cfg(test)]
    pub fn isolates_spawned(&self) -> u64 {
        self.isolates_spawned.load(Ordering::Relaxed)
    }

    fn submit(&self, job: Job) -> Result<u64, SandboxError> {
        let mut slot = self.isolate.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(self.spawn_isolate()?);
        }
        let Some(isolate) = slot.as_ref() else {
            return Err(SandboxError::Unavailable {
                msg: "no isolate available".to_string(),
            });
        };
        let isolate_id = isolate.id;
        if isolate.jobs.send(job).is_err() {
            *slot = None;
            return Err(SandboxError::Unavailable {
                msg: format!("isolate {} is gone", isolate_id),
            });
        }
        Ok(isolate_id)
    }

    fn spawn_isolate(&self) -> Result<Isolate, SandboxError> {
        let id = self.isolates_spawned.fetch_add(1, Ordering::Relaxed) + 1;
        let (jobs, queue) = mpsc::channel::<Job>();

        thread::Builder::new()
            .name(format!("isolate-{}", id))
            .stack_size(ISOLATE_STACK_SIZE_BYTES)
            .spawn(move || {
                while let Ok(Job {
                    request,
                    stdout,
                    interrupt,
                    reply,
                }) = queue.recv()
                {
                    let result = contain(&request, &stdout, || {
                        interpreter::run(&request, stdout.clone(), interrupt)
                    });
                    // The host may have stopped waiting already.
                    let _ = reply.send(result);
                }
                tracing::debug!(isolate_id = id, "isolate stopped");
            })
            .map_err(|e| SandboxError::Unavailable { msg: e.to_string() })?;

        tracing::info!(isolate_id = id, "isolate started");
        Ok(Isolate { id, jobs })
    }

    /// Drops the isolate if it is still the current one.
    fn retire(&self, isolate_id: u64) {
        let mut slot = self.isolate.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|isolate| isolate.id == isolate_id) {
            tracing::debug!(isolate_id, "retiring isolate");
            *slot = None;
        }
    }

    async fn dispatch(
        &self,
        request: &RunRequest,
        stdout: Arc<Mutex<String>>,
        interrupt: Arc<AtomicBool>,
    ) -> Result<RunResult, SandboxError> {
        let started = Instant::now();
        let (reply, result_rx) = oneshot::channel();
        let isolate_id = self.submit(Job {
            request: request.clone(),
            stdout: stdout.clone(),
            interrupt: interrupt.clone(),
            reply,
        })?;
        self.in_flight.insert(
            request.id,
            InFlight {
                isolate_id,
                interrupt: interrupt.clone(),
                stdout: stdout.clone(),
            },
        );

        let limit = Duration::from_millis(request.timeout_ms.saturating_add(ISOLATE_REPORT_SLACK_MS));
        match tokio::time::timeout(limit, result_rx).await {
            Ok(Ok(result)) => {
                if matches!(result.exit_status, ExitStatus::Timeout | ExitStatus::Cancelled) {
                    self.retire(isolate_id);
                }
                Ok(result)
            }
            Ok(Err(_)) => {
                tracing::error!(request_id = %request.id, isolate_id, "isolate dropped the request");
                self.retire(isolate_id);
                Err(SandboxError::Unavailable {
                    msg: "isolate stopped before reporting a result".to_string(),
                })
            }
            Err(_) => {
                tracing::info!(request_id = %request.id, isolate_id, "isolate missed its deadline");
                interrupt.store(true, Ordering::Relaxed);
                self.retire(isolate_id);
                let partial = stdout.lock().unwrap_or_else(PoisonError::into_inner).clone();
                Ok(RunResult::timed_out(
                    request,
                    partial,
                    started.elapsed().as_millis() as u64,
                ))
            }
        }
    }
}

/// Reports an interpreter panic as a failed run instead of losing the isolate.
fn contain(
    request: &RunRequest,
    stdout: &Arc<Mutex<String>>,
    run: impl FnOnce() -> RunResult,
) -> RunResult {
    let started = Instant::now();
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(request_id = %request.id, "interpreter panicked");
            RunResult {
                request_id: request.id,
                stdout: stdout.lock().unwrap_or_else(PoisonError::into_inner).clone(),
                stderr: format!("{}\n", INTERPRETER_FAILURE_MESSAGE),
                exit_status: ExitStatus::Error,
                duration_ms: started.elapsed().as_millis() as u64,
            }
        }
    }
}

#[async_trait::async_trait]
impl Sandbox for IsolatedSandbox {
    #[tracing::instrument(skip(self, request), fields(request_id = %request.id))]
    async fn execute(&self, request: &RunRequest) -> Result<RunResult, SandboxError> {
        let stdout = Arc::new(Mutex::new(String::new()));
        let interrupt = Arc::new(AtomicBool::new(false));

        let outcome = self.dispatch(request, stdout, interrupt).await;
        self.in_flight.remove(&request.id);

        if let Ok(result) = &outcome {
            tracing::debug!(
                exit_status = ?result.exit_status,
                duration_ms = result.duration_ms,
                "execution finished"
            );
        }
        outcome
    }

    fn cancel(&self, request_id: &Uuid) -> Option<String> {
        let (_, in_flight) = self.in_flight.remove(request_id)?;
        tracing::debug!(%request_id, isolate_id = in_flight.isolate_id, "cancelling execution");
        in_flight.interrupt.store(true, Ordering::Relaxed);
        self.retire(in_flight.isolate_id);
        let partial = in_flight
            .stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Some(partial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::ExecutionLimits;

    fn request(source: &str, time_ms: u64) -> RunRequest {
        RunRequest::new(
            source.to_string(),
            String::new(),
            ExecutionLimits {
                time_ms,
                ..ExecutionLimits::default()
            },
        )
    }

    #[tokio::test]
    async fn test_executes_on_isolate() {
        let sandbox = IsolatedSandbox::new();
        let request = request("print(\"Hello World\")", 1000);

        let result = sandbox.execute(&request).await.unwrap();

        assert_eq!(result.request_id, request.id);
        assert_eq!(result.exit_status, ExitStatus::Ok);
        assert_eq!(result.stdout, "Hello World\n");
        assert_eq!(sandbox.isolates_spawned(), 1);
    }

    #[tokio::test]
    async fn test_reuses_isolate_after_clean_run() {
        let sandbox = IsolatedSandbox::new();

        sandbox.execute(&request("x = 1", 1000)).await.unwrap();
        sandbox.execute(&request("y = 2", 1000)).await.unwrap();

        assert_eq!(sandbox.isolates_spawned(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_isolate_is_replaced() {
        let sandbox = IsolatedSandbox::new();

        let result = sandbox
            .execute(&request("print(1)\nwhile True:\n    pass", 200))
            .await
            .unwrap();
        assert_eq!(result.exit_status, ExitStatus::Timeout);
        assert_eq!(result.stdout, "1\n");

        let result = sandbox.execute(&request("print(2)", 1000)).await.unwrap();
        assert_eq!(result.stdout, "2\n");
        assert_eq!(sandbox.isolates_spawned(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_running_code() {
        let sandbox = Arc::new(IsolatedSandbox::new());
        let request = request("print(\"tick\")\nwhile True:\n    pass", 5000);

        let handle = tokio::spawn({
            let sandbox = sandbox.clone();
            let request = request.clone();
            async move { sandbox.execute(&request).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sandbox.cancel(&request.id).as_deref(), Some("tick\n"));
        assert_eq!(sandbox.cancel(&request.id), None);

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("cancelled run should finish promptly")
            .unwrap()
            .unwrap();
        assert_eq!(result.exit_status, ExitStatus::Cancelled);

        let result = sandbox.execute(&self::request("print(3)", 1000)).await.unwrap();
        assert_eq!(result.stdout, "3\n");
        assert_eq!(sandbox.isolates_spawned(), 2);
    }

    #[test]
    fn test_interpreter_panic_becomes_error_result() {
        let request = request("print(1)", 1000);
        let stdout = Arc::new(Mutex::new("partial\n".to_string()));

        let result = contain(&request, &stdout, || panic!("interpreter bug"));

        assert_eq!(result.request_id, request.id);
        assert_eq!(result.exit_status, ExitStatus::Error);
        assert_eq!(result.stdout, "partial\n");
        assert!(result.stderr.starts_with(INTERPRETER_FAILURE_MESSAGE));
    }

    #[tokio::test]
    async fn test_learner_edge_cases_keep_isolate_alive() {
        let sandbox = IsolatedSandbox::new();

        let result = sandbox
            .execute(&request("print([1, 2, 3][2::9223372036854775807])", 1000))
            .await
            .unwrap();
        assert_eq!(result.stdout, "[3]\n");

        let result = sandbox
            .execute(&request("print('{:.1000000000000}f'.format(1.0))", 1000))
            .await
            .unwrap();
        assert_eq!(result.exit_status, ExitStatus::Error);

        let result = sandbox
            .execute(&request("print('{:>1000000000000000000}'.format(1))", 1000))
            .await
            .unwrap();
        assert!(result.stderr.contains("MemoryError"));
        assert_eq!(sandbox.isolates_spawned(), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_request_is_ignored() {
        let sandbox = IsolatedSandbox::new();
        assert_eq!(sandbox.cancel(&Uuid::new_v4()), None);
        assert_eq!(sandbox.isolates_spawned(), 0);
    }
}
