use std::sync::Arc;

use tokio::{
    sync::{Mutex, mpsc::UnboundedSender},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    config::SandboxConfig,
    constants::STATE_RX_CLOSED,
    core::{
        domain::{ExitStatus, RunRequest, RunResult, RunState},
        traits::sandbox::{Sandbox, SandboxError},
    },
};

#[derive(Debug, Default)]
struct Tracker {
    state: RunState,
    /// Only results for this id are honored.
    latest: Option<Uuid>,
    task: Option<JoinHandle<()>>,
    last_result: Option<RunResult>,
}

/// Runs one request at a time against a [`Sandbox`] and publishes every
/// [`RunState`] transition on `state_tx`.
///
/// Publishing never waits on the consumer, so the tracker lock is only held
/// for bookkeeping and `submit`/`cancel` return even if nobody drains states.
///
/// A new submit supersedes the in-flight request: it is cancelled in the
/// sandbox, its task is aborted, and whatever it returns later is dropped.
#[derive(Debug, Clone)]
pub struct RunController {
    sandbox: Arc<dyn Sandbox>,
    config: SandboxConfig,
    state_tx: UnboundedSender<RunState>,
    tracker: Arc<Mutex<Tracker>>,
}

impl RunController {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        config: SandboxConfig,
        state_tx: UnboundedSender<RunState>,
    ) -> Self {
        Self {
            sandbox,
            config,
            state_tx,
            tracker: Arc::new(Mutex::new(Tracker::default())),
        }
    }

    #[tracing::instrument(skip(self, source, stdin))]
    pub async fn submit(&self, source: String, stdin: String) -> Uuid {
        let mut tracker = self.tracker.lock().await;
        if let RunState::Running { request_id } = tracker.state {
            tracing::debug!(%request_id, "superseding in-flight run");
            self.stop(&mut tracker, request_id);
        }

        let request = RunRequest::new(source, stdin, self.config.limits);
        let request_id = request.id;
        tracker.latest = Some(request_id);
        self.publish(&mut tracker, RunState::Running { request_id });
        tracker.task = Some(tokio::spawn(self.clone().execute(request)));

        tracing::info!(%request_id, "run submitted");
        request_id
    }

    /// Cancels the in-flight run, if any. Returns whether one was cancelled.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self) -> bool {
        let mut tracker = self.tracker.lock().await;
        let RunState::Running { request_id } = tracker.state else {
            return false;
        };
        self.stop(&mut tracker, request_id);
        true
    }

    pub async fn state(&self) -> RunState {
        self.tracker.lock().await.state.clone()
    }

    pub async fn last_result(&self) -> Option<RunResult> {
        self.tracker.lock().await.last_result.clone()
    }

    /// Stderr of the last honored run if it did not finish cleanly.
    pub async fn last_error(&self) -> Option<String> {
        self.tracker
            .lock()
            .await
            .last_result
            .as_ref()
            .filter(|result| result.exit_status != ExitStatus::Ok)
            .map(|result| result.stderr.clone())
    }

    fn stop(&self, tracker: &mut Tracker, request_id: Uuid) {
        self.sandbox.cancel(&request_id);
        if let Some(task) = tracker.task.take() {
            task.abort();
        }
        tracker.latest = None;
        self.publish(tracker, RunState::Cancelled { request_id });
        self.publish(tracker, RunState::Idle);
    }

    async fn execute(self, request: RunRequest) {
        let backstop = self.config.backstop(request.timeout_ms);
        let state = match tokio::time::timeout(backstop, self.sandbox.execute(&request)).await {
            Ok(Ok(result)) => RunState::from(result),
            Ok(Err(SandboxError::Unavailable { msg })) => {
                tracing::error!(request_id = %request.id, "sandbox unavailable: {}", msg);
                RunState::Unavailable {
                    request_id: request.id,
                    msg,
                }
            }
            Err(_) => {
                tracing::info!(request_id = %request.id, "sandbox missed the backstop");
                let partial = self.sandbox.cancel(&request.id).unwrap_or_default();
                RunState::TimedOut(RunResult::timed_out(
                    &request,
                    partial,
                    backstop.as_millis() as u64,
                ))
            }
        };
        self.finish(request.id, state).await;
    }

    async fn finish(&self, request_id: Uuid, state: RunState) {
        let mut tracker = self.tracker.lock().await;
        if tracker.latest != Some(request_id) {
            tracing::debug!(%request_id, "discarding stale result");
            return;
        }
        tracker.latest = None;
        tracker.task = None;
        if let RunState::Completed(result) | RunState::Failed(result) | RunState::TimedOut(result) =
            &state
        {
            tracker.last_result = Some(result.clone());
        }
        self.publish(&mut tracker, state);
        self.publish(&mut tracker, RunState::Idle);
    }

    fn publish(&self, tracker: &mut Tracker, state: RunState) {
        tracing::debug!("Run state: {:?}", state);
        tracker.state = state.clone();
        if self.state_tx.send(state).is_err() {
            tracing::debug!("{}", STATE_RX_CLOSED);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};

    use super::*;
    use crate::{
        core::{domain::ExecutionLimits, traits::sandbox::MockSandbox},
        stubs::sandbox::SandboxStub,
    };

    fn result(exit_status: ExitStatus, stdout: &str, stderr: &str) -> RunResult {
        RunResult {
            request_id: Uuid::nil(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_status,
            duration_ms: 3,
        }
    }

    fn config(time_ms: u64, timeout_grace_ms: u64) -> SandboxConfig {
        SandboxConfig {
            limits: ExecutionLimits {
                time_ms,
                ..ExecutionLimits::default()
            },
            timeout_grace_ms,
        }
    }

    fn controller(
        sandbox: impl Sandbox + 'static,
        config: SandboxConfig,
    ) -> (RunController, mpsc::UnboundedReceiver<RunState>) {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        (RunController::new(Arc::new(sandbox), config, state_tx), state_rx)
    }

    async fn next_states(
        state_rx: mpsc::UnboundedReceiver<RunState>,
        n: usize,
    ) -> (Vec<RunState>, mpsc::UnboundedReceiver<RunState>) {
        let mut stream = UnboundedReceiverStream::new(state_rx);
        let mut states = Vec::with_capacity(n);
        while states.len() < n {
            let state = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("state should arrive")
                .expect("channel open");
            states.push(state);
        }
        (states, stream.into_inner())
    }

    #[tokio::test]
    async fn test_successful_run_completes_then_idles() {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().times(1).returning(|request| {
            Ok(RunResult {
                request_id: request.id,
                ..result(ExitStatus::Ok, "Hello World\n", "")
            })
        });
        let (controller, state_rx) = controller(sandbox, SandboxConfig::default());

        let request_id = controller.submit("print('Hello World')".to_string(), String::new()).await;
        let (states, _state_rx) = next_states(state_rx, 3).await;

        assert_eq!(states[0], RunState::Running { request_id });
        assert!(matches!(
            &states[1],
            RunState::Completed(result) if result.request_id == request_id && result.stdout == "Hello World\n"
        ));
        assert_eq!(states[2], RunState::Idle);
        assert_eq!(controller.state().await, RunState::Idle);
        assert_eq!(controller.last_result().await.unwrap().request_id, request_id);
        assert_eq!(controller.last_error().await, None);
    }

    #[tokio::test]
    async fn test_error_result_is_failed_and_kept_for_context() {
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .return_const(Ok(result(ExitStatus::Error, "before\n", "ZeroDivisionError: division by zero\n")));
        let (controller, state_rx) = controller(sandbox, SandboxConfig::default());

        controller.submit("1 / 0".to_string(), String::new()).await;
        let (states, _state_rx) = next_states(state_rx, 3).await;

        assert!(matches!(&states[1], RunState::Failed(result) if result.stdout == "before\n"));
        assert_eq!(
            controller.last_error().await.as_deref(),
            Some("ZeroDivisionError: division by zero\n")
        );
    }

    #[tokio::test]
    async fn test_unavailable_sandbox_is_host_level() {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().return_const(Err(SandboxError::Unavailable {
            msg: "no isolate".to_string(),
        }));
        let (controller, state_rx) = controller(sandbox, SandboxConfig::default());

        let request_id = controller.submit(String::new(), String::new()).await;
        let (states, _state_rx) = next_states(state_rx, 3).await;

        assert_eq!(
            states[1],
            RunState::Unavailable {
                request_id,
                msg: "no isolate".to_string()
            }
        );
        assert_eq!(states[2], RunState::Idle);
        assert!(controller.last_result().await.is_none());
    }

    #[tokio::test]
    async fn test_new_submit_supersedes_in_flight_run() {
        let sandbox = SandboxStub::new(
            Ok(result(ExitStatus::Ok, "done\n", "")),
            Duration::from_millis(100),
        );
        let (controller, state_rx) = controller(sandbox, SandboxConfig::default());

        let first = controller.submit("slow()".to_string(), String::new()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = controller.submit("fast()".to_string(), String::new()).await;
        let (states, mut state_rx) = next_states(state_rx, 6).await;

        assert_eq!(
            states,
            vec![
                RunState::Running { request_id: first },
                RunState::Cancelled { request_id: first },
                RunState::Idle,
                RunState::Running { request_id: second },
                states[4].clone(),
                RunState::Idle,
            ]
        );
        assert!(matches!(&states[4], RunState::Completed(result) if result.request_id == second));

        // Nothing ever shows up for the superseded request.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(state_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_returns_to_idle_without_result() {
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .returning(|_| Ok(result(ExitStatus::Ok, "late\n", "")));
        sandbox.expect_cancel().times(1).return_const(None::<String>);
        let sandbox = SlowSandbox(sandbox);
        let (controller, state_rx) = controller(sandbox, SandboxConfig::default());

        let request_id = controller.submit("while True: pass".to_string(), String::new()).await;
        assert!(controller.cancel().await);
        assert!(!controller.cancel().await);
        let (states, mut state_rx) = next_states(state_rx, 3).await;

        assert_eq!(
            states,
            vec![
                RunState::Running { request_id },
                RunState::Cancelled { request_id },
                RunState::Idle,
            ]
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(state_rx.try_recv().is_err());
        assert!(controller.last_result().await.is_none());
    }

    #[tokio::test]
    async fn test_backstop_times_out_unresponsive_sandbox() {
        let sandbox = SandboxStub::new(
            Ok(result(ExitStatus::Ok, "", "")),
            Duration::from_secs(10),
        )
        .with_partial_stdout("started\n");
        let (controller, state_rx) = controller(sandbox, config(50, 50));

        let request_id = controller.submit("while True: pass".to_string(), String::new()).await;
        let (states, _state_rx) = next_states(state_rx, 3).await;

        assert!(matches!(
            &states[1],
            RunState::TimedOut(result)
                if result.request_id == request_id
                    && result.exit_status == ExitStatus::Timeout
                    && result.stdout == "started\n"
        ));
        assert_eq!(states[2], RunState::Idle);
    }

    #[tokio::test]
    async fn test_stale_result_is_fenced() {
        let (controller, mut state_rx) = controller(MockSandbox::new(), SandboxConfig::default());

        controller
            .finish(Uuid::new_v4(), RunState::Completed(result(ExitStatus::Ok, "", "")))
            .await;

        assert!(state_rx.try_recv().is_err());
        assert_eq!(controller.state().await, RunState::Idle);
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_break_controller() {
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .returning(|request| Ok(RunResult { request_id: request.id, ..result(ExitStatus::Ok, "", "") }));
        let (controller, state_rx) = controller(sandbox, SandboxConfig::default());
        drop(state_rx);

        let request_id = controller.submit(String::new(), String::new()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(controller.state().await, RunState::Idle);
        assert_eq!(controller.last_result().await.unwrap().request_id, request_id);
    }

    #[tokio::test]
    async fn test_undrained_states_never_block_submit_or_cancel() {
        let sandbox = SandboxStub::new(
            Ok(result(ExitStatus::Ok, "", "")),
            Duration::from_secs(10),
        );
        let (controller, mut state_rx) = controller(sandbox, SandboxConfig::default());

        let mut last = None;
        for n in 0..200 {
            let submitted = tokio::time::timeout(
                Duration::from_millis(200),
                controller.submit(format!("print({})", n), String::new()),
            )
            .await;
            last = Some(submitted.expect("submit should not wait on the consumer"));
        }
        let cancelled = tokio::time::timeout(Duration::from_millis(200), controller.cancel())
            .await
            .expect("cancel should not wait on the consumer");

        assert!(cancelled);
        assert_eq!(controller.state().await, RunState::Idle);

        let mut states = Vec::new();
        while let Ok(state) = state_rx.try_recv() {
            states.push(state);
        }
        assert_eq!(states.len(), 1 + 199 * 3 + 2);
        assert_eq!(
            states[states.len() - 2],
            RunState::Cancelled {
                request_id: last.unwrap()
            }
        );
    }

    /// Delegates to a mock but takes a while to answer.
    #[derive(Debug)]
    struct SlowSandbox(MockSandbox);

    #[async_trait::async_trait]
    impl Sandbox for SlowSandbox {
        async fn execute(&self, request: &RunRequest) -> Result<RunResult, SandboxError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.execute(request).await
        }

        fn cancel(&self, request_id: &Uuid) -> Option<String> {
            self.0.cancel(request_id)
        }
    }
}
