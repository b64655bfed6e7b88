use std::sync::Arc;

use tokio::sync::{mpsc::UnboundedSender, watch};
use uuid::Uuid;

use crate::{
    config::SandboxConfig,
    core::{
        assistant::{
            AnalysisType, AssistantRequest, AssistantResponse, ChatMessage, CodeAnalysisRequest,
            CodeAnalysisResponse, Conversation, CourseContext, ExerciseInfo,
        },
        controller::RunController,
        domain::{RunState, SourceBuffer},
        relay::{ChangeRelay, SubscriptionId},
        session::SessionContext,
        traits::sandbox::Sandbox,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditorError {
    #[error("editor is not mounted")]
    NotMounted,
    #[error("the assistant requires a signed-in user")]
    SignedOut,
}

/// One editor instance: its buffer, change relay, run controller and the
/// assistant conversation of the signed-in user.
#[derive(Debug)]
pub struct Editor {
    buffer: SourceBuffer,
    relay: ChangeRelay,
    controller: RunController,
    session: watch::Receiver<SessionContext>,
    conversation: Conversation,
    mounted: bool,
    seeded: bool,
}

impl Editor {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        config: SandboxConfig,
        state_tx: UnboundedSender<RunState>,
        session: watch::Receiver<SessionContext>,
    ) -> Self {
        Self {
            buffer: SourceBuffer::default(),
            relay: ChangeRelay::new(),
            controller: RunController::new(sandbox, config, state_tx),
            session,
            conversation: Conversation::new(),
            mounted: false,
            seeded: false,
        }
    }

    /// Seeds the buffer with `initial_code` on the first mount only.
    pub fn mount(&mut self, initial_code: Option<&str>) {
        if !self.seeded {
            self.buffer.replace(initial_code.unwrap_or_default());
            self.seeded = true;
        }
        self.mounted = true;
    }

    /// Cancels any in-flight run. The buffer survives a later remount.
    pub async fn unmount(&mut self) {
        if self.controller.cancel().await {
            tracing::debug!("cancelled run on unmount");
        }
        self.mounted = false;
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn text(&self) -> &str {
        self.buffer.text()
    }

    /// Replaces the buffer text and notifies subscribers. Never runs code.
    pub fn edit(&mut self, text: impl Into<String>) {
        self.buffer.replace(text);
        self.relay.publish(self.buffer.text());
    }

    pub fn on_code_change<F>(&mut self, subscriber: F) -> SubscriptionId
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.relay.subscribe(subscriber)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.relay.unsubscribe(id)
    }

    /// Runs a snapshot of the buffer, superseding any in-flight run.
    pub async fn run(&self, stdin: impl Into<String>) -> Result<Uuid, EditorError> {
        if !self.mounted {
            return Err(EditorError::NotMounted);
        }
        Ok(self.controller.submit(self.buffer.snapshot(), stdin.into()).await)
    }

    pub async fn cancel(&self) -> bool {
        self.controller.cancel().await
    }

    #[cfg(test)]
    pub fn controller(&self) -> &RunController {
        &self.controller
    }

    /// Current code plus the last execution error, for the assistant panel.
    pub async fn assistant_context(&self, exercise: &ExerciseInfo) -> CourseContext {
        CourseContext::new(exercise, self.buffer.text(), self.controller.last_error().await)
    }

    pub fn analysis_request(&self, analysis_type: AnalysisType) -> Option<CodeAnalysisRequest> {
        CodeAnalysisRequest::from_code(self.buffer.text(), analysis_type)
    }

    /// Builds the next assistant request with the current context and the
    /// conversation so far. Blank messages yield `None`.
    ///
    /// A login or logout since the last question starts a new conversation.
    #[tracing::instrument(skip(self, message, exercise))]
    pub async fn ask_assistant(
        &mut self,
        message: &str,
        exercise: &ExerciseInfo,
    ) -> Result<Option<AssistantRequest>, EditorError> {
        if self.session.has_changed().unwrap_or(false) {
            tracing::debug!("session changed, starting a new conversation");
            self.conversation.clear();
        }
        let signed_in = self.session.borrow_and_update().is_logged_in();
        if !signed_in {
            return Err(EditorError::SignedOut);
        }
        if message.trim().is_empty() {
            return Ok(None);
        }
        let context = self.assistant_context(exercise).await;
        Ok(Some(self.conversation.ask(message, Some(context))))
    }

    pub fn record_reply(&mut self, response: &AssistantResponse) {
        self.conversation.record(response);
    }

    pub fn record_analysis(&mut self, response: &CodeAnalysisResponse) {
        self.conversation.record_analysis(response);
    }

    pub fn conversation(&self) -> &[ChatMessage] {
        self.conversation.history()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::Duration,
    };

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        core::{
            domain::{ExitStatus, RunResult},
            session::{SessionHub, SessionUser, UserRole},
            traits::sandbox::MockSandbox,
        },
        stubs::sandbox::SandboxStub,
    };

    fn editor_for(
        sandbox: impl Sandbox + 'static,
        sessions: &SessionHub,
    ) -> (Editor, mpsc::UnboundedReceiver<RunState>) {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let editor = Editor::new(
            Arc::new(sandbox),
            SandboxConfig::default(),
            state_tx,
            sessions.watch(),
        );
        (editor, state_rx)
    }

    fn editor(sandbox: impl Sandbox + 'static) -> (Editor, mpsc::UnboundedReceiver<RunState>) {
        editor_for(sandbox, &SessionHub::new())
    }

    fn student() -> SessionUser {
        SessionUser {
            id: Some(3),
            email: "grace@example.com".to_string(),
            username: "grace".to_string(),
            role: UserRole::Student,
        }
    }

    fn failing_sandbox() -> MockSandbox {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().returning(|request| {
            Ok(RunResult {
                request_id: request.id,
                stdout: String::new(),
                stderr: "NameError: name 'y' is not defined\n".to_string(),
                exit_status: ExitStatus::Error,
                duration_ms: 1,
            })
        });
        sandbox
    }

    async fn run_to_end(editor: &Editor, state_rx: &mut mpsc::UnboundedReceiver<RunState>) {
        editor.run("").await.unwrap();
        while let Some(state) = state_rx.recv().await {
            if state.is_terminal() {
                break;
            }
        }
    }

    #[test]
    fn test_initial_code_seeds_once() {
        let (mut editor, _state_rx) = editor(MockSandbox::new());

        editor.mount(Some("print('hi')"));
        assert_eq!(editor.text(), "print('hi')");

        editor.edit("print('edited')");
        editor.mount(Some("print('hi')"));
        assert_eq!(editor.text(), "print('edited')");
    }

    #[test]
    fn test_mount_without_initial_code_starts_empty() {
        let (mut editor, _state_rx) = editor(MockSandbox::new());
        editor.mount(None);
        assert_eq!(editor.text(), "");
        assert!(editor.is_mounted());
    }

    #[test]
    fn test_edits_are_relayed_without_running() {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().never();
        let (mut editor, mut state_rx) = editor(sandbox);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        editor.on_code_change(move |text| sink.lock().unwrap().push(text.to_string()));

        editor.mount(None);
        editor.edit("x = 1");
        editor.edit("x = 12");

        assert_eq!(*seen.lock().unwrap(), vec!["x = 1", "x = 12"]);
        assert!(state_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_requires_mount() {
        let (editor, _state_rx) = editor(MockSandbox::new());
        assert_eq!(editor.run("").await, Err(EditorError::NotMounted));
    }

    #[tokio::test]
    async fn test_unmount_cancels_in_flight_run() {
        let sandbox = SandboxStub::new(
            Ok(RunResult {
                request_id: Uuid::nil(),
                stdout: String::new(),
                stderr: String::new(),
                exit_status: ExitStatus::Ok,
                duration_ms: 0,
            }),
            Duration::from_secs(1),
        );
        let (mut editor, mut state_rx) = editor(sandbox);
        editor.mount(Some("while True: pass"));

        let request_id = editor.run("").await.unwrap();
        editor.unmount().await;

        assert_eq!(state_rx.recv().await, Some(RunState::Running { request_id }));
        assert_eq!(state_rx.recv().await, Some(RunState::Cancelled { request_id }));
        assert_eq!(state_rx.recv().await, Some(RunState::Idle));
        assert!(!editor.is_mounted());
    }

    #[tokio::test]
    async fn test_assistant_context_carries_code_and_error() {
        let (mut editor, mut state_rx) = editor(failing_sandbox());
        editor.mount(Some("print(y)"));

        run_to_end(&editor, &mut state_rx).await;

        let context = editor.assistant_context(&ExerciseInfo::default()).await;
        assert_eq!(context.exercise_code, "print(y)");
        assert_eq!(
            context.execution_error.as_deref(),
            Some("NameError: name 'y' is not defined\n")
        );
        assert_eq!(
            editor.analysis_request(AnalysisType::Debug).unwrap().code,
            "print(y)"
        );
    }

    #[tokio::test]
    async fn test_assistant_requires_signed_in_user() {
        let sessions = SessionHub::new();
        let (mut editor, _state_rx) = editor_for(MockSandbox::new(), &sessions);
        editor.mount(Some("print(1)"));

        let asked = editor.ask_assistant("help", &ExerciseInfo::default()).await;
        assert_eq!(asked, Err(EditorError::SignedOut));

        sessions.login(student());
        let asked = editor.ask_assistant("   ", &ExerciseInfo::default()).await;
        assert_eq!(asked, Ok(None));
    }

    #[tokio::test]
    async fn test_conversation_builds_on_run_context() {
        let sessions = SessionHub::new();
        sessions.login(student());
        let (mut editor, mut state_rx) = editor_for(failing_sandbox(), &sessions);
        editor.mount(Some("print(y)"));
        run_to_end(&editor, &mut state_rx).await;

        let first = editor
            .ask_assistant("why does it fail?", &ExerciseInfo::default())
            .await
            .unwrap()
            .unwrap();
        let context = first.context.unwrap();
        assert_eq!(context.exercise_code, "print(y)");
        assert_eq!(
            context.execution_error.as_deref(),
            Some("NameError: name 'y' is not defined\n")
        );
        assert!(first.conversation_history.is_empty());

        editor.record_reply(&AssistantResponse {
            response: "y is never assigned".to_string(),
            success: true,
            error: None,
            provider: None,
        });
        let second = editor
            .ask_assistant("how do I fix it?", &ExerciseInfo::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.conversation_history.len(), 2);
        assert_eq!(editor.conversation().len(), 3);
    }

    #[tokio::test]
    async fn test_new_session_starts_new_conversation() {
        let sessions = SessionHub::new();
        sessions.login(student());
        let (mut editor, _state_rx) = editor_for(MockSandbox::new(), &sessions);
        editor.mount(Some("print(1)"));

        editor
            .ask_assistant("explain this", &ExerciseInfo::default())
            .await
            .unwrap();
        editor.record_analysis(&CodeAnalysisResponse {
            analysis: "prints one".to_string(),
            code: "print(1)".to_string(),
            analysis_type: "explain".to_string(),
            success: true,
            error: None,
            provider: None,
        });
        assert_eq!(editor.conversation().len(), 2);

        assert!(sessions.logout());
        sessions.login(student());
        let request = editor
            .ask_assistant("again", &ExerciseInfo::default())
            .await
            .unwrap()
            .unwrap();

        assert!(request.conversation_history.is_empty());
        assert_eq!(editor.conversation().len(), 1);
    }
}
