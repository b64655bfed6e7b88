use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::config::SandboxConfig;
use crate::constants::TIMEOUT_MESSAGE;
use crate::core::assistant::ExerciseInfo;
use crate::core::domain::{ExecutionLimits, ExitStatus, RunState};
use crate::core::editor::Editor;
use crate::core::output::{OutputPane, PaneStatus};
use crate::core::session::{SessionHub, SessionUser, UserRole};
use crate::native::sandbox::IsolatedSandbox;

fn editor_in(
    limits: ExecutionLimits,
    sessions: &SessionHub,
) -> (Editor, mpsc::UnboundedReceiver<RunState>) {
    let config = SandboxConfig {
        limits,
        ..SandboxConfig::default()
    };
    let (state_tx, state_rx) = mpsc::unbounded_channel();
    (
        Editor::new(
            Arc::new(IsolatedSandbox::new()),
            config,
            state_tx,
            sessions.watch(),
        ),
        state_rx,
    )
}

fn editor_with(limits: ExecutionLimits) -> (Editor, mpsc::UnboundedReceiver<RunState>) {
    editor_in(limits, &SessionHub::new())
}

fn editor() -> (Editor, mpsc::UnboundedReceiver<RunState>) {
    editor_with(ExecutionLimits::default())
}

/// Feeds states into the pane up to and including the next terminal one.
async fn settle(
    state_rx: &mut mpsc::UnboundedReceiver<RunState>,
    pane: &mut OutputPane,
) -> Vec<RunState> {
    let mut seen = Vec::new();
    loop {
        let state = tokio::time::timeout(Duration::from_secs(5), state_rx.recv())
            .await
            .expect("controller should settle")
            .expect("state channel open");
        pane.apply(&state);
        let terminal = state.is_terminal();
        seen.push(state);
        if terminal {
            return seen;
        }
    }
}

#[tokio::test]
async fn test_hello_world() {
    let (mut editor, mut state_rx) = editor();
    let mut pane = OutputPane::new();
    editor.mount(Some("print(\"Hello, Integration Test!\")"));

    editor.run("").await.unwrap();
    settle(&mut state_rx, &mut pane).await;

    assert_eq!(pane.status, PaneStatus::Success);
    assert_eq!(pane.render(), "Hello, Integration Test!\n");
}

#[tokio::test]
async fn test_input_output_handling() {
    let (mut editor, mut state_rx) = editor();
    let mut pane = OutputPane::new();
    editor.mount(Some("name = input()\nprint(f\"Hello, {name}!\")\n"));

    editor.run("World\n").await.unwrap();
    settle(&mut state_rx, &mut pane).await;

    assert_eq!(pane.stdout, "Hello, World!\n");
}

#[tokio::test]
async fn test_same_source_same_output() {
    let (mut editor, mut state_rx) = editor();
    let mut pane = OutputPane::new();
    editor.mount(Some(
        "import math\nvalues = [math.floor(x * 1.5) for x in range(6)]\nprint(sum(values), max(values))\n",
    ));

    let mut outputs = Vec::new();
    for _ in 0..3 {
        editor.run("").await.unwrap();
        settle(&mut state_rx, &mut pane).await;
        outputs.push(pane.render());
    }

    assert_eq!(outputs[0], "21 7\n");
    assert!(outputs.iter().all(|output| output == &outputs[0]));
}

#[tokio::test]
async fn test_only_latest_run_is_rendered() {
    let (mut editor, mut state_rx) = editor();
    let mut pane = OutputPane::new();
    editor.mount(Some(
        "i = 0\nwhile i < 10000000:\n    i += 1\nprint(\"A\")\n",
    ));

    let slow = editor.run("").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    editor.edit("print(\"B\")");
    let fast = editor.run("").await.unwrap();

    let mut states = settle(&mut state_rx, &mut pane).await;
    states.extend(settle(&mut state_rx, &mut pane).await);

    assert_eq!(states[1], RunState::Cancelled { request_id: slow });
    assert!(matches!(
        states.last(),
        Some(RunState::Completed(result)) if result.request_id == fast
    ));
    assert_eq!(pane.render(), "B\n");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state_rx.try_recv().ok(), Some(RunState::Idle));
    assert!(state_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_infinite_loop_times_out_and_controller_stays_responsive() {
    let (mut editor, mut state_rx) = editor_with(ExecutionLimits {
        time_ms: 200,
        ..ExecutionLimits::default()
    });
    let mut pane = OutputPane::new();
    editor.mount(Some("print(\"start\")\nwhile True:\n    pass\n"));

    let started = Instant::now();
    editor.run("").await.unwrap();

    let asked_at = Instant::now();
    assert!(matches!(
        editor.controller().state().await,
        RunState::Running { .. }
    ));
    assert!(asked_at.elapsed() < Duration::from_millis(100));

    let states = settle(&mut state_rx, &mut pane).await;

    assert!(started.elapsed() < Duration::from_millis(200 + 250 + 500));
    assert!(matches!(
        states.last(),
        Some(RunState::TimedOut(result)) if result.exit_status == ExitStatus::Timeout
    ));
    assert_eq!(pane.status, PaneStatus::Timeout);
    assert_eq!(pane.render(), format!("start\n{}", TIMEOUT_MESSAGE));
}

#[tokio::test]
async fn test_cancel_renders_nothing() {
    let (mut editor, mut state_rx) = editor();
    let mut pane = OutputPane::new();
    editor.mount(Some("print(\"tick\")\nwhile True:\n    pass\n"));

    let request_id = editor.run("").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(editor.cancel().await);

    let states = settle(&mut state_rx, &mut pane).await;
    assert_eq!(states.last(), Some(&RunState::Cancelled { request_id }));
    assert_eq!(state_rx.recv().await, Some(RunState::Idle));
    assert_eq!(editor.controller().state().await, RunState::Idle);
    assert_eq!(pane.render(), "");
}

#[tokio::test]
async fn test_empty_source() {
    let (mut editor, mut state_rx) = editor();
    let mut pane = OutputPane::new();
    editor.mount(None);

    editor.run("").await.unwrap();
    let states = settle(&mut state_rx, &mut pane).await;

    let Some(RunState::Completed(result)) = states.last() else {
        panic!("expected Completed, got {:?}", states);
    };
    assert!(result.stdout.is_empty());
    assert!(result.stderr.is_empty());
    assert!(result.duration_ms < 50);
}

#[tokio::test]
async fn test_division_by_zero_is_reported() {
    let (mut editor, mut state_rx) = editor();
    let mut pane = OutputPane::new();
    editor.mount(Some("print(\"partial\")\nprint(10 // 0)\n"));

    editor.run("").await.unwrap();
    settle(&mut state_rx, &mut pane).await;

    assert_eq!(pane.status, PaneStatus::Error);
    assert_eq!(pane.stdout, "partial\n");
    assert!(pane.stderr.contains("line 2"));
    assert!(
        pane.stderr
            .ends_with("ZeroDivisionError: integer division or modulo by zero\n")
    );

    let context = editor.assistant_context(&ExerciseInfo::default()).await;
    assert_eq!(context.execution_error, Some(pane.stderr.clone()));
}

#[tokio::test]
async fn test_assistant_request_follows_failed_run() {
    let sessions = SessionHub::new();
    sessions.login(SessionUser {
        id: Some(11),
        email: "linus@example.com".to_string(),
        username: "linus".to_string(),
        role: UserRole::Student,
    });
    let (mut editor, mut state_rx) = editor_in(ExecutionLimits::default(), &sessions);
    let mut pane = OutputPane::new();
    editor.mount(Some("total = 0\nprint(totl)\n"));

    editor.run("").await.unwrap();
    settle(&mut state_rx, &mut pane).await;
    let request = editor
        .ask_assistant("what is wrong?", &ExerciseInfo::default())
        .await
        .unwrap()
        .unwrap();

    let payload = serde_json::to_value(&request).unwrap();
    assert_eq!(payload["message"], "what is wrong?");
    assert_eq!(payload["context"]["exerciseCode"], "total = 0\nprint(totl)\n");
    assert_eq!(payload["context"]["executionError"], pane.stderr.as_str());
    assert!(pane.stderr.contains("NameError: name 'totl' is not defined"));
}

#[tokio::test]
async fn test_learner_edge_cases_do_not_take_down_the_host() {
    let (mut editor, mut state_rx) = editor();
    let mut pane = OutputPane::new();
    editor.mount(None);

    for source in [
        "print('{:>1000000000000000000}'.format(1))\n",
        "print('%1000000000000000000d' % 1)\n",
        "print('{:.1000000000000}f'.format(1.0))\n",
    ] {
        editor.edit(source);
        editor.run("").await.unwrap();
        settle(&mut state_rx, &mut pane).await;
        assert_eq!(pane.status, PaneStatus::Error, "{}", source);
    }

    editor.edit("print([1, 2, 3][2::9223372036854775807])\n");
    editor.run("").await.unwrap();
    settle(&mut state_rx, &mut pane).await;
    assert_eq!(pane.status, PaneStatus::Success);
    assert_eq!(pane.render(), "[3]\n");
}

#[tokio::test]
async fn test_sandbox_policy_errors_surface_as_stderr() {
    let (mut editor, mut state_rx) = editor();
    let mut pane = OutputPane::new();
    editor.mount(Some("import socket\n"));

    editor.run("").await.unwrap();
    settle(&mut state_rx, &mut pane).await;

    assert_eq!(pane.status, PaneStatus::Error);
    assert!(
        pane.stderr
            .contains("ImportError: module 'socket' is not available in the sandbox")
    );
}

#[tokio::test]
async fn test_editors_run_independently() {
    let runs = (0..3).map(|n| async move {
        let (mut editor, mut state_rx) = editor();
        let mut pane = OutputPane::new();
        editor.mount(Some(&format!("print({} * 10)", n)));
        editor.run("").await.unwrap();
        settle(&mut state_rx, &mut pane).await;
        pane.render()
    });

    let outputs = futures::future::join_all(runs).await;

    assert_eq!(outputs, vec!["0\n", "10\n", "20\n"]);
}
