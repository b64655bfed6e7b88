use std::io::IsTerminal;
use std::panic;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::config::SandboxConfig;
use crate::core::editor::Editor;
use crate::core::output::{OutputPane, PaneStatus};
use crate::core::session::SessionHub;
use crate::native::sandbox::IsolatedSandbox;

mod config;
mod constants;
mod core;
mod native;

#[cfg(test)]
mod integration_test;
#[cfg(test)]
mod stubs;

/// Runs a Python file (or stdin when no path is given) in the sandbox and
/// prints what the output pane would show.
#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let config = SandboxConfig::from_env()?;
    let (source, stdin) = match std::env::args().nth(1) {
        Some(path) => (tokio::fs::read_to_string(&path).await?, read_stdin().await?),
        None => (read_stdin().await?, String::new()),
    };

    let sessions = SessionHub::new();
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    let mut editor = Editor::new(
        Arc::new(IsolatedSandbox::new()),
        config,
        state_tx,
        sessions.watch(),
    );
    editor.mount(Some(&source));
    let request_id = editor.run(stdin).await?;
    tracing::info!(%request_id, "running source");

    let mut pane = OutputPane::new();
    while let Some(state) = state_rx.recv().await {
        pane.apply(&state);
        if state.is_terminal() {
            break;
        }
    }
    editor.unmount().await;

    let rendered = pane.render();
    if rendered.ends_with('\n') || rendered.is_empty() {
        print!("{}", rendered);
    } else {
        println!("{}", rendered);
    }

    Ok(match pane.status {
        PaneStatus::Success => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

async fn read_stdin() -> std::io::Result<String> {
    let mut input = String::new();
    if std::io::stdin().is_terminal() {
        return Ok(input);
    }
    tokio::io::stdin().read_to_string(&mut input).await?;
    Ok(input)
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
