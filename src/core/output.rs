use crate::{
    constants::TIMEOUT_MESSAGE,
    core::domain::{RunResult, RunState},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PaneStatus {
    #[default]
    Idle,
    Running,
    Success,
    Error,
    Timeout,
    Unavailable,
}

/// What the learner sees under the editor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputPane {
    pub status: PaneStatus,
    pub stdout: String,
    pub stderr: String,
    /// Host-side message shown instead of learner stderr.
    pub notice: Option<String>,
}

impl OutputPane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one controller state into the pane.
    ///
    /// `Idle` keeps whatever the last terminal state rendered; a cancelled run
    /// leaves the pane empty.
    pub fn apply(&mut self, state: &RunState) {
        match state {
            RunState::Idle => {
                if self.status == PaneStatus::Running {
                    self.status = PaneStatus::Idle;
                }
            }
            RunState::Running { .. } => *self = Self {
                status: PaneStatus::Running,
                ..Self::default()
            },
            RunState::Completed(result) => self.show(PaneStatus::Success, result, None),
            RunState::Failed(result) => self.show(PaneStatus::Error, result, None),
            RunState::TimedOut(result) => self.show(
                PaneStatus::Timeout,
                result,
                Some(TIMEOUT_MESSAGE.to_string()),
            ),
            RunState::Cancelled { .. } => *self = Self::default(),
            RunState::Unavailable { msg, .. } => *self = Self {
                status: PaneStatus::Unavailable,
                notice: Some(format!("The code runner is unavailable: {}", msg)),
                ..Self::default()
            },
        }
    }

    fn show(&mut self, status: PaneStatus, result: &RunResult, notice: Option<String>) {
        self.status = status;
        self.stdout = result.stdout.clone();
        self.stderr = if notice.is_some() {
            String::new()
        } else {
            result.stderr.clone()
        };
        self.notice = notice;
    }

    pub fn render(&self) -> String {
        let mut out = self.stdout.clone();
        for extra in [Some(&self.stderr), self.notice.as_ref()].into_iter().flatten() {
            if extra.is_empty() {
                continue;
            }
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(extra);
        }
        out
    }
}
