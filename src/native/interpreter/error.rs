use std::fmt;

use itertools::Itertools;

use crate::constants::EXERCISE_FILE_NAME;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BaseException,
    Exception,
    ArithmeticError,
    LookupError,
    SyntaxError,
    IndentationError,
    NameError,
    TypeError,
    ValueError,
    ZeroDivisionError,
    OverflowError,
    IndexError,
    KeyError,
    AttributeError,
    RecursionError,
    MemoryError,
    ImportError,
    PermissionError,
    AssertionError,
    EOFError,
    RuntimeError,
    NotImplementedError,
    // Raised by the host, never catchable by learner code.
    Timeout,
    Cancelled,
    OutputLimitExceeded,
}

impl ErrorKind {
    pub const CATCHABLE: &'static [ErrorKind] = &[
        ErrorKind::BaseException,
        ErrorKind::Exception,
        ErrorKind::ArithmeticError,
        ErrorKind::LookupError,
        ErrorKind::SyntaxError,
        ErrorKind::IndentationError,
        ErrorKind::NameError,
        ErrorKind::TypeError,
        ErrorKind::ValueError,
        ErrorKind::ZeroDivisionError,
        ErrorKind::OverflowError,
        ErrorKind::IndexError,
        ErrorKind::KeyError,
        ErrorKind::AttributeError,
        ErrorKind::RecursionError,
        ErrorKind::MemoryError,
        ErrorKind::ImportError,
        ErrorKind::PermissionError,
        ErrorKind::AssertionError,
        ErrorKind::EOFError,
        ErrorKind::RuntimeError,
        ErrorKind::NotImplementedError,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::BaseException => "BaseException",
            ErrorKind::Exception => "Exception",
            ErrorKind::ArithmeticError => "ArithmeticError",
            ErrorKind::LookupError => "LookupError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::IndentationError => "IndentationError",
            ErrorKind::NameError => "NameError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ValueError => "ValueError",
            ErrorKind::ZeroDivisionError => "ZeroDivisionError",
            ErrorKind::OverflowError => "OverflowError",
            ErrorKind::IndexError => "IndexError",
            ErrorKind::KeyError => "KeyError",
            ErrorKind::AttributeError => "AttributeError",
            ErrorKind::RecursionError => "RecursionError",
            ErrorKind::MemoryError => "MemoryError",
            ErrorKind::ImportError => "ImportError",
            ErrorKind::PermissionError => "PermissionError",
            ErrorKind::AssertionError => "AssertionError",
            ErrorKind::EOFError => "EOFError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::NotImplementedError => "NotImplementedError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Cancelled => "CancelledError",
            ErrorKind::OutputLimitExceeded => "OutputLimitExceeded",
        }
    }

    pub fn from_name(name: &str) -> Option<ErrorKind> {
        Self::CATCHABLE.iter().copied().find(|kind| kind.name() == name)
    }

    fn parent(&self) -> Option<ErrorKind> {
        match self {
            ErrorKind::BaseException => None,
            ErrorKind::Exception => Some(ErrorKind::BaseException),
            ErrorKind::ZeroDivisionError | ErrorKind::OverflowError => {
                Some(ErrorKind::ArithmeticError)
            }
            ErrorKind::IndexError | ErrorKind::KeyError => Some(ErrorKind::LookupError),
            ErrorKind::IndentationError => Some(ErrorKind::SyntaxError),
            ErrorKind::RecursionError | ErrorKind::NotImplementedError => {
                Some(ErrorKind::RuntimeError)
            }
            ErrorKind::Timeout | ErrorKind::Cancelled | ErrorKind::OutputLimitExceeded => None,
            _ => Some(ErrorKind::Exception),
        }
    }

    pub fn is_subclass_of(&self, other: ErrorKind) -> bool {
        let mut current = Some(*self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    /// Host-imposed stops cannot be swallowed by `try/except`.
    pub fn is_catchable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Cancelled | ErrorKind::OutputLimitExceeded
        )
    }
}

/// A raised Python exception plus where it travelled.
#[derive(Clone, Debug, PartialEq)]
pub struct Exception {
    pub kind: ErrorKind,
    pub msg: String,
    /// Innermost frame first.
    pub traceback: Vec<Frame>,
    pub(crate) needs_line: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub line: usize,
    pub scope: String,
}

impl Exception {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
            traceback: Vec::new(),
            needs_line: true,
        }
    }

    pub fn syntax(line: usize, msg: impl Into<String>) -> Self {
        Self::syntax_kind(ErrorKind::SyntaxError, line, msg)
    }

    pub fn syntax_kind(kind: ErrorKind, line: usize, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
            traceback: vec![Frame {
                line,
                scope: String::new(),
            }],
            needs_line: false,
        }
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, msg)
    }

    pub fn value_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValueError, msg)
    }

    pub fn is_syntax(&self) -> bool {
        self.kind.is_subclass_of(ErrorKind::SyntaxError)
    }

    pub(crate) fn at(mut self, line: usize, scope: &str) -> Self {
        if self.needs_line {
            self.traceback.push(Frame {
                line,
                scope: scope.to_string(),
            });
            self.needs_line = false;
        }
        self
    }

    /// Called when the exception leaves a function body so the caller's line
    /// is recorded too.
    pub(crate) fn unwind(mut self) -> Self {
        self.needs_line = true;
        self
    }

    pub fn line(&self) -> Option<usize> {
        self.traceback.first().map(|frame| frame.line)
    }

    /// The learner-facing rendering written to stderr.
    pub fn render(&self) -> String {
        if self.is_syntax() {
            let location = self
                .line()
                .map(|line| format!("  File \"{}\", line {}\n", EXERCISE_FILE_NAME, line))
                .unwrap_or_default();
            return format!("{}{}\n", location, self);
        }

        // Deep recursion repeats the same frame; keep three and summarise the rest.
        let frames = self
            .traceback
            .iter()
            .rev()
            .dedup_with_count()
            .flat_map(|(count, frame)| {
                let line = format!(
                    "  File \"{}\", line {}, in {}",
                    EXERCISE_FILE_NAME, frame.line, frame.scope
                );
                let mut lines = vec![line; count.min(3)];
                if count > 3 {
                    lines.push(format!("  [Previous line repeated {} more times]", count - 3));
                }
                lines
            })
            .join("\n");
        if frames.is_empty() {
            format!("Traceback (most recent call last):\n{}\n", self)
        } else {
            format!("Traceback (most recent call last):\n{}\n{}\n", frames, self)
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{}", self.kind.name())
        } else {
            write!(f, "{}: {}", self.kind.name(), self.msg)
        }
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy() {
        assert!(ErrorKind::ZeroDivisionError.is_subclass_of(ErrorKind::ArithmeticError));
        assert!(ErrorKind::KeyError.is_subclass_of(ErrorKind::Exception));
        assert!(!ErrorKind::KeyError.is_subclass_of(ErrorKind::IndexError));
        assert!(!ErrorKind::Timeout.is_subclass_of(ErrorKind::BaseException));
        assert!(!ErrorKind::Timeout.is_catchable());
        assert_eq!(ErrorKind::from_name("ValueError"), Some(ErrorKind::ValueError));
        assert_eq!(ErrorKind::from_name("TimeoutError"), None);
    }

    #[test]
    fn test_render_traceback() {
        let err = Exception::new(ErrorKind::ZeroDivisionError, "division by zero")
            .at(2, "divide")
            .unwind()
            .at(5, "<module>");

        assert_eq!(
            err.render(),
            "Traceback (most recent call last):\n  \
             File \"<exercise>\", line 5, in <module>\n  \
             File \"<exercise>\", line 2, in divide\n\
             ZeroDivisionError: division by zero\n"
        );
    }

    #[test]
    fn test_render_collapses_repeated_frames() {
        let mut err = Exception::new(ErrorKind::RecursionError, "maximum recursion depth exceeded");
        for _ in 0..10 {
            err = err.at(2, "f").unwind();
        }
        err = err.at(4, "<module>");

        let rendered = err.render();
        assert_eq!(rendered.matches("line 2, in f").count(), 3);
        assert!(rendered.contains("[Previous line repeated 7 more times]"));
        assert!(rendered.ends_with("RecursionError: maximum recursion depth exceeded\n"));
    }

    #[test]
    fn test_render_syntax_error() {
        let err = Exception::syntax(3, "invalid syntax");
        assert_eq!(
            err.render(),
            "  File \"<exercise>\", line 3\nSyntaxError: invalid syntax\n"
        );
    }
}
