//! Tree-walking interpreter for the Python subset learners write.
//!
//! Everything here is single-threaded (`Rc`/`RefCell` values) and meant to
//! live on one isolate thread. The host only sees [`run`].

use std::{
    sync::{Arc, Mutex, PoisonError, atomic::AtomicBool},
    time::Instant,
};

use crate::core::domain::{ExitStatus, RunRequest, RunResult};

pub mod ast;
pub mod builtins;
pub mod error;
pub mod eval;
pub mod format;
pub mod lexer;
pub mod methods;
pub mod parser;
pub mod value;

use error::ErrorKind;
use eval::Interpreter;

/// Parses and executes `request.source_snapshot` to completion.
///
/// `stdout` is shared with the caller so partial output survives a host-side
/// timeout; `interrupt` stops the interpreter at its next check.
pub fn run(
    request: &RunRequest,
    stdout: Arc<Mutex<String>>,
    interrupt: Arc<AtomicBool>,
) -> RunResult {
    let started = Instant::now();
    let outcome = parser::parse(&request.source_snapshot).and_then(|program| {
        let mut interp = Interpreter::new(request, stdout.clone(), interrupt);
        interp.exec_module(&program)
    });
    let duration_ms = started.elapsed().as_millis() as u64;
    let captured = stdout.lock().unwrap_or_else(PoisonError::into_inner).clone();

    match outcome {
        Ok(()) => RunResult {
            request_id: request.id,
            stdout: captured,
            stderr: String::new(),
            exit_status: ExitStatus::Ok,
            duration_ms,
        },
        Err(err) if err.kind == ErrorKind::Timeout => {
            RunResult::timed_out(request, captured, duration_ms)
        }
        Err(err) if err.kind == ErrorKind::Cancelled => {
            RunResult::cancelled(request, captured, duration_ms)
        }
        Err(err) => {
            tracing::debug!(request_id = %request.id, kind = err.kind.name(), "learner code raised");
            RunResult {
                request_id: request.id,
                stdout: captured,
                stderr: truncate(err.render(), request.limits.stderr_size_bytes),
                exit_status: ExitStatus::Error,
                duration_ms,
            }
        }
    }
}

fn truncate(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use super::*;
    use crate::{constants::ISOLATE_STACK_SIZE_BYTES, core::domain::ExecutionLimits};

    fn run_with(source: &str, stdin: &str, limits: ExecutionLimits) -> RunResult {
        let request = RunRequest::new(source.to_string(), stdin.to_string(), limits);
        std::thread::Builder::new()
            .stack_size(ISOLATE_STACK_SIZE_BYTES)
            .spawn(move || {
                run(
                    &request,
                    Arc::new(Mutex::new(String::new())),
                    Arc::new(AtomicBool::new(false)),
                )
            })
            .unwrap()
            .join()
            .unwrap()
    }

    fn run_source(source: &str) -> RunResult {
        run_with(source, "", ExecutionLimits::default())
    }

    #[test]
    fn test_prints_program_output() {
        let result = run_source(
            r#"
def square(n):
    return n * n

total = 0
for i in range(4):
    total += square(i)
print(f"total={total}")
print("a", "b", sep="-", end="!\n")
words = "the quick brown fox".split()
print(len(words), words[-1].upper(), sorted(words)[0])
"#,
        );

        assert_eq!(result.exit_status, ExitStatus::Ok);
        assert_eq!(result.stdout, "total=14\na-b!\n4 FOX brown\n");
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn test_empty_source_is_ok() {
        let result = run_source("");

        assert_eq!(result.exit_status, ExitStatus::Ok);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.is_empty());
        assert!(result.duration_ms < 100);
    }

    #[test]
    fn test_division_by_zero_keeps_partial_stdout() {
        let result = run_source("print(\"before\")\nx = 1 / 0\nprint(\"after\")\n");

        assert_eq!(result.exit_status, ExitStatus::Error);
        assert_eq!(result.stdout, "before\n");
        assert!(result.stderr.starts_with("Traceback (most recent call last):\n"));
        assert!(result.stderr.contains("File \"<exercise>\", line 2"));
        assert!(result.stderr.ends_with("ZeroDivisionError: division by zero\n"));
    }

    #[test]
    fn test_syntax_error_runs_nothing() {
        let result = run_source("print(\"never\")\ndef broken(:\n    pass\n");

        assert_eq!(result.exit_status, ExitStatus::Error);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.starts_with("  File \"<exercise>\", line 2\n"));
        assert!(result.stderr.contains("SyntaxError"));
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let limits = ExecutionLimits {
            time_ms: 200,
            ..ExecutionLimits::default()
        };
        let started = Instant::now();
        let result = run_with("print(\"spinning\")\nwhile True:\n    pass\n", "", limits);

        assert_eq!(result.exit_status, ExitStatus::Timeout);
        assert_eq!(result.stdout, "spinning\n");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_timeout_cannot_be_caught() {
        let limits = ExecutionLimits {
            time_ms: 100,
            ..ExecutionLimits::default()
        };
        let result = run_with(
            "try:\n    while True:\n        pass\nexcept:\n    print(\"caught\")\n",
            "",
            limits,
        );

        assert_eq!(result.exit_status, ExitStatus::Timeout);
        assert!(result.stdout.is_empty());
    }

    #[test]
    fn test_runaway_recursion_is_contained() {
        let result = run_source("def f(n):\n    return f(n + 1)\n\nf(0)\n");

        assert_eq!(result.exit_status, ExitStatus::Error);
        assert!(
            result
                .stderr
                .contains("RecursionError: maximum recursion depth exceeded")
        );
        assert!(result.stderr.contains("[Previous line repeated"));
    }

    #[test]
    fn test_imports_follow_sandbox_policy() {
        let ok = run_source("import math\nprint(math.sqrt(16))\n");
        assert_eq!(ok.stdout, "4.0\n");

        let denied = run_source("import os\n");
        assert_eq!(denied.exit_status, ExitStatus::Error);
        assert!(
            denied
                .stderr
                .contains("ImportError: module 'os' is not available in the sandbox")
        );
    }

    #[test]
    fn test_forbidden_builtins_raise_permission_error() {
        for name in ["open", "eval", "exec", "__import__", "exit"] {
            let result = run_source(&format!("{}(\"x\")\n", name));

            assert_eq!(result.exit_status, ExitStatus::Error, "{}", name);
            assert!(
                result.stderr.contains(&format!(
                    "PermissionError: '{}' is not allowed in the sandbox",
                    name
                )),
                "{}",
                result.stderr
            );
        }
    }

    #[test]
    fn test_input_reads_stdin_lines() {
        let result = run_with(
            "name = input()\nprint(\"hi \" + name)\ninput()\n",
            "Ada\n",
            ExecutionLimits::default(),
        );

        assert_eq!(result.stdout, "hi Ada\n");
        assert!(result.stderr.contains("EOFError: EOF when reading a line"));
    }

    #[test]
    fn test_output_cap_truncates_stdout() {
        let limits = ExecutionLimits {
            stdout_size_bytes: 10,
            ..ExecutionLimits::default()
        };
        let result = run_with("while True:\n    print(\"xxxx\")\n", "", limits);

        assert_eq!(result.exit_status, ExitStatus::Error);
        assert_eq!(result.stdout.len(), 10);
        assert!(result.stderr.contains("OutputLimitExceeded"));
    }

    #[test]
    fn test_collection_cap_raises_memory_error() {
        let limits = ExecutionLimits {
            max_collection_len: 100,
            ..ExecutionLimits::default()
        };
        let result = run_with("items = [0] * 1000\n", "", limits);

        assert_eq!(result.exit_status, ExitStatus::Error);
        assert!(result.stderr.contains("MemoryError"));
    }

    #[test]
    fn test_oversized_format_width_is_a_memory_error() {
        for source in [
            "print('{:>1000000000000000000}'.format(1))\n",
            "print(f'{1:>1000000000000000000}')\n",
            "print('%1000000000000000000d' % 1)\n",
        ] {
            let result = run_source(source);

            assert_eq!(result.exit_status, ExitStatus::Error, "{}", source);
            assert!(result.stderr.contains("MemoryError"), "{}", result.stderr);
        }
    }

    #[test]
    fn test_extreme_slice_step_and_precision_raise_or_succeed() {
        let result = run_source("print([1, 2, 3][2::9223372036854775807])\n");
        assert_eq!(result.exit_status, ExitStatus::Ok);
        assert_eq!(result.stdout, "[3]\n");

        let result = run_source("print('{:.1000000000000f}'.format(1.0))\n");
        assert_eq!(result.exit_status, ExitStatus::Error);
        assert!(result.stderr.contains("ValueError: precision too big"));
    }

    #[test]
    fn test_stderr_is_capped() {
        let limits = ExecutionLimits {
            stderr_size_bytes: 16,
            ..ExecutionLimits::default()
        };
        let result = run_with("raise ValueError(\"x\" * 100)\n", "", limits);

        assert_eq!(result.exit_status, ExitStatus::Error);
        assert_eq!(result.stderr.len(), 16);
    }

    #[test]
    fn test_interrupt_cancels_run() {
        let request = RunRequest::new(
            "while True:\n    pass\n".to_string(),
            String::new(),
            ExecutionLimits::default(),
        );
        let interrupt = Arc::new(AtomicBool::new(false));
        interrupt.store(true, Ordering::Relaxed);

        let result = run(&request, Arc::new(Mutex::new(String::new())), interrupt);

        assert_eq!(result.exit_status, ExitStatus::Cancelled);
        assert_eq!(result.request_id, request.id);
    }

    #[test]
    fn test_identical_source_is_deterministic() {
        let source = r#"
counts = {}
for word in "b a c a b a".split():
    counts[word] = counts.get(word, 0) + 1
for key, value in sorted(counts.items()):
    print(key, value)
print({1, 2, 3}, [x * x for x in range(5) if x % 2 == 0])
"#;
        let first = run_source(source);
        let second = run_source(source);

        assert_eq!(first.exit_status, ExitStatus::Ok);
        assert_eq!(first.stdout, "a 3\nb 2\nc 1\n{1, 2, 3} [0, 4, 16]\n");
        assert_eq!(first.stdout, second.stdout);
    }

    #[test]
    fn test_exceptions_are_catchable() {
        let result = run_source(
            r#"
try:
    [1, 2][5]
except IndexError as e:
    print("caught", e)
finally:
    print("done")
"#,
        );

        assert_eq!(result.stdout, "caught list index out of range\ndone\n");
    }
}
