pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_TIMEOUT_GRACE_MS: u64 = 250;
pub const DEFAULT_STDOUT_SIZE_BYTES: usize = 64 * 1024;
pub const DEFAULT_STDERR_SIZE_BYTES: usize = 16 * 1024;
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 200;
pub const DEFAULT_MAX_COLLECTION_LEN: usize = 100_000;

/// Extra time the isolate gets to report its own timeout before the host
/// gives up on it.
pub const ISOLATE_REPORT_SLACK_MS: u64 = 50;
pub const ISOLATE_STACK_SIZE_BYTES: usize = 64 * 1024 * 1024;

pub const EXERCISE_FILE_NAME: &str = "<exercise>";
pub const TIMEOUT_MESSAGE: &str = "Your code took too long to run";
pub const INTERPRETER_FAILURE_MESSAGE: &str =
    "SystemError: the interpreter failed while running this code";

pub const ENV_TIMEOUT_MS: &str = "SANDBOX_TIMEOUT_MS";
pub const ENV_TIMEOUT_GRACE_MS: &str = "SANDBOX_TIMEOUT_GRACE_MS";
pub const ENV_STDOUT_LIMIT_BYTES: &str = "SANDBOX_STDOUT_LIMIT_BYTES";
pub const ENV_STDERR_LIMIT_BYTES: &str = "SANDBOX_STDERR_LIMIT_BYTES";
pub const ENV_MAX_RECURSION: &str = "SANDBOX_MAX_RECURSION";
/// Largest string the interpreter will build.
pub const MAX_STRING_BYTES: usize = 16 * 1024 * 1024;
pub const MAX_FORMAT_PRECISION: usize = 10_000;

pub const STATE_RX_CLOSED: &str = "run state receiver dropped, state change not delivered";
pub const SESSION_EVENT_CAPACITY: usize = 16;
