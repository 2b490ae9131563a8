//! Result assembly
//!
//! Folds the raw shape of a finished run (exit code, timeout flag, OOM flag,
//! captured output) into the one record callers see. Pure; no I/O.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Output fragments that mean the program died even if it exited 0
const STACK_TRACE_MARKERS: &[&str] = &[
    "Traceback (most recent call last):",
    "Exception in thread \"",
    "panicked at",
    "goroutine 1 [",
    "Segmentation fault",
    "core dumped",
    "Uncaught ",
];

const TIME_LIMIT_NOTE: &str = "Time limit exceeded";
const MEMORY_LIMIT_NOTE: &str = "Memory limit exceeded";

/// Coarse classification of how a request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    None,
    CompileError,
    RuntimeError,
    Timeout,
    Rejected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::None => "none",
            FailureKind::CompileError => "compile_error",
            FailureKind::RuntimeError => "runtime_error",
            FailureKind::Timeout => "timeout",
            FailureKind::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// What the caller gets back for every non-fault request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    pub is_error: bool,
    pub duration_seconds: f64,
    pub failure: FailureKind,
}

impl ExecutionResult {
    /// Turned away before anything ran
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            output: message.into(),
            is_error: true,
            duration_seconds: 0.0,
            failure: FailureKind::Rejected,
        }
    }

    pub fn compile_error(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            output: output.into(),
            is_error: true,
            duration_seconds: duration.as_secs_f64(),
            failure: FailureKind::CompileError,
        }
    }
}

/// Raw outcome of the run step
#[derive(Debug, Clone, Default)]
pub struct RawOutcome {
    /// None when the process was killed by a signal or never reported one
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub oom_killed: bool,
    /// Combined stdout/stderr, already capped
    pub output: String,
}

/// Classify a raw run outcome.
///
/// Precedence: timeout, out-of-memory, non-zero exit, stack-trace markers.
pub fn assemble(raw: RawOutcome, duration: Duration) -> ExecutionResult {
    let failure = if raw.timed_out {
        FailureKind::Timeout
    } else if raw.oom_killed || raw.exit_code != Some(0) || has_stack_trace(&raw.output) {
        FailureKind::RuntimeError
    } else {
        FailureKind::None
    };

    let mut output = raw.output;
    if raw.timed_out {
        append_note(&mut output, TIME_LIMIT_NOTE);
    } else if raw.oom_killed {
        append_note(&mut output, MEMORY_LIMIT_NOTE);
    } else if raw.exit_code.is_none() {
        append_note(&mut output, "Process terminated by signal");
    }

    ExecutionResult {
        output,
        is_error: failure != FailureKind::None,
        duration_seconds: duration.as_secs_f64(),
        failure,
    }
}

fn has_stack_trace(output: &str) -> bool {
    STACK_TRACE_MARKERS.iter().any(|marker| output.contains(marker))
}

fn append_note(output: &mut String, note: &str) {
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(note);
}
