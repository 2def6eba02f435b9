use crate::core::{AppError, ErrorCategory};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Characters of stderr/stdout embedded in failure messages.
const FAILURE_SNIPPET_CHARS: usize = 1024;

/// Knobs for deciding whether a finished run counts as a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExternalToolResultHeuristics {
    /// Some well-behaved tools write informational text to stderr. When set,
    /// stderr content alone does not turn an exit code 0 into a failure.
    pub standard_error_is_not_error: bool,
}

impl ExternalToolResultHeuristics {
    /// Strict preset: any stderr content fails a run.
    pub const DEFAULT: Self = Self {
        standard_error_is_not_error: false,
    };

    /// Permissive preset for tool ecosystems that chat on stderr.
    pub const LINUX: Self = Self {
        standard_error_is_not_error: true,
    };
}

/// Immutable snapshot of one finished tool run.
#[derive(Debug, Clone)]
pub struct ExternalToolResult {
    command_line: String,
    exit_code: i32,
    standard_output: Option<String>,
    standard_error: Option<String>,
    started_at: DateTime<Utc>,
    duration: Duration,
    succeeded: bool,
}

impl ExternalToolResult {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        command_line: String,
        exit_code: i32,
        standard_output: Option<String>,
        standard_error: Option<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
        heuristics: ExternalToolResultHeuristics,
    ) -> Self {
        let succeeded = determine_success(exit_code, standard_error.as_deref(), heuristics);
        ExternalToolResult {
            command_line,
            exit_code,
            standard_output,
            standard_error,
            started_at,
            duration,
            succeeded,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Captured stdout, `None` when a custom consumer took the stream.
    pub fn standard_output(&self) -> Option<&str> {
        self.standard_output.as_deref()
    }

    /// Captured stderr, `None` when a custom consumer took the stream.
    pub fn standard_error(&self) -> Option<&str> {
        self.standard_error.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Success judgement, computed once at construction.
    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// Command line with censored strings already redacted.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Write captured output to the log. Stderr goes to the error level only
    /// when the run as a whole failed; tools that merely chat on stderr stay
    /// at debug.
    pub fn forward_outputs(&self) {
        if let Some(stdout) = self.standard_output.as_deref() {
            if !stdout.trim().is_empty() {
                tracing::debug!(command = %self.command_line, "tool stdout:\n{}", stdout);
            }
        }
        if let Some(stderr) = self.standard_error.as_deref() {
            if !stderr.trim().is_empty() {
                if self.succeeded {
                    tracing::debug!(command = %self.command_line, "tool stderr:\n{}", stderr);
                } else {
                    tracing::error!(command = %self.command_line, "tool stderr:\n{}", stderr);
                }
            }
        }
    }

    /// Error out unless the run succeeded.
    pub fn verify_success(&self) -> Result<(), AppError> {
        if self.succeeded {
            return Ok(());
        }
        let mut error = AppError::new(
            ErrorCategory::ToolExecutionError,
            format!(
                "tool failed with exit code {} after {:.3}s: {}",
                self.exit_code,
                self.duration.as_secs_f64(),
                self.command_line
            ),
        )
        .with_code("EXEC-007");
        if let Some(snippet) = self.failure_snippet() {
            error.add_context("output", &snippet);
        }
        Err(error)
    }

    /// Standard fire-and-check: forward outputs, raise on failure, then log
    /// the duration.
    pub fn consume(&self) -> Result<(), AppError> {
        self.forward_outputs();
        self.verify_success()?;
        tracing::debug!(
            command = %self.command_line,
            duration_ms = self.duration.as_millis() as u64,
            "tool finished"
        );
        Ok(())
    }

    /// Up to the first 1024 characters of stderr, falling back to stdout when
    /// stderr is blank.
    fn failure_snippet(&self) -> Option<String> {
        let text = [self.standard_error.as_deref(), self.standard_output.as_deref()]
            .into_iter()
            .flatten()
            .find(|candidate| !candidate.trim().is_empty())?;
        Some(text.chars().take(FAILURE_SNIPPET_CHARS).collect())
    }
}

/// Pure success classification from exit code, stderr, and heuristics.
pub(crate) fn determine_success(
    exit_code: i32,
    standard_error: Option<&str>,
    heuristics: ExternalToolResultHeuristics,
) -> bool {
    if exit_code != 0 {
        return false;
    }
    if heuristics.standard_error_is_not_error {
        return true;
    }
    standard_error.map_or(true, |stderr| stderr.trim().is_empty())
}
