use crate::core::{AppError, ErrorCategory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

/// Owned read end of a child output stream.
pub type ChildOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Owned write end of the child input stream. Dropping it closes the pipe,
/// which is how the child observes EOF.
pub type ChildInput = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything needed to spawn one child process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Pipe stdin for a provider. When false the child gets the null
    /// device, never the parent's stdin.
    pub pipe_stdin: bool,
}

/// Seam between the orchestration logic and the OS process machinery, so the
/// instance state machine can be exercised against a scripted fake.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ChildHandle>, AppError>;
}

/// One live child process.
#[async_trait]
pub trait ChildHandle: Send {
    fn take_stdin(&mut self) -> Option<ChildInput>;
    fn take_stdout(&mut self) -> Option<ChildOutput>;
    fn take_stderr(&mut self) -> Option<ChildOutput>;

    /// Detachable best-effort kill switch. Usable while another task owns
    /// the handle and is blocked in [`ChildHandle::wait`].
    fn kill_handle(&self) -> Arc<dyn KillHandle>;

    fn id(&self) -> Option<u32>;

    /// Wait for the child to exit and return its exit code. A termination
    /// without an exit code (signal kill) is reported as -1.
    async fn wait(&mut self) -> Result<i32, AppError>;
}

pub trait KillHandle: Send + Sync {
    /// Best-effort, idempotent kill. Races with natural exit are tolerated.
    fn kill(&self);
}

/// Default spawner backed by `tokio::process`.
pub struct TokioProcessSpawner;

impl ProcessSpawner for TokioProcessSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ChildHandle>, AppError> {
        let _dialog_guard = suppress_error_dialogs();

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .envs(&request.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.stdin(if request.pipe_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        if let Some(ref dir) = request.working_directory {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|err| {
            let mut error = AppError::with_source(
                ErrorCategory::ToolExecutionError,
                format!("failed to start {}", request.program.display()),
                Box::new(err),
            )
            .with_code("EXEC-003");
            error.add_context("program", &request.program.display().to_string());
            error
        })?;

        // Courtesy to the host system. The child may already be gone, in
        // which case the nudge simply does not land.
        if let Some(pid) = child.id() {
            lower_priority(pid);
        }

        Ok(Box::new(TokioChildHandle { child }))
    }
}

struct TokioChildHandle {
    child: tokio::process::Child,
}

#[async_trait]
impl ChildHandle for TokioChildHandle {
    fn take_stdin(&mut self) -> Option<ChildInput> {
        self.child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as ChildInput)
    }

    fn take_stdout(&mut self) -> Option<ChildOutput> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as ChildOutput)
    }

    fn take_stderr(&mut self) -> Option<ChildOutput> {
        self.child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as ChildOutput)
    }

    fn kill_handle(&self) -> Arc<dyn KillHandle> {
        Arc::new(PidKillHandle {
            pid: self.child.id(),
        })
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<i32, AppError> {
        let status = self.child.wait().await.map_err(|err| {
            AppError::with_source(
                ErrorCategory::IoError,
                "failed to wait for child process",
                Box::new(err),
            )
            .with_code("EXEC-004")
        })?;
        Ok(status.code().unwrap_or(-1))
    }
}

struct PidKillHandle {
    pid: Option<u32>,
}

impl KillHandle for PidKillHandle {
    fn kill(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        tracing::debug!(pid, "killing child process");
        kill_by_pid(pid);
    }
}

#[cfg(unix)]
fn kill_by_pid(pid: u32) {
    // SIGKILL by pid rather than through the Child, so the wait loop can keep
    // exclusive ownership of the handle.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_by_pid(_pid: u32) {}

#[cfg(target_os = "linux")]
fn lower_priority(pid: u32) {
    unsafe {
        // Nice value 10, below normal. Failure (e.g. the process already
        // exited) is swallowed.
        libc::setpriority(libc::PRIO_PROCESS as _, pid as libc::id_t, 10);
    }
}

#[cfg(not(target_os = "linux"))]
fn lower_priority(_pid: u32) {}

/// Scoped suppression of OS crash dialogs around child startup.
///
/// Windows has a process-wide error mode that pops modal dialogs for
/// crashing children; the platforms we build on have no such concept, so the
/// guard is a no-op that keeps the orchestration code platform-neutral.
pub(crate) struct ErrorDialogSuppression;

pub(crate) fn suppress_error_dialogs() -> ErrorDialogSuppression {
    ErrorDialogSuppression
}
