use crate::core::{AppError, ErrorCategory, InstanceState};
use crate::exec::capture::{spawn_stdin_provider, OutputWorker};
use crate::exec::process::{ChildHandle, KillHandle, ProcessSpawner, SpawnRequest};
use crate::exec::result::{ExternalToolResult, ExternalToolResultHeuristics};
use crate::exec::tool::ExternalTool;
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// After a timeout or cancellation kill, how long the waiter still gives the
/// coordinator to flush captured output before raising. Not configurable.
const KILL_FLUSH_GRACE: Duration = Duration::from_secs(10);

type ResultSlot = Option<Arc<Result<ExternalToolResult, AppError>>>;

/// One started (or about to be started) run of an [`ExternalTool`].
///
/// Created per `start()` call on the template; the instance itself may be
/// started at most once. Any number of callers may wait on the result
/// concurrently; they all observe the same resolved or faulted outcome.
pub struct ExternalToolInstance {
    id: Uuid,
    tool: ExternalTool,
    command_line: String,
    spawner: Arc<dyn ProcessSpawner>,
    started: AtomicBool,
    state: Arc<StateCell>,
    kill: OnceLock<Arc<dyn KillHandle>>,
    result_tx: std::sync::Mutex<Option<watch::Sender<ResultSlot>>>,
    result_rx: watch::Receiver<ResultSlot>,
}

impl ExternalToolInstance {
    /// Snapshot the template. Validation happens in [`start`], not here.
    pub fn new(tool: &ExternalTool) -> Self {
        let (result_tx, result_rx) = watch::channel(None);
        ExternalToolInstance {
            id: Uuid::new_v4(),
            command_line: tool.redacted_command_line(),
            spawner: tool.spawner(),
            tool: tool.clone(),
            started: AtomicBool::new(false),
            state: Arc::new(StateCell::new()),
            kill: OnceLock::new(),
            result_tx: std::sync::Mutex::new(Some(result_tx)),
            result_rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> InstanceState {
        self.state.get()
    }

    /// Redacted command line used in logs and failure messages.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Spawn the child process and all capture workers.
    ///
    /// Validates the template, resolves the executable, opens the output
    /// mirror file, then hands the live child to a coordinator task that
    /// waits for exit, joins the output workers, mirrors captured output,
    /// and publishes the result.
    pub fn start(&self) -> Result<(), AppError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("tool instance already started: {}", self.command_line),
            )
            .with_code("EXEC-001"));
        }

        let executable = self.tool.validate_and_resolve()?;
        let request = SpawnRequest {
            program: executable,
            args: self.tool.argument_list(),
            working_directory: self.tool.working_directory().cloned(),
            env: self.tool.environment_variables().clone(),
            pipe_stdin: self.tool.stdin_provider().is_some(),
        };

        // Opened before the spawn so a spawn failure drops (closes) the
        // handle on the way out.
        let mirror = match self.tool.output_file_path() {
            Some(path) => Some(File::create(path).map_err(|err| {
                AppError::with_source(
                    ErrorCategory::IoError,
                    format!("failed to create output file {}", path.display()),
                    Box::new(err),
                )
                .with_code("EXEC-008")
            })?),
            None => None,
        };

        let started_at = Utc::now();
        let started_clock = Instant::now();
        let mut child = self.spawner.spawn(&request)?;

        self.state.set(InstanceState::Running);
        let _ = self.kill.set(child.kill_handle());
        tracing::debug!(
            instance = %self.id,
            command = %self.command_line,
            pid = child.id(),
            "started external tool"
        );

        let stdin_task = self
            .tool
            .stdin_provider()
            .map(|provider| spawn_stdin_provider(child.take_stdin(), provider, self.id));
        let stdout_worker = OutputWorker::spawn(
            child.take_stdout(),
            self.tool.stdout_consumer(),
            "stdout",
            self.id,
        );
        let stderr_worker = OutputWorker::spawn(
            child.take_stderr(),
            self.tool.stderr_consumer(),
            "stderr",
            self.id,
        );

        let result_tx = self
            .result_tx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| {
                AppError::new(
                    ErrorCategory::InternalError,
                    "result channel already taken",
                )
            })?;

        tokio::spawn(coordinate(CoordinatorInputs {
            child,
            stdout_worker,
            stderr_worker,
            stdin_task,
            mirror,
            command_line: self.command_line.clone(),
            heuristics: self.tool.result_heuristics(),
            started_at,
            started_clock,
            state: Arc::clone(&self.state),
            result_tx,
        }));

        Ok(())
    }

    /// Wait for the result, up to `timeout`.
    ///
    /// On expiry the child is killed, the coordinator is given a bounded
    /// grace period to flush captured output to the mirror file, and a
    /// timeout error is raised. The process is not guaranteed to be fully
    /// reaped by then.
    pub async fn get_result(&self, timeout: Duration) -> Result<ExternalToolResult, AppError> {
        self.ensure_started()?;
        let mut rx = self.result_rx.clone();
        // Resolved to an owned value in one expression so the watch guard
        // borrowing `rx` never outlives the statement.
        let waited = tokio::time::timeout(timeout, rx.wait_for(|slot| slot.is_some()))
            .await
            .map(take_result);
        match waited {
            Ok(resolved) => resolved,
            Err(_) => {
                tracing::warn!(
                    instance = %self.id,
                    command = %self.command_line,
                    "tool timed out, killing"
                );
                self.abandon();
                self.await_flush().await;
                Err(AppError::new(
                    ErrorCategory::TimeoutError,
                    format!(
                        "tool did not finish within {:.1}s: {}",
                        timeout.as_secs_f64(),
                        self.command_line
                    ),
                )
                .with_code("EXEC-005"))
            }
        }
    }

    /// Wait for the result until the token signals cancellation.
    ///
    /// Cancellation means "stop waiting": a kill is issued and the same
    /// bounded flush grace applies, but the caller may observe the
    /// cancellation error before the process is dead.
    pub async fn get_result_async(
        &self,
        cancel: CancellationToken,
    ) -> Result<ExternalToolResult, AppError> {
        self.ensure_started()?;
        let mut rx = self.result_rx.clone();
        tokio::select! {
            outcome = rx.wait_for(|slot| slot.is_some()) => take_result(outcome),
            _ = cancel.cancelled() => {
                tracing::warn!(
                    instance = %self.id,
                    command = %self.command_line,
                    "result wait cancelled, killing"
                );
                self.abandon();
                self.await_flush().await;
                Err(AppError::new(
                    ErrorCategory::CancelledError,
                    format!("tool execution cancelled: {}", self.command_line),
                )
                .with_code("EXEC-006"))
            }
        }
    }

    fn ensure_started(&self) -> Result<(), AppError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("tool instance not started: {}", self.command_line),
            )
            .with_code("EXEC-001"));
        }
        Ok(())
    }

    fn abandon(&self) {
        self.state.set(InstanceState::Killed);
        if let Some(kill) = self.kill.get() {
            kill.kill();
        }
    }

    async fn await_flush(&self) {
        let mut rx = self.result_rx.clone();
        let _ = tokio::time::timeout(KILL_FLUSH_GRACE, rx.wait_for(|slot| slot.is_some())).await;
    }
}

impl fmt::Debug for ExternalToolInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalToolInstance")
            .field("id", &self.id)
            .field("command_line", &self.command_line)
            .field("state", &self.state.get())
            .finish()
    }
}

fn take_result(
    outcome: Result<watch::Ref<'_, ResultSlot>, watch::error::RecvError>,
) -> Result<ExternalToolResult, AppError> {
    let slot = outcome
        .map_err(|_| {
            AppError::new(
                ErrorCategory::InternalError,
                "result channel closed before completion",
            )
        })?
        .clone();
    match slot {
        Some(shared) => match shared.as_ref() {
            Ok(result) => Ok(result.clone()),
            Err(err) => Err(err.clone_detached()),
        },
        None => Err(AppError::new(
            ErrorCategory::InternalError,
            "result slot resolved empty",
        )),
    }
}

struct CoordinatorInputs {
    child: Box<dyn ChildHandle>,
    stdout_worker: OutputWorker,
    stderr_worker: OutputWorker,
    stdin_task: Option<JoinHandle<()>>,
    mirror: Option<File>,
    command_line: String,
    heuristics: ExternalToolResultHeuristics,
    started_at: DateTime<Utc>,
    started_clock: Instant,
    state: Arc<StateCell>,
    result_tx: watch::Sender<ResultSlot>,
}

/// Coordinator worker: waits for exit, joins the output workers so captured
/// text is complete before anything is published, mirrors output, resolves
/// the result slot.
async fn coordinate(inputs: CoordinatorInputs) {
    let CoordinatorInputs {
        mut child,
        stdout_worker,
        stderr_worker,
        stdin_task,
        mirror,
        command_line,
        heuristics,
        started_at,
        started_clock,
        state,
        result_tx,
    } = inputs;

    let outcome = async {
        let exit_code = child.wait().await?;
        let standard_output = stdout_worker.settle().await?;
        let standard_error = stderr_worker.settle().await?;
        if let Some(task) = stdin_task {
            let _ = task.await;
        }
        let duration = started_clock.elapsed();

        if let Some(file) = mirror {
            write_mirror(file, standard_output.as_deref(), standard_error.as_deref())?;
        }

        Ok(ExternalToolResult::new(
            command_line,
            exit_code,
            standard_output,
            standard_error,
            started_at,
            duration,
            heuristics,
        ))
    }
    .await;

    if outcome.is_ok() {
        // A concurrent kill wins over Completed.
        state.complete_if_running();
    }
    let _ = result_tx.send(Some(Arc::new(outcome)));
}

/// Stdout then a line break then stderr, each as one block, and only the
/// internally captured streams. Custom consumers forward their own output;
/// when both streams went to consumers the file is left empty.
fn write_mirror(
    mut file: File,
    standard_output: Option<&str>,
    standard_error: Option<&str>,
) -> Result<(), AppError> {
    let mirror_failure = |err: std::io::Error| {
        AppError::with_source(
            ErrorCategory::IoError,
            "failed to write output file",
            Box::new(err),
        )
        .with_code("EXEC-008")
    };
    if standard_output.is_none() && standard_error.is_none() {
        return Ok(());
    }
    if let Some(stdout) = standard_output {
        file.write_all(stdout.as_bytes()).map_err(mirror_failure)?;
    }
    file.write_all(b"\n").map_err(mirror_failure)?;
    if let Some(stderr) = standard_error {
        file.write_all(stderr.as_bytes()).map_err(mirror_failure)?;
    }
    Ok(())
}

/// Lock-free state holder shared between the instance and its coordinator.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        StateCell(AtomicU8::new(encode(InstanceState::Created)))
    }

    fn get(&self) -> InstanceState {
        decode(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: InstanceState) {
        self.0.store(encode(state), Ordering::SeqCst);
    }

    fn complete_if_running(&self) {
        let _ = self.0.compare_exchange(
            encode(InstanceState::Running),
            encode(InstanceState::Completed),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

fn encode(state: InstanceState) -> u8 {
    match state {
        InstanceState::Created => 0,
        InstanceState::Running => 1,
        InstanceState::Completed => 2,
        InstanceState::Killed => 3,
    }
}

fn decode(raw: u8) -> InstanceState {
    match raw {
        1 => InstanceState::Running,
        2 => InstanceState::Completed,
        3 => InstanceState::Killed,
        _ => InstanceState::Created,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::process::{ChildInput, ChildOutput};
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};

    struct FakeSpawner {
        spawn_count: Arc<AtomicUsize>,
        exit_code: i32,
        exit_delay: Duration,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        fail_stdout_read: bool,
    }

    impl FakeSpawner {
        fn quick(exit_code: i32, stdout: &[u8], stderr: &[u8]) -> Self {
            FakeSpawner {
                spawn_count: Arc::default(),
                exit_code,
                exit_delay: Duration::from_millis(0),
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
                fail_stdout_read: false,
            }
        }
    }

    impl ProcessSpawner for FakeSpawner {
        fn spawn(&self, _request: &SpawnRequest) -> Result<Box<dyn ChildHandle>, AppError> {
            self.spawn_count.fetch_add(1, Ordering::SeqCst);
            let stdout: ChildOutput = if self.fail_stdout_read {
                Box::new(FailingReader)
            } else {
                Box::new(Cursor::new(self.stdout.clone()))
            };
            Ok(Box::new(FakeChild {
                exit_code: self.exit_code,
                exit_delay: self.exit_delay,
                killed: CancellationToken::new(),
                stdout: Some(stdout),
                stderr: Some(Box::new(Cursor::new(self.stderr.clone()))),
            }))
        }
    }

    struct FakeChild {
        exit_code: i32,
        exit_delay: Duration,
        killed: CancellationToken,
        stdout: Option<ChildOutput>,
        stderr: Option<ChildOutput>,
    }

    #[async_trait]
    impl ChildHandle for FakeChild {
        fn take_stdin(&mut self) -> Option<ChildInput> {
            None
        }

        fn take_stdout(&mut self) -> Option<ChildOutput> {
            self.stdout.take()
        }

        fn take_stderr(&mut self) -> Option<ChildOutput> {
            self.stderr.take()
        }

        fn kill_handle(&self) -> Arc<dyn KillHandle> {
            Arc::new(TokenKill(self.killed.clone()))
        }

        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait(&mut self) -> Result<i32, AppError> {
            tokio::select! {
                _ = tokio::time::sleep(self.exit_delay) => Ok(self.exit_code),
                _ = self.killed.cancelled() => Ok(-1),
            }
        }
    }

    struct TokenKill(CancellationToken);

    impl KillHandle for TokenKill {
        fn kill(&self) {
            self.0.cancel();
        }
    }

    struct FailingReader;

    impl tokio::io::AsyncRead for FailingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::other("scripted read failure")))
        }
    }

    fn tool_with(spawner: FakeSpawner) -> ExternalTool {
        // Template validation resolves the executable even when a fake
        // spawner never runs it, so use something that is always on PATH.
        ExternalTool::new("sh").with_spawner(Arc::new(spawner))
    }

    #[tokio::test]
    async fn double_start_errors_without_second_spawn() {
        let spawn_count = Arc::new(AtomicUsize::new(0));
        let mut spawner = FakeSpawner::quick(0, b"", b"");
        spawner.spawn_count = Arc::clone(&spawn_count);
        let instance = ExternalToolInstance::new(&tool_with(spawner));

        instance.start().unwrap();
        let err = instance.start().unwrap_err();
        assert_eq!(err.code, "EXEC-001");
        assert_eq!(spawn_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn result_visible_to_multiple_waiters() {
        let instance = ExternalToolInstance::new(&tool_with(FakeSpawner::quick(
            0,
            b"payload",
            b"",
        )));
        instance.start().unwrap();

        let first = instance.get_result(Duration::from_secs(5)).await.unwrap();
        let second = instance.get_result(Duration::from_secs(5)).await.unwrap();
        assert_eq!(first.exit_code(), 0);
        assert_eq!(first.standard_output(), Some("payload"));
        assert_eq!(second.standard_output(), Some("payload"));
        assert_eq!(instance.state(), InstanceState::Completed);
    }

    #[tokio::test]
    async fn stream_read_failure_surfaces_through_result() {
        let mut spawner = FakeSpawner::quick(0, b"", b"");
        spawner.fail_stdout_read = true;
        let instance = ExternalToolInstance::new(&tool_with(spawner));
        instance.start().unwrap();

        let err = instance.get_result(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.code, "EXEC-004");
    }

    #[tokio::test]
    async fn timeout_kills_and_later_waiters_see_killed_exit() {
        let mut spawner = FakeSpawner::quick(0, b"", b"");
        spawner.exit_delay = Duration::from_secs(30);
        let instance = ExternalToolInstance::new(&tool_with(spawner));
        instance.start().unwrap();

        let err = instance
            .get_result(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(instance.state(), InstanceState::Killed);

        // The kill lets the coordinator finish; the faulted exit is shared.
        let result = instance.get_result(Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.exit_code(), -1);
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn cancellation_raises_distinct_error() {
        let mut spawner = FakeSpawner::quick(0, b"", b"");
        spawner.exit_delay = Duration::from_secs(30);
        let instance = ExternalToolInstance::new(&tool_with(spawner));
        instance.start().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = instance.get_result_async(cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.code, "EXEC-006");
    }

    #[tokio::test]
    async fn debug_output_names_id_and_command_line() {
        let instance = ExternalToolInstance::new(&tool_with(FakeSpawner::quick(0, b"", b"")));
        let rendered = format!("{instance:?}");
        assert!(rendered.contains(&instance.id().to_string()));
        assert!(rendered.contains("sh"));
        assert!(rendered.contains("Created"));
    }

    #[tokio::test]
    async fn get_result_before_start_is_a_validation_error() {
        let instance = ExternalToolInstance::new(&tool_with(FakeSpawner::quick(0, b"", b"")));
        let err = instance.get_result(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err.code, "EXEC-001");
    }
}
