use crate::core::{AppError, ErrorCategory};
use crate::exec::capture::{StdinProvider, StreamConsumer};
use crate::exec::instance::ExternalToolInstance;
use crate::exec::process::{
    ChildInput, ChildOutput, ProcessSpawner, TokioProcessSpawner,
};
use crate::exec::result::{ExternalToolResult, ExternalToolResultHeuristics};
use crate::utils::path::resolve_executable;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const REDACTION_MARKER: &str = "*****";

/// Reusable template describing how to run one external tool.
///
/// A template is a plain value bag: configure it with the builder methods,
/// then call [`start`](ExternalTool::start) as many times as needed; every
/// call produces an independent [`ExternalToolInstance`]. Validation happens
/// at start time, not at construction.
#[derive(Clone)]
pub struct ExternalTool {
    executable_path: String,
    arguments: String,
    working_directory: Option<PathBuf>,
    environment_variables: HashMap<String, String>,
    output_file_path: Option<PathBuf>,
    result_heuristics: ExternalToolResultHeuristics,
    stdin_provider: Option<StdinProvider>,
    stdout_consumer: Option<StreamConsumer>,
    stderr_consumer: Option<StreamConsumer>,
    censored_strings: Vec<String>,
    spawner: Arc<dyn ProcessSpawner>,
}

impl ExternalTool {
    pub fn new<S: Into<String>>(executable_path: S) -> Self {
        ExternalTool {
            executable_path: executable_path.into(),
            arguments: String::new(),
            working_directory: None,
            environment_variables: HashMap::new(),
            output_file_path: None,
            result_heuristics: ExternalToolResultHeuristics::DEFAULT,
            stdin_provider: None,
            stdout_consumer: None,
            stderr_consumer: None,
            censored_strings: Vec::new(),
            spawner: Arc::new(TokioProcessSpawner),
        }
    }

    /// Raw argument string. Split on whitespace at spawn time; shell quoting
    /// is out of scope.
    pub fn with_arguments<S: Into<String>>(mut self, arguments: S) -> Self {
        self.arguments = arguments.into();
        self
    }

    pub fn with_working_directory<P: Into<PathBuf>>(mut self, directory: P) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    /// Add one environment variable on top of the inherited environment.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }

    pub fn with_environment(mut self, variables: HashMap<String, String>) -> Self {
        self.environment_variables.extend(variables);
        self
    }

    /// Mirror internally captured stdout/stderr into this file after the run.
    pub fn with_output_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output_file_path = Some(path.into());
        self
    }

    pub fn with_heuristics(mut self, heuristics: ExternalToolResultHeuristics) -> Self {
        self.result_heuristics = heuristics;
        self
    }

    /// Feed the child's standard input from a callback. The pipe is closed
    /// when the callback finishes so the child sees EOF.
    ///
    /// Without a provider the child's stdin is attached to the null device
    /// rather than inherited, so a tool that reads stdin gets immediate EOF
    /// instead of blocking on the caller's terminal.
    pub fn with_stdin_provider<F, Fut>(mut self, provider: F) -> Self
    where
        F: Fn(ChildInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::io::Result<()>> + Send + 'static,
    {
        self.stdin_provider = Some(Arc::new(move |stdin| Box::pin(provider(stdin))));
        self
    }

    /// Hand stdout to a callback instead of capturing it. The result's
    /// `standard_output` will be `None` for instances started afterwards.
    pub fn with_stdout_consumer<F, Fut>(mut self, consumer: F) -> Self
    where
        F: Fn(ChildOutput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::io::Result<()>> + Send + 'static,
    {
        self.stdout_consumer = Some(Arc::new(move |stream| Box::pin(consumer(stream))));
        self
    }

    /// Hand stderr to a callback instead of capturing it.
    pub fn with_stderr_consumer<F, Fut>(mut self, consumer: F) -> Self
    where
        F: Fn(ChildOutput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::io::Result<()>> + Send + 'static,
    {
        self.stderr_consumer = Some(Arc::new(move |stream| Box::pin(consumer(stream))));
        self
    }

    /// Redact this string from logged command lines and failure messages.
    /// Captured output is not touched.
    pub fn censor<S: Into<String>>(mut self, secret: S) -> Self {
        self.censored_strings.push(secret.into());
        self
    }

    /// Replace the OS process seam, used by tests to script child behavior.
    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Validate the template, spawn the process, and return the running
    /// instance.
    pub fn start(&self) -> Result<ExternalToolInstance, AppError> {
        let instance = ExternalToolInstance::new(self);
        instance.start()?;
        Ok(instance)
    }

    /// One-shot facade: start, wait up to `timeout`, consume (forward
    /// outputs and raise on failure), and return the result.
    pub async fn execute(
        executable_path: &str,
        arguments: &str,
        timeout: Duration,
    ) -> Result<ExternalToolResult, AppError> {
        let instance = ExternalTool::new(executable_path)
            .with_arguments(arguments)
            .start()?;
        let result = instance.get_result(timeout).await?;
        result.consume()?;
        Ok(result)
    }

    /// Cancellable one-shot facade over the full instance lifecycle.
    pub async fn execute_async(
        executable_path: &str,
        arguments: &str,
        cancel: CancellationToken,
    ) -> Result<ExternalToolResult, AppError> {
        let instance = ExternalTool::new(executable_path)
            .with_arguments(arguments)
            .start()?;
        let result = instance.get_result_async(cancel).await?;
        result.consume()?;
        Ok(result)
    }

    /// Command line for logs and errors, censored strings redacted.
    pub fn redacted_command_line(&self) -> String {
        let mut line = if self.arguments.trim().is_empty() {
            self.executable_path.clone()
        } else {
            format!("{} {}", self.executable_path, self.arguments)
        };
        for secret in &self.censored_strings {
            if !secret.is_empty() {
                line = line.replace(secret, REDACTION_MARKER);
            }
        }
        line
    }

    pub(crate) fn validate_and_resolve(&self) -> Result<PathBuf, AppError> {
        if self.executable_path.trim().is_empty() {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "executable path must not be blank",
            )
            .with_code("EXEC-001"));
        }
        if let Some(ref directory) = self.working_directory {
            if !directory.is_dir() {
                return Err(AppError::new(
                    ErrorCategory::ValidationError,
                    format!(
                        "working directory does not exist: {}",
                        directory.display()
                    ),
                )
                .with_code("EXEC-001"));
            }
        }
        resolve_executable(&self.executable_path).map_err(|err| {
            let mut error = AppError::new(ErrorCategory::ResolutionError, err.to_string())
                .with_code("EXEC-002");
            error.add_context("executable", &self.executable_path);
            error
        })
    }

    pub(crate) fn argument_list(&self) -> Vec<String> {
        self.arguments
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub(crate) fn working_directory(&self) -> Option<&PathBuf> {
        self.working_directory.as_ref()
    }

    pub(crate) fn environment_variables(&self) -> &HashMap<String, String> {
        &self.environment_variables
    }

    pub(crate) fn output_file_path(&self) -> Option<&PathBuf> {
        self.output_file_path.as_ref()
    }

    pub(crate) fn result_heuristics(&self) -> ExternalToolResultHeuristics {
        self.result_heuristics
    }

    pub(crate) fn stdin_provider(&self) -> Option<StdinProvider> {
        self.stdin_provider.clone()
    }

    pub(crate) fn stdout_consumer(&self) -> Option<StreamConsumer> {
        self.stdout_consumer.clone()
    }

    pub(crate) fn stderr_consumer(&self) -> Option<StreamConsumer> {
        self.stderr_consumer.clone()
    }

    pub(crate) fn spawner(&self) -> Arc<dyn ProcessSpawner> {
        Arc::clone(&self.spawner)
    }
}

impl fmt::Debug for ExternalTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalTool")
            .field("command_line", &self.redacted_command_line())
            .field("working_directory", &self.working_directory)
            .field("output_file_path", &self.output_file_path)
            .field("result_heuristics", &self.result_heuristics)
            .field("has_stdin_provider", &self.stdin_provider.is_some())
            .field("has_stdout_consumer", &self.stdout_consumer.is_some())
            .field("has_stderr_consumer", &self.stderr_consumer.is_some())
            .finish()
    }
}
