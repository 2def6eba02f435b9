use crate::core::{AppError, ErrorCategory};
use crate::exec::process::{ChildInput, ChildOutput};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Callback that takes ownership of a child output stream and drains it.
/// While a consumer is attached the internal capture buffer for that stream
/// stays empty.
pub type StreamConsumer = Arc<
    dyn Fn(ChildOutput) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Callback that feeds the child's standard input. The pipe is closed when
/// the provider finishes (the handle is dropped with the future), which is
/// what delivers EOF to the child.
pub type StdinProvider = Arc<
    dyn Fn(ChildInput) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// The worker owning one output stream of a started instance.
pub(crate) enum OutputWorker {
    /// Internal capture: the full stream ends up as one string.
    Buffered(JoinHandle<Result<String, AppError>>),
    /// A caller-supplied consumer took the stream; nothing is captured.
    Consumed(JoinHandle<()>),
}

impl OutputWorker {
    pub(crate) fn spawn(
        stream: Option<ChildOutput>,
        consumer: Option<StreamConsumer>,
        stream_name: &'static str,
        instance_id: Uuid,
    ) -> Self {
        match consumer {
            Some(consumer) => OutputWorker::Consumed(spawn_consumer(
                stream,
                consumer,
                stream_name,
                instance_id,
            )),
            None => OutputWorker::Buffered(spawn_drain(stream, stream_name)),
        }
    }

    /// Wait for the worker to finish. `Some` holds the captured text,
    /// `None` means a consumer owned the stream.
    pub(crate) async fn settle(self) -> Result<Option<String>, AppError> {
        match self {
            OutputWorker::Buffered(handle) => {
                let captured = handle.await.map_err(join_failure)??;
                Ok(Some(captured))
            }
            OutputWorker::Consumed(handle) => {
                let _ = handle.await;
                Ok(None)
            }
        }
    }
}

fn spawn_drain(
    stream: Option<ChildOutput>,
    stream_name: &'static str,
) -> JoinHandle<Result<String, AppError>> {
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return Ok(String::new());
        };
        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await.map_err(|err| {
            AppError::with_source(
                ErrorCategory::IoError,
                format!("failed to read child {}", stream_name),
                Box::new(err),
            )
            .with_code("EXEC-004")
        })?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    })
}

fn spawn_consumer(
    stream: Option<ChildOutput>,
    consumer: StreamConsumer,
    stream_name: &'static str,
    instance_id: Uuid,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return;
        };
        if let Err(err) = consumer(stream).await {
            tracing::warn!(
                instance = %instance_id,
                stream = stream_name,
                error = %err,
                "output consumer failed"
            );
        }
    })
}

/// Run the stdin provider on its own task. Provider errors are logged and
/// swallowed; either way the write end is dropped so the child sees EOF
/// instead of blocking forever.
pub(crate) fn spawn_stdin_provider(
    stdin: Option<ChildInput>,
    provider: StdinProvider,
    instance_id: Uuid,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(stdin) = stdin else {
            return;
        };
        if let Err(err) = provider(stdin).await {
            tracing::warn!(
                instance = %instance_id,
                error = %err,
                "stdin provider failed"
            );
        }
    })
}

fn join_failure(err: tokio::task::JoinError) -> AppError {
    AppError::with_source(
        ErrorCategory::InternalError,
        "output capture task failed",
        Box::new(err),
    )
    .with_code("EXEC-004")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn buffered_worker_captures_full_stream() {
        let (mut tx, rx) = tokio::io::duplex(16);
        let worker = OutputWorker::spawn(
            Some(Box::new(rx)),
            None,
            "stdout",
            Uuid::new_v4(),
        );
        tx.write_all(b"hello from the child").await.unwrap();
        drop(tx);
        let captured = worker.settle().await.unwrap();
        assert_eq!(captured.as_deref(), Some("hello from the child"));
    }

    #[tokio::test]
    async fn missing_stream_captures_empty_string() {
        let worker = OutputWorker::spawn(None, None, "stderr", Uuid::new_v4());
        assert_eq!(worker.settle().await.unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn consumed_worker_reports_no_capture() {
        let (mut tx, rx) = tokio::io::duplex(16);
        let seen: Arc<std::sync::Mutex<Vec<u8>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let consumer: StreamConsumer = Arc::new(move |mut stream| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                let mut buffer = Vec::new();
                stream.read_to_end(&mut buffer).await?;
                sink.lock().unwrap().extend_from_slice(&buffer);
                Ok(())
            })
        });
        let worker = OutputWorker::spawn(
            Some(Box::new(rx)),
            Some(consumer),
            "stdout",
            Uuid::new_v4(),
        );
        tx.write_all(b"abc").await.unwrap();
        drop(tx);
        assert_eq!(worker.settle().await.unwrap(), None);
        assert_eq!(seen.lock().unwrap().as_slice(), b"abc");
    }
}
