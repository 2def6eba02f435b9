use runtool::core::InstanceState;
use runtool::exec::{CancellationToken, ExternalTool};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn write_script(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).expect("write test script");
    path
}

#[tokio::test]
async fn timeout_kills_long_sleep_early() -> Result<(), Box<dyn std::error::Error>> {
    let instance = ExternalTool::new("sleep").with_arguments("10").start()?;

    let started = Instant::now();
    let err = instance
        .get_result(Duration::from_millis(300))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout());
    assert_eq!(err.code, "EXEC-005");
    assert!(
        elapsed < Duration::from_secs(9),
        "waited {elapsed:?}, should be well under the 10s sleep"
    );
    assert_eq!(instance.state(), InstanceState::Killed);
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_the_wait_before_natural_completion(
) -> Result<(), Box<dyn std::error::Error>> {
    let instance = ExternalTool::new("sleep").with_arguments("10").start()?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = instance.get_result_async(cancel).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_cancelled());
    assert!(
        elapsed < Duration::from_secs(9),
        "waited {elapsed:?}, should be well under the 10s sleep"
    );
    Ok(())
}

#[tokio::test]
async fn mirror_file_is_flushed_even_after_a_timeout() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    // exec replaces the shell so the kill hits the sleep itself and the
    // stream pipes close immediately.
    let script = write_script(
        &dir,
        "slow.sh",
        "printf 'early-out-text'\nprintf 'early-err-text' >&2\nexec sleep 30\n",
    );
    let output_file = dir.path().join("mirror.log");

    let instance = ExternalTool::new("sh")
        .with_arguments(script.display().to_string())
        .with_output_file(&output_file)
        .start()?;
    let err = instance
        .get_result(Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // The kill only guarantees a bounded best-effort flush, so poll.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mirrored = loop {
        if let Ok(content) = std::fs::read_to_string(&output_file) {
            if content.contains("early-err-text") {
                break content;
            }
        }
        assert!(Instant::now() < deadline, "mirror file never materialized");
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    assert_eq!(mirrored.matches("early-out-text").count(), 1);
    assert_eq!(mirrored.matches("early-err-text").count(), 1);
    Ok(())
}

#[tokio::test]
async fn double_start_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let tool = ExternalTool::new("sleep").with_arguments("10");
    let instance = tool.start()?;

    let err = instance.start().unwrap_err();
    assert_eq!(err.code, "EXEC-001");

    // Shut the first (and only) child down.
    let _ = instance.get_result(Duration::from_millis(50)).await;
    Ok(())
}

#[tokio::test]
async fn late_waiters_observe_the_result_after_a_kill() -> Result<(), Box<dyn std::error::Error>> {
    let instance = ExternalTool::new("sleep").with_arguments("30").start()?;

    let err = instance
        .get_result(Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // The killed process still produces a final result for later callers.
    let result = instance.get_result(Duration::from_secs(10)).await?;
    assert!(!result.succeeded());
    assert_eq!(result.exit_code(), -1);
    Ok(())
}
