use runtool::core::ErrorCategory;
use runtool::exec::ExternalTool;
use runtool::utils::path::resolve_executable;
use std::time::Duration;

#[tokio::test]
async fn bare_names_resolve_before_spawn() -> Result<(), Box<dyn std::error::Error>> {
    let resolved = resolve_executable("sleep")?;
    assert!(resolved.is_absolute());

    // Absolute and bare invocations behave the same.
    let result = ExternalTool::new(resolved.to_str().unwrap())
        .with_arguments("0")
        .start()?
        .get_result(Duration::from_secs(30))
        .await?;
    assert!(result.succeeded());
    Ok(())
}

#[tokio::test]
async fn unresolvable_name_fails_start_synchronously() {
    let err = ExternalTool::new("runtool_no_such_binary_anywhere")
        .with_arguments("--help")
        .start()
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::ResolutionError);
    assert_eq!(err.code, "EXEC-002");
    assert!(err.message.contains("runtool_no_such_binary_anywhere"));
}
