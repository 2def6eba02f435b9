use crate::cli::{RunArgs, WhichArgs};
use crate::exec::{ExternalTool, ExternalToolResultHeuristics};
use crate::utils::path::resolve_executable;
use anyhow::anyhow;
use std::io::Write;
use std::time::Duration;

/// Conventional exit code for a command that hit the timeout.
const TIMEOUT_EXIT_CODE: i32 = 124;

pub async fn run(args: RunArgs) -> crate::Result<i32> {
    let timeout = Duration::from_secs(args.timeout);

    let mut tool = ExternalTool::new(&args.program).with_arguments(args.args.join(" "));
    if let Some(workdir) = args.workdir {
        tool = tool.with_working_directory(workdir);
    }
    for pair in &args.env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --env '{pair}', expected KEY=VALUE"))?;
        tool = tool.env(key, value);
    }
    if let Some(output_file) = args.output_file {
        tool = tool.with_output_file(output_file);
    }
    if args.stderr_ok {
        tool = tool.with_heuristics(ExternalToolResultHeuristics::LINUX);
    }
    for secret in args.censor {
        tool = tool.censor(secret);
    }

    let instance = tool.start()?;
    let result = match instance.get_result(timeout).await {
        Ok(result) => result,
        Err(err) if err.is_timeout() => {
            tracing::error!("{}", err.message);
            return Ok(TIMEOUT_EXIT_CODE);
        }
        Err(err) => return Err(err.into()),
    };

    if args.json {
        let payload = serde_json::json!({
            "exit_code": result.exit_code(),
            "stdout": result.standard_output(),
            "stderr": result.standard_error(),
            "duration_ms": result.duration().as_millis() as u64,
            "succeeded": result.succeeded(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        if let Some(stdout) = result.standard_output() {
            print!("{stdout}");
            std::io::stdout().flush()?;
        }
        if let Some(stderr) = result.standard_error() {
            eprint!("{stderr}");
            std::io::stderr().flush()?;
        }
    }

    Ok(exit_code_for(result.exit_code()))
}

pub fn which(args: WhichArgs) -> crate::Result<i32> {
    match resolve_executable(&args.name) {
        Ok(path) => {
            println!("{}", path.display());
            Ok(0)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(1)
        }
    }
}

/// Map the child's exit code onto our own. Signal deaths (-1) and out-of-range
/// codes collapse to 1.
fn exit_code_for(child_exit: i32) -> i32 {
    if (0..=255).contains(&child_exit) {
        child_exit
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_pass_through_in_range() {
        assert_eq!(exit_code_for(0), 0);
        assert_eq!(exit_code_for(7), 7);
        assert_eq!(exit_code_for(255), 255);
    }

    #[test]
    fn signal_death_collapses_to_one() {
        assert_eq!(exit_code_for(-1), 1);
        assert_eq!(exit_code_for(300), 1);
    }
}
