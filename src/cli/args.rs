use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct RunArgs {
    /// Executable to run (bare names are resolved against PATH)
    #[arg(value_name = "PROGRAM")]
    pub program: String,

    /// Arguments passed to the program verbatim
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Abort the run after this many seconds (default: 300)
    #[arg(long, default_value = "300", value_name = "SECONDS")]
    pub timeout: u64,

    /// Working directory for the child process
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Extra environment variable, KEY=VALUE (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Mirror captured stdout/stderr into this file
    #[arg(long, value_name = "FILE", help_heading = "Output Options")]
    pub output_file: Option<PathBuf>,

    /// Do not treat stderr content as a failure signal
    #[arg(long, help_heading = "Output Options")]
    pub stderr_ok: bool,

    /// Redact this string from logged command lines (repeatable)
    #[arg(long = "censor", value_name = "TEXT", help_heading = "Output Options")]
    pub censor: Vec<String>,

    /// Emit the result as a JSON object instead of raw output
    #[arg(long, help_heading = "Output Options")]
    pub json: bool,
}

#[derive(Args)]
pub struct WhichArgs {
    /// Executable name to resolve
    #[arg(value_name = "NAME")]
    pub name: String,
}
