pub mod args;
pub mod commands;

pub use args::{RunArgs, WhichArgs};
use clap::{Parser, Subcommand};

const HELP_TEMPLATE: &str = "\
{name} {version}\n\
{about-with-newline}\n\
USAGE:\n    {usage}\n\
\nOPTIONS:\n{options}\n\
COMMANDS:\n{subcommands}\n";

#[derive(Parser)]
#[command(name = "runtool")]
#[command(version = crate::VERSION)]
#[command(about = "Run external tools with captured output and timeouts")]
#[command(help_template = HELP_TEMPLATE)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[command(
        about = "Run a program and capture its output",
        long_about = "Run spawns the program with piped stdout/stderr, waits up to the timeout, and reports exit code, duration, and captured output.",
        after_help = "Examples:\n    runtool run -- git status\n    runtool run --timeout 5 --output-file build.log -- make all"
    )]
    Run(RunArgs),
    #[command(
        about = "Resolve an executable name against PATH",
        after_help = "Example:\n    runtool which cargo"
    )]
    Which(WhichArgs),
}

/// Dispatch to the command handlers; the returned code becomes the process
/// exit code.
pub async fn run(args: Args) -> crate::Result<i32> {
    match args.command {
        Command::Run(run_args) => commands::run(run_args).await,
        Command::Which(which_args) => commands::which(which_args),
    }
}
