//! External tool execution: template configuration, per-run instances with
//! concurrent output capture, timeout/cancellation kill, and heuristic
//! success classification.

pub mod capture;
pub mod instance;
pub mod process;
pub mod result;
pub mod tool;

pub use capture::{StdinProvider, StreamConsumer};
pub use instance::ExternalToolInstance;
pub use process::{
    ChildHandle, ChildInput, ChildOutput, KillHandle, ProcessSpawner, SpawnRequest,
    TokioProcessSpawner,
};
pub use result::{ExternalToolResult, ExternalToolResultHeuristics};
pub use tool::ExternalTool;

pub use tokio_util::sync::CancellationToken;
