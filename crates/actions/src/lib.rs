//! Custom quick actions: command templating and supervised execution.

pub mod executor;
pub mod template;

pub use executor::{CommandExecutor, ExecEvent, ExecOutcome, ExecutorError, RunHandle};
pub use template::render_command;
