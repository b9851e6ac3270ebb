//! Execution context: run spawning, definition lookup and the stack.

mod definition;
mod execution;
mod options;

pub use definition::{Definition, Definitions};
pub use execution::{ExecutionContext, ExecutionContextBuilder};
pub use options::{ExecuteFn, RunHook, RunOptions};
