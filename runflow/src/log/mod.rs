//! User-visible run logs.
//!
//! Every run owns a [`Logger`]. Loggers are ordered queues of leveled entries
//! that render lazily when read; a child run's logger is embedded in its
//! parent's as a reader entry, which produces the indented tree users see.
//! Internal diagnostics go through `tracing` instead.

mod entry;
mod level;
mod logger;

pub use entry::{LogColor, LogFields, LogRecord};
pub use level::{default_level, set_default_level, LogLevel};
pub use logger::{ErrorCallback, LogReader, Logger};
