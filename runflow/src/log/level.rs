//! Log levels and the process-wide default threshold.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity of a log entry, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Failures.
    Error,
    /// Recoverable problems.
    Warn,
    /// Progress information.
    Info,
    /// Detailed diagnostics.
    Debug,
    /// Everything, including stream contents.
    Trace,
}

impl LogLevel {
    /// All levels, most severe first.
    pub const ALL: [Self; 5] = [
        Self::Error,
        Self::Warn,
        Self::Info,
        Self::Debug,
        Self::Trace,
    ];

    /// Returns true if an entry at this level passes `threshold`.
    #[must_use]
    pub fn passes(self, threshold: Self) -> bool {
        self <= threshold
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
            Self::Debug => write!(f, "debug"),
            Self::Trace => write!(f, "trace"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!(
                "unknown verbosity {other:?}, expected one of trace, debug, info, warn, error"
            )),
        }
    }
}

// Set once at startup, read whenever a logger is created.
static DEFAULT_LEVEL: RwLock<LogLevel> = RwLock::new(LogLevel::Info);

/// Sets the threshold new loggers start with.
pub fn set_default_level(level: LogLevel) {
    *DEFAULT_LEVEL.write() = level;
}

/// Returns the threshold new loggers start with.
pub fn default_level() -> LogLevel {
    *DEFAULT_LEVEL.read()
}
