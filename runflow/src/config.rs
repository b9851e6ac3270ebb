//! Engine settings.
//!
//! Settings arrive from the pipeline-file parser as a JSON value and can be
//! overlaid from the environment.

use crate::errors::PipelineError;
use crate::log::LogLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable overriding [`Settings::log_level`].
pub const VERBOSITY_ENV: &str = "RUNFLOW_VERBOSITY";

/// How the `shell` middleware invokes a command given as a single string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Interpreter program.
    #[serde(default = "default_shell_program")]
    pub program: String,
    /// Flag that makes the interpreter read a command string.
    #[serde(default = "default_shell_flag")]
    pub flag: String,
}

fn default_shell_program() -> String {
    "sh".to_string()
}

fn default_shell_flag() -> String {
    "-c".to_string()
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: default_shell_program(),
            flag: default_shell_flag(),
        }
    }
}

/// Interpolation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpolationConfig {
    /// Substitution passes before giving up on nested placeholders.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

fn default_max_rounds() -> usize {
    5
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
        }
    }
}

/// Settings for the `wait-for` middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitForConfig {
    /// How often to look for runs that have not been spawned yet.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on the whole wait.
    #[serde(default = "default_wait_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_wait_timeout_ms() -> u64 {
    10 * 60 * 1000 // 10 minutes
}

impl WaitForConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for WaitForConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: default_wait_timeout_ms(),
        }
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Threshold for run loggers.
    #[serde(default)]
    pub log_level: LogLevel,
    /// Shell invocation.
    #[serde(default)]
    pub shell: ShellConfig,
    /// Interpolation.
    #[serde(default)]
    pub interpolation: InterpolationConfig,
    /// `wait-for` behaviour.
    #[serde(default)]
    pub wait_for: WaitForConfig,
    /// File the root pipeline was loaded from; its definitions win lookups.
    #[serde(default)]
    pub root_file_name: Option<String>,
}

impl Settings {
    /// Parses settings from the parser's default-settings value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, PipelineError> {
        serde_json::from_value(value)
            .map_err(|e| PipelineError::malformed("settings", e.to_string()))
    }

    /// Overlays settings from the environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(VERBOSITY_ENV) {
            match raw.parse() {
                Ok(level) => self.log_level = level,
                Err(reason) => tracing::warn!(%reason, "ignoring {VERBOSITY_ENV}"),
            }
        }
        self
    }

    /// Sets the log level.
    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets the shell interpreter.
    #[must_use]
    pub fn with_shell(mut self, program: impl Into<String>, flag: impl Into<String>) -> Self {
        self.shell = ShellConfig {
            program: program.into(),
            flag: flag.into(),
        };
        self
    }

    /// Sets the root file name.
    #[must_use]
    pub fn with_root_file_name(mut self, name: impl Into<String>) -> Self {
        self.root_file_name = Some(name.into());
        self
    }

    /// Sets the `wait-for` timeout.
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_for.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
