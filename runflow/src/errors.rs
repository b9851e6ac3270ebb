//! Error types for the runflow engine.
//!
//! Almost every error is recovered locally: it is logged on the responsible
//! run's logger and execution continues. The execution context collects the
//! logged errors into an [`ErrorReport`] for the end of the invocation.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The main error type for runflow operations.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A middleware argument is present but has the wrong shape.
    #[error("malformed arguments for {middleware:?}: {reason}")]
    MalformedArguments {
        /// The middleware (and argument) name.
        middleware: String,
        /// What was wrong with the value.
        reason: String,
    },

    /// A data stream was used out of order.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Two argument maps could not be merged.
    #[error(transparent)]
    MergeConflict(#[from] MergeConflictError),

    /// A path lookup ran past the end of the argument tree.
    #[error("value does not exist at path {path}")]
    PathNotFound {
        /// The dotted path that was looked up.
        path: String,
    },

    /// A path lookup crossed a value that is not a map.
    #[error("encountered something other than a string map at {path}")]
    NotAMap {
        /// The dotted path up to the offending value.
        path: String,
    },

    /// A path accessor was called without any path component.
    #[error("empty argument path")]
    EmptyPath,

    /// A shell process exited with a non-zero status.
    #[error("exit status {code}")]
    ExitStatus {
        /// The exit code.
        code: i32,
    },

    /// A run was cancelled before it ever started executing.
    #[error("cancelling a run that has not yet started")]
    NotStarted,

    /// Work was skipped because its run had been cancelled.
    #[error("run was cancelled")]
    Cancelled,

    /// A cancel hook failed.
    #[error("cancel hook failed: {0}")]
    CancelHook(String),

    /// No definition exists for a pipeline identifier.
    #[error("pipeline {0:?} could not be found")]
    UnknownPipeline(String),

    /// A conditional expression could not be evaluated.
    #[error("invalid expression {expression:?}: {reason}")]
    Expression {
        /// The expression source.
        expression: String,
        /// The parse or evaluation failure.
        reason: String,
    },

    /// An interpolation placeholder referenced a missing value.
    #[error("interpolation failed: {0}")]
    Interpolation(String),

    /// The selection prompt returned an error.
    #[error("selection prompt failed: {0}")]
    Prompt(String),

    /// Spawning or controlling an OS process failed.
    #[error("process error: {0}")]
    Process(String),

    /// A run wrote to its stderr stream.
    #[error("stderr output: {0}")]
    Stderr(String),

    /// Waiting on a dependency took longer than allowed.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// An error attributed to a specific run.
    #[error("{run}: {source}")]
    Run {
        /// The display identifier of the run.
        run: String,
        /// The underlying error.
        source: Box<PipelineError>,
    },

    /// Several errors aggregated into one.
    #[error("{}", format_multiple(.0))]
    Multiple(Vec<PipelineError>),

    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl PipelineError {
    /// Creates a malformed-arguments error.
    #[must_use]
    pub fn malformed(middleware: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedArguments {
            middleware: middleware.into(),
            reason: reason.into(),
        }
    }

    /// Attributes this error to a run.
    #[must_use]
    pub fn for_run(self, run: impl Into<String>) -> Self {
        Self::Run {
            run: run.into(),
            source: Box::new(self),
        }
    }

    /// Folds a list of errors into a single result.
    ///
    /// No errors is `Ok`, one error is returned as-is, more are wrapped in
    /// [`PipelineError::Multiple`].
    pub fn combine(mut errors: Vec<Self>) -> Result<(), Self> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Returns true for errors raised by a closed data stream.
    #[must_use]
    pub fn is_stream_error(&self) -> bool {
        match self {
            Self::Stream(_) => true,
            Self::Run { source, .. } => source.is_stream_error(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

fn format_multiple(errors: &[PipelineError]) -> String {
    let mut out = format!("{} errors occurred:", errors.len());
    for err in errors {
        out.push_str("\n\t* ");
        out.push_str(&err.to_string());
    }
    out
}

/// Errors reported by a data stream through its error callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A wiring operation was attempted after the stream was closed.
    #[error("attempt to modify closed data stream {name}")]
    Closed {
        /// The stream name.
        name: String,
    },
}

impl StreamError {
    /// Creates a closed-stream error.
    #[must_use]
    pub fn closed(name: impl Into<String>) -> Self {
        Self::Closed { name: name.into() }
    }
}

/// Error raised when a map and a non-map meet at the same key during a merge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("type mismatch at {path}: cannot merge {subject} with {other}")]
pub struct MergeConflictError {
    /// The dotted path of the conflicting key.
    pub path: String,
    /// The kind of value already present.
    pub subject: &'static str,
    /// The kind of value being merged in.
    pub other: &'static str,
}

impl MergeConflictError {
    /// Creates a new merge conflict error.
    #[must_use]
    pub fn new(path: impl Into<String>, subject: &'static str, other: &'static str) -> Self {
        Self {
            path: path.into(),
            subject,
            other,
        }
    }
}

/// Every error logged during one invocation, in the order they were logged.
#[derive(Debug, Clone, Default)]
pub struct ErrorReport {
    errors: Vec<PipelineError>,
}

impl ErrorReport {
    /// Creates a report from collected errors.
    #[must_use]
    pub fn new(errors: Vec<PipelineError>) -> Self {
        Self { errors }
    }

    /// Returns true if nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns the errors.
    #[must_use]
    pub fn errors(&self) -> &[PipelineError] {
        &self.errors
    }

    /// Converts the report into a single result.
    pub fn into_result(self) -> Result<(), PipelineError> {
        PipelineError::combine(self.errors)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "no errors");
        }
        write!(f, "{}", format_multiple(&self.errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_message() {
        let err = StreamError::closed("stdout");
        assert_eq!(
            err.to_string(),
            "attempt to modify closed data stream stdout"
        );
    }

    #[test]
    fn test_run_prefix() {
        let err = PipelineError::ExitStatus { code: 2 }.for_run("build");
        assert_eq!(err.to_string(), "build: exit status 2");
    }

    #[test]
    fn test_combine() {
        assert!(PipelineError::combine(Vec::new()).is_ok());

        let single = PipelineError::combine(vec![PipelineError::NotStarted]).unwrap_err();
        assert!(matches!(single, PipelineError::NotStarted));

        let many = PipelineError::combine(vec![
            PipelineError::NotStarted,
            PipelineError::CancelHook("boom".to_string()),
        ])
        .unwrap_err();
        let message = many.to_string();
        assert!(message.starts_with("2 errors occurred:"));
        assert!(message.contains("boom"));
    }

    #[test]
    fn test_is_stream_error() {
        let err = PipelineError::from(StreamError::closed("stdin")).for_run("anonymous");
        assert!(err.is_stream_error());
        assert!(!PipelineError::NotStarted.is_stream_error());
    }

    #[test]
    fn test_error_report() {
        let report = ErrorReport::new(vec![PipelineError::Stderr("oops".to_string())]);
        assert_eq!(report.len(), 1);
        assert!(report.to_string().contains("oops"));
        assert!(ErrorReport::default().into_result().is_ok());
    }
}
