//! Per-run logger readable as a byte stream.
//!
//! Entries queue up in insertion order and are only rendered when someone
//! reads the logger. A child run's whole log can be spliced in as a single
//! reader entry, so nested output appears exactly where the child started.

use super::{default_level, LogFields, LogLevel, LogRecord};
use crate::errors::PipelineError;
use crate::stream::{pipe, BoxedReader, PipeWriter};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::trace;

/// Callback receiving every error logged, prefixed with the run identifier.
pub type ErrorCallback = Arc<dyn Fn(PipelineError) + Send + Sync>;

enum LogEntry {
    Record(LogRecord),
    Reader(BoxedReader),
}

#[derive(Default)]
struct LogState {
    queue: VecDeque<LogEntry>,
    /// Rendered bytes that did not fit into the previous read.
    pending: Vec<u8>,
    pending_offset: usize,
    counts: [usize; 5],
    errors: Vec<PipelineError>,
    closed: bool,
    waker: Option<Waker>,
}

impl LogState {
    fn push(&mut self, entry: LogEntry) {
        self.queue.push_back(entry);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// An ordered, lazily drained log.
///
/// A logger is drained by a single reader: either one [`LogReader`] or
/// repeated [`Logger::try_read`] calls, not both at once.
pub struct Logger {
    identifier: Option<String>,
    indentation: usize,
    level: RwLock<LogLevel>,
    state: Mutex<LogState>,
    error_callback: RwLock<Option<ErrorCallback>>,
}

impl Logger {
    /// Creates a logger at the process-wide default level.
    #[must_use]
    pub fn new(identifier: Option<String>, indentation: usize) -> Self {
        Self {
            identifier,
            indentation,
            level: RwLock::new(default_level()),
            state: Mutex::new(LogState::default()),
            error_callback: RwLock::new(None),
        }
    }

    /// Returns the indentation applied to this logger's entries.
    #[must_use]
    pub fn indentation(&self) -> usize {
        self.indentation
    }

    /// Returns the threshold level.
    #[must_use]
    pub fn level(&self) -> LogLevel {
        *self.level.read()
    }

    /// Changes the threshold level.
    ///
    /// Applies to every entry not yet drained.
    pub fn set_level(&self, level: LogLevel) {
        *self.level.write() = level;
    }

    /// Installs the callback invoked for every logged error.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.error_callback.write() = Some(callback);
    }

    fn add_record(&self, record: LogRecord) {
        let mut state = self.state.lock();
        state.counts[record.level.index()] += 1;
        state.push(LogEntry::Record(record));
    }

    /// Logs an error.
    pub fn error(&self, err: PipelineError) {
        self.error_with_fields(err, LogFields::new());
    }

    /// Logs an error with presentation fields.
    pub fn error_with_fields(&self, err: PipelineError, fields: LogFields) {
        let record =
            LogRecord::new(LogLevel::Error, fields, self.indentation).with_error(err.clone());
        {
            let mut state = self.state.lock();
            state.errors.push(err.clone());
            state.counts[LogLevel::Error.index()] += 1;
            state.push(LogEntry::Record(record));
        }

        let callback = self.error_callback.read().clone();
        if let Some(callback) = callback {
            let run = self.identifier.as_deref().unwrap_or("anonymous");
            callback(err.for_run(run));
        }
    }

    /// Logs a warning.
    pub fn warn(&self, err: PipelineError) {
        self.warn_with_fields(err, LogFields::new());
    }

    /// Logs a warning with presentation fields.
    pub fn warn_with_fields(&self, err: PipelineError, fields: LogFields) {
        let record = LogRecord::new(LogLevel::Warn, fields, self.indentation).with_error(err);
        self.add_record(record);
    }

    /// Logs an informational entry.
    pub fn info(&self, message: impl Into<String>) {
        self.info_with_fields(LogFields::message(message));
    }

    /// Logs an informational entry with presentation fields.
    pub fn info_with_fields(&self, fields: LogFields) {
        self.add_record(LogRecord::new(LogLevel::Info, fields, self.indentation));
    }

    /// Logs a debug entry.
    pub fn debug(&self, message: impl Into<String>) {
        self.debug_with_fields(LogFields::message(message));
    }

    /// Logs a debug entry with presentation fields.
    pub fn debug_with_fields(&self, fields: LogFields) {
        self.add_record(LogRecord::new(LogLevel::Debug, fields, self.indentation));
    }

    /// Logs a trace entry.
    pub fn trace(&self, message: impl Into<String>) {
        self.trace_with_fields(LogFields::message(message));
    }

    /// Logs a trace entry with presentation fields.
    pub fn trace_with_fields(&self, fields: LogFields) {
        self.add_record(LogRecord::new(LogLevel::Trace, fields, self.indentation));
    }

    /// Splices a byte stream into the log at the current position.
    pub fn add_reader_entry<R>(&self, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.state.lock().push(LogEntry::Reader(Box::new(reader)));
    }

    /// Splices a writer's output into the log at the current position.
    ///
    /// Later entries are held back until the writer is shut down or dropped.
    pub fn add_write_closer_entry(&self) -> PipeWriter {
        let (writer, reader) = pipe();
        self.add_reader_entry(reader);
        writer
    }

    /// Marks the logger as finished. Idempotent.
    ///
    /// Readers see EOF once everything queued has been drained.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns the number of errors logged.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.state.lock().counts[LogLevel::Error.index()]
    }

    /// Returns the number of warnings logged.
    #[must_use]
    pub fn warn_count(&self) -> usize {
        self.state.lock().counts[LogLevel::Warn.index()]
    }

    /// Returns the number of entries logged at `level`.
    #[must_use]
    pub fn count(&self, level: LogLevel) -> usize {
        self.state.lock().counts[level.index()]
    }

    /// Returns the most recent error.
    #[must_use]
    pub fn last_error(&self) -> Option<PipelineError> {
        self.state.lock().errors.last().cloned()
    }

    /// Returns every logged error message in order.
    #[must_use]
    pub fn all_error_messages(&self) -> Vec<String> {
        self.state
            .lock()
            .errors
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Returns a short warning/error summary, empty if there is nothing to report.
    #[must_use]
    pub fn summary(&self) -> String {
        let (errors, warnings) = {
            let state = self.state.lock();
            (
                state.counts[LogLevel::Error.index()],
                state.counts[LogLevel::Warn.index()],
            )
        };

        let mut parts = Vec::new();
        if errors > 0 {
            parts.push(format!("{errors} {}", plural(errors, "error")));
        }
        if warnings > 0 {
            parts.push(format!("{warnings} {}", plural(warnings, "warning")));
        }
        parts.join(", ")
    }

    /// Returns an async reader draining this logger.
    #[must_use]
    pub fn reader(self: &Arc<Self>) -> LogReader {
        LogReader {
            logger: Arc::clone(self),
        }
    }

    /// Drains without waiting.
    ///
    /// `Ok(None)` means nothing is available yet, `Ok(Some(0))` means the
    /// logger is closed and fully drained.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        let mut read_buf = ReadBuf::new(buf);
        match self.poll_drain(&mut cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Ok(Some(read_buf.filled().len())),
            Poll::Ready(Err(err)) => Err(err),
            Poll::Pending => Ok(None),
        }
    }

    /// Drains the whole log into a string; resolves once the logger is closed.
    pub async fn read_to_string(self: &Arc<Self>) -> io::Result<String> {
        let mut out = String::new();
        self.reader().read_to_string(&mut out).await?;
        Ok(out)
    }

    fn poll_drain(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let threshold = self.level();
        let mut state = self.state.lock();

        loop {
            if state.pending_offset < state.pending.len() {
                let start = state.pending_offset;
                let n = buf.remaining().min(state.pending.len() - start);
                buf.put_slice(&state.pending[start..start + n]);
                state.pending_offset += n;
                if state.pending_offset == state.pending.len() {
                    state.pending.clear();
                    state.pending_offset = 0;
                }
                return Poll::Ready(Ok(()));
            }

            let Some(front) = state.queue.front_mut() else {
                if state.closed {
                    return Poll::Ready(Ok(()));
                }
                state.waker = Some(cx.waker().clone());
                return Poll::Pending;
            };

            match front {
                LogEntry::Reader(reader) => {
                    let before = buf.filled().len();
                    let polled = Pin::new(reader).poll_read(cx, buf);
                    match polled {
                        Poll::Ready(Ok(())) if buf.filled().len() > before => {
                            return Poll::Ready(Ok(()));
                        }
                        Poll::Ready(Ok(())) => {
                            state.queue.pop_front();
                        }
                        Poll::Ready(Err(err)) => {
                            trace!(error = %err, "embedded log reader failed");
                            state.queue.pop_front();
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
                LogEntry::Record(_) => {
                    if let Some(LogEntry::Record(record)) = state.queue.pop_front() {
                        if record.level.passes(threshold) {
                            state.pending = record.render().into_bytes();
                            state.pending_offset = 0;
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Logger")
            .field("identifier", &self.identifier)
            .field("indentation", &self.indentation)
            .field("queued", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        word.to_string()
    } else {
        format!("{word}s")
    }
}

/// Async reader over a [`Logger`].
pub struct LogReader {
    logger: Arc<Logger>,
}

impl AsyncRead for LogReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.logger.poll_drain(cx, buf)
    }
}
