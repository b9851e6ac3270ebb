//! Composable data stream: one of a run's stdin, stdout or stderr channels.
//!
//! A stream holds a reader *cursor*: the source downstream consumers will see.
//! Every wiring operation swaps that cursor for a new pipe and spawns a task
//! that feeds the pipe from the old cursor, so operations compose in call
//! order. `close` freezes the cursor and drains it into the result buffer.

use super::pipe::{pipe, PipeReader, PipeWriter};
use crate::errors::StreamError;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::watch;
use tracing::{trace, warn};

/// A boxed reader used as a stream source.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A boxed writer used as a tee target.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Callback receiving stream-discipline errors.
pub type ErrorHandler = Arc<dyn Fn(StreamError) + Send + Sync>;

const CHUNK_SIZE: usize = 8 * 1024;

struct Cursor {
    reader: BoxedReader,
    closed: bool,
}

struct Inner {
    name: String,
    cursor: Mutex<Cursor>,
    result: RwLock<Vec<u8>>,
    completed: watch::Sender<bool>,
    on_error: RwLock<Option<ErrorHandler>>,
}

/// An asynchronously closing, composable byte channel.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct DataStream {
    inner: Arc<Inner>,
}

impl DataStream {
    /// Creates an empty, open stream.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (completed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                cursor: Mutex::new(Cursor {
                    reader: Box::new(tokio::io::empty()),
                    closed: false,
                }),
                result: RwLock::new(Vec::new()),
                completed,
                on_error: RwLock::new(None),
            }),
        }
    }

    /// Creates a stream with an error handler already installed.
    #[must_use]
    pub fn with_error_handler(name: impl Into<String>, handler: ErrorHandler) -> Self {
        let stream = Self::new(name);
        stream.set_error_handler(handler);
        stream
    }

    /// Returns the stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Installs the callback that receives stream-discipline errors.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.inner.on_error.write() = Some(handler);
    }

    fn report(&self, err: StreamError) {
        let handler = self.inner.on_error.read().clone();
        match handler {
            Some(handler) => handler(err),
            None => warn!(stream = %self.inner.name, error = %err, "unhandled stream error"),
        }
    }

    /// Swaps the cursor under the lock.
    ///
    /// `f` receives the current source and returns the new source plus the
    /// operation's output. On a closed stream the error is reported and `f` is
    /// never called.
    fn rewire<T>(&self, f: impl FnOnce(BoxedReader) -> (BoxedReader, T)) -> Option<T> {
        let mut cursor = self.inner.cursor.lock();
        if cursor.closed {
            drop(cursor);
            self.report(StreamError::closed(&self.inner.name));
            return None;
        }
        let current = std::mem::replace(&mut cursor.reader, Box::new(tokio::io::empty()));
        let (next, output) = f(current);
        cursor.reader = next;
        Some(output)
    }

    /// Duplicates everything that flows through the stream from now on.
    ///
    /// The stream keeps its own copy; the returned reader gets an identical one.
    pub fn copy(&self) -> Option<PipeReader> {
        self.rewire(|source| {
            let (main_writer, main_reader) = pipe();
            let (copy_writer, copy_reader) = pipe();
            tokio::spawn(fan_out(
                self.inner.name.clone(),
                source,
                vec![Box::new(main_writer) as BoxedWriter, Box::new(copy_writer)],
            ));
            (Box::new(main_reader) as BoxedReader, copy_reader)
        })
    }

    /// Splices a wiretap into the stream.
    ///
    /// Reading the interception yields the current upstream content. Whatever
    /// is written to it becomes the stream's content downstream; shut it down
    /// or drop it to finish.
    pub fn intercept(&self) -> Option<Interception> {
        self.rewire(|upstream| {
            let (writer, reader) = pipe();
            (Box::new(reader) as BoxedReader, Interception { upstream, writer })
        })
    }

    /// Appends `reader`'s content after the stream's current content.
    pub fn merge_with<R>(&self, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let name = &self.inner.name;
        self.rewire(|existing| (merged(name, existing, Box::new(reader)), ()));
    }

    /// Substitutes `reader` for the stream's content.
    ///
    /// The old content is still drained so whoever writes it never stalls.
    pub fn replace<R>(&self, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.rewire(|mut old| {
            let name = self.inner.name.clone();
            tokio::spawn(async move {
                if let Err(err) = tokio::io::copy(&mut old, &mut tokio::io::sink()).await {
                    trace!(stream = %name, error = %err, "discarding replaced content failed");
                }
            });
            (Box::new(reader) as BoxedReader, ())
        });
    }

    /// Tees the stream's content into `writer` without changing it.
    ///
    /// The writer is shut down once the source ends.
    pub fn start_copying_into<W>(&self, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.rewire(|source| {
            let (main_writer, main_reader) = pipe();
            tokio::spawn(fan_out(
                self.inner.name.clone(),
                source,
                vec![Box::new(main_writer) as BoxedWriter, Box::new(writer)],
            ));
            (Box::new(main_reader) as BoxedReader, ())
        });
    }

    /// Returns a writer whose bytes are appended to the stream.
    ///
    /// The stream does not complete until the writer is shut down or dropped.
    pub fn write_closer(&self) -> Option<PipeWriter> {
        self.rewire(|existing| {
            let (writer, reader) = pipe();
            (merged(&self.inner.name, existing, Box::new(reader)), writer)
        })
    }

    /// Closes the stream for wiring and starts draining it.
    ///
    /// Idempotent. Completion is signalled once the source reaches EOF.
    pub fn close(&self) {
        let mut source = {
            let mut cursor = self.inner.cursor.lock();
            if cursor.closed {
                return;
            }
            cursor.closed = true;
            std::mem::replace(&mut cursor.reader, Box::new(tokio::io::empty()))
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match source.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => inner.result.write().extend_from_slice(&buf[..n]),
                    Err(err) => {
                        warn!(stream = %inner.name, error = %err, "draining data stream failed");
                        break;
                    }
                }
            }
            inner.completed.send_replace(true);
        });
    }

    /// Waits until the stream has been closed and fully drained.
    pub async fn wait(&self) {
        let mut completed = self.inner.completed.subscribe();
        // The sender lives in `inner`, which this handle keeps alive.
        let _ = completed.wait_for(|done| *done).await;
    }

    /// Returns true once `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.cursor.lock().closed
    }

    /// Returns true once the stream is drained.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        *self.inner.completed.borrow()
    }

    /// Returns the accumulated content.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.inner.result.read().clone()
    }

    /// Returns the number of accumulated bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.result.read().len()
    }

    /// Returns true if nothing has accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.result.read().is_empty()
    }
}

impl fmt::Display for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.inner.result.read()))
    }
}

impl fmt::Debug for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStream")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .field("completed", &self.is_completed())
            .field("len", &self.len())
            .finish()
    }
}

/// Reader and writer halves returned by [`DataStream::intercept`].
pub struct Interception {
    upstream: BoxedReader,
    writer: PipeWriter,
}

impl Interception {
    /// Splits into the upstream reader and the downstream writer.
    #[must_use]
    pub fn into_parts(self) -> (BoxedReader, PipeWriter) {
        (self.upstream, self.writer)
    }
}

impl AsyncRead for Interception {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.upstream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Interception {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Returns a reader producing `first` then `second`, fed by a background task.
fn merged(name: &str, mut first: BoxedReader, mut second: BoxedReader) -> BoxedReader {
    let (mut writer, reader) = pipe();
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(err) = tokio::io::copy(&mut first, &mut writer).await {
            trace!(stream = %name, error = %err, "copying existing content failed");
        }
        if let Err(err) = tokio::io::copy(&mut second, &mut writer).await {
            trace!(stream = %name, error = %err, "copying merged content failed");
        }
        writer.close();
    });
    Box::new(reader)
}

/// Copies `source` into every sink, dropping sinks that fail.
///
/// The source is always read to the end so the upstream never stalls.
async fn fan_out(name: String, mut source: BoxedReader, mut sinks: Vec<BoxedWriter>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(stream = %name, error = %err, "reading fan-out source failed");
                break;
            }
        };

        let mut index = 0;
        while index < sinks.len() {
            if sinks[index].write_all(&buf[..n]).await.is_err() {
                trace!(stream = %name, "fan-out branch went away");
                drop(sinks.remove(index));
            } else {
                index += 1;
            }
        }
    }

    for mut sink in sinks {
        let _ = sink.shutdown().await;
    }
}
