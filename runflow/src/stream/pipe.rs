//! Unbounded in-memory byte pipe.
//!
//! ```text
//!   PipeWriter ──▶ [VecDeque<u8>] ──▶ PipeReader
//!                  ├── writes never wait
//!                  ├── reader waits when empty
//!                  ├── shutdown/drop writer → EOF
//!                  └── drop reader → broken pipe for the writer
//! ```
//!
//! Writers never wait because stream wiring chains many pipes through
//! background copy tasks; a bounded buffer anywhere in such a chain can stall a
//! task that another branch of the same fan-out is waiting on.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Default)]
struct PipeState {
    buffer: VecDeque<u8>,
    reader_waker: Option<Waker>,
    writer_closed: bool,
    reader_closed: bool,
}

impl PipeState {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.reader_waker.take() {
            waker.wake();
        }
    }
}

/// Writing end of a pipe.
pub struct PipeWriter {
    shared: Arc<Mutex<PipeState>>,
}

/// Reading end of a pipe.
pub struct PipeReader {
    shared: Arc<Mutex<PipeState>>,
}

/// Creates a connected pipe pair.
#[must_use]
pub fn pipe() -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Mutex::new(PipeState::default()));
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

impl PipeWriter {
    /// Marks the pipe as finished; the reader sees EOF once drained.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.writer_closed = true;
        state.wake_reader();
    }

    /// Returns true once the reading end has been dropped.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.shared.lock().reader_closed
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.shared.lock();
        if state.reader_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe reader closed",
            )));
        }
        if state.writer_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after pipe shutdown",
            )));
        }
        state.buffer.extend(buf);
        state.wake_reader();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();

        if !state.buffer.is_empty() {
            let to_read = buf.remaining().min(state.buffer.len());
            let (front, back) = state.buffer.as_slices();
            if to_read <= front.len() {
                buf.put_slice(&front[..to_read]);
            } else {
                buf.put_slice(front);
                buf.put_slice(&back[..to_read - front.len()]);
            }
            state.buffer.drain(..to_read);
            Poll::Ready(Ok(()))
        } else if state.writer_closed {
            Poll::Ready(Ok(()))
        } else {
            state.reader_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.reader_closed = true;
        state.buffer.clear();
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter").finish()
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader").finish()
    }
}
