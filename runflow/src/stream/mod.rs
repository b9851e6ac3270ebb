//! The composable data-stream engine.
//!
//! A run owns three [`DataStream`]s. Middleware rewires them while the run is
//! being set up; closing a stream freezes the wiring and drains it.

mod data_stream;
mod pipe;

pub use data_stream::{BoxedReader, BoxedWriter, DataStream, ErrorHandler, Interception};
pub use pipe::{pipe, PipeReader, PipeWriter};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads a source to EOF.
pub async fn read_all<R>(mut reader: R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await?;
    Ok(out)
}

/// Wraps bytes in a reader suitable for [`DataStream::merge_with`].
#[must_use]
pub fn bytes_reader(bytes: impl Into<Vec<u8>>) -> std::io::Cursor<Vec<u8>> {
    std::io::Cursor::new(bytes.into())
}
