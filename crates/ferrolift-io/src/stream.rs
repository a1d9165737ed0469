//! Streaming utilities for transfers
//!
//! [`ProgressReader`] decorates a byte stream and publishes a running byte count after every
//! read. [`copy_stream`] pumps a reader into a writer chunk by chunk, checking a cancellation
//! token at each chunk boundary.

use ferrolift_types::{Error, Result};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Timestamped running byte count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    /// Bytes read so far
    pub bytes: u64,
    /// Time of the read that produced this sample
    pub at: Instant,
}

impl ProgressSample {
    /// Sample with zero bytes taken now
    pub fn zero() -> Self {
        Self {
            bytes: 0,
            at: Instant::now(),
        }
    }
}

/// Progress-observing reader wrapper
#[derive(Debug)]
pub struct ProgressReader<R> {
    inner: R,
    bytes: u64,
    progress: watch::Sender<ProgressSample>,
}

impl<R> ProgressReader<R> {
    /// Wrap `inner`; samples are published on the returned receiver
    pub fn new(inner: R) -> (Self, watch::Receiver<ProgressSample>) {
        let (progress, receiver) = watch::channel(ProgressSample::zero());
        (
            Self {
                inner,
                bytes: 0,
                progress,
            },
            receiver,
        )
    }

    /// Bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let read = buf.filled().len() - before;
        if read > 0 {
            this.bytes += read as u64;
            this.progress.send_replace(ProgressSample {
                bytes: this.bytes,
                at: Instant::now(),
            });
        }
        Poll::Ready(Ok(()))
    }
}

/// Copy `reader` into `writer` until exhausted, then complete the writer.
///
/// Returns the number of bytes copied. Fails with [`Error::Cancelled`] as soon as `cancel`
/// fires; read and write failures are labelled with `source` and `destination`.
pub async fn copy_stream<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    cancel: &CancellationToken,
    source: &str,
    destination: &str,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            read = reader.read(&mut buffer) => read.map_err(|e| Error::from_io(&e, source))?,
        };
        if read == 0 {
            break;
        }

        writer
            .write_all(&buffer[..read])
            .await
            .map_err(|e| Error::from_io(&e, destination))?;
        total += read as u64;
    }

    writer
        .shutdown()
        .await
        .map_err(|e| Error::from_io(&e, destination))?;
    Ok(total)
}
