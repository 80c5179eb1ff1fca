//! Read-ahead buffer over an async reader.
//!
//! Bytes returned by [`PeekableStream::peek`] stay buffered and are handed
//! out again by the [`AsyncRead`] implementation, so whatever was inspected
//! during ClientHello parsing is still relayed to the backend verbatim.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

const READ_CHUNK: usize = 4096;

pub struct PeekableStream<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> PeekableStream<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Number of bytes peeked but not yet read.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns up to `n` unread bytes without consuming them.
    ///
    /// Reads from the inner stream until `n` bytes are buffered or it reaches
    /// end of stream; a shorter slice therefore means EOF. Cancel safe: bytes
    /// read before the future is dropped remain buffered.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buffered() < n {
            self.buf.reserve(READ_CHUNK.max(n - self.buffered()));
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                break;
            }
        }
        let end = self.buf.len().min(self.pos + n);
        Ok(&self.buf[self.pos..end])
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekableStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.buf.len() {
            let n = (this.buf.len() - this.pos).min(out.remaining());
            out.put_slice(&this.buf[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.buf.len() {
                // Release the ClientHello buffer once it has been replayed
                this.buf = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}
