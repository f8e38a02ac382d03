use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub(crate) const IO_CHUNK_SIZE: usize = 8 * 1024;

/// Bidirectional byte stream the proxy can hold as a trait object.
pub(crate) trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Duplex for T {}

/// A connection with a read-side buffer. Reads drain the buffer before
/// touching the stream; anything pulled off the socket past a message
/// boundary stays buffered for the next read.
pub(crate) struct BufferedConn {
    pub(crate) stream: Box<dyn Duplex>,
    pub(crate) read_buf: Vec<u8>,
}

impl BufferedConn {
    pub(crate) fn new(stream: Box<dyn Duplex>) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    /// Releases the stream together with any bytes read past the last
    /// consumed boundary.
    pub(crate) fn into_parts(self) -> (Box<dyn Duplex>, Vec<u8>) {
        (self.stream, self.read_buf)
    }

    /// Reads until `pattern` is buffered and drains everything through it.
    /// Returns `Ok(None)` when the connection closed cleanly with nothing
    /// buffered.
    pub(crate) async fn read_until_pattern(
        &mut self,
        pattern: &[u8],
        max_bytes: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(start) = find_subsequence(&self.read_buf, pattern) {
                let end = start + pattern.len();
                let bytes = self.read_buf.drain(..end).collect::<Vec<_>>();
                return Ok(Some(bytes));
            }

            if self.read_buf.len() > max_bytes {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message head exceeded configured limit",
                ));
            }

            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before message boundary was reached",
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Drains buffered bytes into `buf`, falling through to the stream once
    /// the buffer is empty.
    pub(crate) async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.read_buf.is_empty() {
            let take = self.read_buf.len().min(buf.len());
            buf[..take].copy_from_slice(&self.read_buf[..take]);
            self.read_buf.drain(..take);
            return Ok(take);
        }
        self.stream.read(buf).await
    }

    pub(crate) async fn read_exact_buffered(&mut self, len: usize) -> io::Result<Vec<u8>> {
        while self.read_buf.len() < len {
            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before fixed-length read completed",
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
        Ok(self.read_buf.drain(..len).collect::<Vec<_>>())
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Wraps a stream so reads see `prefix` before any bytes from the stream
/// itself. Writes, flushes, and shutdown delegate unchanged. Used to hand a
/// TLS server the ClientHello bytes the head reader pulled off the socket.
pub(crate) struct PrefixedStream<S> {
    inner: S,
    prefix: Vec<u8>,
    offset: usize,
}

impl<S> PrefixedStream<S> {
    pub(crate) fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            prefix,
            offset: 0,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let take = (self.prefix.len() - self.offset).min(out.remaining());
            if take > 0 {
                let start = self.offset;
                out.put_slice(&self.prefix[start..start + take]);
                self.offset += take;
                if self.offset == self.prefix.len() {
                    self.prefix = Vec::new();
                    self.offset = 0;
                }
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
