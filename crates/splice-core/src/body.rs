use std::io;
use std::sync::{Arc, Mutex};

use splice_http::BodyFraming;

use crate::conn::BufferedConn;

const CHUNK_LINE_LIMIT: usize = 8 * 1024;

/// How a request body stream ended, as observed by [`BodyStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEnd {
    /// The framing completed and a clean end of stream was observed.
    Eof,
    /// A read failed; the stored kind is the original error's.
    Error(io::ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Terminal {
    #[default]
    Active,
    Eof,
    Failed(io::ErrorKind),
    ClosedAfterEnd,
}

/// Shared view of a request body's terminal state. The connection loop keeps
/// one handle while the body travels into the round-trip callable; after the
/// response is written it asks whether the body ended in a clean EOF, which
/// decides keep-alive.
#[derive(Debug, Clone, Default)]
pub struct BodyStatus {
    inner: Arc<Mutex<Terminal>>,
}

impl BodyStatus {
    /// The observed terminal state. A body that was closed after reaching a
    /// terminal state reads back as `None`, distinguishing "ended cleanly"
    /// from "ended and was abandoned".
    pub fn body_end(&self) -> Option<BodyEnd> {
        match *self.inner.lock().expect("lock poisoned") {
            Terminal::Eof => Some(BodyEnd::Eof),
            Terminal::Failed(kind) => Some(BodyEnd::Error(kind)),
            Terminal::Active | Terminal::ClosedAfterEnd => None,
        }
    }

    fn terminal(&self) -> Terminal {
        *self.inner.lock().expect("lock poisoned")
    }

    fn store(&self, terminal: Terminal) {
        *self.inner.lock().expect("lock poisoned") = terminal;
    }

    fn close(&self) {
        let mut terminal = self.inner.lock().expect("lock poisoned");
        if matches!(*terminal, Terminal::Eof | Terminal::Failed(_)) {
            *terminal = Terminal::ClosedAfterEnd;
        }
    }
}

#[derive(Debug)]
enum Decoder {
    Sized { remaining: u64 },
    Chunked(ChunkState),
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    Done,
}

/// A request body stream, decoding content-length or chunked framing off the
/// connection. The terminal state survives in the shared [`BodyStatus`] after
/// the body itself is dropped.
pub struct RequestBody<'a> {
    conn: &'a mut BufferedConn,
    decoder: Decoder,
    status: BodyStatus,
}

impl<'a> RequestBody<'a> {
    pub(crate) fn new(conn: &'a mut BufferedConn, framing: BodyFraming, status: BodyStatus) -> Self {
        let decoder = match framing {
            BodyFraming::Chunked => Decoder::Chunked(ChunkState::Size),
            BodyFraming::ContentLength(length) => Decoder::Sized { remaining: length },
            // Requests are never close-delimited; absent framing means no
            // body is constructed at all.
            BodyFraming::None | BodyFraming::Unbounded => Decoder::Sized { remaining: 0 },
        };
        Self {
            conn,
            decoder,
            status,
        }
    }

    /// Reads decoded body bytes. `Ok(0)` marks the clean end of the body;
    /// errors are sticky and are also visible through [`BodyStatus`].
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.status.terminal() {
            Terminal::Active => {}
            Terminal::Eof => return Ok(0),
            Terminal::Failed(kind) => {
                return Err(io::Error::new(kind, "request body already failed"))
            }
            Terminal::ClosedAfterEnd => {
                return Err(io::Error::other("request body read after close"))
            }
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let result = self.fill(buf).await;
        match &result {
            Ok(0) => self.status.store(Terminal::Eof),
            Ok(_) => {}
            Err(error) => self.status.store(Terminal::Failed(error.kind())),
        }
        result
    }

    /// Reads the remainder of the body, appending to `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let mut chunk = [0_u8; 4096];
        let mut total = 0;
        loop {
            let read = self.read(&mut chunk).await?;
            if read == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..read]);
            total += read;
        }
    }

    /// Marks the body as done with. A body that already reached a terminal
    /// state is downgraded to the closed-after-end marker; an active body is
    /// left untouched.
    pub fn close(&mut self) {
        self.status.close();
    }

    async fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.decoder {
            Decoder::Sized { remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                let read = self.conn.read_some(&mut buf[..take]).await?;
                if read == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before request body completed",
                    ));
                }
                *remaining -= read as u64;
                Ok(read)
            }
            Decoder::Chunked(state) => loop {
                match state {
                    ChunkState::Size => {
                        let line = self
                            .conn
                            .read_until_pattern(b"\r\n", CHUNK_LINE_LIMIT)
                            .await?
                            .ok_or_else(|| {
                                io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "connection closed before chunk size line was read",
                                )
                            })?;
                        let length = parse_chunk_len(&line)?;
                        if length == 0 {
                            read_chunked_trailers(self.conn).await?;
                            *state = ChunkState::Done;
                            return Ok(0);
                        }
                        *state = ChunkState::Data { remaining: length };
                    }
                    ChunkState::Data { remaining } => {
                        let take = (*remaining).min(buf.len() as u64) as usize;
                        let read = self.conn.read_some(&mut buf[..take]).await?;
                        if read == 0 {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed inside a chunk",
                            ));
                        }
                        *remaining -= read as u64;
                        if *remaining == 0 {
                            let terminator = self.conn.read_exact_buffered(2).await?;
                            if terminator != b"\r\n" {
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    "invalid chunk terminator",
                                ));
                            }
                            *state = ChunkState::Size;
                        }
                        return Ok(read);
                    }
                    ChunkState::Done => return Ok(0),
                }
            },
        }
    }
}

async fn read_chunked_trailers(conn: &mut BufferedConn) -> io::Result<()> {
    loop {
        let line = conn
            .read_until_pattern(b"\r\n", CHUNK_LINE_LIMIT)
            .await?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before chunked trailers completed",
                )
            })?;
        if line == b"\r\n" {
            return Ok(());
        }
    }
}

fn parse_chunk_len(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid UTF-8",
        )
    })?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid hex length",
        )
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn conn(data: &[u8]) -> BufferedConn {
        BufferedConn::new(Box::new(Cursor::new(data.to_vec())))
    }

    #[tokio::test]
    async fn sized_body_reports_eof_on_the_read_after_the_last_byte() {
        let mut conn = conn(b"hello");
        let status = BodyStatus::default();
        let mut body = RequestBody::new(&mut conn, BodyFraming::ContentLength(5), status.clone());

        let mut buf = [0_u8; 16];
        assert_eq!(body.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        // The terminal state is delayed until the next read observes it.
        assert_eq!(status.body_end(), None);
        assert_eq!(body.read(&mut buf).await.unwrap(), 0);
        assert_eq!(status.body_end(), Some(BodyEnd::Eof));
    }

    #[tokio::test]
    async fn sized_body_fails_when_the_connection_ends_early() {
        let mut conn = conn(b"abc");
        let status = BodyStatus::default();
        let mut body = RequestBody::new(&mut conn, BodyFraming::ContentLength(5), status.clone());

        let mut out = Vec::new();
        let error = body.read_to_end(&mut out).await.expect_err("must fail");
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(out, b"abc");
        assert_eq!(
            status.body_end(),
            Some(BodyEnd::Error(io::ErrorKind::UnexpectedEof))
        );
    }

    #[tokio::test]
    async fn errors_are_sticky() {
        let mut conn = conn(b"");
        let status = BodyStatus::default();
        let mut body = RequestBody::new(&mut conn, BodyFraming::ContentLength(2), status.clone());

        let mut buf = [0_u8; 4];
        assert!(body.read(&mut buf).await.is_err());
        let again = body.read(&mut buf).await.expect_err("still failed");
        assert_eq!(again.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn chunked_body_decodes_and_ends_cleanly() {
        let mut conn = conn(b"3\r\nabc\r\n4\r\ndefg\r\n0\r\n\r\n");
        let status = BodyStatus::default();
        let mut body = RequestBody::new(&mut conn, BodyFraming::Chunked, status.clone());

        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdefg");
        assert_eq!(status.body_end(), Some(BodyEnd::Eof));
    }

    #[tokio::test]
    async fn chunked_body_skips_trailers() {
        let mut conn = conn(b"2\r\nhi\r\n0\r\nX-Meta: 1\r\n\r\n");
        let status = BodyStatus::default();
        let mut body = RequestBody::new(&mut conn, BodyFraming::Chunked, status.clone());

        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hi");
        assert_eq!(status.body_end(), Some(BodyEnd::Eof));
    }

    #[tokio::test]
    async fn chunked_body_rejects_bad_chunk_terminators() {
        let mut conn = conn(b"2\r\nhiXX");
        let status = BodyStatus::default();
        let mut body = RequestBody::new(&mut conn, BodyFraming::Chunked, status.clone());

        let mut out = Vec::new();
        let error = body.read_to_end(&mut out).await.expect_err("must fail");
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn chunked_extensions_are_ignored() {
        let mut conn = conn(b"2;name=value\r\nok\r\n0\r\n\r\n");
        let status = BodyStatus::default();
        let mut body = RequestBody::new(&mut conn, BodyFraming::Chunked, status.clone());

        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ok");
    }

    #[tokio::test]
    async fn close_after_eof_masks_the_clean_end() {
        let mut conn = conn(b"ab");
        let status = BodyStatus::default();
        let mut body = RequestBody::new(&mut conn, BodyFraming::ContentLength(2), status.clone());

        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(status.body_end(), Some(BodyEnd::Eof));

        body.close();
        assert_eq!(status.body_end(), None);

        let error = body.read(&mut [0; 1]).await.expect_err("read after close");
        assert_eq!(error.kind(), io::ErrorKind::Other);
    }

    #[tokio::test]
    async fn close_on_an_active_body_is_a_no_op() {
        let mut conn = conn(b"abcd");
        let status = BodyStatus::default();
        let mut body = RequestBody::new(&mut conn, BodyFraming::ContentLength(4), status.clone());

        body.close();
        assert_eq!(status.body_end(), None);

        let mut buf = [0_u8; 4];
        assert_eq!(body.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
    }

    #[tokio::test]
    async fn body_drains_bytes_already_buffered_on_the_connection() {
        let mut conn = conn(b"llo");
        conn.read_buf = b"he".to_vec();
        let status = BodyStatus::default();
        let mut body = RequestBody::new(&mut conn, BodyFraming::ContentLength(5), status);

        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }
}
