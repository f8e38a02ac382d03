use std::io;
use std::sync::atomic::Ordering;

use splice_http::{
    encode_response_head, parse_request_head, reason_phrase, request_body_framing, requested_close,
    response_body_framing, scrub_fields, BodyFraming, Fields, HeadError, HttpVersion, RequestHead,
};
use splice_observe::{Event, EventSink, EventType, FlowContext};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

use crate::body::{BodyEnd, BodyStatus, RequestBody};
use crate::conn::{BufferedConn, Duplex, PrefixedStream, IO_CHUNK_SIZE};
use crate::{Proxy, Request, Response, ResponseBody, RoundTrip, Scheme};

enum ConnectionMode {
    Plain,
    Intercepted { remote: String },
}

enum HeadReadError {
    Malformed,
    UnsupportedVersion,
    Io(io::Error),
}

impl<R, S> Proxy<R, S>
where
    R: RoundTrip + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    /// Serves one client connection until it terminates. Callers typically
    /// spawn one task per accepted connection; instances of this proxy may be
    /// shared freely between them.
    pub async fn serve<IO>(&self, stream: IO) -> io::Result<()>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let conn = BufferedConn::new(Box::new(stream));
        self.run_loop(conn, ConnectionMode::Plain, connection_id).await
    }

    async fn run_loop(
        &self,
        mut conn: BufferedConn,
        mode: ConnectionMode,
        connection_id: u64,
    ) -> io::Result<()> {
        loop {
            let head = match read_request_head(&mut conn, self.config.max_head_bytes).await {
                Ok(Some(head)) => head,
                Ok(None) => {
                    self.emit_closed(&mode, connection_id, "clean_eof");
                    return Ok(());
                }
                Err(HeadReadError::Malformed) => {
                    let response = status_response(404, "Malformed HTTP request header.");
                    // There is no parsed request here, so the write path gets
                    // a safe default method.
                    let result = write_response(&mut conn, response, "GET").await;
                    self.emit_closed(&mode, connection_id, "head_parse_failed");
                    return result;
                }
                Err(HeadReadError::UnsupportedVersion) => {
                    let response = status_response(505, "Unsupported HTTP version number.");
                    let result = write_response(&mut conn, response, "GET").await;
                    self.emit_closed(&mode, connection_id, "version_unsupported");
                    return result;
                }
                Err(HeadReadError::Io(error)) => {
                    self.emit_closed(&mode, connection_id, "io_error");
                    return Err(error);
                }
            };

            if matches!(mode, ConnectionMode::Plain) && head.method == "CONNECT" {
                return self.intercept(conn, head, connection_id).await;
            }

            let method = head.method.clone();
            let closing_requested = requested_close(head.version, &head.fields);
            let framing = request_body_framing(&head.fields)
                .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
            let has_body = framing != BodyFraming::None;
            let status = BodyStatus::default();

            let (mut response, local_page) = self
                .dispatch(&mut conn, head, framing, &status, &mode, connection_id)
                .await;

            // If the round-trip callable left request body bytes unread, the
            // next bytes on the wire may be body continuation rather than a
            // new request head; the connection must close.
            let body_ended_cleanly = !has_body || status.body_end() == Some(BodyEnd::Eof);
            let keep_alive = !closing_requested && body_ended_cleanly && !local_page;
            response
                .fields
                .set("Connection", if keep_alive { "keep-alive" } else { "close" });

            write_response(&mut conn, response, &method).await?;

            if !keep_alive {
                self.emit_closed(&mode, connection_id, "connection_close");
                return Ok(());
            }
        }
    }

    /// Forwards one request through the round-trip callable. The second
    /// return value is true when the response is a locally built status page,
    /// which always closes the connection.
    async fn dispatch(
        &self,
        conn: &mut BufferedConn,
        head: RequestHead,
        framing: BodyFraming,
        status: &BodyStatus,
        mode: &ConnectionMode,
        connection_id: u64,
    ) -> (Response, bool) {
        let (scheme, remote, target) = match mode {
            ConnectionMode::Plain => match resolve_absolute_target(&head.target) {
                Ok(parts) => parts,
                Err(page) => return (page, true),
            },
            ConnectionMode::Intercepted { remote } => {
                (Scheme::Https, remote.clone(), head.target.clone())
            }
        };

        let method = head.method;
        let mut fields = head.fields;
        scrub_fields(&mut fields, framing);
        // The upstream hop is always keep-alive; the client-facing header is
        // decided separately once the response has been produced.
        fields.set("Connection", "keep-alive");

        let body = if framing != BodyFraming::None {
            Some(RequestBody::new(conn, framing, status.clone()))
        } else {
            None
        };

        let request = Request {
            method: method.clone(),
            target,
            version: HttpVersion::Http11,
            fields,
            scheme,
            remote: remote.clone(),
            body,
        };

        self.emit(
            Event::new(
                EventType::RequestForwarded,
                self.flow_context(connection_id, scheme, &remote),
            )
            .with_attribute("method", method.clone()),
        );

        match self.round_trip.round_trip(request).await {
            Ok(mut response) => match scrub_response(&mut response, &method) {
                Ok(()) => (response, false),
                Err(_) => (status_response(500, "Could not scrub response."), true),
            },
            Err(error) => {
                self.emit(
                    Event::new(
                        EventType::UpstreamFailed,
                        self.flow_context(connection_id, scheme, &remote),
                    )
                    .with_attribute("detail", error.to_string()),
                );
                (
                    status_response(500, &format!("Round-trip to upstream failed: {error}.")),
                    true,
                )
            }
        }
    }

    /// Handles a `CONNECT` request by impersonating the target host: forge a
    /// leaf for it, confirm the tunnel in plaintext, complete a TLS handshake
    /// as the origin, then run the request loop over the TLS session.
    async fn intercept(
        &self,
        mut conn: BufferedConn,
        head: RequestHead,
        connection_id: u64,
    ) -> io::Result<()> {
        let context = self.flow_context(connection_id, Scheme::Https, &head.target);

        let Some(authority) = self.authority.as_ref() else {
            self.emit(
                Event::new(EventType::TunnelRejected, context)
                    .with_attribute("reason_code", "no_signing_authority"),
            );
            let response =
                status_response(500, "Cannot serve CONNECT requests without a signing authority.");
            return write_response(&mut conn, response, &head.method).await;
        };

        let Some(host) = connect_host(&head.target) else {
            self.emit(
                Event::new(EventType::TunnelRejected, context)
                    .with_attribute("reason_code", "invalid_target"),
            );
            let response =
                status_response(400, &format!("Invalid CONNECT address: {}.", head.target));
            return write_response(&mut conn, response, &head.method).await;
        };

        let server_config = match authority
            .forge_leaf(&host)
            .and_then(|leaf| leaf.into_server_config())
        {
            Ok(config) => config,
            Err(error) => {
                self.emit(
                    Event::new(EventType::TunnelRejected, context)
                        .with_attribute("reason_code", "forgery_failed")
                        .with_attribute("detail", error.to_string()),
                );
                let response =
                    status_response(500, &format!("Certificate forgery failed: {error}."));
                return write_response(&mut conn, response, &head.method).await;
            }
        };

        // Any bytes the head reader pulled past the CONNECT request belong to
        // the TLS session; the handshake must see them before the socket.
        let (stream, leftover) = conn.into_parts();
        let mut stream: Box<dyn Duplex> = if leftover.is_empty() {
            stream
        } else {
            Box::new(PrefixedStream::new(stream, leftover))
        };

        stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
        stream.flush().await?;

        self.emit(Event::new(EventType::TlsHandshakeStarted, context.clone()));
        let acceptor = TlsAcceptor::from(server_config);
        let tls_stream = match acceptor.accept(stream).await {
            Ok(tls_stream) => tls_stream,
            Err(error) => {
                self.emit(
                    Event::new(EventType::TlsHandshakeFailed, context)
                        .with_attribute("detail", error.to_string()),
                );
                return Err(error);
            }
        };
        self.emit(Event::new(EventType::TlsHandshakeSucceeded, context));

        Box::pin(self.run_loop(
            BufferedConn::new(Box::new(tls_stream)),
            ConnectionMode::Intercepted {
                remote: head.target,
            },
            connection_id,
        ))
        .await
    }

    fn flow_context(&self, connection_id: u64, scheme: Scheme, remote: &str) -> FlowContext {
        FlowContext {
            connection_id,
            scheme: scheme.as_str().to_string(),
            remote: remote.to_string(),
        }
    }

    fn emit(&self, event: Event) {
        self.sink.emit(event);
    }

    fn emit_closed(&self, mode: &ConnectionMode, connection_id: u64, reason: &'static str) {
        let (scheme, remote) = match mode {
            ConnectionMode::Plain => (Scheme::Http, ""),
            ConnectionMode::Intercepted { remote } => (Scheme::Https, remote.as_str()),
        };
        self.emit(
            Event::new(
                EventType::StreamClosed,
                self.flow_context(connection_id, scheme, remote),
            )
            .with_attribute("reason_code", reason),
        );
    }
}

async fn read_request_head(
    conn: &mut BufferedConn,
    max_bytes: usize,
) -> Result<Option<RequestHead>, HeadReadError> {
    let raw = match conn.read_until_pattern(b"\r\n\r\n", max_bytes).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(None),
        Err(error) if error.kind() == io::ErrorKind::InvalidData => {
            return Err(HeadReadError::Malformed)
        }
        Err(error) => return Err(HeadReadError::Io(error)),
    };
    match parse_request_head(&raw) {
        Ok(head) => Ok(Some(head)),
        Err(HeadError::UnsupportedVersion) => Err(HeadReadError::UnsupportedVersion),
        Err(HeadError::Malformed(_)) => Err(HeadReadError::Malformed),
    }
}

/// Splits a plain proxied request target into scheme, remote authority, and
/// path form. Targets must be absolute `http`/`https` URIs.
fn resolve_absolute_target(target: &str) -> Result<(Scheme, String, String), Response> {
    let uri: http::Uri = match target.parse() {
        Ok(uri) => uri,
        Err(_) => return Err(status_response(400, "Invalid URI in request.")),
    };

    let scheme = match uri.scheme_str() {
        Some("http") => Scheme::Http,
        Some("https") => Scheme::Https,
        Some(_) => return Err(status_response(400, "Invalid URI in request.")),
        None => return Err(status_response(400, "Request URI must be absolute.")),
    };
    let Some(authority) = uri.authority() else {
        return Err(status_response(400, "Request URI must be absolute."));
    };

    let remote = match authority.as_str().rsplit_once('@') {
        Some((_, host)) => host.to_string(),
        None => authority.as_str().to_string(),
    };
    let target = uri
        .path_and_query()
        .map(|path| path.as_str().to_string())
        .filter(|path| !path.is_empty())
        .unwrap_or_else(|| "/".to_string());

    Ok((scheme, remote, target))
}

/// Extracts the host from a CONNECT target, accepting only port 443.
/// Bracketed IPv6 literals are supported; bare IPv6 authorities are not.
fn connect_host(target: &str) -> Option<String> {
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, suffix) = rest.split_once(']')?;
        (host, suffix.strip_prefix(':')?)
    } else {
        let (host, port) = target.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };
    if host.is_empty() || port != "443" {
        return None;
    }
    Some(host.to_string())
}

fn scrub_response(
    response: &mut Response,
    request_method: &str,
) -> Result<(), splice_http::FramingError> {
    response.version = HttpVersion::Http11;
    let framing = response_body_framing(&response.fields, request_method, response.status)?;
    scrub_fields(&mut response.fields, framing);
    Ok(())
}

fn status_response(status: u16, message: &str) -> Response {
    let body = message.as_bytes().to_vec();
    let mut fields = Fields::new();
    fields.set("Connection", "close");
    fields.set("Content-Type", "text/plain; charset=utf-8");
    fields.set("Content-Length", body.len().to_string());
    Response {
        status,
        reason: reason_phrase(status).to_string(),
        version: HttpVersion::Http11,
        fields,
        body: Some(Box::new(std::io::Cursor::new(body))),
    }
}

/// Writes a response head and body with the framing the fields advertise.
/// The head is flushed before the body, and the body is flushed before the
/// next request is read.
async fn write_response(
    conn: &mut BufferedConn,
    response: Response,
    request_method: &str,
) -> io::Result<()> {
    let framing = response_body_framing(&response.fields, request_method, response.status)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;

    let head = encode_response_head(
        response.version,
        response.status,
        &response.reason,
        &response.fields,
    );
    conn.write_all(&head).await?;
    conn.flush().await?;

    let mut body = response.body;
    match framing {
        BodyFraming::None => {}
        BodyFraming::ContentLength(length) => {
            let body = body.as_mut().ok_or_else(missing_body)?;
            copy_exact(body, conn, length).await?;
            conn.flush().await?;
        }
        BodyFraming::Chunked => {
            let body = body.as_mut().ok_or_else(missing_body)?;
            copy_chunked(body, conn).await?;
            conn.flush().await?;
        }
        BodyFraming::Unbounded => {
            if let Some(body) = body.as_mut() {
                copy_until_eof(body, conn).await?;
            }
            conn.flush().await?;
        }
    }
    Ok(())
}

fn missing_body() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "response advertised a body but none was attached",
    )
}

async fn copy_exact(
    body: &mut ResponseBody,
    conn: &mut BufferedConn,
    mut remaining: u64,
) -> io::Result<()> {
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    while remaining > 0 {
        let take = remaining.min(IO_CHUNK_SIZE as u64) as usize;
        let read = body.read(&mut chunk[..take]).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "response body ended before the advertised length",
            ));
        }
        conn.write_all(&chunk[..read]).await?;
        remaining -= read as u64;
    }
    Ok(())
}

async fn copy_chunked(body: &mut ResponseBody, conn: &mut BufferedConn) -> io::Result<()> {
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = body.read(&mut chunk).await?;
        if read == 0 {
            return conn.write_all(b"0\r\n\r\n").await;
        }
        conn.write_all(format!("{read:x}\r\n").as_bytes()).await?;
        conn.write_all(&chunk[..read]).await?;
        conn.write_all(b"\r\n").await?;
    }
}

async fn copy_until_eof(body: &mut ResponseBody, conn: &mut BufferedConn) -> io::Result<()> {
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = body.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        conn.write_all(&chunk[..read]).await?;
    }
}
