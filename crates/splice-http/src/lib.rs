//! HTTP/1.1 message-head model shared by the proxy flows: ordered header
//! fields, request-head parsing, response-head encoding, body framing, and
//! hop-by-hop scrubbing. This crate performs no I/O.

use thiserror::Error;

mod framing;
mod scrub;

pub use framing::{request_body_framing, response_body_framing, BodyFraming, FramingError};
pub use scrub::{scrub_fields, HOP_BY_HOP_FIELDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

/// Ordered list of header fields. Names compare case-insensitively and may
/// repeat; insertion order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    entries: Vec<HeaderField>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.entries.iter()
    }

    /// Returns the value of the first field with the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(name))
            .map(|field| field.value.as_str())
    }

    /// Appends a field, preserving any existing fields with the same name.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push(HeaderField {
            name: name.to_string(),
            value: value.into(),
        });
    }

    /// Replaces every field with the given name by a single occurrence.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .retain(|field| !field.name.eq_ignore_ascii_case(name));
        self.add(name, value);
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&HeaderField) -> bool) {
        self.entries.retain(|field| keep(field));
    }

    /// Collects the comma-separated tokens of every field with the given
    /// name. Empty tokens are dropped.
    pub fn split_tokens(&self, name: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|field| field.name.eq_ignore_ascii_case(name))
            .flat_map(|field| field.value.split(','))
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect()
    }

    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|field| field.name.eq_ignore_ascii_case(name))
            .flat_map(|field| field.value.split(','))
            .any(|value| value.trim().eq_ignore_ascii_case(token))
    }
}

impl FromIterator<(String, String)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(pairs: I) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(name, value)| HeaderField { name, value })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub fields: Fields,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeadError {
    #[error("malformed request head: {0}")]
    Malformed(&'static str),
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
}

/// Parses a request head, including the terminating empty line.
pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead, HeadError> {
    let text =
        std::str::from_utf8(raw).map_err(|_| HeadError::Malformed("head was not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or(HeadError::Malformed("request line is missing"))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or(HeadError::Malformed("request method is missing"))?;
    let target = parts
        .next()
        .ok_or(HeadError::Malformed("request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or(HeadError::Malformed("HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(HeadError::Malformed("request line had too many fields"));
    }

    let version = match version_text {
        "HTTP/1.0" => HttpVersion::Http10,
        "HTTP/1.1" => HttpVersion::Http11,
        text if text.starts_with("HTTP/") => return Err(HeadError::UnsupportedVersion),
        _ => return Err(HeadError::Malformed("request line had no HTTP version")),
    };

    let mut fields = Fields::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(HeadError::Malformed("malformed header line"))?;
        fields.add(name.trim(), value.trim().to_string());
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        fields,
    })
}

/// Serializes a response head, including the terminating empty line.
pub fn encode_response_head(
    version: HttpVersion,
    status: u16,
    reason: &str,
    fields: &Fields,
) -> Vec<u8> {
    let mut head = format!("{} {} {}\r\n", version.as_str(), status, reason).into_bytes();
    for field in fields.iter() {
        head.extend_from_slice(field.name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(field.value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Canonical reason phrase for a status code, or the empty string.
pub fn reason_phrase(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("")
}

/// Whether the peer asked for the connection to close after this message.
/// HTTP/1.0 defaults to close unless keep-alive was requested explicitly.
pub fn requested_close(version: HttpVersion, fields: &Fields) -> bool {
    if fields.has_token("Connection", "close") {
        return true;
    }
    version == HttpVersion::Http10 && !fields.has_token("Connection", "keep-alive")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_head_with_repeated_fields() {
        let head = parse_request_head(
            b"GET http://x.example/a HTTP/1.1\r\nHost: x.example\r\nCookie: a=1\r\nCookie: b=2\r\n\r\n",
        )
        .expect("must parse");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://x.example/a");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.fields.len(), 3);
        assert_eq!(head.fields.get("cookie"), Some("a=1"));
    }

    #[test]
    fn rejects_unsupported_version() {
        let error = parse_request_head(b"GET / HTTP/2.0\r\n\r\n").expect_err("must fail");
        assert_eq!(error, HeadError::UnsupportedVersion);
    }

    #[test]
    fn rejects_garbage_version_as_malformed() {
        let error = parse_request_head(b"GET / FTP/1.1\r\n\r\n").expect_err("must fail");
        assert!(matches!(error, HeadError::Malformed(_)));
    }

    #[test]
    fn rejects_header_line_without_colon() {
        let error = parse_request_head(b"GET / HTTP/1.1\r\nbogus\r\n\r\n").expect_err("must fail");
        assert!(matches!(error, HeadError::Malformed(_)));
    }

    #[test]
    fn set_collapses_repeated_fields() {
        let mut fields = Fields::new();
        fields.add("Connection", "close");
        fields.add("connection", "upgrade");
        fields.set("Connection", "keep-alive");
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("Connection"), Some("keep-alive"));
    }

    #[test]
    fn split_tokens_spans_repeated_fields() {
        let mut fields = Fields::new();
        fields.add("Connection", "X-Custom, close");
        fields.add("Connection", "TE");
        assert_eq!(fields.split_tokens("connection"), vec!["X-Custom", "close", "TE"]);
    }

    #[test]
    fn encodes_response_head() {
        let mut fields = Fields::new();
        fields.add("Content-Length", "0");
        let head = encode_response_head(HttpVersion::Http11, 200, "OK", &fields);
        assert_eq!(head, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
    }

    #[test]
    fn close_requested_for_http10_without_keep_alive() {
        let fields = Fields::new();
        assert!(requested_close(HttpVersion::Http10, &fields));
        assert!(!requested_close(HttpVersion::Http11, &fields));

        let mut keep_alive = Fields::new();
        keep_alive.add("Connection", "keep-alive");
        assert!(!requested_close(HttpVersion::Http10, &keep_alive));

        let mut close = Fields::new();
        close.add("Connection", "x-custom, close");
        assert!(requested_close(HttpVersion::Http11, &close));
    }

    #[test]
    fn reason_phrases_cover_proxy_status_pages() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(400), "Bad Request");
        assert_eq!(reason_phrase(404), "Not Found");
        assert_eq!(reason_phrase(500), "Internal Server Error");
        assert_eq!(reason_phrase(505), "HTTP Version Not Supported");
    }
}
