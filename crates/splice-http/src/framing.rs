use thiserror::Error;

use crate::Fields;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    /// Delimited by connection close; only responses may use this.
    Unbounded,
}

impl BodyFraming {
    /// The advertised size, when one exists. `None` means chunked or
    /// close-delimited transfer.
    pub fn known_size(self) -> Option<u64> {
        match self {
            Self::None => Some(0),
            Self::ContentLength(length) => Some(length),
            Self::Chunked | Self::Unbounded => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("invalid Content-Length value")]
    InvalidContentLength,
}

/// Body framing of a request. Requests carry a body only when framing
/// headers announce one.
pub fn request_body_framing(fields: &Fields) -> Result<BodyFraming, FramingError> {
    if fields.has_token("Transfer-Encoding", "chunked") {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(fields)? {
        Some(0) | None => Ok(BodyFraming::None),
        Some(length) => Ok(BodyFraming::ContentLength(length)),
    }
}

/// Body framing of a response, which additionally depends on the request
/// method and the status code.
pub fn response_body_framing(
    fields: &Fields,
    request_method: &str,
    status: u16,
) -> Result<BodyFraming, FramingError> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyFraming::None);
    }

    if fields.has_token("Transfer-Encoding", "chunked") {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(fields)? {
        Some(0) => Ok(BodyFraming::None),
        Some(length) => Ok(BodyFraming::ContentLength(length)),
        None => Ok(BodyFraming::Unbounded),
    }
}

fn content_length(fields: &Fields) -> Result<Option<u64>, FramingError> {
    let mut value = None;
    for field in fields.iter() {
        if field.name.eq_ignore_ascii_case("content-length") {
            let parsed = field
                .value
                .parse::<u64>()
                .map_err(|_| FramingError::InvalidContentLength)?;
            value = Some(parsed);
        }
    }
    Ok(value)
}
