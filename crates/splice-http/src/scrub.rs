use crate::{BodyFraming, Fields};

/// Fields never forwarded across a hop: the hop-by-hop set from RFC 2616
/// section 13.5.1, the non-standard `Proxy-Connection` some browsers add,
/// and `Content-Length`, which the proxy re-derives.
pub const HOP_BY_HOP_FIELDS: [&str; 11] = [
    "Connection",
    "Keep-Alive",
    "Public",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailers",
    "Transfer-Encoding",
    "Upgrade",
    "Proxy-Connection",
    "Content-Length",
];

/// Removes hop-by-hop fields (including any named by `Connection` tokens)
/// and re-advertises the body framing. Strips first, then adds exactly one
/// framing field, so applying it twice with the same framing is a no-op.
pub fn scrub_fields(fields: &mut Fields, framing: BodyFraming) {
    let connection_tokens = fields.split_tokens("Connection");

    fields.retain(|field| {
        let name = field.name.as_str();
        !HOP_BY_HOP_FIELDS
            .iter()
            .any(|blocked| name.eq_ignore_ascii_case(blocked))
            && !connection_tokens
                .iter()
                .any(|token| name.eq_ignore_ascii_case(token))
    });

    match framing.known_size() {
        Some(size) => fields.add("Content-Length", size.to_string()),
        None => fields.add("Transfer-Encoding", "chunked"),
    }
}
