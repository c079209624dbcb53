//! Small extensions over `rsip` parsed types.
//!
//! `rsip` leaves a few headers untyped (`RSeq`, `RAck`, `Event`,
//! `Subscription-State`); the helpers here parse them on demand from the
//! stored header list instead of keeping a second parsed copy around.

use crate::{Error, Result};
use rsip::{
    message::HasHeaders,
    prelude::{HeadersExt, UntypedHeader},
    Header, Method,
};
use std::hash::{Hash, Hasher};

/// Extract the URI from a Contact header value such as
/// `"Bob" <sip:bob@host:5060;transport=tcp>;expires=60`.
pub fn extract_uri_from_contact(line: &str) -> Result<rsip::Uri> {
    let uri_part = match (line.find('<'), line.find('>')) {
        (Some(start), Some(end)) if end > start => &line[start + 1..end],
        _ => line.split(';').next().unwrap_or(line),
    };
    rsip::Uri::try_from(uri_part.trim())
        .map_err(|e| Error::SipMessageError(format!("invalid contact uri {}: {}", line, e)))
}

/// Lookup the raw value of a header by name, covering both typed and
/// `Header::Other` representations. Name comparison is ASCII case-insensitive.
pub fn header_value(headers: &rsip::Headers, name: &str) -> Option<String> {
    for header in headers.iter() {
        match header {
            Header::Other(n, v) if n.eq_ignore_ascii_case(name) => {
                return Some(v.to_string());
            }
            Header::Supported(s) if name.eq_ignore_ascii_case("supported") => {
                return Some(s.value().to_string());
            }
            Header::Require(r) if name.eq_ignore_ascii_case("require") => {
                return Some(r.value().to_string());
            }
            _ => {}
        }
    }
    None
}

/// True when a comma-separated token header (`Supported`, `Require`, ...)
/// contains the given token, case-insensitively.
pub fn header_contains_token(headers: &rsip::Headers, name: &str, token: &str) -> bool {
    header_value(headers, name)
        .map(|value| {
            value
                .split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

/// Parse the `RSeq` header of a reliable provisional response (RFC 3262 §7.1).
pub fn parse_rseq_header(headers: &rsip::Headers) -> Option<u32> {
    header_value(headers, "RSeq").and_then(|v| v.trim().parse().ok())
}

/// Parse the `RAck` header of a PRACK (RFC 3262 §7.2): `RSeq CSeq Method`.
pub fn parse_rack_header(headers: &rsip::Headers) -> Option<(u32, u32, Method)> {
    let value = header_value(headers, "RAck")?;
    let mut parts = value.split_whitespace();
    let rseq = parts.next()?.parse().ok()?;
    let cseq = parts.next()?.parse().ok()?;
    let method = parts.next()?.parse::<Method>().ok()?;
    Some((rseq, cseq, method))
}

/// The event package of an `Event` header with its optional `id` parameter,
/// normalized for RFC 3265 §7.2.1 matching (`refer;id=7` != `refer`).
pub fn parse_event_header(headers: &rsip::Headers) -> Option<String> {
    let value = header_value(headers, "Event")?;
    let mut parts = value.split(';');
    let package = parts.next()?.trim().to_ascii_lowercase();
    let id = parts
        .map(str::trim)
        .find(|p| p.to_ascii_lowercase().starts_with("id="))
        .map(|p| p[3..].trim().to_ascii_lowercase());
    match id {
        Some(id) => Some(format!("{};id={}", package, id)),
        None => Some(package),
    }
}

/// True for methods allowed to refresh the dialog's remote target in-dialog
/// (RFC 3261 §12.2, RFC 3265 §3.3.3, RFC 3515).
pub fn is_target_refresh(method: &Method) -> bool {
    matches!(
        method,
        Method::Invite | Method::Update | Method::Subscribe | Method::Notify | Method::Refer
    )
}

/// Stable fingerprint component for a message body, used to tell forked
/// response retransmissions apart from new provisional offers.
pub fn body_hash(body: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    body.hash(&mut hasher);
    hasher.finish()
}

/// Build a response for a request the way a stateless layer would: Via,
/// From, To (tag supplied by the caller when needed), CSeq, Call-ID copied
/// from the request.
pub fn make_response(
    request: &rsip::Request,
    status: rsip::StatusCode,
    body: Option<Vec<u8>>,
) -> rsip::Response {
    let mut headers = rsip::Headers::default();
    for header in request.headers().iter() {
        match header {
            Header::Via(v) => headers.push(Header::Via(v.clone())),
            Header::From(f) => headers.push(Header::From(f.clone())),
            Header::To(t) => headers.push(Header::To(t.clone())),
            Header::CSeq(c) => headers.push(Header::CSeq(c.clone())),
            Header::CallId(c) => headers.push(Header::CallId(c.clone())),
            _ => {}
        }
    }
    headers.push(Header::ContentLength(
        body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
    ));
    rsip::Response {
        status_code: status,
        headers,
        body: body.unwrap_or_default(),
        version: request.version.clone(),
    }
}

/// Response-side helpers used by the dialog layer.
pub trait RsipResponseExt {
    /// The remote target learned from the response's Contact header, falling
    /// back to `None` when the peer omitted it.
    fn contact_uri(&self) -> Option<rsip::Uri>;
}

impl RsipResponseExt for rsip::Response {
    fn contact_uri(&self) -> Option<rsip::Uri> {
        self.contact_header()
            .ok()
            .and_then(|c| extract_uri_from_contact(c.value()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &str, value: &str) -> rsip::Headers {
        let mut headers = rsip::Headers::default();
        headers.push(Header::Other(name.into(), value.into()));
        headers
    }

    #[test]
    fn rack_parses_rseq_cseq_method() {
        let headers = headers_with("RAck", "7 5 INVITE");
        assert_eq!(
            parse_rack_header(&headers),
            Some((7, 5, Method::Invite))
        );
    }

    #[test]
    fn rack_rejects_short_values() {
        let headers = headers_with("RAck", "7 5");
        assert_eq!(parse_rack_header(&headers), None);
    }

    #[test]
    fn rseq_parses() {
        let headers = headers_with("RSeq", " 772 ");
        assert_eq!(parse_rseq_header(&headers), Some(772));
    }

    #[test]
    fn event_match_key_includes_id() {
        let headers = headers_with("Event", "Refer; id=93809824");
        assert_eq!(
            parse_event_header(&headers),
            Some("refer;id=93809824".to_string())
        );
        let plain = headers_with("Event", "presence");
        assert_eq!(parse_event_header(&plain), Some("presence".to_string()));
    }

    #[test]
    fn contact_uri_with_display_name() {
        let uri = extract_uri_from_contact("\"Bob\" <sip:bob@example.com:5060;transport=tcp>")
            .expect("uri");
        assert_eq!(uri.host_with_port.to_string(), "example.com:5060");
    }

    #[test]
    fn supported_token_lookup() {
        let mut headers = rsip::Headers::default();
        headers.push(Header::Other("Supported".into(), "timer, 100rel".into()));
        assert!(header_contains_token(&headers, "Supported", "100rel"));
        assert!(!header_contains_token(&headers, "Supported", "precondition"));
    }
}
