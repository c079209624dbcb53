//! Credential carry-through.
//!
//! The stack does not compute digest responses; challenges surface to the
//! host as ordinary final responses. What the dialog layer does own is the
//! replay of authorization headers the host (or the original request)
//! supplied: a cached `Proxy-Authorization` is attached to every
//! subsequent in-dialog request, and the ACK inherits the INVITE's
//! credentials.

use rsip::Header;

/// Identity the host associates with a dialog. The password never enters
/// any message built here; it exists so hosts can hand the pair to their
/// own challenge-response code.
#[derive(Clone, Debug)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
}

/// Pull the authorization headers worth replaying out of a request.
pub fn authorization_headers(request: &rsip::Request) -> Vec<Header> {
    request
        .headers
        .iter()
        .filter(|h| matches!(h, Header::ProxyAuthorization(_) | Header::Authorization(_)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::*;

    #[test]
    fn replayable_headers_extracted() {
        let request = rsip::Request {
            method: rsip::Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            headers: vec![
                CallId::new("c1").into(),
                ProxyAuthorization::new(
                    "Digest username=\"alice\", realm=\"example.com\", nonce=\"xyz\"",
                )
                .into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: vec![],
        };
        let headers = authorization_headers(&request);
        assert_eq!(headers.len(), 1);
        assert!(matches!(headers[0], Header::ProxyAuthorization(_)));
    }
}
