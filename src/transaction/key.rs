//! Identifier algebra over parsed messages.
//!
//! Every index of the runtime is keyed by values computed here: the
//! transaction key (branch based for RFC 3261 peers, a full-message hash
//! for RFC 2543 peers), and the merge id used for loop detection
//! (RFC 3261 §8.2.2.2).

use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::Method;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::MAGIC_COOKIE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// The key under which a transaction is registered.
///
/// RFC 3261 peers put a magic-cookie branch on the top Via; the branch plus
/// the CSeq method identify the transaction. For RFC 2543 peers the branch
/// is unusable, so the key is a hash over Call-ID, tags, CSeq and the top
/// Via line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionKey {
    Rfc3261 { branch: String, method: Method },
    Rfc2543 { hash: u64, method: Method },
}

impl Hash for TransactionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            TransactionKey::Rfc3261 { branch, method } => {
                0u8.hash(state);
                branch.hash(state);
                method.to_string().hash(state);
            }
            TransactionKey::Rfc2543 { hash, method } => {
                1u8.hash(state);
                hash.hash(state);
                method.to_string().hash(state);
            }
        }
    }
}

impl TransactionKey {
    /// Compute the key for a request. On the server side ACK folds onto the
    /// INVITE key, so a non-2xx ACK finds the transaction it acknowledges.
    pub fn from_request(request: &rsip::Request, role: TransactionRole) -> Result<Self> {
        let method = match (role, request.method) {
            (TransactionRole::Server, Method::Ack) => Method::Invite,
            (_, m) => m,
        };
        let via = request.via_header()?;
        match branch_of(via)? {
            Some(branch) => Ok(TransactionKey::Rfc3261 { branch, method }),
            None => {
                let mut hasher = DefaultHasher::new();
                request.call_id_header()?.value().hash(&mut hasher);
                if let Ok(Some(tag)) = request.from_header()?.tag() {
                    tag.value().hash(&mut hasher);
                }
                request.cseq_header()?.value().hash(&mut hasher);
                via.value().hash(&mut hasher);
                Ok(TransactionKey::Rfc2543 {
                    hash: hasher.finish(),
                    method,
                })
            }
        }
    }

    /// Compute the key a response belongs to: the top Via branch plus the
    /// CSeq method (responses echo the request's Via chain).
    pub fn from_response(response: &rsip::Response) -> Result<Self> {
        let method = response
            .cseq_header()?
            .method()
            .map_err(|e| Error::SipMessageError(e.to_string()))?;
        let via = response.via_header()?;
        match branch_of(via)? {
            Some(branch) => Ok(TransactionKey::Rfc3261 { branch, method }),
            None => {
                let mut hasher = DefaultHasher::new();
                response.call_id_header()?.value().hash(&mut hasher);
                if let Ok(Some(tag)) = response.to_header()?.tag() {
                    tag.value().hash(&mut hasher);
                }
                if let Ok(Some(tag)) = response.from_header()?.tag() {
                    tag.value().hash(&mut hasher);
                }
                response.cseq_header()?.value().hash(&mut hasher);
                via.value().hash(&mut hasher);
                Ok(TransactionKey::Rfc2543 {
                    hash: hasher.finish(),
                    method,
                })
            }
        }
    }

    pub fn method(&self) -> &Method {
        match self {
            TransactionKey::Rfc3261 { method, .. } | TransactionKey::Rfc2543 { method, .. } => {
                method
            }
        }
    }

    /// The raw branch id, when the peer supplied an RFC 3261 one.
    pub fn branch(&self) -> Option<&str> {
        match self {
            TransactionKey::Rfc3261 { branch, .. } => Some(branch),
            TransactionKey::Rfc2543 { .. } => None,
        }
    }

    /// Same transaction, different method slot. Used to look up the INVITE
    /// a CANCEL targets.
    pub fn with_method(&self, method: Method) -> Self {
        match self {
            TransactionKey::Rfc3261 { branch, .. } => TransactionKey::Rfc3261 {
                branch: branch.clone(),
                method,
            },
            TransactionKey::Rfc2543 { hash, .. } => TransactionKey::Rfc2543 {
                hash: *hash,
                method,
            },
        }
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKey::Rfc3261 { branch, method } => write!(f, "{}:{}", branch, method),
            TransactionKey::Rfc2543 { hash, method } => write!(f, "2543:{:x}:{}", hash, method),
        }
    }
}

/// The branch parameter of a Via header, when it carries the RFC 3261
/// magic cookie.
fn branch_of(via: &rsip::headers::Via) -> Result<Option<String>> {
    let typed = via
        .typed()
        .map_err(|e| Error::SipMessageError(e.to_string()))?;
    for param in typed.params.iter() {
        if let rsip::Param::Branch(branch) = param {
            let value = branch.value().to_string();
            if value.starts_with(MAGIC_COOKIE) {
                return Ok(Some(value));
            }
            return Ok(None);
        }
    }
    Ok(None)
}

/// The merge id of a request: `call-id:from-tag:cseq-number`
/// (RFC 3261 §8.2.2.2). `None` when the From tag is missing.
pub fn merge_id(request: &rsip::Request) -> Option<String> {
    let call_id = request.call_id_header().ok()?.value().to_string();
    let from_tag = request.from_header().ok()?.tag().ok()??;
    let cseq = request.cseq_header().ok()?.seq().ok()?;
    Some(format!("{}:{}:{}", call_id, from_tag.value(), cseq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::*;

    fn request(branch: &str) -> rsip::Request {
        rsip::Request {
            method: rsip::Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            headers: vec![
                Via::new(format!("SIP/2.0/UDP host:5060;branch={}", branch)).into(),
                CSeq::new("1 INVITE").into(),
                From::new("<sip:alice@example.com>;tag=abc").into(),
                To::new("<sip:bob@example.com>").into(),
                CallId::new("call-1@host").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: vec![],
        }
    }

    #[test]
    fn rfc3261_branch_forms_the_key() {
        let req = request("z9hG4bKnashds7");
        let key = TransactionKey::from_request(&req, TransactionRole::Server).unwrap();
        match &key {
            TransactionKey::Rfc3261 { branch, method } => {
                assert_eq!(branch, "z9hG4bKnashds7");
                assert_eq!(*method, Method::Invite);
            }
            _ => panic!("expected rfc3261 key"),
        }
    }

    #[test]
    fn pre_cookie_branch_falls_back_to_hash() {
        let req = request("oldstyle1");
        let key = TransactionKey::from_request(&req, TransactionRole::Server).unwrap();
        assert!(matches!(key, TransactionKey::Rfc2543 { .. }));
        // Deterministic for an identical retransmission.
        let again = TransactionKey::from_request(&req, TransactionRole::Server).unwrap();
        assert_eq!(key, again);
    }

    #[test]
    fn server_ack_folds_onto_invite_key() {
        let invite = request("z9hG4bK77");
        let mut ack = invite.clone();
        ack.method = rsip::Method::Ack;
        let invite_key = TransactionKey::from_request(&invite, TransactionRole::Server).unwrap();
        let ack_key = TransactionKey::from_request(&ack, TransactionRole::Server).unwrap();
        assert_eq!(invite_key, ack_key);
    }

    #[test]
    fn merge_id_combines_callid_fromtag_cseq() {
        let req = request("z9hG4bK77");
        assert_eq!(merge_id(&req), Some("call-1@host:abc:1".to_string()));
    }

    #[test]
    fn merge_id_absent_without_from_tag() {
        let mut req = request("z9hG4bK77");
        req.headers.retain(|h| !matches!(h, rsip::Header::From(_)));
        req.headers
            .push(From::new("<sip:alice@example.com>").into());
        assert_eq!(merge_id(&req), None);
    }
}
