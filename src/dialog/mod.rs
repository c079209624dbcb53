use crate::transaction::key::TransactionRole;
use crate::transaction::transaction::Transaction;
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Request, Response};

pub mod authenticate;
pub mod client_dialog;
pub mod dialog;
pub mod dialog_layer;
pub mod invitation;
pub mod server_dialog;
pub mod subscription;

#[cfg(test)]
mod tests;

/// SIP Dialog Identifier
///
/// A dialog is identified by the Call-ID plus the local and remote tags
/// (RFC 3261 §12). While a dialog is still early the remote tag may be
/// empty; [`DialogId::early_id`] is the lookup key for that window.
///
/// The rendered form is the lowercased `call-id:local-tag:remote-tag`,
/// which is what every registry index uses.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    /// The early-dialog key: call-id plus local tag, remote tag omitted.
    pub fn early_id(&self) -> String {
        format!("{}:{}", self.call_id, self.local_tag).to_lowercase()
    }

    pub fn is_early(&self) -> bool {
        self.remote_tag.is_empty()
    }

    /// Dialog id of an outgoing dialog-creating request (no remote tag yet).
    pub fn from_uac_request(request: &Request) -> Result<Self> {
        DialogId::try_from((request, TransactionRole::Client))
    }

    /// Dialog id carried by a response to our own request.
    pub fn from_uac_response(response: &Response) -> Result<Self> {
        DialogId::try_from((response, TransactionRole::Client))
    }
}

impl TryFrom<(&Request, TransactionRole)> for DialogId {
    type Error = crate::Error;

    fn try_from((request, role): (&Request, TransactionRole)) -> Result<Self> {
        let call_id = request.call_id_header()?.value().to_string();

        let from_tag = match request.from_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Error("from tag not found".to_string())),
        };

        let to_tag = match request.to_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => "".to_string(),
        };

        match role {
            TransactionRole::Client => Ok(DialogId {
                call_id,
                local_tag: from_tag,
                remote_tag: to_tag,
            }),
            TransactionRole::Server => Ok(DialogId {
                call_id,
                local_tag: to_tag,
                remote_tag: from_tag,
            }),
        }
    }
}

impl TryFrom<(&Response, TransactionRole)> for DialogId {
    type Error = crate::Error;

    fn try_from((resp, role): (&Response, TransactionRole)) -> Result<Self> {
        let call_id = resp.call_id_header()?.value().to_string();

        let from_tag = match resp.from_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Error("from tag not found".to_string())),
        };

        let to_tag = match resp.to_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Error("to tag not found".to_string())),
        };

        match role {
            TransactionRole::Client => Ok(DialogId {
                call_id,
                local_tag: from_tag,
                remote_tag: to_tag,
            }),
            TransactionRole::Server => Ok(DialogId {
                call_id,
                local_tag: to_tag,
                remote_tag: from_tag,
            }),
        }
    }
}

impl TryFrom<&Transaction> for DialogId {
    type Error = crate::Error;

    fn try_from(value: &Transaction) -> std::result::Result<Self, Self::Error> {
        DialogId::try_from((&value.original, value.role()))
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered = format!("{}:{}:{}", self.call_id, self.local_tag, self.remote_tag);
        write!(f, "{}", rendered.to_lowercase())
    }
}
