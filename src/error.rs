use crate::dialog::DialogId;
use crate::transaction::key::TransactionKey;
use crate::transport::SipAddr;

/// Crate-wide error type.
///
/// Variants carry enough context to route the failure back to the right
/// object: a dialog id for dialog-layer errors, a transaction key for
/// transaction-layer errors and the peer address for transport failures.
#[derive(Debug)]
pub enum Error {
    Error(String),
    SipMessageError(String),
    DialogError(String, DialogId, rsip::StatusCode),
    TransactionError(String, TransactionKey),
    TransportError(String, SipAddr),
    EndpointError(String),
    IoError(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Error(msg) => write!(f, "{}", msg),
            Error::SipMessageError(msg) => write!(f, "sip message error: {}", msg),
            Error::DialogError(msg, id, code) => {
                write!(f, "dialog error: {} id={} status={}", msg, id, code)
            }
            Error::TransactionError(msg, key) => {
                write!(f, "transaction error: {} key={}", msg, key)
            }
            Error::TransportError(msg, addr) => {
                write!(f, "transport error: {} addr={}", msg, addr)
            }
            Error::EndpointError(msg) => write!(f, "endpoint error: {}", msg),
            Error::IoError(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e)
    }
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessageError(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
