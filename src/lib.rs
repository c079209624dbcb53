//! A SIP user-agent dialog and transaction core.
//!
//! This crate implements the in-memory heart of a SIP user agent: the
//! transaction state machines of RFC 3261 §17, the dialog state machine of
//! RFC 3261 §12 (with reliable provisional responses per RFC 3262 and
//! SUBSCRIBE/NOTIFY dialog usage per RFC 3265/3515), and the concurrent
//! registries that route incoming parsed messages to the right transaction
//! or dialog.
//!
//! Message parsing is delegated to the [`rsip`] crate, and raw I/O is kept
//! behind the thin connection interface in [`transport`]: the core consumes
//! parsed messages and produces parsed messages plus lifecycle events; it
//! never opens sockets on its own.
//!
//! The usual wiring is:
//!
//! ```rust,no_run
//! use uastack::{EndpointBuilder, transport::TransportLayer};
//! use tokio_util::sync::CancellationToken;
//!
//! # fn main() -> uastack::Result<()> {
//! let token = CancellationToken::new();
//! let transport_layer = TransportLayer::new(token.child_token());
//! let endpoint = EndpointBuilder::new()
//!     .with_cancel_token(token)
//!     .with_user_agent("uastack/0.3")
//!     .with_transport_layer(transport_layer)
//!     .build();
//!
//! let dialog_layer = uastack::dialog::dialog_layer::DialogLayer::new(endpoint.inner.clone());
//! # let _ = dialog_layer;
//! # Ok(())
//! # }
//! ```

pub mod dialog;
mod error;
pub mod rsip_ext;
pub mod transaction;
pub mod transport;

pub use error::{Error, Result};
pub use transaction::endpoint::EndpointBuilder;

pub const USER_AGENT: &str = concat!("uastack/", env!("CARGO_PKG_VERSION"));
