//! The transport seam of the stack.
//!
//! The core never performs raw I/O. Connections are owned by message
//! processors outside this crate; the dialog and transaction layers hold
//! them only as [`SipConnection`] handles resolved per send through the
//! [`TransportLayer`] processor set. The in-memory [`channel::ChannelConnection`]
//! implements the same contract for tests and for hosts that bridge their
//! own sockets into the stack.

use crate::{Error, Result};
use rsip::SipMessage;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod channel;

pub use channel::ChannelConnection;

/// A SIP-level address: a transport name plus host and port.
///
/// Dialogs never keep socket handles; they keep `SipAddr` triples and
/// resolve a connection through the transport layer at send time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SipAddr {
    pub r#type: Option<rsip::transport::Transport>,
    pub addr: rsip::HostWithPort,
}

impl std::hash::Hash for SipAddr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.r#type.hash(state);
        self.addr.to_string().hash(state);
    }
}

impl SipAddr {
    pub fn new(transport: rsip::transport::Transport, addr: rsip::HostWithPort) -> Self {
        SipAddr {
            r#type: Some(transport),
            addr,
        }
    }

    pub fn is_reliable(&self) -> bool {
        !matches!(
            self.r#type,
            Some(rsip::transport::Transport::Udp) | None
        )
    }
}

impl std::fmt::Display for SipAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.r#type {
            Some(t) => write!(f, "{}://{}", t, self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl TryFrom<&rsip::Uri> for SipAddr {
    type Error = crate::Error;

    fn try_from(uri: &rsip::Uri) -> Result<Self> {
        let transport = uri
            .params
            .iter()
            .find_map(|p| match p {
                rsip::Param::Transport(t) => Some(*t),
                _ => None,
            })
            .or_else(|| match uri.scheme {
                Some(rsip::Scheme::Sips) => Some(rsip::transport::Transport::Tls),
                _ => None,
            });
        Ok(SipAddr {
            r#type: transport,
            addr: uri.host_with_port.clone(),
        })
    }
}

impl TryFrom<rsip::Uri> for SipAddr {
    type Error = crate::Error;

    fn try_from(uri: rsip::Uri) -> Result<Self> {
        SipAddr::try_from(&uri)
    }
}

impl From<SipAddr> for rsip::Uri {
    fn from(addr: SipAddr) -> Self {
        let mut params = vec![];
        if let Some(t) = addr.r#type {
            if !matches!(t, rsip::transport::Transport::Udp) {
                params.push(rsip::Param::Transport(t));
            }
        }
        rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            auth: None,
            host_with_port: addr.addr,
            params,
            headers: Default::default(),
        }
    }
}

/// Events produced by message processors and consumed by the endpoint.
pub enum TransportEvent {
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportSender = UnboundedSender<TransportEvent>;
pub type TransportReceiver = UnboundedReceiver<TransportEvent>;

/// A handle to one message processor connection.
///
/// The only implementation in this crate is the in-memory channel; real
/// UDP/TCP/TLS/WebSocket processors live with the host and wrap themselves
/// in the same enum through `From`.
#[derive(Clone, Debug)]
pub enum SipConnection {
    Channel(ChannelConnection),
}

impl SipConnection {
    pub fn the_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Channel(c) => c.the_addr(),
        }
    }

    pub fn is_reliable(&self) -> bool {
        match self {
            SipConnection::Channel(c) => c.is_reliable(),
        }
    }

    /// Hand a message to the processor. The processor may buffer; an error
    /// here means the connection is unusable.
    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Channel(c) => c.send(msg, destination).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Channel(c) => c.serve_loop(sender).await,
        }
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(c: ChannelConnection) -> Self {
        SipConnection::Channel(c)
    }
}

impl std::fmt::Display for SipConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.the_addr())
    }
}

struct TransportLayerInner {
    listens: RwLock<HashMap<SipAddr, SipConnection>>,
    cancel_token: CancellationToken,
}

/// The processor set: every listening point the host registered, keyed by
/// its local address. Lookup picks a processor compatible with the
/// destination's transport.
#[derive(Clone)]
pub struct TransportLayer {
    inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(TransportLayerInner {
                listens: RwLock::new(HashMap::new()),
                cancel_token,
            }),
        }
    }

    pub fn add_transport(&self, connection: SipConnection) {
        let addr = connection.the_addr().clone();
        debug!(%addr, "transport added");
        self.inner.listens.write().unwrap().insert(addr, connection);
    }

    pub fn del_transport(&self, addr: &SipAddr) {
        debug!(%addr, "transport removed");
        self.inner.listens.write().unwrap().remove(addr);
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.listens.read().unwrap().keys().cloned().collect()
    }

    /// The listening point for a transport, if any (RFC 3261 §18.2.2).
    pub fn listening_point(
        &self,
        transport: rsip::transport::Transport,
    ) -> Option<SipAddr> {
        self.inner
            .listens
            .read()
            .unwrap()
            .keys()
            .find(|a| a.r#type == Some(transport))
            .cloned()
    }

    /// Resolve a connection for a destination. A processor whose transport
    /// matches the destination wins; otherwise any registered processor is
    /// used (the host decides what its processors can reach).
    pub fn lookup(&self, destination: &SipAddr) -> Result<SipConnection> {
        let listens = self.inner.listens.read().unwrap();
        if let Some(conn) = listens
            .iter()
            .find(|(addr, _)| destination.r#type.is_none() || addr.r#type == destination.r#type)
            .map(|(_, c)| c.clone())
        {
            return Ok(conn);
        }
        listens.values().next().cloned().ok_or_else(|| {
            Error::TransportError("no transport available".to_string(), destination.clone())
        })
    }

    /// Start the serve loop of every registered processor, feeding inbound
    /// messages into `sender`.
    pub fn serve(&self, sender: TransportSender) {
        let connections: Vec<SipConnection> =
            self.inner.listens.read().unwrap().values().cloned().collect();
        for connection in connections {
            let sender = sender.clone();
            let token = self.inner.cancel_token.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = connection.serve_loop(sender) => {}
                }
            });
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }
}
