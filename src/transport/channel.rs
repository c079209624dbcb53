//! In-memory message processor.
//!
//! Bridges a pair of unbounded channels into the [`SipConnection`] contract:
//! inbound messages pushed by the host (or a test) surface as
//! `TransportEvent::Incoming`, outbound messages are handed back to the
//! host over the outgoing channel. No bytes are marshaled anywhere.

use super::{SipAddr, TransportEvent, TransportSender};
use crate::{Error, Result};
use rsip::SipMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

pub type ChannelIncomingSender = UnboundedSender<SipMessage>;

#[derive(Debug)]
struct ChannelInner {
    addr: SipAddr,
    incoming: Mutex<Option<UnboundedReceiver<SipMessage>>>,
    outgoing: UnboundedSender<(SipMessage, Option<SipAddr>)>,
    broken: AtomicBool,
}

/// An in-memory connection endpoint.
#[derive(Clone, Debug)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

/// The host-facing side of a [`ChannelConnection`].
pub struct ChannelPeer {
    /// Push parsed messages here to deliver them to the stack.
    pub incoming: ChannelIncomingSender,
    /// Messages the stack sent, with the resolved destination if any.
    pub outgoing: UnboundedReceiver<(SipMessage, Option<SipAddr>)>,
}

impl ChannelConnection {
    pub fn create_connection(addr: SipAddr) -> (Self, ChannelPeer) {
        let (incoming_tx, incoming_rx) = unbounded_channel();
        let (outgoing_tx, outgoing_rx) = unbounded_channel();
        let connection = Self {
            inner: Arc::new(ChannelInner {
                addr,
                incoming: Mutex::new(Some(incoming_rx)),
                outgoing: outgoing_tx,
                broken: AtomicBool::new(false),
            }),
        };
        let peer = ChannelPeer {
            incoming: incoming_tx,
            outgoing: outgoing_rx,
        };
        (connection, peer)
    }

    pub fn the_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub fn is_reliable(&self) -> bool {
        self.inner.addr.is_reliable()
    }

    /// Simulate a transport failure: subsequent sends return an error.
    pub fn set_broken(&self, broken: bool) {
        self.inner.broken.store(broken, Ordering::Relaxed);
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        if self.inner.broken.load(Ordering::Relaxed) {
            return Err(Error::TransportError(
                "connection broken".to_string(),
                self.inner.addr.clone(),
            ));
        }
        self.inner
            .outgoing
            .send((msg, destination.cloned()))
            .map_err(|_| {
                Error::TransportError("peer dropped".to_string(), self.inner.addr.clone())
            })
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut incoming = self
            .inner
            .incoming
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Error("channel already served".to_string()))?;
        while let Some(msg) = incoming.recv().await {
            sender.send(TransportEvent::Incoming(
                msg,
                super::SipConnection::Channel(self.clone()),
                self.inner.addr.clone(),
            ))?;
        }
        debug!(addr = %self.inner.addr, "channel closed");
        sender.send(TransportEvent::Closed(super::SipConnection::Channel(
            self.clone(),
        )))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::prelude::{HeadersExt, UntypedHeader};

    fn test_addr() -> SipAddr {
        SipAddr::new(
            rsip::transport::Transport::Udp,
            rsip::HostWithPort::try_from("127.0.0.1:5060").unwrap(),
        )
    }

    fn test_request() -> rsip::Request {
        rsip::Request {
            method: rsip::Method::Options,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            headers: vec![rsip::Header::CallId(rsip::headers::CallId::new("c1"))].into(),
            version: rsip::Version::V2,
            body: vec![],
        }
    }

    #[tokio::test]
    async fn incoming_messages_surface_as_events() {
        let (connection, peer) = ChannelConnection::create_connection(test_addr());
        let (tx, mut rx) = unbounded_channel();
        let conn = connection.clone();
        tokio::spawn(async move { conn.serve_loop(tx).await });

        peer.incoming
            .send(SipMessage::Request(test_request()))
            .unwrap();
        match rx.recv().await.unwrap() {
            TransportEvent::Incoming(SipMessage::Request(req), _, addr) => {
                assert_eq!(req.method, rsip::Method::Options);
                assert_eq!(addr, test_addr());
            }
            _ => panic!("expected incoming request"),
        }
    }

    #[tokio::test]
    async fn broken_connection_reports_transport_error() {
        let (connection, _peer) = ChannelConnection::create_connection(test_addr());
        connection.set_broken(true);
        let err = connection
            .send(SipMessage::Request(test_request()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportError(_, _)));
    }

    #[tokio::test]
    async fn outgoing_messages_reach_the_peer() {
        let (connection, mut peer) = ChannelConnection::create_connection(test_addr());
        connection
            .send(SipMessage::Request(test_request()), None)
            .await
            .unwrap();
        let (msg, dest) = peer.outgoing.recv().await.unwrap();
        assert!(dest.is_none());
        match msg {
            SipMessage::Request(req) => {
                assert_eq!(req.call_id_header().unwrap().value(), "c1")
            }
            _ => panic!("expected request"),
        }
    }
}
