//! The four transaction state machines of RFC 3261 §17.
//!
//! A `Transaction` is an owned value handed to the upper layer: the dialog
//! drives it by awaiting [`Transaction::receive`] while the endpoint feeds
//! parsed messages and timer firings into its event channel. Cross
//! references between dialogs and transactions are ids, never pointers;
//! the endpoint registry is the single owner of the lookup tables.

use super::endpoint::EndpointInnerRef;
use super::key::{TransactionKey, TransactionRole};
use super::{
    TransactionEvent, TransactionEventReceiver, TransactionEventSender, TransactionState,
    TransactionTimer, TransactionType,
};
use crate::rsip_ext::make_response;
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Method, Request, Response, SipMessage, StatusCode, StatusCodeKind};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, trace, warn};

pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub state: TransactionState,
    pub endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    /// Resolved next hop; when unset the endpoint's router decides per send.
    pub destination: Option<SipAddr>,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub tu_receiver: TransactionEventReceiver,
    pub tu_sender: TransactionEventSender,
    timer_retransmit: Option<u64>,
    timer_timeout: Option<u64>,
    timer_linger: Option<u64>,
    timer_lifetime: Option<u64>,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        let state = match transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => {
                TransactionState::Calling
            }
            // server transactions exist because a request arrived
            TransactionType::ServerInvite | TransactionType::ServerNonInvite => {
                TransactionState::Trying
            }
        };
        Self {
            transaction_type,
            key,
            original,
            state,
            endpoint_inner,
            connection,
            destination: None,
            last_response: None,
            last_ack: None,
            tu_receiver,
            tu_sender,
            timer_retransmit: None,
            timer_timeout: None,
            timer_linger: None,
            timer_lifetime: None,
        }
    }

    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Transaction::new(tx_type, key, original, endpoint_inner, connection)
    }

    pub fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        Transaction::new(tx_type, key, original, endpoint_inner, connection)
    }

    pub fn role(&self) -> TransactionRole {
        match self.transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => {
                TransactionRole::Client
            }
            TransactionType::ServerInvite | TransactionType::ServerNonInvite => {
                TransactionRole::Server
            }
        }
    }

    fn is_client(&self) -> bool {
        self.role() == TransactionRole::Client
    }

    fn reliable(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_reliable())
            .unwrap_or(false)
    }

    /// A CANCEL matches this transaction when it targets the same branch as
    /// the INVITE that created it (RFC 3261 §9.2).
    pub fn does_cancel_match(&self, cancel: &Request) -> Result<bool> {
        if self.transaction_type != TransactionType::ServerInvite {
            return Ok(false);
        }
        let cancel_key = TransactionKey::from_request(cancel, TransactionRole::Server)?;
        Ok(cancel_key.with_method(Method::Invite) == self.key)
    }

    /// Send the original request (client transactions only).
    pub async fn send(&mut self) -> Result<()> {
        if !self.is_client() {
            return Err(Error::TransactionError(
                "send is only valid for client transactions".to_string(),
                self.key.clone(),
            ));
        }

        if self.destination.is_none() {
            self.destination = Some(self.endpoint_inner.next_hop(&self.original).await?);
        }
        if self.connection.is_none() {
            let destination = self.destination.as_ref().unwrap();
            let connection = self.endpoint_inner.transport_layer.lookup(destination)?;
            self.connection = Some(connection);
        }

        let connection = self.connection.as_ref().unwrap();
        connection
            .send(
                self.original.clone().into(),
                self.destination.as_ref(),
            )
            .await
            .map_err(|e| self.report_io_error(e))?;

        self.endpoint_inner
            .attach_transaction(&self.key, self.tu_sender.clone(), &self.original, self.role());
        self.start_lifetime_timer();
        self.transition(TransactionState::Trying).map(|_| ())
    }

    /// Send a response (server transactions only).
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.is_client() {
            return Err(Error::TransactionError(
                "respond is only valid for server transactions".to_string(),
                self.key.clone(),
            ));
        }
        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no connection for response".to_string(),
            self.key.clone(),
        ))?;
        connection
            .send(response.clone().into(), None)
            .await
            .map_err(|e| self.report_io_error(e))?;

        match response.status_code.kind() {
            StatusCodeKind::Provisional => {
                self.last_response.replace(response);
                if self.state == TransactionState::Trying {
                    self.transition(TransactionState::Proceeding).map(|_| ())
                } else {
                    Ok(())
                }
            }
            _ => {
                let is_2xx = response.status_code.kind() == StatusCodeKind::Successful;
                self.last_response.replace(response);
                match self.transaction_type {
                    TransactionType::ServerInvite => {
                        if is_2xx {
                            // stay discoverable for the 2xx ACK after Terminated
                            self.endpoint_inner.put_terminated_pending_ack(
                                &self.key,
                                self.last_response.as_ref().unwrap(),
                            );
                        }
                        self.transition(TransactionState::Completed).map(|_| ())
                    }
                    _ => self.transition(TransactionState::Completed).map(|_| ()),
                }
            }
        }
    }

    pub async fn reply(&mut self, status: StatusCode) -> Result<()> {
        let response = make_response(&self.original, status, None);
        self.respond(response).await
    }

    pub async fn send_trying(&mut self) -> Result<()> {
        self.reply(StatusCode::Trying).await
    }

    /// Send an ACK for a non-2xx final response through this transaction
    /// (2xx ACKs are dialog business and use a fresh branch elsewhere).
    pub async fn send_ack(&mut self, ack: Request) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::TransactionError(
                "send_ack is only valid for client invite transactions".to_string(),
                self.key.clone(),
            ));
        }
        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no connection for ack".to_string(),
            self.key.clone(),
        ))?;
        connection
            .send(ack.clone().into(), self.destination.as_ref())
            .await
            .map_err(|e| self.report_io_error(e))?;
        self.last_ack.replace(ack);
        Ok(())
    }

    /// Await the next message for the upper layer. Retransmissions, timer
    /// housekeeping and `Respond` commands are consumed internally.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(msg, connection) => {
                    if let Some(msg) = match msg {
                        SipMessage::Request(req) => {
                            self.on_received_request(req, connection).await
                        }
                        SipMessage::Response(resp) => self.on_received_response(resp).await,
                    } {
                        return Some(msg);
                    }
                }
                TransactionEvent::Respond(response) => {
                    if let Err(e) = self.respond(response).await {
                        warn!(key = %self.key, "respond failed: {}", e);
                    }
                }
                TransactionEvent::Timer(t) => {
                    self.on_timer(t).await.ok();
                }
                TransactionEvent::Terminate => {
                    return None;
                }
            }
        }
        None
    }

    fn inform_tu_response(&mut self, response: Response) -> Result<()> {
        self.tu_sender
            .send(TransactionEvent::Received(
                SipMessage::Response(response),
                None,
            ))
            .map_err(|e| Error::TransactionError(e.to_string(), self.key.clone()))
    }

    async fn on_received_request(
        &mut self,
        req: Request,
        connection: Option<SipConnection>,
    ) -> Option<SipMessage> {
        if self.is_client() {
            return None;
        }
        if let Some(connection) = connection {
            self.connection.get_or_insert(connection);
        }

        if req.method == Method::Cancel {
            // the endpoint already answered the CANCEL; surface it so the
            // dialog can terminate the INVITE with 487
            return Some(SipMessage::Request(req));
        }

        match self.state {
            TransactionState::Trying | TransactionState::Proceeding => {
                if req.method == self.original.method {
                    // request retransmission: replay the last response
                    if let Some(last) = self.last_response.clone() {
                        self.respond(last).await.ok();
                    }
                    return None;
                }
                None
            }
            TransactionState::Completed => {
                if req.method == Method::Ack {
                    self.transition(TransactionState::Confirmed).ok();
                    return Some(SipMessage::Request(req));
                }
                if req.method == self.original.method {
                    if let Some(last) = self.last_response.clone() {
                        self.respond(last).await.ok();
                    }
                }
                None
            }
            TransactionState::Confirmed => {
                // ACK retransmission, absorbed
                None
            }
            _ => None,
        }
    }

    async fn on_received_response(&mut self, resp: Response) -> Option<SipMessage> {
        if !self.is_client() {
            return None;
        }
        let kind = resp.status_code.kind();
        match self.state {
            TransactionState::Calling | TransactionState::Trying => {
                match kind {
                    StatusCodeKind::Provisional => {
                        self.last_response.replace(resp.clone());
                        self.transition(TransactionState::Proceeding).ok();
                    }
                    StatusCodeKind::Successful => {
                        self.last_response.replace(resp.clone());
                        self.transition(TransactionState::Confirmed).ok();
                    }
                    _ => {
                        self.last_response.replace(resp.clone());
                        self.ack_error_response(&resp).await;
                        self.transition(TransactionState::Completed).ok();
                    }
                }
                Some(SipMessage::Response(resp))
            }
            TransactionState::Proceeding => {
                match kind {
                    StatusCodeKind::Provisional => {
                        if self.is_provisional_retransmission(&resp) {
                            return None;
                        }
                        self.last_response.replace(resp.clone());
                        Some(SipMessage::Response(resp))
                    }
                    StatusCodeKind::Successful => {
                        self.last_response.replace(resp.clone());
                        if self.transaction_type == TransactionType::ClientInvite {
                            self.transition(TransactionState::Confirmed).ok();
                        } else {
                            self.transition(TransactionState::Completed).ok();
                        }
                        Some(SipMessage::Response(resp))
                    }
                    _ => {
                        self.last_response.replace(resp.clone());
                        self.ack_error_response(&resp).await;
                        self.transition(TransactionState::Completed).ok();
                        Some(SipMessage::Response(resp))
                    }
                }
            }
            TransactionState::Completed => {
                // final response retransmission: re-ACK, absorb
                if self.transaction_type == TransactionType::ClientInvite {
                    if let Some(ack) = self.last_ack.clone() {
                        self.send_ack(ack).await.ok();
                    }
                }
                None
            }
            TransactionState::Confirmed => {
                // 2xx retransmission: the dialog resends its ACK
                if kind == StatusCodeKind::Successful {
                    return Some(SipMessage::Response(resp));
                }
                None
            }
            _ => None,
        }
    }

    fn is_provisional_retransmission(&self, resp: &Response) -> bool {
        self.last_response
            .as_ref()
            .map(|last| {
                last.status_code == resp.status_code
                    && last.body == resp.body
                    && last.cseq_header().ok().map(|c| c.value().to_string())
                        == resp.cseq_header().ok().map(|c| c.value().to_string())
            })
            .unwrap_or(false)
    }

    /// ACK a 3xx-6xx final on the original branch (RFC 3261 §17.1.1.3).
    async fn ack_error_response(&mut self, resp: &Response) {
        if self.transaction_type != TransactionType::ClientInvite {
            return;
        }
        let mut headers = rsip::Headers::default();
        for header in self.original.headers.iter() {
            match header {
                rsip::Header::Via(v) => headers.push(rsip::Header::Via(v.clone())),
                rsip::Header::From(f) => headers.push(rsip::Header::From(f.clone())),
                rsip::Header::CallId(c) => headers.push(rsip::Header::CallId(c.clone())),
                rsip::Header::MaxForwards(m) => {
                    headers.push(rsip::Header::MaxForwards(m.clone()))
                }
                rsip::Header::Route(r) => headers.push(rsip::Header::Route(r.clone())),
                _ => {}
            }
        }
        // To mirrors the response so the peer's tag is acknowledged
        if let Ok(to) = resp.to_header() {
            headers.push(rsip::Header::To(to.clone()));
        }
        if let Ok(cseq) = self.original.cseq_header() {
            if let Ok(seq) = cseq.seq() {
                headers.push(rsip::Header::CSeq(
                    rsip::typed::CSeq {
                        seq,
                        method: Method::Ack,
                    }
                    .into(),
                ));
            }
        }
        headers.push(rsip::Header::ContentLength(0u32.into()));
        let ack = Request {
            method: Method::Ack,
            uri: self.original.uri.clone(),
            headers,
            version: rsip::Version::V2,
            body: vec![],
        };
        self.send_ack(ack).await.ok();
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Result<()> {
        match timer {
            TransactionTimer::TimerA(key, duration) => {
                if self.state == TransactionState::Trying {
                    self.retransmit_original().await?;
                    let duration = duration * 2;
                    let id = self
                        .endpoint_inner
                        .timers
                        .timeout(duration, TransactionTimer::TimerA(key, duration));
                    self.timer_retransmit.replace(id);
                }
            }
            TransactionTimer::TimerE(key, duration) => {
                if matches!(
                    self.state,
                    TransactionState::Trying | TransactionState::Proceeding
                ) {
                    self.retransmit_original().await?;
                    let duration = (duration * 2).min(self.endpoint_inner.option.t2);
                    let id = self
                        .endpoint_inner
                        .timers
                        .timeout(duration, TransactionTimer::TimerE(key, duration));
                    self.timer_retransmit.replace(id);
                }
            }
            TransactionTimer::TimerG(key, duration) => {
                if self.state == TransactionState::Completed {
                    if let Some(last) = self.last_response.clone() {
                        if let Some(connection) = self.connection.as_ref() {
                            connection.send(last.into(), None).await.ok();
                        }
                    }
                    let duration = (duration * 2).min(self.endpoint_inner.option.t2);
                    let id = self
                        .endpoint_inner
                        .timers
                        .timeout(duration, TransactionTimer::TimerG(key, duration));
                    self.timer_retransmit.replace(id);
                }
            }
            TransactionTimer::TimerB(_) | TransactionTimer::TimerF(_) => {
                if matches!(
                    self.state,
                    TransactionState::Calling
                        | TransactionState::Trying
                        | TransactionState::Proceeding
                ) {
                    let timeout = make_response(&self.original, StatusCode::RequestTimeout, None);
                    self.inform_tu_response(timeout)?;
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerH(_) => {
                if self.state == TransactionState::Completed {
                    // no ACK before Timer H: give up
                    self.endpoint_inner.remove_terminated_pending_ack(&self.key);
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerD(_)
            | TransactionTimer::TimerI(_)
            | TransactionTimer::TimerJ(_)
            | TransactionTimer::TimerK(_) => {
                if matches!(
                    self.state,
                    TransactionState::Completed | TransactionState::Confirmed
                ) {
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerMaxLifetime(_) => {
                if self.state != TransactionState::Terminated {
                    debug!(key = %self.key, "transaction exceeded max lifetime");
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerCleanup(_) => {}
        }
        Ok(())
    }

    async fn retransmit_original(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.as_ref() {
            connection
                .send(self.original.clone().into(), self.destination.as_ref())
                .await
                .ok();
        }
        Ok(())
    }

    fn start_lifetime_timer(&mut self) {
        let lifetime = match self.transaction_type {
            TransactionType::ClientInvite | TransactionType::ServerInvite => {
                self.endpoint_inner.option.max_tx_lifetime_invite
            }
            _ => self.endpoint_inner.option.max_tx_lifetime_non_invite,
        };
        let id = self.endpoint_inner.timers.timeout(
            lifetime,
            TransactionTimer::TimerMaxLifetime(self.key.clone()),
        );
        self.timer_lifetime.replace(id);
    }

    pub(super) fn start_server_timers(&mut self) {
        self.endpoint_inner.attach_transaction(
            &self.key,
            self.tu_sender.clone(),
            &self.original,
            self.role(),
        );
        self.start_lifetime_timer();
    }

    fn transition(&mut self, state: TransactionState) -> Result<TransactionState> {
        if self.state == state {
            return Ok(state);
        }
        let timers = &self.endpoint_inner.timers;
        let option = &self.endpoint_inner.option;
        match state {
            TransactionState::Calling => {}
            TransactionState::Trying => {
                if !self.reliable() {
                    let (duration, timer) = match self.transaction_type {
                        TransactionType::ClientInvite => (
                            option.t1,
                            TransactionTimer::TimerA(self.key.clone(), option.t1),
                        ),
                        _ => (
                            option.t1,
                            TransactionTimer::TimerE(self.key.clone(), option.t1),
                        ),
                    };
                    if self.is_client() {
                        self.timer_retransmit
                            .replace(timers.timeout(duration, timer));
                    }
                }
                if self.is_client() {
                    let timer = match self.transaction_type {
                        TransactionType::ClientInvite => {
                            TransactionTimer::TimerB(self.key.clone())
                        }
                        _ => TransactionTimer::TimerF(self.key.clone()),
                    };
                    self.timer_timeout.replace(timers.timeout(option.t1x64, timer));
                }
            }
            TransactionState::Proceeding => {
                if self.transaction_type == TransactionType::ClientInvite {
                    // provisional received: stop INVITE retransmissions
                    self.timer_retransmit.take().map(|id| timers.cancel(id));
                }
            }
            TransactionState::Completed => {
                self.timer_retransmit.take().map(|id| timers.cancel(id));
                self.timer_timeout.take().map(|id| timers.cancel(id));
                match self.transaction_type {
                    TransactionType::ClientInvite => {
                        let duration = if self.reliable() {
                            std::time::Duration::ZERO
                        } else {
                            std::time::Duration::from_secs(32)
                        };
                        self.timer_linger.replace(
                            timers.timeout(duration, TransactionTimer::TimerD(self.key.clone())),
                        );
                    }
                    TransactionType::ClientNonInvite => {
                        let duration = if self.reliable() {
                            std::time::Duration::ZERO
                        } else {
                            option.t4
                        };
                        self.timer_linger.replace(
                            timers.timeout(duration, TransactionTimer::TimerK(self.key.clone())),
                        );
                    }
                    TransactionType::ServerInvite => {
                        if !self.reliable() {
                            self.timer_retransmit.replace(timers.timeout(
                                option.t1,
                                TransactionTimer::TimerG(self.key.clone(), option.t1),
                            ));
                        }
                        self.timer_timeout.replace(
                            timers
                                .timeout(option.t1x64, TransactionTimer::TimerH(self.key.clone())),
                        );
                    }
                    TransactionType::ServerNonInvite => {
                        let duration = if self.reliable() {
                            std::time::Duration::ZERO
                        } else {
                            option.t1x64
                        };
                        self.timer_linger.replace(
                            timers.timeout(duration, TransactionTimer::TimerJ(self.key.clone())),
                        );
                    }
                }
            }
            TransactionState::Confirmed => {
                self.timer_retransmit.take().map(|id| timers.cancel(id));
                self.timer_timeout.take().map(|id| timers.cancel(id));
                match self.transaction_type {
                    TransactionType::ServerInvite => {
                        let duration = if self.reliable() {
                            std::time::Duration::ZERO
                        } else {
                            option.t4
                        };
                        self.timer_linger.replace(
                            timers.timeout(duration, TransactionTimer::TimerI(self.key.clone())),
                        );
                    }
                    TransactionType::ClientInvite => {
                        // RFC 6026: absorb 2xx retransmissions for 64*T1
                        self.timer_linger.replace(
                            timers
                                .timeout(option.t1x64, TransactionTimer::TimerD(self.key.clone())),
                        );
                    }
                    _ => {}
                }
            }
            TransactionState::Terminated => {
                self.cleanup();
                self.tu_sender.send(TransactionEvent::Terminate).ok();
            }
        }
        trace!(key = %self.key, "transition {:?} -> {:?}", self.state, state);
        self.state = state;
        Ok(state)
    }

    fn report_io_error(&self, e: Error) -> Error {
        self.endpoint_inner.report_io_error(
            &e,
            self.destination
                .as_ref()
                .or_else(|| self.connection.as_ref().map(|c| c.the_addr())),
        );
        e
    }

    fn cleanup_timers(&mut self) {
        let timers = &self.endpoint_inner.timers;
        self.timer_retransmit.take().map(|id| timers.cancel(id));
        self.timer_timeout.take().map(|id| timers.cancel(id));
        self.timer_linger.take().map(|id| timers.cancel(id));
        self.timer_lifetime.take().map(|id| timers.cancel(id));
    }

    fn cleanup(&mut self) {
        if self.state == TransactionState::Terminated {
            return;
        }
        self.cleanup_timers();
        let last_message = match self.transaction_type {
            TransactionType::ClientInvite => self.last_ack.take().map(SipMessage::Request),
            TransactionType::ServerNonInvite | TransactionType::ServerInvite => {
                self.last_response.take().map(SipMessage::Response)
            }
            _ => None,
        };
        self.endpoint_inner
            .detach_transaction(&self.key, last_message);
        self.endpoint_inner.emit_transaction_terminated(&self.key);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
        self.state = TransactionState::Terminated;
    }
}
