use super::dialog::{Dialog, DialogInnerRef, DialogState, TerminatedReason, TransactionHandle};
use super::subscription::ServerSubscriptionDialog;
use super::DialogId;
use crate::rsip_ext::parse_rack_header;
use crate::{
    transaction::{transaction::Transaction, TransactionEvent},
    Result,
};
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Header, Request, SipMessage, StatusCode};
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Server-side INVITE dialog (UAS).
///
/// Created from a received INVITE; the application answers through
/// [`ServerInviteDialog::ringing`] / [`ServerInviteDialog::accept`] /
/// [`ServerInviteDialog::reject`], reliable provisionals go out via
/// [`ServerInviteDialog::send_reliable_provisional`], and the dialog
/// confirms when the peer's ACK arrives.
#[derive(Clone)]
pub struct ServerInviteDialog {
    pub(super) inner: DialogInnerRef,
}

impl ServerInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id.lock().unwrap().clone()
    }

    pub fn state(&self) -> DialogState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn from_inner(inner: DialogInnerRef) -> Self {
        Self { inner }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    /// The INVITE that created this dialog.
    pub fn initial_request(&self) -> Request {
        self.inner
            .initial_request
            .lock()
            .expect("get initial request poisoned")
            .clone()
    }

    /// Send 180 Ringing (or 183 Session Progress when a body is present).
    pub fn ringing(&self, headers: Option<Vec<Header>>, body: Option<Vec<u8>>) -> Result<()> {
        if !self.inner.can_cancel() {
            return Ok(());
        }
        debug!(id = %self.id(), "sending ringing response");
        let resp = self.inner.make_response(
            &self.initial_request(),
            if body.is_some() {
                StatusCode::SessionProgress
            } else {
                StatusCode::Ringing
            },
            headers,
            body,
        );
        self.inner
            .tu_sender
            .send(TransactionEvent::Respond(resp.clone()))?;
        self.inner.transition(DialogState::Early(self.id(), resp))?;
        Ok(())
    }

    /// Send a reliable provisional response (RFC 3262). The INVITE must
    /// have offered `100rel`; one reliable 1xx may be outstanding at a
    /// time, retransmitted until its PRACK arrives.
    pub fn send_reliable_provisional(
        &self,
        status: StatusCode,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let resp = self.inner.create_reliable_provisional(status, headers, body)?;
        self.inner.send_reliable_provisional(resp)
    }

    /// Accept the INVITE with 200 OK; the dialog waits for the ACK.
    pub fn accept(&self, headers: Option<Vec<Header>>, body: Option<Vec<u8>>) -> Result<()> {
        let resp =
            self.inner
                .make_response(&self.initial_request(), rsip::StatusCode::OK, headers, body);
        self.inner
            .tu_sender
            .send(TransactionEvent::Respond(resp.clone()))?;
        self.inner.last_response.lock().unwrap().replace(resp.clone());

        if let Some(layer) = self.inner.layer.upgrade() {
            layer.register_confirmed_merge(&self.inner);
        }
        self.inner
            .transition(DialogState::WaitAck(self.id(), resp))?;
        Ok(())
    }

    /// Reject the INVITE (603 Decline by default).
    pub fn reject(&self, code: Option<rsip::StatusCode>, reason: Option<String>) {
        if self.inner.is_terminated() || self.inner.is_confirmed() {
            return;
        }
        debug!(id = %self.id(), ?code, ?reason, "rejecting dialog");
        let headers =
            reason.map(|reason| vec![rsip::Header::Other("Reason".into(), reason.into())]);
        let resp = self.inner.make_response(
            &self.initial_request(),
            code.unwrap_or(rsip::StatusCode::Decline),
            headers,
            None,
        );
        self.inner
            .tu_sender
            .send(TransactionEvent::Respond(resp))
            .ok();
        self.inner
            .transition(DialogState::Terminated(
                self.id(),
                TerminatedReason::UasDecline,
            ))
            .ok();
    }

    /// Send a BYE to terminate the dialog.
    pub async fn bye(&self) -> Result<()> {
        self.bye_with_headers(None).await
    }

    pub async fn bye_with_headers(&self, headers: Option<Vec<rsip::Header>>) -> Result<()> {
        if !self.inner.is_confirmed() && !self.inner.waiting_ack() {
            return Ok(());
        }

        let request = self
            .inner
            .make_request(rsip::Method::Bye, None, None, headers, None)?;

        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UasBye))?;
        self.inner.do_request(request).await.map(|_| ())
    }

    pub async fn bye_with_reason(&self, reason: String) -> Result<()> {
        self.bye_with_headers(Some(vec![rsip::Header::Other(
            "Reason".into(),
            reason.into(),
        )]))
        .await
    }

    /// Re-INVITE within the confirmed dialog.
    pub async fn reinvite(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        debug!(id = %self.id(), "sending re-invite request");
        let request = self
            .inner
            .make_request(rsip::Method::Invite, None, None, headers, body)?;
        let allow_interleaving = !self.inner.is_back_to_back_user_agent();
        let cseq = request.cseq_header()?.seq()?;
        let resp = self
            .inner
            .do_request_with_interleaving(request, allow_interleaving)
            .await;
        match resp {
            Ok(Some(ref r)) if r.status_code == StatusCode::OK => {
                if let Ok(ack) = self.inner.create_ack(cseq) {
                    self.inner.send_ack(ack).await.ok();
                }
            }
            Ok(Some(ref r)) if r.status_code == StatusCode::RequestTimeout => {
                self.inner.transition(DialogState::Timeout(
                    self.id(),
                    crate::dialog::dialog::DialogTimeout::ReInvite,
                ))?;
            }
            _ => {}
        }
        resp
    }

    pub async fn update(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        self.request(rsip::Method::Update, headers, body).await
    }

    pub async fn info(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        self.request(rsip::Method::Info, headers, body).await
    }

    /// Send a generic in-dialog request.
    pub async fn request(
        &self,
        method: rsip::Method,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        debug!(id = %self.id(), %method, "sending request");
        let request = self.inner.create_request(method, headers, body)?;
        self.inner.do_request(request).await
    }

    pub async fn notify(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        self.request(rsip::Method::Notify, headers, body).await
    }

    pub async fn refer(
        &self,
        refer_to: rsip::Uri,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        let mut headers = headers.unwrap_or_default();
        headers.push(rsip::Header::Other(
            "Refer-To".into(),
            format!("<{}>", refer_to).into(),
        ));
        self.request(rsip::Method::Refer, Some(headers), body).await
    }

    /// REFER progress notification (RFC 3515 §2.4.5).
    pub async fn notify_refer(
        &self,
        status: rsip::StatusCode,
        sub_state: &str,
    ) -> Result<Option<rsip::Response>> {
        let headers = vec![
            rsip::Header::Other("Event".into(), "refer".into()),
            rsip::Header::Other("Subscription-State".into(), sub_state.into()),
            rsip::Header::ContentType("message/sipfrag".into()),
        ];

        let body = format!("SIP/2.0 {} {:?}", u16::from(status.clone()), status).into_bytes();

        self.notify(Some(headers), Some(body)).await
    }

    pub fn as_subscription(&self) -> ServerSubscriptionDialog {
        ServerSubscriptionDialog {
            inner: self.inner.clone(),
        }
    }

    pub async fn message(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        self.request(rsip::Method::Message, headers, body).await
    }

    /// Handle a request the registry routed to this dialog. Late ACKs
    /// (during the linger window) arrive here too.
    pub async fn handle(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(
            id = %self.id(),
            method = %tx.original.method,
            state = %self.inner.state.lock().unwrap(),
            "handle request"
        );

        if tx.original.method == rsip::Method::Ack {
            // matched through the registry: either WaitAck or a late ACK in
            // the linger window; idempotent either way
            self.inner.handle_ack(&tx.original)?;
            return Ok(());
        }

        let cseq = tx.original.cseq_header()?.seq()? as u64;
        let remote_seq = self.inner.remote_seq.load(Ordering::Relaxed);
        if remote_seq > 0 && cseq < remote_seq {
            debug!(
                id = %self.id(),
                method = %tx.original.method(),
                remote_seq,
                cseq,
                "received old request"
            );
            // discard old request
            return Ok(());
        }
        self.inner
            .remote_seq
            .compare_exchange(remote_seq, cseq, Ordering::Relaxed, Ordering::Relaxed)
            .ok();

        if self.inner.is_confirmed() {
            match tx.original.method {
                rsip::Method::Cancel => {
                    debug!(id = %self.id(), "CANCEL in confirmed state");
                    tx.reply(rsip::StatusCode::OK).await?;
                    return Ok(());
                }
                rsip::Method::Invite => return self.handle_reinvite(tx).await,
                rsip::Method::Bye => return self.handle_bye(tx).await,
                rsip::Method::PRack => return self.handle_prack(tx).await,
                rsip::Method::Info => return self.handle_event(tx, DialogState::Info).await,
                rsip::Method::Options => return self.handle_event(tx, DialogState::Options).await,
                rsip::Method::Update => return self.handle_event(tx, DialogState::Updated).await,
                rsip::Method::Refer => return self.handle_event(tx, DialogState::Refer).await,
                rsip::Method::Message => return self.handle_event(tx, DialogState::Message).await,
                rsip::Method::Notify => return self.handle_event(tx, DialogState::Notify).await,
                _ => {
                    debug!(id = %self.id(), method = ?tx.original.method, "invalid request method");
                    tx.reply(rsip::StatusCode::MethodNotAllowed).await?;
                    return Err(crate::Error::DialogError(
                        "invalid request".to_string(),
                        self.id(),
                        rsip::StatusCode::MethodNotAllowed,
                    ));
                }
            }
        }

        match tx.original.method {
            rsip::Method::Invite => self.handle_invite(tx).await,
            rsip::Method::PRack => self.handle_prack(tx).await,
            rsip::Method::Bye if self.inner.waiting_ack() => self.handle_bye(tx).await,
            _ => {
                // other requests in non-confirmed state are ignored
                Ok(())
            }
        }
    }

    async fn handle_bye(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received bye");
        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UacBye))?;
        tx.reply(rsip::StatusCode::OK).await?;
        Ok(())
    }

    /// PRACK acknowledges the outstanding reliable 1xx (RFC 3262 §3); a
    /// mismatched RAck drops the PRACK with 481.
    async fn handle_prack(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received prack");

        if parse_rack_header(&tx.original.headers).is_none() {
            warn!(id = %self.id(), "received PRACK without RAck header");
            tx.reply(rsip::StatusCode::BadRequest).await?;
            return Ok(());
        }

        if self.inner.handle_prack(&tx.original)? {
            tx.reply(rsip::StatusCode::OK).await?;
        } else {
            tx.reply(rsip::StatusCode::CallTransactionDoesNotExist)
                .await?;
        }
        Ok(())
    }

    async fn handle_event(
        &mut self,
        tx: &mut Transaction,
        build: fn(DialogId, rsip::Request, TransactionHandle) -> DialogState,
    ) -> Result<()> {
        debug!(id = %self.id(), method = %tx.original.method, "received in-dialog request");
        let (handle, rx) = TransactionHandle::new();
        self.inner
            .transition(build(self.id(), tx.original.clone(), handle))?;
        self.inner.process_transaction_handle(tx, rx).await
    }

    async fn handle_reinvite(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), "received re-invite {}", tx.original.uri);
        let (handle, rx) = TransactionHandle::new();
        self.inner
            .transition(DialogState::Updated(self.id(), tx.original.clone(), handle))?;

        self.inner.process_transaction_handle(tx, rx).await?;

        // re-INVITE is a target refresh: Contact updates the remote target,
        // the route set stays frozen
        if let Ok(contact) = tx.original.contact_header() {
            if let Ok(uri) = crate::rsip_ext::extract_uri_from_contact(contact.value()) {
                self.inner.set_remote_target(uri, Some(contact.clone()));
            }
        }

        while let Some(msg) = tx.receive().await {
            if let SipMessage::Request(req) = msg {
                if req.method == rsip::Method::Ack {
                    debug!(id = %self.id(), "received ack for re-invite {}", req.uri);
                    self.inner.handle_ack(&req)?;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_invite(&mut self, tx: &mut Transaction) -> Result<()> {
        let handle_loop = async {
            if !self.inner.is_confirmed() && matches!(tx.original.method, rsip::Method::Invite) {
                self.inner.transition(DialogState::Calling(self.id()))?;
                tx.send_trying().await.ok();
            }

            while let Some(msg) = tx.receive().await {
                match msg {
                    SipMessage::Request(req) => match req.method {
                        rsip::Method::Ack => {
                            if self.inner.is_terminated() {
                                // dialog already terminated, ignore
                                break;
                            }
                            debug!(id = %self.id(), "received ack {}", req.uri);
                            self.inner.handle_ack(&req)?;
                            break;
                        }
                        rsip::Method::Cancel => {
                            debug!(id = %self.id(), "received cancel {}", req.uri);
                            tx.reply(rsip::StatusCode::RequestTerminated).await?;
                            self.inner.transition(DialogState::Terminated(
                                self.id(),
                                TerminatedReason::UacCancel,
                            ))?;
                            break;
                        }
                        rsip::Method::PRack => {
                            if self.inner.handle_prack(&req)? {
                                // PRACK arrived inside the INVITE tx window;
                                // its own transaction answers 200
                                trace!(id = %self.id(), "prack matched pending 1xx");
                            }
                        }
                        _ => {}
                    },
                    SipMessage::Response(_) => {}
                }
            }
            Ok::<(), crate::Error>(())
        };
        match handle_loop.await {
            Ok(_) => {
                trace!(id = %self.id(), "process done");
                Ok(())
            }
            Err(e) => {
                warn!(id = %self.id(), "handle_invite error: {:?}", e);
                Err(e)
            }
        }
    }
}

impl TryFrom<&Dialog> for ServerInviteDialog {
    type Error = crate::Error;

    fn try_from(dlg: &Dialog) -> Result<Self> {
        match dlg {
            Dialog::ServerInvite(dlg) => Ok(dlg.clone()),
            _ => Err(crate::Error::DialogError(
                "dialog is not a ServerInviteDialog".to_string(),
                dlg.id(),
                rsip::StatusCode::BadRequest,
            )),
        }
    }
}
