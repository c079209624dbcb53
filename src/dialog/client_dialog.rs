use super::dialog::DialogInnerRef;
use super::dialog_layer::DialogLayer;
use super::DialogId;
use crate::dialog::dialog::{DialogState, TerminatedReason, TransactionHandle};
use crate::rsip_ext::extract_uri_from_contact;
use crate::transaction::transaction::Transaction;
use crate::Result;
use rsip::prelude::{HasHeaders, HeadersExt, UntypedHeader};
use rsip::{Header, Response, SipMessage, StatusCode, StatusCodeKind};
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Client-side INVITE dialog (UAC).
///
/// Created when an INVITE is dispatched; collects provisional responses
/// (forking peers included), confirms on the 2xx and drives the ACK per
/// RFC 3261 §13.2.2.4, then carries in-dialog requests until BYE.
///
/// The wrapper is cheap to clone; all state lives in the shared inner.
#[derive(Clone)]
pub struct ClientInviteDialog {
    pub(super) inner: DialogInnerRef,
}

impl ClientInviteDialog {
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

    /// The primary dialog this one forked from, when this is a secondary
    /// fork branch.
    pub fn original_dialog(&self) -> Option<ClientInviteDialog> {
        self.inner
            .original_dialog
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .map(|inner| ClientInviteDialog { inner })
    }

    /// Send a BYE to terminate the dialog.
    pub async fn bye(&self) -> Result<()> {
        self.bye_with_headers(None).await
    }

    /// BYE with extra headers (e.g. `Reason`). No-op unless the dialog is
    /// confirmed.
    pub async fn bye_with_headers(&self, headers: Option<Vec<rsip::Header>>) -> Result<()> {
        if !self.inner.is_confirmed() {
            return Ok(());
        }

        let request = self
            .inner
            .make_request(rsip::Method::Bye, None, None, headers, None)?;

        if let Err(e) = self.inner.do_request(request).await {
            info!(error = %e, "bye error");
        }

        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UacBye))?;
        Ok(())
    }

    pub async fn bye_with_reason(&self, reason: String) -> Result<()> {
        self.bye_with_headers(Some(vec![rsip::Header::Other(
            "Reason".into(),
            reason.into(),
        )]))
        .await
    }

    /// CANCEL an early dialog, BYE a confirmed one.
    pub async fn hangup(&self) -> Result<()> {
        if self.inner.can_cancel() {
            self.cancel().await
        } else {
            self.bye().await
        }
    }

    /// Send CANCEL for the original INVITE: same branch, same CSeq number,
    /// method CANCEL (RFC 3261 §9.1).
    pub async fn cancel(&self) -> Result<()> {
        if self.inner.is_confirmed() {
            return Ok(());
        }
        debug!(id = %self.id(), "sending cancel request");
        let mut cancel_request = self
            .inner
            .initial_request
            .lock()
            .expect("cancel mutex poisoned")
            .clone();
        let invite_seq = cancel_request.cseq_header()?.seq()?;
        cancel_request
            .headers_mut()
            .retain(|h| !matches!(h, Header::ContentLength(_) | Header::ContentType(_)));

        cancel_request.method = rsip::Method::Cancel;
        cancel_request
            .cseq_header_mut()?
            .mut_seq(invite_seq)?
            .mut_method(rsip::Method::Cancel)?;
        cancel_request.body = vec![];
        self.inner.send_cancel(cancel_request).await?;
        Ok(())
    }

    /// Re-INVITE within a confirmed dialog. On a back-to-back user agent
    /// the request is serialized behind any in-flight re-INVITE.
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

    pub async fn options(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        self.request(rsip::Method::Options, headers, body).await
    }

    /// Send a generic in-dialog request. CSeq, Call-ID, tags and the Route
    /// set are filled in; wire order per dialog is submission order.
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

    /// REFER the peer to another target (RFC 3515).
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

    pub fn as_subscription(&self) -> super::subscription::ClientSubscriptionDialog {
        super::subscription::ClientSubscriptionDialog {
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

    /// Handle a request the registry routed to this dialog.
    pub async fn handle(&mut self, tx: &mut Transaction) -> Result<()> {
        trace!(
            id = %self.id(),
            method = %tx.original.method,
            state = %self.inner.state.lock().unwrap(),
            "handle request"
        );

        let cseq = tx.original.cseq_header()?.seq()? as u64;
        let remote_seq = self.inner.remote_seq.load(Ordering::Relaxed);
        if remote_seq > 0 && cseq < remote_seq {
            debug!(
                id = %self.id(),
                remote_seq,
                cseq,
                "received old request"
            );
            tx.reply(rsip::StatusCode::ServerInternalError).await?;
            return Ok(());
        }

        self.inner
            .remote_seq
            .compare_exchange(remote_seq, cseq, Ordering::Relaxed, Ordering::Relaxed)
            .ok();

        if self.inner.is_confirmed() {
            match tx.original.method {
                rsip::Method::Invite => return self.handle_reinvite(tx).await,
                rsip::Method::Bye => return self.handle_bye(tx).await,
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
        } else {
            debug!(
                id = %self.id(),
                method = ?tx.original.method,
                "received request not confirmed"
            );
        }
        Ok(())
    }

    async fn handle_bye(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received bye");
        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UasBye))?;
        tx.reply(rsip::StatusCode::OK).await?;
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
        debug!(id = %self.id(), uri = %tx.original.uri, "received reinvite");
        let (handle, rx) = TransactionHandle::new();
        self.inner
            .transition(DialogState::Updated(self.id(), tx.original.clone(), handle))?;

        self.inner.process_transaction_handle(tx, rx).await?;

        // target refresh: new Contact, route set untouched
        if let Ok(contact) = tx.original.contact_header() {
            if let Ok(uri) = extract_uri_from_contact(contact.value()) {
                self.inner.set_remote_target(uri, Some(contact.clone()));
            }
        }

        while let Some(msg) = tx.receive().await {
            if let SipMessage::Request(req) = msg {
                if req.method == rsip::Method::Ack {
                    debug!(id = %self.id(), "received ACK for re-INVITE");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Drive the initial INVITE transaction to completion: provisional
    /// responses (PRACK included), forked branches, and the final response.
    /// Returns the confirmed dialog id and the final response.
    pub async fn process_invite(
        &self,
        layer: &DialogLayer,
        tx: &mut Transaction,
    ) -> Result<(DialogId, Option<Response>)> {
        self.inner.transition(DialogState::Calling(self.id()))?;
        tx.send().await?;
        self.inner
            .endpoint_inner
            .set_transaction_dialog(&tx.key, self.id().to_string());
        let mut dialog_id = self.id();
        let mut final_response = None;
        while let Some(msg) = tx.receive().await {
            let resp = match msg {
                SipMessage::Response(resp) => resp,
                SipMessage::Request(_) => continue,
            };
            let status = resp.status_code.clone();

            if status == StatusCode::Trying {
                self.inner.transition(DialogState::Trying(self.id()))?;
                continue;
            }

            if matches!(status.kind(), StatusCodeKind::Provisional) {
                if self.dispatch_to_fork(layer, &resp).await? {
                    continue;
                }
                self.inner.handle_provisional_response(&resp).await?;
                self.inner.apply_response(&resp)?;
                continue;
            }

            if self.dispatch_to_fork(layer, &resp).await? {
                // a final response concludes the INVITE even when another
                // branch won the race
                final_response = Some(resp.clone());
                if let Ok(id) = DialogId::from_uac_response(&resp) {
                    dialog_id = id;
                }
                break;
            }

            final_response = Some(resp.clone());
            if let Some(tag) = resp.to_header()?.tag()? {
                self.inner.update_remote_tag(tag.value())?;
            }

            if let Ok(id) = DialogId::from_uac_response(&resp) {
                dialog_id = id;
            }
            self.inner.apply_response(&resp)?;
            if status.kind() == StatusCodeKind::Successful {
                let cseq = resp.cseq_header()?.seq()?;
                if let Ok(ack) = self.inner.create_ack(cseq) {
                    self.inner.send_ack(ack).await.ok();
                }
            }
            break;
        }
        Ok((dialog_id, final_response))
    }

    /// Forked responses: a to-tag different from this dialog's remote tag
    /// belongs to a secondary dialog. One is created on first sight,
    /// cross-branch retransmissions are flagged, and the branch a 2xx
    /// lands on is confirmed. Returns true when the response was consumed
    /// by a fork branch.
    async fn dispatch_to_fork(&self, layer: &DialogLayer, resp: &Response) -> Result<bool> {
        let Some(to_tag) = resp.to_header()?.tag()? else {
            return Ok(false);
        };
        let our_tag = self.id().remote_tag;
        if our_tag.is_empty() || our_tag == to_tag.value() {
            // primary branch; record the fingerprint for duplicate tracking
            self.inner.check_retransmission_for_forking(resp);
            return Ok(false);
        }

        let fork = layer.get_or_create_fork_dialog(self, resp)?;
        if fork.inner.check_retransmission_for_forking(resp) {
            debug!(id = %fork.id(), "forked response retransmission suppressed");
            return Ok(true);
        }
        fork.inner.apply_response(resp)?;
        if resp.status_code.kind() == StatusCodeKind::Successful {
            let cseq = resp.cseq_header()?.seq()?;
            if let Ok(ack) = fork.inner.create_ack(cseq) {
                fork.inner.send_ack(ack).await.ok();
            }
        }
        Ok(true)
    }
}
