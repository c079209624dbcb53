use super::dialog::{DialogInnerRef, DialogState, TerminatedReason, TransactionHandle};
use super::DialogId;
use crate::transaction::transaction::Transaction;
use crate::Result;
use rsip::{Header, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Client-side subscription dialog (RFC 3265): created by an outgoing
/// SUBSCRIBE, or adopted when an out-of-dialog NOTIFY matches a pending
/// SUBSCRIBE transaction.
#[derive(Clone)]
pub struct ClientSubscriptionDialog {
    pub(super) inner: DialogInnerRef,
}

impl ClientSubscriptionDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id.lock().unwrap().clone()
    }

    pub fn state(&self) -> DialogState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    /// Allow one route-set install from the 202 even after confirmation.
    pub fn set_pending_route_update_on_202(&self) {
        self.inner.set_pending_route_update_on_202()
    }

    pub async fn subscribe(
        &self,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        self.request(Method::Subscribe, headers, body).await
    }

    /// SUBSCRIBE with Expires: 0 closes the subscription (RFC 3265 §3.1.4.3).
    pub async fn unsubscribe(&self) -> Result<()> {
        let headers = vec![Header::Expires(0.into())];
        self.request(Method::Subscribe, Some(headers), None).await?;
        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UacBye))?;
        Ok(())
    }

    pub async fn request(
        &self,
        method: rsip::Method,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        let request = self
            .inner
            .make_request(method, None, None, headers, body)?;
        self.inner.do_request(request).await
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

    pub async fn message(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        self.request(rsip::Method::Message, headers, body).await
    }

    pub async fn handle(&mut self, tx: &mut Transaction) -> Result<()> {
        match tx.original.method {
            Method::Notify => {
                // a NOTIFY with Subscription-State: terminated closes the
                // usage after the reply goes out (RFC 3265 §3.3.7)
                let terminated = crate::rsip_ext::header_value(
                    &tx.original.headers,
                    "Subscription-State",
                )
                .map(|s| s.to_ascii_lowercase().contains("terminated"))
                .unwrap_or(false);

                let (handle, rx) = TransactionHandle::new();
                self.inner.transition(DialogState::Notify(
                    self.id(),
                    tx.original.clone(),
                    handle,
                ))?;
                self.inner.process_transaction_handle(tx, rx).await?;

                if terminated {
                    debug!(id = %self.id(), "subscription terminated by notify");
                    self.inner.transition(DialogState::Terminated(
                        self.id(),
                        TerminatedReason::UasBye,
                    ))?;
                }
                Ok(())
            }
            Method::Refer => {
                let (handle, rx) = TransactionHandle::new();
                self.inner.transition(DialogState::Refer(
                    self.id(),
                    tx.original.clone(),
                    handle,
                ))?;
                self.inner.process_transaction_handle(tx, rx).await
            }
            Method::Message => {
                let (handle, rx) = TransactionHandle::new();
                self.inner.transition(DialogState::Message(
                    self.id(),
                    tx.original.clone(),
                    handle,
                ))?;
                self.inner.process_transaction_handle(tx, rx).await
            }
            _ => Ok(()),
        }
    }
}

/// Server-side subscription dialog: created from a received SUBSCRIBE (or
/// an in-dialog REFER), owns outgoing NOTIFYs.
#[derive(Clone)]
pub struct ServerSubscriptionDialog {
    pub(super) inner: DialogInnerRef,
}

impl ServerSubscriptionDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id.lock().unwrap().clone()
    }

    pub fn state(&self) -> DialogState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    /// Accept the SUBSCRIBE. 202 Accepted is the customary answer when the
    /// subscription needs backend work before its first NOTIFY.
    pub fn accept(&self, headers: Option<Vec<Header>>, body: Option<Vec<u8>>) -> Result<()> {
        let resp = self.inner.make_response(
            &self.inner.initial_request.lock().unwrap(),
            StatusCode::Accepted,
            headers,
            body,
        );
        use crate::transaction::TransactionEvent;
        self.inner
            .tu_sender
            .send(TransactionEvent::Respond(resp.clone()))?;
        self.inner.last_response.lock().unwrap().replace(resp.clone());
        self.inner
            .transition(DialogState::Confirmed(self.id(), resp))?;
        Ok(())
    }

    pub async fn notify(
        &self,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        let request = self
            .inner
            .make_request(Method::Notify, None, None, headers, body)?;
        self.inner.do_request(request).await
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UasBye))?;
        Ok(())
    }

    pub async fn request(
        &self,
        method: rsip::Method,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        let request = self
            .inner
            .make_request(method, None, None, headers, body)?;
        self.inner.do_request(request).await
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

    pub async fn message(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        self.request(rsip::Method::Message, headers, body).await
    }

    pub async fn handle(&mut self, tx: &mut Transaction) -> Result<()> {
        match tx.original.method {
            Method::Subscribe => {
                let (handle, rx) = TransactionHandle::new();
                self.inner.transition(DialogState::Updated(
                    self.id(),
                    tx.original.clone(),
                    handle,
                ))?;
                self.inner.process_transaction_handle(tx, rx).await
            }
            Method::Refer => {
                let (handle, rx) = TransactionHandle::new();
                self.inner.transition(DialogState::Refer(
                    self.id(),
                    tx.original.clone(),
                    handle,
                ))?;
                self.inner.process_transaction_handle(tx, rx).await
            }
            Method::Message => {
                let (handle, rx) = TransactionHandle::new();
                self.inner.transition(DialogState::Message(
                    self.id(),
                    tx.original.clone(),
                    handle,
                ))?;
                self.inner.process_transaction_handle(tx, rx).await
            }
            _ => Ok(()),
        }
    }
}
