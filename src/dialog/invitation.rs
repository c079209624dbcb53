use super::{
    authenticate::Credential,
    client_dialog::ClientInviteDialog,
    dialog::{DialogInner, DialogStateSender},
    dialog_layer::DialogLayer,
};
use crate::{
    dialog::{
        dialog::{Dialog, DialogState, TerminatedReason},
        dialog_layer::DialogLayerInnerRef,
        DialogId,
    },
    transaction::{
        key::{TransactionKey, TransactionRole},
        make_tag,
        transaction::Transaction,
    },
    transport::SipAddr,
    Result,
};
use futures::FutureExt;
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Request, Response, SipMessage, StatusCodeKind,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything needed to place an outbound INVITE: parties, contact,
/// offer body, optional credentials and extra headers.
#[derive(Default, Clone)]
pub struct InviteOption {
    pub caller_display_name: Option<String>,
    pub caller_params: Vec<rsip::uri::Param>,
    pub caller: rsip::Uri,
    pub callee: rsip::Uri,
    pub destination: Option<SipAddr>,
    pub content_type: Option<String>,
    pub offer: Option<Vec<u8>>,
    pub contact: rsip::Uri,
    pub credential: Option<Credential>,
    pub headers: Option<Vec<rsip::Header>>,
    pub support_prack: bool,
    pub call_id: Option<String>,
}

/// Removes the dialog from the layer (and hangs it up) when dropped.
pub struct DialogGuard {
    pub dialog_layer_inner: DialogLayerInnerRef,
    pub id: DialogId,
}

impl DialogGuard {
    pub fn new(dialog_layer: &Arc<DialogLayer>, id: DialogId) -> Self {
        Self {
            dialog_layer_inner: dialog_layer.inner.clone(),
            id,
        }
    }
}

impl Drop for DialogGuard {
    fn drop(&mut self) {
        let dlg = match self.dialog_layer_inner.dialogs.write() {
            Ok(mut dialogs) => match dialogs.remove(&self.id.to_string()) {
                Some(dlg) => dlg,
                None => return,
            },
            _ => return,
        };
        let _ = tokio::spawn(async move {
            if let Err(e) = dlg.hangup().await {
                info!(id = %dlg.id(), error = %e, "failed to hangup dialog");
            }
        });
    }
}

pub(super) struct DialogGuardForUnconfirmed<'a> {
    pub dialog_layer_inner: &'a DialogLayerInnerRef,
    pub id: &'a DialogId,
    invite_tx: Option<Transaction>,
}

impl<'a> Drop for DialogGuardForUnconfirmed<'a> {
    fn drop(&mut self) {
        // an unconfirmed dialog dropped mid-INVITE is CANCELed
        match self.dialog_layer_inner.early_dialogs.write() {
            Ok(mut dialogs) => match dialogs.remove(&self.id.early_id()) {
                Some(dlg) => {
                    debug!(id = %self.id, "unconfirmed dialog dropped, cancelling it");
                    let invite_tx = self.invite_tx.take();
                    let _ = tokio::spawn(async move {
                        if let Dialog::ClientInvite(ref client_dialog) = dlg {
                            if client_dialog.inner.can_cancel() {
                                if let Err(e) = client_dialog.cancel().await {
                                    warn!(id = %client_dialog.id(), error = %e, "dialog cancel failed");
                                    return;
                                }

                                if let Some(mut invite_tx) = invite_tx {
                                    let duration = tokio::time::Duration::from_secs(2);
                                    let timeout = tokio::time::sleep(duration);
                                    tokio::pin!(timeout);
                                    loop {
                                        tokio::select! {
                                            _ = &mut timeout => break,
                                            msg = invite_tx.receive() => {
                                                if let Some(msg) = msg {
                                                    if let SipMessage::Response(resp) = msg {
                                                        if resp.status_code.kind() != StatusCodeKind::Provisional {
                                                            debug!(
                                                                id = %client_dialog.id(),
                                                                status = %resp.status_code,
                                                                "received final response"
                                                            );
                                                            break;
                                                        }
                                                    }
                                                } else {
                                                    break;
                                                }
                                            }
                                        }
                                    }
                                }
                                let _ = client_dialog.inner.transition(DialogState::Terminated(
                                    client_dialog.id(),
                                    TerminatedReason::UacCancel,
                                ));
                                debug!(id = %client_dialog.id(), "dialog terminated");
                                return;
                            }
                        }

                        if let Err(e) = dlg.hangup().await {
                            info!(id = %dlg.id(), error = %e, "failed to hangup unconfirmed dialog");
                        }
                    });
                }
                None => {}
            },
            Err(e) => {
                warn!(id = %self.id, error = %e, "failed to acquire write lock on dialogs");
            }
        }
    }
}

pub type InviteAsyncResult = Result<(DialogId, Option<Response>)>;

impl DialogLayer {
    /// Build the dialog-creating INVITE from the options.
    pub fn make_invite_request(&self, opt: &InviteOption) -> Result<Request> {
        let last_seq = self.increment_last_seq();
        let to = rsip::typed::To {
            display_name: None,
            uri: opt.callee.clone(),
            params: vec![],
        };
        let recipient = to.uri.clone();

        let from = rsip::typed::From {
            display_name: opt.caller_display_name.clone(),
            uri: opt.caller.clone(),
            params: opt.caller_params.clone(),
        }
        .with_tag(make_tag());

        let call_id = opt
            .call_id
            .as_ref()
            .map(|id| rsip::headers::CallId::from(id.clone()));

        let via = self.endpoint.get_via(None, None)?;
        let mut request = self.endpoint.make_request(
            rsip::Method::Invite,
            recipient,
            via,
            from,
            to,
            last_seq,
            call_id,
        );

        let contact = rsip::typed::Contact {
            display_name: None,
            uri: opt.contact.clone(),
            params: vec![],
        };

        request
            .headers
            .unique_push(rsip::Header::Contact(contact.into()));

        request.headers.unique_push(rsip::Header::ContentType(
            opt.content_type
                .clone()
                .unwrap_or("application/sdp".to_string())
                .into(),
        ));

        if opt.support_prack {
            request
                .headers
                .unique_push(rsip::Header::Supported("100rel".into()));
        }
        // can't override default headers
        if let Some(headers) = opt.headers.as_ref() {
            for header in headers {
                // only dedup max-forwards; duplicates there make some peers
                // treat the message as malformed
                match header {
                    rsip::Header::MaxForwards(_) => request.headers.unique_push(header.clone()),
                    _ => request.headers.push(header.clone()),
                }
            }
        }
        Ok(request)
    }

    /// Place an INVITE and drive it to a final response. The dialog is
    /// indexed under its early id while in progress and under the full
    /// dialog id once a to-tag confirms it.
    pub async fn do_invite(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(ClientInviteDialog, Option<Response>)> {
        let (dialog, tx) = self.create_client_invite_dialog(opt, state_sender)?;
        let id = dialog.id();

        self.put_dialog(Dialog::ClientInvite(dialog.clone()));
        debug!(%id, "client invite dialog created");
        let mut guard = DialogGuardForUnconfirmed {
            dialog_layer_inner: &self.inner,
            id: &id,
            invite_tx: Some(tx),
        };

        let tx = guard
            .invite_tx
            .as_mut()
            .expect("transaction should be available");

        let r = dialog.process_invite(self, tx).boxed().await;
        // invite finished: empty the early slot first so the guard's drop
        // finds nothing to cancel
        self.inner
            .early_dialogs
            .write()
            .unwrap()
            .remove(&id.early_id());
        drop(guard);

        match r {
            Ok((new_dialog_id, resp)) => {
                if let Some(ref r) = resp {
                    if r.status_code.kind() == StatusCodeKind::Successful {
                        debug!("client invite dialog confirmed: {} => {}", id, new_dialog_id);
                        self.inner
                            .dialogs
                            .write()
                            .unwrap()
                            .entry(new_dialog_id.to_string())
                            .or_insert_with(|| Dialog::ClientInvite(dialog.clone()));
                    }
                }
                Ok((dialog, resp))
            }
            Err(e) => Err(e),
        }
    }

    /// Background variant of [`DialogLayer::do_invite`]: returns the early
    /// dialog immediately and a handle resolving to the final outcome.
    pub fn do_invite_async(
        self: &Arc<Self>,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(
        ClientInviteDialog,
        tokio::task::JoinHandle<InviteAsyncResult>,
    )> {
        let (dialog, mut tx) = self.create_client_invite_dialog(opt, state_sender)?;
        let id0 = dialog.id();

        self.put_dialog(Dialog::ClientInvite(dialog.clone()));
        debug!(%id0, "client invite dialog created (async)");

        let layer = self.clone();
        let dialog_clone = dialog.clone();

        let handle = tokio::spawn(async move {
            let r = dialog_clone.process_invite(&layer, &mut tx).boxed().await;

            layer
                .inner
                .early_dialogs
                .write()
                .unwrap()
                .remove(&id0.early_id());

            match &r {
                Ok((new_id, resp_opt)) => {
                    let is_2xx = resp_opt
                        .as_ref()
                        .map(|resp| resp.status_code.kind() == StatusCodeKind::Successful)
                        .unwrap_or(false);

                    if is_2xx {
                        debug!("client invite dialog confirmed: {} => {}", id0, new_id);
                        layer
                            .inner
                            .dialogs
                            .write()
                            .unwrap()
                            .entry(new_id.to_string())
                            .or_insert_with(|| Dialog::ClientInvite(dialog_clone.clone()));
                    }
                }
                Err(e) => debug!(%id0, error = %e, "async invite failed"),
            }

            r
        });

        Ok((dialog, handle))
    }

    pub fn create_client_invite_dialog(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(ClientInviteDialog, Transaction)> {
        let mut request = self.make_invite_request(&opt)?;
        request.body = opt.offer.unwrap_or_default();
        request.headers.unique_push(rsip::Header::ContentLength(
            (request.body.len() as u32).into(),
        ));
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request.clone(), self.endpoint.clone(), None);

        if opt.destination.is_some() {
            tx.destination = opt.destination;
        } else if let Some(route) = tx.original.route_header() {
            if let Some(first_route) = route.typed().ok().and_then(|r| r.uris().first().cloned()) {
                tx.destination = SipAddr::try_from(&first_route.uri).ok();
            }
        }

        let id = DialogId::from_uac_request(&request)?;
        let dlg_inner = DialogInner::new(
            TransactionRole::Client,
            id.clone(),
            request.clone(),
            self.endpoint.clone(),
            Arc::downgrade(&self.inner),
            state_sender,
            opt.credential,
            Some(opt.contact),
            tx.tu_sender.clone(),
        )?;

        if let Some(destination) = &tx.destination {
            let uri = destination.clone().into();
            dlg_inner
                .remote_uri
                .lock()
                .map(|mut guard| {
                    *guard = uri;
                })
                .ok();
        }
        let dialog = ClientInviteDialog {
            inner: Arc::new(dlg_inner),
        };
        Ok((dialog, tx))
    }
}
