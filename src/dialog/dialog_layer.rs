use super::authenticate::Credential;
use super::client_dialog::ClientInviteDialog;
use super::dialog::{
    Dialog, DialogInner, DialogState, DialogStateReceiver, DialogStateSender, DialogTimeout,
    DialogTimerEvent, TerminatedReason,
};
use super::server_dialog::ServerInviteDialog;
use super::subscription::{ClientSubscriptionDialog, ServerSubscriptionDialog};
use super::DialogId;
use crate::transaction::key::{merge_id, TransactionRole};
use crate::transaction::timer::Timer;
use crate::transaction::transaction::Transaction;
use crate::transaction::{endpoint::EndpointInnerRef, make_tag, transaction_event_sender_noop};
use crate::Result;
use rsip::prelude::HeadersExt;
use rsip::Request;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::{debug, info, warn};

/// Registry state behind the dialog layer.
///
/// Three indexes mirror the lifecycle: `dialogs` holds everything with a
/// full dialog id, `early_dialogs` holds entries still missing the remote
/// tag, and `server_dialog_merge` maps merge ids of confirmed server
/// dialogs for late loop detection. All maps take concurrent readers and
/// per-key writers; audits work on shallow snapshots.
pub struct DialogLayerInner {
    pub(super) last_seq: AtomicU32,
    pub(super) dialogs: RwLock<HashMap<String, Dialog>>,
    pub(super) early_dialogs: RwLock<HashMap<String, Dialog>>,
    pub(super) server_dialog_merge: RwLock<HashMap<String, DialogId>>,
    pub(crate) timers: Timer<DialogTimerEvent>,
}

pub type DialogLayerInnerRef = Arc<DialogLayerInner>;

impl DialogLayerInner {
    /// Move a dialog to a new id (remote tag learned or reassigned).
    pub(super) fn reindex_dialog(&self, old_id: &DialogId, new_id: &DialogId) {
        let dialog = {
            let mut early = self.early_dialogs.write().unwrap();
            let mut dialogs = self.dialogs.write().unwrap();
            early
                .remove(&old_id.early_id())
                .or_else(|| dialogs.remove(&old_id.to_string()))
        };
        let Some(dialog) = dialog else { return };
        debug!(%old_id, %new_id, "reindexing dialog");
        if new_id.is_early() {
            self.early_dialogs
                .write()
                .unwrap()
                .insert(new_id.early_id(), dialog);
        } else {
            self.dialogs
                .write()
                .unwrap()
                .insert(new_id.to_string(), dialog);
        }
    }

    /// Drop a dialog from every index. Runs inline when linger is zero,
    /// from the linger timer otherwise.
    pub(crate) fn finish_remove(&self, id: &DialogId) {
        let removed = {
            let mut dialogs = self.dialogs.write().unwrap();
            dialogs.remove(&id.to_string())
        };
        self.early_dialogs.write().unwrap().remove(&id.early_id());
        if let Some(dialog) = removed {
            if let Some(mid) = &dialog.inner().first_transaction.merge_id {
                self.server_dialog_merge.write().unwrap().remove(mid);
            }
            dialog.on_remove();
            debug!(%id, "dialog removed");
        }
    }

    /// Record a confirmed server dialog in the merge index
    /// (RFC 3261 §8.2.2.2 late-duplicate detection).
    pub(super) fn register_confirmed_merge(&self, inner: &DialogInner) {
        if let Some(mid) = &inner.first_transaction.merge_id {
            let id = inner.id.lock().unwrap().clone();
            self.server_dialog_merge
                .write()
                .unwrap()
                .insert(mid.clone(), id);
        }
    }
}

/// SIP Dialog Layer
///
/// Creates and indexes dialogs, routes matched transactions to them, runs
/// the dialog housekeeping timers (early-state, ACK-wait, linger, reliable
/// 1xx retransmission) and the leak auditor.
pub struct DialogLayer {
    pub endpoint: EndpointInnerRef,
    pub inner: DialogLayerInnerRef,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef) -> Self {
        Self {
            endpoint,
            inner: Arc::new(DialogLayerInner {
                last_seq: AtomicU32::new(0),
                dialogs: RwLock::new(HashMap::new()),
                early_dialogs: RwLock::new(HashMap::new()),
                server_dialog_merge: RwLock::new(HashMap::new()),
                timers: Timer::new(),
            }),
        }
    }

    /// Drive the dialog housekeeping timers. Spawn alongside the
    /// endpoint's serve loop.
    pub async fn serve(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.endpoint.option.timer_interval);
        loop {
            tokio::select! {
                _ = self.endpoint.cancel_token.cancelled() => break,
                _ = ticker.tick() => self.process_timers(),
            }
        }
        Ok(())
    }

    /// One timer sweep; separated out so tests can drive time by hand.
    pub fn process_timers(&self) {
        for event in self.inner.timers.poll(Instant::now()) {
            let id = event.dialog_id().clone();
            match event {
                DialogTimerEvent::Linger(_) => {
                    self.inner.finish_remove(&id);
                }
                DialogTimerEvent::EarlyTimeout(_) => {
                    if let Some(dialog) = self.get_dialog(&id) {
                        let inner = dialog.inner();
                        if inner.is_early() || inner.can_cancel() {
                            info!(%id, "early dialog timeout");
                            inner
                                .transition(DialogState::Timeout(id, DialogTimeout::EarlyState))
                                .ok();
                        }
                    }
                }
                DialogTimerEvent::AckWait(_) => {
                    if let Some(dialog) = self.get_dialog(&id) {
                        let inner = dialog.inner();
                        let kind = match inner.role {
                            TransactionRole::Client => DialogTimeout::AckNotSent,
                            TransactionRole::Server => DialogTimeout::AckNotReceived,
                        };
                        if inner.waiting_ack()
                            || (inner.role == TransactionRole::Client
                                && inner.last_ack_sent.lock().unwrap().is_none())
                        {
                            info!(%id, ?kind, "ack reliability timeout");
                            inner.transition(DialogState::Timeout(id, kind)).ok();
                        }
                    }
                }
                DialogTimerEvent::ReliableRetransmit(_) => {
                    if let Some(dialog) = self.get_dialog(&id) {
                        dialog.inner().on_reliable_retransmit();
                    }
                }
            }
        }
    }

    /// Server INVITE dialog for a transaction: returns the existing one
    /// for an in-dialog INVITE, creates one (local tag assigned here) for
    /// a dialog-creating INVITE.
    pub fn get_or_create_server_invite(
        &self,
        tx: &Transaction,
        state_sender: DialogStateSender,
        credential: Option<Credential>,
        local_contact: Option<rsip::Uri>,
    ) -> Result<ServerInviteDialog> {
        let mut id = DialogId::try_from(tx)?;
        if !id.local_tag.is_empty() {
            let dlg = self.get_dialog(&id);
            match dlg {
                Some(Dialog::ServerInvite(dlg)) => return Ok(dlg),
                _ => {
                    return Err(crate::Error::DialogError(
                        "the dialog not found".to_string(),
                        id,
                        rsip::StatusCode::CallTransactionDoesNotExist,
                    ));
                }
            }
        }
        id.local_tag = make_tag().to_string(); // generate to tag

        let mut local_contact = local_contact;
        if local_contact.is_none() {
            local_contact = self
                .build_local_contact(credential.as_ref().map(|cred| cred.username.clone()), None)
                .ok();
        }

        let dlg_inner = DialogInner::new(
            TransactionRole::Server,
            id.clone(),
            tx.original.clone(),
            self.endpoint.clone(),
            Arc::downgrade(&self.inner),
            state_sender,
            credential,
            local_contact,
            tx.tu_sender.clone(),
        )?;

        *dlg_inner.remote_contact.lock().unwrap() = tx.original.contact_header().ok().cloned();

        let dialog = ServerInviteDialog {
            inner: Arc::new(dlg_inner),
        };
        self.endpoint
            .set_transaction_dialog(&tx.key, id.to_string());
        self.put_dialog(Dialog::ServerInvite(dialog.clone()));
        debug!(%id, "server invite dialog created");
        Ok(dialog)
    }

    pub fn get_or_create_server_subscription(
        &self,
        tx: &Transaction,
        state_sender: DialogStateSender,
        credential: Option<Credential>,
        local_contact: Option<rsip::Uri>,
    ) -> Result<ServerSubscriptionDialog> {
        let mut id = DialogId::try_from(tx)?;
        if !id.local_tag.is_empty() {
            let dlg = self.get_dialog(&id);
            match dlg {
                Some(Dialog::ServerSubscription(dlg)) => return Ok(dlg),
                _ => {
                    return Err(crate::Error::DialogError(
                        "the dialog not found".to_string(),
                        id,
                        rsip::StatusCode::CallTransactionDoesNotExist,
                    ));
                }
            }
        }
        id.local_tag = make_tag().to_string();

        let mut local_contact = local_contact;
        if local_contact.is_none() {
            local_contact = self
                .build_local_contact(credential.as_ref().map(|cred| cred.username.clone()), None)
                .ok();
        }

        let dlg_inner = DialogInner::new(
            TransactionRole::Server,
            id.clone(),
            tx.original.clone(),
            self.endpoint.clone(),
            Arc::downgrade(&self.inner),
            state_sender,
            credential,
            local_contact,
            tx.tu_sender.clone(),
        )?;

        *dlg_inner.remote_contact.lock().unwrap() = tx.original.contact_header().ok().cloned();

        let dialog = ServerSubscriptionDialog {
            inner: Arc::new(dlg_inner),
        };
        self.endpoint
            .set_transaction_dialog(&tx.key, id.to_string());
        self.put_dialog(Dialog::ServerSubscription(dialog.clone()));
        debug!(%id, "server subscription dialog created");
        Ok(dialog)
    }

    pub fn get_or_create_client_subscription(
        &self,
        call_id: String,
        from_tag: String,
        to_tag: String,
        initial_request: rsip::Request,
        state_sender: DialogStateSender,
        credential: Option<Credential>,
        local_contact: Option<rsip::Uri>,
    ) -> Result<ClientSubscriptionDialog> {
        let id = DialogId {
            call_id,
            local_tag: from_tag,
            remote_tag: to_tag,
        };

        if let Some(Dialog::ClientSubscription(dlg)) = self.get_dialog(&id) {
            return Ok(dlg);
        }

        let mut local_contact = local_contact;
        if local_contact.is_none() {
            local_contact = self
                .build_local_contact(credential.as_ref().map(|cred| cred.username.clone()), None)
                .ok();
        }

        let dlg_inner = DialogInner::new(
            TransactionRole::Client,
            id.clone(),
            initial_request,
            self.endpoint.clone(),
            Arc::downgrade(&self.inner),
            state_sender,
            credential,
            local_contact,
            transaction_event_sender_noop(),
        )?;

        let dialog = ClientSubscriptionDialog {
            inner: Arc::new(dlg_inner),
        };
        self.put_dialog(Dialog::ClientSubscription(dialog.clone()));
        Ok(dialog)
    }

    /// Adopt an out-of-dialog NOTIFY (RFC 3265 §4.4.1): locate the pending
    /// SUBSCRIBE client transaction through the registry and create the
    /// subscription dialog it establishes. Returns `None` when no
    /// SUBSCRIBE matches (the caller answers 481).
    pub fn adopt_notify(
        &self,
        tx: &Transaction,
        state_sender: DialogStateSender,
    ) -> Result<Option<ClientSubscriptionDialog>> {
        let notify = &tx.original;
        let Some((sub_key, _meta)) = self.endpoint.find_subscribe_transaction(notify) else {
            return Ok(None);
        };

        // Dialog id wrt the NOTIFY: we are its UAS, so local = to-tag
        // (our SUBSCRIBE from-tag), remote = from-tag.
        let id = DialogId::try_from((notify, TransactionRole::Server))?;
        if let Some(Dialog::ClientSubscription(existing)) = self.get_dialog(&id) {
            return Ok(Some(existing));
        }

        let dlg_inner = DialogInner::new(
            TransactionRole::Server,
            id.clone(),
            notify.clone(),
            self.endpoint.clone(),
            Arc::downgrade(&self.inner),
            state_sender,
            None,
            self.build_local_contact(None, None).ok(),
            tx.tu_sender.clone(),
        )?;
        *dlg_inner.remote_contact.lock().unwrap() = notify.contact_header().ok().cloned();

        let dialog = ClientSubscriptionDialog {
            inner: Arc::new(dlg_inner),
        };
        self.endpoint
            .set_transaction_dialog(&sub_key, id.to_string());
        self.put_dialog(Dialog::ClientSubscription(dialog.clone()));
        // subscription usage exists once the NOTIFY is answered 2xx
        dialog.inner.transition(DialogState::Confirmed(
            id.clone(),
            rsip::Response::default(),
        ))?;
        debug!(%id, "client subscription dialog adopted from notify");
        Ok(Some(dialog))
    }

    /// Secondary dialog for a forked response (distinct to-tag): same
    /// initial request, own remote target and route set, back reference to
    /// the primary dialog.
    pub fn get_or_create_fork_dialog(
        &self,
        primary: &ClientInviteDialog,
        resp: &rsip::Response,
    ) -> Result<ClientInviteDialog> {
        let id = DialogId::from_uac_response(resp)?;
        if let Some(Dialog::ClientInvite(existing)) = self.get_dialog(&id) {
            return Ok(existing);
        }

        let initial_request = primary.inner.initial_request.lock().unwrap().clone();
        let dlg_inner = DialogInner::new(
            TransactionRole::Client,
            id.clone(),
            initial_request,
            self.endpoint.clone(),
            Arc::downgrade(&self.inner),
            primary.inner.state_sender.clone(),
            primary.inner.credential.clone(),
            primary.inner.local_contact.clone(),
            primary.inner.tu_sender.clone(),
        )?;
        *dlg_inner.original_dialog.lock().unwrap() = Some(Arc::downgrade(&primary.inner));

        let dialog = ClientInviteDialog {
            inner: Arc::new(dlg_inner),
        };
        self.put_dialog(Dialog::ClientInvite(dialog.clone()));
        debug!(%id, primary = %primary.id(), "fork dialog created");
        Ok(dialog)
    }

    pub fn increment_last_seq(&self) -> u32 {
        self.inner.last_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.last_seq.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_dialog_ids(&self) -> Vec<String> {
        self.inner
            .dialogs
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect::<Vec<_>>()
    }

    /// Insert a dialog under its current id. Never replaces: when an entry
    /// already exists the incumbent is returned and the argument dropped.
    pub fn put_dialog(&self, dialog: Dialog) -> Option<Dialog> {
        let id = dialog.id();
        if id.is_early() {
            let mut early = self.inner.early_dialogs.write().unwrap();
            if let Some(existing) = early.get(&id.early_id()) {
                return Some(existing.clone());
            }
            early.insert(id.early_id(), dialog);
        } else {
            let mut dialogs = self.inner.dialogs.write().unwrap();
            if let Some(existing) = dialogs.get(&id.to_string()) {
                return Some(existing.clone());
            }
            dialogs.insert(id.to_string(), dialog);
        }
        None
    }

    /// Lookup by full id, falling back to the early index. Terminated
    /// dialogs stay reachable through the linger window.
    pub fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        if let Some(dialog) = self
            .inner
            .dialogs
            .read()
            .unwrap()
            .get(&id.to_string())
            .cloned()
        {
            return Some(dialog);
        }
        self.inner
            .early_dialogs
            .read()
            .unwrap()
            .get(&id.early_id())
            .cloned()
    }

    pub fn get_dialog_with(&self, rendered: &str) -> Option<Dialog> {
        self.inner.dialogs.read().unwrap().get(rendered).cloned()
    }

    /// All client INVITE dialogs sharing a Call-ID (fork branches have the
    /// same call-id and local tag but different remote tags).
    pub fn get_client_dialog_by_call_id(&self, call_id: &str) -> Vec<ClientInviteDialog> {
        let dialogs = match self.inner.dialogs.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        dialogs
            .values()
            .filter_map(|dlg| match dlg {
                Dialog::ClientInvite(client_dlg) if client_dlg.id().call_id == call_id => {
                    Some(client_dlg.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Remove a dialog immediately (no linger). Cascades across every
    /// index; the terminated event, if not yet delivered, is the caller's
    /// to arrange via the dialog's own transition.
    pub fn remove_dialog(&self, id: &DialogId) {
        debug!(%id, "remove dialog");
        self.inner.finish_remove(id);
    }

    pub fn match_dialog(&self, tx: &Transaction) -> Option<Dialog> {
        let id = DialogId::try_from(tx).ok()?;
        self.get_dialog(&id)
    }

    /// RFC 3261 §8.2.2.2 merged-request detection: true when a different
    /// ongoing server transaction or a confirmed server dialog shares the
    /// request's merge id. The caller answers 482 Loop Detected.
    pub fn find_merged(&self, request: &Request) -> Result<bool> {
        if request.method != rsip::Method::Invite {
            return Ok(false);
        }
        if self.endpoint.find_merged_transaction(request)? {
            return Ok(true);
        }
        let Some(mid) = merge_id(request) else {
            return Ok(false);
        };
        let dialog_id = self
            .inner
            .server_dialog_merge
            .read()
            .unwrap()
            .get(&mid)
            .cloned();
        if let Some(dialog_id) = dialog_id {
            if let Some(dialog) = self.get_dialog(&dialog_id) {
                let inner = dialog.inner();
                if inner.is_server() && inner.is_confirmed() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Leak audit: walk a shallow snapshot, mark entries whose call-id the
    /// application does not recognize, terminate those marked longer than
    /// `leak_threshold` ago. Returns a report when anything leaked.
    pub fn audit_stack(
        &self,
        active_call_ids: &HashSet<String>,
        leak_threshold: Duration,
    ) -> Option<String> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let snapshot: Vec<Dialog> = self
            .inner
            .dialogs
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();

        let mut leaked = 0usize;
        let mut report = String::from("leaked dialogs:\n");
        for dialog in snapshot {
            let inner = dialog.inner();
            let call_id = inner.id.lock().unwrap().call_id.clone();
            if active_call_ids.contains(&call_id) {
                inner.audit_tag.store(0, Ordering::Relaxed);
                continue;
            }
            let tag = inner.audit_tag.load(Ordering::Relaxed);
            if tag == 0 {
                inner.audit_tag.store(now_ms, Ordering::Relaxed);
                continue;
            }
            if now_ms.saturating_sub(tag) >= leak_threshold.as_millis() as u64 {
                leaked += 1;
                let id = dialog.id();
                report.push_str(&format!(
                    "  {} state={}\n",
                    id,
                    inner.state.lock().unwrap()
                ));
                warn!(%id, "leaked dialog terminated by audit");
                inner
                    .transition(DialogState::Terminated(id, TerminatedReason::Leaked))
                    .ok();
            }
        }
        if leaked > 0 {
            report.push_str(&format!("  total: {} leaked dialogs\n", leaked));
            Some(report)
        } else {
            None
        }
    }

    pub fn new_dialog_state_channel(&self) -> (DialogStateSender, DialogStateReceiver) {
        tokio::sync::mpsc::unbounded_channel()
    }

    pub fn build_local_contact(
        &self,
        username: Option<String>,
        params: Option<Vec<rsip::Param>>,
    ) -> Result<rsip::Uri> {
        let addr = self
            .endpoint
            .transport_layer
            .get_addrs()
            .first()
            .ok_or(crate::Error::EndpointError("no sip addrs".to_string()))?
            .clone();

        let scheme = if matches!(addr.r#type, Some(rsip::Transport::Tls)) {
            rsip::Scheme::Sips
        } else {
            rsip::Scheme::Sip
        };

        let mut params = params.unwrap_or_default();
        if !matches!(addr.r#type, Some(rsip::Transport::Udp) | None) {
            addr.r#type.map(|t| params.push(rsip::Param::Transport(t)));
        }
        let auth = username.map(|user| rsip::Auth {
            user,
            password: None,
        });
        Ok(rsip::Uri {
            scheme: Some(scheme),
            auth,
            host_with_port: addr.addr.clone().into(),
            params,
            ..Default::default()
        })
    }
}
