use super::{
    authenticate::Credential,
    client_dialog::ClientInviteDialog,
    dialog_layer::DialogLayerInner,
    server_dialog::ServerInviteDialog,
    subscription::{ClientSubscriptionDialog, ServerSubscriptionDialog},
    DialogId,
};
use crate::{
    rsip_ext::{
        body_hash, extract_uri_from_contact, header_contains_token, is_target_refresh,
        parse_rack_header, parse_rseq_header,
    },
    transaction::{
        endpoint::EndpointInnerRef,
        key::{merge_id, TransactionKey, TransactionRole},
        make_via_branch,
        transaction::Transaction,
        TransactionEvent, TransactionEventSender,
    },
    transport::SipAddr,
    Error, Result,
};
use rsip::{
    headers::Route,
    message::HasHeaders,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    typed::{CSeq, Contact},
    Header, Method, Param, Request, Response, StatusCode, StatusCodeKind,
};
use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc, Mutex, Weak,
};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub type TransactionCommandSender = mpsc::Sender<TransactionCommand>;
pub type TransactionCommandReceiver = mpsc::Receiver<TransactionCommand>;

#[derive(Debug)]
pub enum TransactionCommand {
    Respond {
        status: StatusCode,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    },
}

/// Handle the upper layer uses to answer an in-dialog request surfaced
/// through a [`DialogState`] event.
#[derive(Clone, Debug)]
pub struct TransactionHandle {
    sender: TransactionCommandSender,
}

impl TransactionHandle {
    pub fn new() -> (Self, TransactionCommandReceiver) {
        let (tx, rx) = mpsc::channel(4);
        (Self { sender: tx }, rx)
    }

    pub async fn reply(
        &self,
        status: StatusCode,
    ) -> std::result::Result<(), mpsc::error::SendError<TransactionCommand>> {
        self.respond(status, None, None).await
    }

    pub async fn respond(
        &self,
        status: StatusCode,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> std::result::Result<(), mpsc::error::SendError<TransactionCommand>> {
        self.sender
            .send(TransactionCommand::Respond {
                status,
                headers,
                body,
            })
            .await
    }
}

/// SIP Dialog State
///
/// The dialog state machine of RFC 3261 §12: NULL (`Calling`/`Trying`) →
/// `Early` → `Confirmed` → `Terminated`, with `WaitAck` as the server-side
/// window between the 2xx and its ACK. The remaining variants are
/// event-only: they surface an in-dialog request (or a timer alert) to the
/// upper layer without changing the stored state.
#[derive(Clone)]
pub enum DialogState {
    Calling(DialogId),
    Trying(DialogId),
    Early(DialogId, rsip::Response),
    WaitAck(DialogId, rsip::Response),
    Confirmed(DialogId, rsip::Response),
    Updated(DialogId, rsip::Request, TransactionHandle),
    Notify(DialogId, rsip::Request, TransactionHandle),
    Refer(DialogId, rsip::Request, TransactionHandle),
    Message(DialogId, rsip::Request, TransactionHandle),
    Info(DialogId, rsip::Request, TransactionHandle),
    Options(DialogId, rsip::Request, TransactionHandle),
    /// Non-fatal timer alert; the upper layer decides whether to hang up.
    Timeout(DialogId, DialogTimeout),
    Terminated(DialogId, TerminatedReason),
}

/// Timer expirations surfaced as alerts rather than terminations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogTimeout {
    /// The dialog sat in EARLY longer than `early_dialog_timeout`.
    EarlyState,
    /// We received a 2xx but never sent the ACK.
    AckNotSent,
    /// We sent a 2xx but never saw the ACK.
    AckNotReceived,
    /// A re-INVITE got no final response in time.
    ReInvite,
}

#[derive(Debug, Clone)]
pub enum TerminatedReason {
    Timeout,
    Leaked,
    UacCancel,
    UacBye,
    UasBye,
    UacBusy,
    UasBusy,
    UasDecline,
    UacOther(rsip::StatusCode),
    UasOther(rsip::StatusCode),
}

/// Housekeeping timers owned by the dialog layer's wheel. Each carries the
/// dialog id only; a firing whose dialog is gone resolves to nothing.
#[derive(Clone, Debug)]
pub enum DialogTimerEvent {
    EarlyTimeout(DialogId),
    AckWait(DialogId),
    Linger(DialogId),
    ReliableRetransmit(DialogId),
}

impl DialogTimerEvent {
    pub fn dialog_id(&self) -> &DialogId {
        match self {
            DialogTimerEvent::EarlyTimeout(id)
            | DialogTimerEvent::AckWait(id)
            | DialogTimerEvent::Linger(id)
            | DialogTimerEvent::ReliableRetransmit(id) => id,
        }
    }
}

/// Top-level dialog value stored in the registry.
#[derive(Clone)]
pub enum Dialog {
    ServerInvite(ServerInviteDialog),
    ClientInvite(ClientInviteDialog),
    ServerSubscription(ServerSubscriptionDialog),
    ClientSubscription(ClientSubscriptionDialog),
}

/// A reliable provisional response awaiting its PRACK (RFC 3262 §3).
pub(super) struct PendingReliable {
    pub response: Response,
    pub rseq: u32,
    pub cseq: u32,
    pub method: Method,
    pub interval: Duration,
    pub elapsed: Duration,
}

/// UAC-side record of the last reliable 1xx we acknowledged.
#[derive(Clone)]
pub(super) struct RemoteReliableState {
    pub last_rseq: u32,
    pub prack_request: Request,
}

#[derive(Default)]
pub(super) struct DialogTimerIds {
    pub early: Option<u64>,
    pub ack_wait: Option<u64>,
    pub linger: Option<u64>,
    pub reliable: Option<u64>,
}

/// Summary of the transaction that created the dialog, retained after the
/// transaction itself is discarded.
#[derive(Clone, Debug)]
pub struct FirstTransactionInfo {
    pub method: Method,
    pub branch: Option<String>,
    pub secure: bool,
    pub merge_id: Option<String>,
}

/// Internal dialog state shared by the role-specific wrappers.
///
/// Owns the sequence numbers, tags, route set, remote target, reliability
/// bookkeeping for provisional responses, ACK reliability for 2xx and the
/// forking fingerprint set. Mutation funnels through the per-dialog
/// executor queue or the inbound-message thread; fields are individually
/// locked, never the dialog as a whole.
pub struct DialogInner {
    pub role: TransactionRole,
    pub cancel_token: CancellationToken,
    pub id: Mutex<DialogId>,
    pub state: Mutex<DialogState>,

    pub local_seq: AtomicU64,
    pub remote_seq: AtomicU64,
    pub local_contact: Option<rsip::Uri>,
    pub remote_contact: Mutex<Option<rsip::headers::untyped::Contact>>,
    pub remote_uri: Mutex<rsip::Uri>,

    pub from: rsip::typed::From,
    pub to: Mutex<rsip::typed::To>,

    pub credential: Option<Credential>,
    pub route_set: Mutex<Vec<Route>>,
    pub(super) route_frozen: AtomicBool,
    pub(super) pending_route_update_on_202: AtomicBool,

    pub(super) endpoint_inner: EndpointInnerRef,
    pub(super) layer: Weak<DialogLayerInner>,
    pub(super) state_sender: DialogStateSender,
    pub(super) tu_sender: TransactionEventSender,
    pub(super) initial_request: Mutex<Request>,
    pub first_transaction: FirstTransactionInfo,

    pub(super) supports_100rel: bool,
    pub(super) local_rseq: AtomicU32,
    pub(super) reliable_local: Mutex<Option<PendingReliable>>,
    pub(super) remote_reliable: Mutex<Option<RemoteReliableState>>,

    pub(super) last_response: Mutex<Option<Response>>,
    /// Highest INVITE CSeq for which we saw a 2xx (UAC, feeds `create_ack`).
    pub(super) last_invite_ok_cseq: AtomicU64,
    pub(super) last_ack_sent: Mutex<Option<Request>>,
    /// Highest CSeq acknowledged by a received ACK; 0 = none yet.
    pub(super) ack_seen_cseq: AtomicU64,

    pub terminate_on_bye: bool,
    pub(super) is_b2bua: AtomicBool,
    pub(super) bye_sent: AtomicBool,

    pub(super) fork_fingerprints: Mutex<HashSet<String>>,
    pub(super) original_dialog: Mutex<Option<Weak<DialogInner>>>,
    /// Leak-audit marker: 0 = unseen, else the millis of the first sweep
    /// that did not recognize the call-id.
    pub(super) audit_tag: AtomicU64,
    pub(super) terminated_event_sent: AtomicBool,
    pub(super) cached_authorization: Mutex<Option<rsip::Header>>,
    pub(super) timer_ids: Mutex<DialogTimerIds>,
}

pub type DialogStateReceiver = UnboundedReceiver<DialogState>;
pub type DialogStateSender = UnboundedSender<DialogState>;

pub(crate) type DialogInnerRef = Arc<DialogInner>;

impl DialogState {
    pub fn id(&self) -> &DialogId {
        match self {
            DialogState::Calling(id)
            | DialogState::Trying(id)
            | DialogState::Early(id, _)
            | DialogState::WaitAck(id, _)
            | DialogState::Confirmed(id, _)
            | DialogState::Updated(id, _, _)
            | DialogState::Notify(id, _, _)
            | DialogState::Refer(id, _, _)
            | DialogState::Message(id, _, _)
            | DialogState::Info(id, _, _)
            | DialogState::Options(id, _, _)
            | DialogState::Timeout(id, _)
            | DialogState::Terminated(id, _) => id,
        }
    }

    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            DialogState::Calling(_) | DialogState::Trying(_) | DialogState::Early(_, _)
        )
    }

    pub fn is_early(&self) -> bool {
        matches!(self, DialogState::Early(_, _))
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed(_, _))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated(_, _))
    }

    pub fn waiting_ack(&self) -> bool {
        matches!(self, DialogState::WaitAck(_, _))
    }
}

impl DialogInner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: TransactionRole,
        id: DialogId,
        initial_request: Request,
        endpoint_inner: EndpointInnerRef,
        layer: Weak<DialogLayerInner>,
        state_sender: DialogStateSender,
        credential: Option<Credential>,
        local_contact: Option<rsip::Uri>,
        tu_sender: TransactionEventSender,
    ) -> Result<Self> {
        let cseq = initial_request.cseq_header()?.seq()? as u64;

        let remote_uri = match role {
            TransactionRole::Client => initial_request.uri.clone(),
            TransactionRole::Server => {
                extract_uri_from_contact(initial_request.contact_header()?.value())?
            }
        };

        let from = initial_request.from_header()?.typed()?;
        let mut to = initial_request.to_header()?.typed()?;
        if !to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
            let tag = match role {
                TransactionRole::Client => &id.remote_tag,
                TransactionRole::Server => &id.local_tag,
            };
            if !tag.is_empty() {
                to.params.push(rsip::Param::Tag(tag.clone().into()));
            }
        }

        // Server dialogs learn the route set from the creating request in
        // order (RFC 3261 §12.1.1); client dialogs learn theirs reversed
        // from responses later.
        let mut route_set = vec![];
        if role == TransactionRole::Server {
            for h in initial_request.headers.iter() {
                if let Header::RecordRoute(rr) = h {
                    route_set.push(Route::from(rr.value()));
                }
            }
        }

        let supports_100rel =
            header_contains_token(&initial_request.headers, "Supported", "100rel")
                || header_contains_token(&initial_request.headers, "Require", "100rel");

        let first_transaction = FirstTransactionInfo {
            method: initial_request.method,
            branch: TransactionKey::from_request(&initial_request, role)
                .ok()
                .and_then(|k| k.branch().map(|b| b.to_string())),
            secure: matches!(initial_request.uri.scheme, Some(rsip::Scheme::Sips)),
            merge_id: match role {
                TransactionRole::Server => merge_id(&initial_request),
                TransactionRole::Client => None,
            },
        };

        let cached_authorization = initial_request
            .headers
            .iter()
            .find(|h| matches!(h, Header::ProxyAuthorization(_)))
            .cloned();

        Ok(Self {
            role,
            cancel_token: CancellationToken::new(),
            id: Mutex::new(id.clone()),
            from,
            to: Mutex::new(to),
            local_seq: AtomicU64::new(cseq),
            remote_seq: AtomicU64::new(0),
            remote_uri: Mutex::new(remote_uri),
            credential,
            route_set: Mutex::new(route_set),
            route_frozen: AtomicBool::new(false),
            pending_route_update_on_202: AtomicBool::new(false),
            endpoint_inner,
            layer,
            state_sender,
            tu_sender,
            state: Mutex::new(DialogState::Calling(id)),
            initial_request: Mutex::new(initial_request),
            first_transaction,
            local_contact,
            remote_contact: Mutex::new(None),
            supports_100rel,
            local_rseq: AtomicU32::new(rand::Rng::gen_range(
                &mut rand::thread_rng(),
                1..=(i32::MAX as u32),
            )),
            reliable_local: Mutex::new(None),
            remote_reliable: Mutex::new(None),
            last_response: Mutex::new(None),
            last_invite_ok_cseq: AtomicU64::new(0),
            last_ack_sent: Mutex::new(None),
            ack_seen_cseq: AtomicU64::new(0),
            terminate_on_bye: true,
            is_b2bua: AtomicBool::new(false),
            bye_sent: AtomicBool::new(false),
            fork_fingerprints: Mutex::new(HashSet::new()),
            original_dialog: Mutex::new(None),
            audit_tag: AtomicU64::new(0),
            terminated_event_sent: AtomicBool::new(false),
            cached_authorization: Mutex::new(cached_authorization),
            timer_ids: Mutex::new(DialogTimerIds::default()),
        })
    }

    pub fn can_cancel(&self) -> bool {
        self.state.lock().unwrap().can_cancel()
    }
    pub fn is_early(&self) -> bool {
        self.state.lock().unwrap().is_early()
    }
    pub fn is_confirmed(&self) -> bool {
        self.state.lock().unwrap().is_confirmed()
    }
    pub fn is_terminated(&self) -> bool {
        self.state.lock().unwrap().is_terminated()
    }
    pub fn waiting_ack(&self) -> bool {
        self.state.lock().unwrap().waiting_ack()
    }
    pub fn is_server(&self) -> bool {
        self.role == TransactionRole::Server
    }

    pub fn get_local_seq(&self) -> u64 {
        self.local_seq.load(Ordering::Relaxed)
    }

    /// Local CSeq only ever moves forward; the 32-bit wire bound is checked
    /// where requests are built.
    pub fn increment_local_seq(&self) -> u64 {
        self.local_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn set_back_to_back_user_agent(&self, enabled: bool) {
        self.is_b2bua.store(enabled, Ordering::Relaxed);
    }

    pub fn is_back_to_back_user_agent(&self) -> bool {
        self.is_b2bua.load(Ordering::Relaxed)
    }

    /// One-shot carve-out: allow the route set of a SUBSCRIBE dialog to be
    /// installed from the 202 response even after CONFIRMED.
    pub fn set_pending_route_update_on_202(&self) {
        self.pending_route_update_on_202
            .store(true, Ordering::Relaxed);
    }

    /// Reassign the remote tag and re-index the dialog. Legal while the
    /// dialog is early (forking); gated by the stack-wide reassignment flag
    /// when a different tag was already in place.
    pub fn update_remote_tag(&self, tag: &str) -> Result<()> {
        let old_id = self.id.lock().unwrap().clone();
        if !old_id.remote_tag.is_empty() && old_id.remote_tag != tag {
            let reassignable = self.state.lock().unwrap().can_cancel()
                && self.endpoint_inner.option.allow_remote_tag_reassignment;
            if !reassignable {
                debug!(id = %old_id, tag, "remote tag reassignment refused");
                return Ok(());
            }
        }
        let new_id = {
            let mut id = self.id.lock().unwrap();
            id.remote_tag = tag.to_string();
            id.clone()
        };

        if self.role == TransactionRole::Client {
            let mut to = self.to.lock().unwrap();
            *to = to.clone().with_tag(tag.into());
        }

        if old_id != new_id {
            if let Some(layer) = self.layer.upgrade() {
                layer.reindex_dialog(&old_id, &new_id);
            }
        }
        Ok(())
    }

    pub(super) fn clear_remote_reliable(&self) {
        self.remote_reliable.lock().unwrap().take();
    }

    /// Build the PRACK for a reliable 1xx we received, or return the cached
    /// one for an RSeq already acknowledged (RFC 3262 §4). The RAck carries
    /// `RSeq CSeq Method` of the acknowledged response.
    pub fn create_prack(&self, resp: &Response) -> Result<Option<Request>> {
        if !header_contains_token(resp.headers(), "Require", "100rel") {
            return Ok(None);
        }

        let Some(rseq) = parse_rseq_header(resp.headers()) else {
            warn!(
                id = %self.id.lock().unwrap(),
                "received reliable provisional response without RSeq"
            );
            return Ok(None);
        };

        let cseq_header = resp.cseq_header()?;
        let cseq = cseq_header.seq()?;
        let method = cseq_header.method()?;

        {
            let state_guard = self.remote_reliable.lock().unwrap();
            if let Some(state) = state_guard.as_ref() {
                if state.last_rseq == rseq {
                    return Ok(Some(state.prack_request.clone()));
                }
                if state.last_rseq > rseq {
                    return Ok(None);
                }
            }
        }

        let rack_value = format!("{} {} {}", rseq, cseq, method);
        let mut headers = vec![Header::Other("RAck".into(), rack_value.into())];
        if self.supports_100rel {
            headers.push(Header::Other("Supported".into(), "100rel".into()));
        }

        let next_seq = self.next_wire_seq()?;
        let prack_request =
            self.make_request(Method::PRack, Some(next_seq), None, Some(headers), None)?;

        *self.remote_reliable.lock().unwrap() = Some(RemoteReliableState {
            last_rseq: rseq,
            prack_request: prack_request.clone(),
        });

        Ok(Some(prack_request))
    }

    pub(super) async fn handle_provisional_response(
        self: &Arc<Self>,
        resp: &Response,
    ) -> Result<()> {
        let to_header = resp.to_header()?;
        if let Ok(Some(tag)) = to_header.tag() {
            self.update_remote_tag(tag.value())?;
        }

        if let Some(prack) = self.create_prack(resp)? {
            let _ = self.send_prack_request(prack).await?;
        }

        Ok(())
    }

    /// PRACK goes out directly, never through the per-dialog queue: it may
    /// be triggered from inside a queued send, and queueing it again behind
    /// that send would wedge the dialog.
    pub(super) async fn send_prack_request(
        self: &Arc<Self>,
        request: Request,
    ) -> Result<Option<Response>> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint_inner.clone(), None);

        if let Some(route) = tx.original.route_header() {
            if let Some(first_route) = route.typed().ok().and_then(|r| r.uris().first().cloned()) {
                tx.destination = SipAddr::try_from(&first_route.uri).ok();
            }
        }

        tx.send().await?;
        while let Some(msg) = tx.receive().await {
            match msg {
                rsip::SipMessage::Response(resp) => {
                    if resp.status_code == StatusCode::Trying {
                        continue;
                    }
                    return Ok(Some(resp));
                }
                _ => break,
            }
        }
        Ok(None)
    }

    /// Refresh the remote target. The route set is untouched; target
    /// refresh never rewrites it.
    pub fn set_remote_target(
        &self,
        uri: rsip::Uri,
        contact: Option<rsip::headers::untyped::Contact>,
    ) {
        *self.remote_uri.lock().unwrap() = uri;
        *self.remote_contact.lock().unwrap() = contact;
    }

    /// Install the route set from the Record-Route headers of a response
    /// (client dialogs, reversed per RFC 3261 §12.1.2). Once the dialog is
    /// confirmed the set is frozen, except for the one-shot 202-SUBSCRIBE
    /// carve-out.
    pub(crate) fn update_route_set_from_response(&self, resp: &Response) {
        if !matches!(self.role, TransactionRole::Client) {
            return;
        }
        if self.route_frozen.load(Ordering::Relaxed) {
            let deferred_202 = resp.status_code == StatusCode::Accepted
                && self
                    .pending_route_update_on_202
                    .swap(false, Ordering::Relaxed);
            if !deferred_202 {
                trace!(id = %self.id.lock().unwrap(), "route set frozen, ignoring Record-Route");
                return;
            }
        }

        let mut new_route_set: Vec<Route> = resp
            .headers()
            .iter()
            .filter_map(|header| match header {
                Header::RecordRoute(rr) => Some(Route::from(rr.value())),
                _ => None,
            })
            .collect();

        new_route_set.reverse();
        for route in &new_route_set {
            if let Ok(typed) = route.typed() {
                let loose = typed
                    .uris()
                    .first()
                    .map(|u| u.uri.params.iter().any(|p| matches!(p, Param::Lr)))
                    .unwrap_or(false);
                if !loose {
                    warn!(
                        id = %self.id.lock().unwrap(),
                        route = %route.value(),
                        "strict-router route entry accepted"
                    );
                }
            }
        }
        *self.route_set.lock().unwrap() = new_route_set;
    }

    /// The next CSeq, validated against the 32-bit wire bound.
    fn next_wire_seq(&self) -> Result<u32> {
        let next = self.increment_local_seq();
        if next >= u32::MAX as u64 {
            return Err(Error::DialogError(
                "local CSeq exhausted".to_string(),
                self.id.lock().unwrap().clone(),
                StatusCode::ServerInternalError,
            ));
        }
        Ok(next as u32)
    }

    /// Construct an in-dialog request per RFC 3261 §12.2.1.1. The caller-
    /// facing guardrails (method and state checks) live in
    /// [`DialogInner::create_request`].
    pub(super) fn make_request(
        &self,
        method: rsip::Method,
        cseq: Option<u32>,
        addr: Option<SipAddr>,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<rsip::Request> {
        let mut headers = headers.unwrap_or_default();
        let seq = match cseq {
            Some(seq) => seq,
            None => self.next_wire_seq()?,
        };
        let cseq_header = CSeq { seq, method };

        let via = self.endpoint_inner.get_via(addr, None)?;
        headers.push(Header::Via(via.into()));
        headers.push(Header::CallId(
            self.id.lock().unwrap().call_id.clone().into(),
        ));

        let to = self.to.lock().unwrap().clone().untyped().value().to_string();
        let from = self.from.clone().untyped().value().to_string();
        match self.role {
            TransactionRole::Client => {
                headers.push(Header::From(from.into()));
                headers.push(Header::To(to.into()));
            }
            TransactionRole::Server => {
                headers.push(Header::From(to.into()));
                headers.push(Header::To(from.into()));
            }
        }
        headers.push(Header::CSeq(cseq_header.into()));
        headers.push(Header::UserAgent(
            self.endpoint_inner.user_agent.clone().into(),
        ));

        if is_target_refresh(&method) {
            self.local_contact
                .as_ref()
                .map(|c| headers.push(Contact::from(c.clone()).into()));
        }

        if let Some(auth) = self.cached_authorization.lock().unwrap().clone() {
            if !headers
                .iter()
                .any(|h| matches!(h, Header::ProxyAuthorization(_)))
            {
                headers.push(auth);
            }
        }

        {
            let route_set = self.route_set.lock().unwrap();
            headers.extend(route_set.iter().cloned().map(Header::Route));
        }
        headers.push(Header::MaxForwards(70.into()));

        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        let req = rsip::Request {
            method,
            uri: self.request_uri(),
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        };
        Ok(req)
    }

    /// Request-URI for in-dialog requests: the learned remote target, else
    /// the remote party URI with its parameters stripped.
    fn request_uri(&self) -> rsip::Uri {
        let uri = self.remote_uri.lock().unwrap().clone();
        if uri.host_with_port.to_string().is_empty() {
            let mut fallback = match self.role {
                TransactionRole::Client => self.to.lock().unwrap().uri.clone(),
                TransactionRole::Server => self.from.uri.clone(),
            };
            fallback.params.clear();
            return fallback;
        }
        uri
    }

    /// Caller-facing request construction: rejects ACK/CANCEL/PRACK (they
    /// have dedicated constructors) and enforces the dialog-state rules of
    /// RFC 3261 §12.2.1 and §15.1.
    pub fn create_request(
        &self,
        method: rsip::Method,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<rsip::Request> {
        if matches!(method, Method::Ack | Method::Cancel | Method::PRack) {
            return Err(Error::DialogError(
                format!("{} cannot be built via create_request", method),
                self.id.lock().unwrap().clone(),
                StatusCode::BadRequest,
            ));
        }
        let state = self.state.lock().unwrap().clone();
        let allowed = match method {
            // UAC may BYE an early dialog, UAS may not (RFC 3261 §15)
            Method::Bye => {
                state.is_confirmed()
                    || state.waiting_ack()
                    || (state.is_early() && self.role == TransactionRole::Client)
            }
            _ => state.is_early() || state.is_confirmed(),
        };
        if !allowed {
            return Err(Error::DialogError(
                format!("cannot create {} in state {}", method, state),
                self.id.lock().unwrap().clone(),
                StatusCode::CallTransactionDoesNotExist,
            ));
        }
        self.make_request(method, None, None, headers, body)
    }

    pub(super) fn make_response(
        &self,
        request: &Request,
        status: StatusCode,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> rsip::Response {
        let mut resp_headers = rsip::Headers::default();

        for header in request.headers.iter() {
            match header {
                Header::Via(via) => {
                    resp_headers.push(Header::Via(via.clone()));
                }
                Header::From(from) => {
                    resp_headers.push(Header::From(from.clone()));
                }
                Header::To(to) => {
                    let mut to = match to.clone().typed() {
                        Ok(to) => to,
                        Err(e) => {
                            info!(error = %e, "error parsing to header");
                            continue;
                        }
                    };

                    if status != StatusCode::Trying
                        && !to.params.iter().any(|p| matches!(p, Param::Tag(_)))
                    {
                        to.params.push(rsip::Param::Tag(
                            self.id.lock().unwrap().local_tag.clone().into(),
                        ));
                    }
                    resp_headers.push(Header::To(to.into()));
                }
                Header::CSeq(cseq) => {
                    resp_headers.push(Header::CSeq(cseq.clone()));
                }
                Header::CallId(call_id) => {
                    resp_headers.push(Header::CallId(call_id.clone()));
                }
                Header::RecordRoute(rr) => {
                    // responses echo the request's Record-Route (RFC 3261 §12.1.1)
                    resp_headers.push(Header::RecordRoute(rr.clone()));
                }
                _ => {}
            }
        }

        self.local_contact
            .as_ref()
            .map(|c| resp_headers.push(Contact::from(c.clone()).into()));

        if let Some(headers) = headers {
            for header in headers {
                resp_headers.unique_push(header);
            }
        }

        resp_headers.retain(|h| !matches!(h, Header::ContentLength(_) | Header::UserAgent(_)));

        resp_headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        resp_headers.push(Header::UserAgent(
            self.endpoint_inner.user_agent.clone().into(),
        ));

        Response {
            status_code: status,
            headers: resp_headers,
            body: body.unwrap_or_default(),
            version: request.version().clone(),
        }
    }

    /// Build the ACK for a 2xx with CSeq `cseq` (RFC 3261 §13.2.2.4): fresh
    /// branch, Request-URI from the route set or remote target, credentials
    /// carried over from the INVITE.
    pub fn create_ack(&self, cseq: u32) -> Result<Request> {
        let ok_cseq = self.last_invite_ok_cseq.load(Ordering::Relaxed);
        if ok_cseq == 0 || (cseq as u64) > ok_cseq {
            return Err(Error::DialogError(
                format!("no 2xx to INVITE with CSeq <= {}", cseq),
                self.id.lock().unwrap().clone(),
                StatusCode::CallTransactionDoesNotExist,
            ));
        }

        let route_set = self.route_set.lock().unwrap().clone();
        let mut route_headers: Vec<Route> = route_set.clone();
        let request_uri = match route_set.first().map(|r| r.typed()) {
            Some(Ok(first)) => match first.uris().first() {
                Some(first_uri) => {
                    let loose = first_uri.uri.params.iter().any(|p| matches!(p, Param::Lr));
                    if loose {
                        self.request_uri()
                    } else {
                        // strict router: its URI becomes the Request-URI and
                        // drops out of the Route list (RFC 3261 §12.2.1.1)
                        route_headers.remove(0);
                        first_uri.uri.clone()
                    }
                }
                None => self.request_uri(),
            },
            _ => self.request_uri(),
        };

        let transport = self.select_ack_transport(&request_uri);
        let addr = self
            .endpoint_inner
            .transport_layer
            .listening_point(transport)
            .or_else(|| self.endpoint_inner.get_addrs().first().cloned());

        let mut headers: Vec<Header> = vec![];
        let via = self.endpoint_inner.get_via(addr, Some(make_via_branch()))?;
        headers.push(Header::Via(via.into()));
        headers.push(Header::CallId(
            self.id.lock().unwrap().call_id.clone().into(),
        ));
        headers.push(Header::From(
            self.from.clone().untyped().value().to_string().into(),
        ));
        headers.push(Header::To(
            self.to
                .lock()
                .unwrap()
                .clone()
                .untyped()
                .value()
                .to_string()
                .into(),
        ));
        headers.push(Header::CSeq(
            CSeq {
                seq: cseq,
                method: Method::Ack,
            }
            .into(),
        ));
        headers.push(Header::MaxForwards(70.into()));
        headers.extend(route_headers.into_iter().map(Header::Route));
        if let Some(auth) = self.cached_authorization.lock().unwrap().clone() {
            headers.push(auth);
        }
        headers.push(Header::ContentLength(0u32.into()));

        Ok(Request {
            method: Method::Ack,
            uri: request_uri,
            headers: headers.into(),
            version: rsip::Version::V2,
            body: vec![],
        })
    }

    /// Transport preference for the ACK: explicit `;transport` parameter,
    /// then TLS for sips targets, then UDP, TCP, and finally whatever the
    /// last response arrived on.
    fn select_ack_transport(&self, uri: &rsip::Uri) -> rsip::transport::Transport {
        if let Some(t) = uri.params.iter().find_map(|p| match p {
            Param::Transport(t) => Some(*t),
            _ => None,
        }) {
            return t;
        }
        if matches!(uri.scheme, Some(rsip::Scheme::Sips)) {
            return rsip::transport::Transport::Tls;
        }
        let available = self.endpoint_inner.get_addrs();
        for preferred in [
            rsip::transport::Transport::Udp,
            rsip::transport::Transport::Tcp,
        ] {
            if available.iter().any(|a| a.r#type == Some(preferred)) {
                return preferred;
            }
        }
        self.last_response
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|r| r.via_header().ok().and_then(|v| v.typed().ok()))
            .map(|v| v.transport)
            .unwrap_or(rsip::transport::Transport::Udp)
    }

    /// Send an ACK, head-inserted into this dialog's outbound queue so it
    /// overtakes queued requests but never an ACK already in flight.
    pub async fn send_ack(self: &Arc<Self>, ack: Request) -> Result<()> {
        if ack.method != Method::Ack {
            return Err(Error::DialogError(
                "send_ack requires an ACK request".to_string(),
                self.id.lock().unwrap().clone(),
                StatusCode::BadRequest,
            ));
        }
        let our_call_id = self.id.lock().unwrap().call_id.clone();
        if ack.call_id_header()?.value() != our_call_id {
            return Err(Error::DialogError(
                "ACK call-id does not belong to this dialog".to_string(),
                self.id.lock().unwrap().clone(),
                StatusCode::BadRequest,
            ));
        }

        let (done_tx, done_rx) = oneshot::channel();
        let inner = self.clone();
        let ack_clone = ack.clone();
        self.endpoint_inner
            .executor
            .submit_first(&our_call_id, async move {
                let result = inner.send_raw_request(ack_clone).await;
                done_tx.send(result).ok();
            });
        match done_rx.await {
            Ok(Ok(())) => {
                self.last_ack_sent.lock().unwrap().replace(ack);
                self.cancel_ack_wait_timer();
                Ok(())
            }
            Ok(Err(e)) => {
                // transport failure surfaced as an event; the dialog lives on
                warn!(id = %self.id.lock().unwrap(), "ack send failed: {}", e);
                Err(e)
            }
            Err(_) => Err(Error::Error("executor dropped ack task".to_string())),
        }
    }

    /// Resend the last ACK (a 2xx retransmission arrived).
    pub async fn resend_ack(self: &Arc<Self>) -> Result<()> {
        let last = self.last_ack_sent.lock().unwrap().clone();
        match last {
            Some(ack) => self.send_ack(ack).await,
            None => Ok(()),
        }
    }

    /// Fire-and-forget send outside any transaction (ACK is its own
    /// transactionless message).
    async fn send_raw_request(self: &Arc<Self>, request: Request) -> Result<()> {
        let destination = self.endpoint_inner.next_hop(&request).await?;
        let connection = self.endpoint_inner.transport_layer.lookup(&destination)?;
        connection
            .send(request.into(), Some(&destination))
            .await
            .map_err(|e| {
                self.endpoint_inner.report_io_error(&e, Some(&destination));
                e
            })
    }

    /// Server-side ACK acceptance (RFC 3261 §13.3.1.4): idempotent, CSeq
    /// checked against the answered 2xx. Returns true exactly once per ACK.
    pub fn handle_ack(&self, ack: &Request) -> Result<bool> {
        let cseq = ack.cseq_header()?.seq()? as u64;
        let seen = self.ack_seen_cseq.load(Ordering::Relaxed);
        if seen != 0 && cseq <= seen {
            trace!(id = %self.id.lock().unwrap(), cseq, "ACK retransmission dropped");
            return Ok(false);
        }

        let last = self.last_response.lock().unwrap().clone();
        let matches_2xx = last
            .as_ref()
            .map(|resp| {
                resp.status_code.kind() == StatusCodeKind::Successful
                    && resp
                        .cseq_header()
                        .ok()
                        .and_then(|c| c.seq().ok())
                        .map(|s| s as u64 == cseq)
                        .unwrap_or(false)
            })
            .unwrap_or(false);
        if !matches_2xx {
            debug!(id = %self.id.lock().unwrap(), cseq, "ACK does not match last 2xx");
            return Ok(false);
        }

        self.ack_seen_cseq.store(cseq, Ordering::Relaxed);
        self.cancel_ack_wait_timer();
        if self.is_terminated() {
            // late ACK in the linger window: absorbed, no resurrection
            trace!(id = %self.id.lock().unwrap(), cseq, "late ACK absorbed after termination");
            return Ok(false);
        }
        let id = self.id.lock().unwrap().clone();
        self.transition(DialogState::Confirmed(id, last.unwrap_or_default()))?;
        Ok(true)
    }

    /// Fingerprint a response across forked branches; true when it was
    /// already seen and should be flagged as a retransmission.
    pub fn check_retransmission_for_forking(&self, resp: &Response) -> bool {
        let status = u16::from(resp.status_code.clone());
        let (cseq, method) = match resp
            .cseq_header()
            .ok()
            .and_then(|c| Some((c.seq().ok()?, c.method().ok()?)))
        {
            Some(v) => v,
            None => return false,
        };
        let mut fingerprint = format!("{}/{}/{}", status, cseq, method);
        if (100..200).contains(&status) && !resp.body.is_empty() {
            fingerprint.push_str(&format!("/{}", body_hash(&resp.body)));
        }
        if let Some(rseq) = parse_rseq_header(resp.headers()) {
            fingerprint.push_str(&format!("/{}", rseq));
        }
        !self.fork_fingerprints.lock().unwrap().insert(fingerprint)
    }

    /// The central response hook (client side): records the response
    /// summary and drives the state table of RFC 3261 §12.
    pub fn apply_response(&self, resp: &Response) -> Result<()> {
        if resp.status_code == StatusCode::Trying {
            return Ok(());
        }
        let cseq = resp.cseq_header()?;
        let method = cseq.method()?;
        let seq = cseq.seq()? as u64;
        let kind = resp.status_code.kind();
        let is_dialog_creating = matches!(method, Method::Invite | Method::Subscribe);

        if kind == StatusCodeKind::Successful && method == Method::Invite {
            // recorded even after TERMINATED so late ACKs can be constructed
            let prev = self.last_invite_ok_cseq.load(Ordering::Relaxed);
            self.last_invite_ok_cseq
                .store(prev.max(seq), Ordering::Relaxed);
        }

        if self.is_terminated() {
            trace!(id = %self.id.lock().unwrap(), "response after termination ignored");
            return Ok(());
        }

        if matches!(
            kind,
            StatusCodeKind::Provisional | StatusCodeKind::Successful
        ) {
            if let Some(tag) = resp.to_header()?.tag()? {
                self.update_remote_tag(tag.value())?;
            }
        }

        self.last_response.lock().unwrap().replace(resp.clone());
        let id = self.id.lock().unwrap().clone();

        match kind {
            StatusCodeKind::Provisional => {
                if is_dialog_creating {
                    self.update_route_set_from_response(resp);
                }
                self.transition(DialogState::Early(id, resp.clone()))?;
            }
            StatusCodeKind::Successful => {
                if method == Method::Bye && self.terminate_on_bye {
                    self.transition(DialogState::Terminated(id, TerminatedReason::UacBye))?;
                    return Ok(());
                }
                if is_dialog_creating || method == Method::Notify {
                    let confirmed = self.is_confirmed();
                    self.update_route_set_from_response(resp);
                    if let Ok(contact) = resp.contact_header() {
                        if let Ok(uri) = extract_uri_from_contact(contact.value()) {
                            self.set_remote_target(uri, Some(contact.clone()));
                        }
                    }
                    if !confirmed {
                        self.transition(DialogState::Confirmed(id, resp.clone()))?;
                    }
                } else if is_target_refresh(&method) {
                    if let Ok(contact) = resp.contact_header() {
                        if let Ok(uri) = extract_uri_from_contact(contact.value()) {
                            self.set_remote_target(uri, Some(contact.clone()));
                        }
                    }
                }
            }
            _ => {
                // 489 on SUBSCRIBE/NOTIFY does not kill the dialog
                // (RFC 3265 §3.1.4.1); every other final failure on a
                // dialog-creating method before CONFIRMED does
                let bad_event = u16::from(resp.status_code.clone()) == 489
                    && matches!(method, Method::Subscribe | Method::Notify);
                if is_dialog_creating && !self.is_confirmed() && !bad_event {
                    self.transition(DialogState::Terminated(
                        id,
                        TerminatedReason::UasOther(resp.status_code.clone()),
                    ))?;
                }
            }
        }
        Ok(())
    }

    pub(super) fn transition(&self, state: DialogState) -> Result<()> {
        match &state {
            DialogState::Updated(_, _, _)
            | DialogState::Notify(_, _, _)
            | DialogState::Info(_, _, _)
            | DialogState::Refer(_, _, _)
            | DialogState::Message(_, _, _)
            | DialogState::Timeout(_, _)
            | DialogState::Options(_, _, _) => {
                // event-only: surfaced to the upper layer, state unchanged
                self.state_sender.send(state).ok();
                return Ok(());
            }
            _ => {}
        }

        {
            let mut old_state = self.state.lock().unwrap();
            match (&*old_state, &state) {
                (DialogState::Terminated(id, _), _) => {
                    trace!(
                        id = %id,
                        target = %state,
                        "dialog already terminated, ignoring transition"
                    );
                    return Ok(());
                }
                (DialogState::Confirmed(_, _), DialogState::WaitAck(_, _)) => {
                    trace!(target = %state, "dialog already confirmed, ignoring transition");
                    return Ok(());
                }
                _ => {}
            }
            debug!(from = %old_state, to = %state, "transitioning state");
            *old_state = state.clone();
        }

        if let DialogState::Terminated(id, _) = &state {
            if self
                .terminated_event_sent
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Ok(());
            }
            let id = id.clone();
            self.stop_all_timers();
            self.endpoint_inner.executor.cancel(&id.call_id);
            self.state_sender.send(state).ok();
            self.schedule_linger(&id);
            return Ok(());
        }

        match &state {
            DialogState::Early(id, _) => {
                // restarted on every 1xx, stopped on leaving EARLY
                self.restart_early_timer(id);
            }
            DialogState::WaitAck(id, _) => {
                self.start_ack_wait_timer(id);
            }
            DialogState::Confirmed(id, _) => {
                self.cancel_early_timer();
                self.route_frozen.store(true, Ordering::Relaxed);
                if self.role == TransactionRole::Client
                    && self.first_transaction.method == Method::Invite
                {
                    // an ACK must follow; alert if it never goes out
                    self.start_ack_wait_timer(id);
                }
            }
            _ => {}
        }
        self.state_sender.send(state).ok();
        Ok(())
    }

    fn layer_timers(&self) -> Option<Arc<DialogLayerInner>> {
        self.layer.upgrade()
    }

    fn restart_early_timer(&self, id: &DialogId) {
        if let Some(layer) = self.layer_timers() {
            let mut ids = self.timer_ids.lock().unwrap();
            if let Some(old) = ids.early.take() {
                layer.timers.cancel(old);
            }
            ids.early = Some(layer.timers.timeout(
                self.endpoint_inner.option.early_dialog_timeout,
                DialogTimerEvent::EarlyTimeout(id.clone()),
            ));
        }
    }

    fn cancel_early_timer(&self) {
        if let Some(layer) = self.layer_timers() {
            if let Some(id) = self.timer_ids.lock().unwrap().early.take() {
                layer.timers.cancel(id);
            }
        }
    }

    fn start_ack_wait_timer(&self, id: &DialogId) {
        if let Some(layer) = self.layer_timers() {
            let mut ids = self.timer_ids.lock().unwrap();
            if let Some(old) = ids.ack_wait.take() {
                layer.timers.cancel(old);
            }
            ids.ack_wait = Some(layer.timers.timeout(
                self.endpoint_inner.option.t1x64,
                DialogTimerEvent::AckWait(id.clone()),
            ));
        }
    }

    pub(super) fn cancel_ack_wait_timer(&self) {
        if let Some(layer) = self.layer_timers() {
            if let Some(id) = self.timer_ids.lock().unwrap().ack_wait.take() {
                layer.timers.cancel(id);
            }
        }
    }

    fn stop_all_timers(&self) {
        if let Some(layer) = self.layer_timers() {
            let mut ids = self.timer_ids.lock().unwrap();
            for id in [ids.early.take(), ids.ack_wait.take(), ids.reliable.take()]
                .into_iter()
                .flatten()
            {
                layer.timers.cancel(id);
            }
        }
        self.reliable_local.lock().unwrap().take();
    }

    fn schedule_linger(&self, id: &DialogId) {
        let Some(layer) = self.layer_timers() else {
            return;
        };
        let linger = self.endpoint_inner.option.connection_linger;
        if linger.is_zero() {
            layer.finish_remove(id);
            return;
        }
        let timer_id = layer
            .timers
            .timeout(linger, DialogTimerEvent::Linger(id.clone()));
        self.timer_ids.lock().unwrap().linger = Some(timer_id);
    }

    // ---- reliable provisional responses (RFC 3262), UAS side ----

    /// Build a reliable 1xx: requires the INVITE to have offered or
    /// required 100rel, assigns the next RSeq and copies Record-Route via
    /// the normal response path (RFC 3262 §3).
    pub fn create_reliable_provisional(
        &self,
        status: StatusCode,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        if self.role != TransactionRole::Server {
            return Err(Error::DialogError(
                "reliable provisionals are server-side only".to_string(),
                self.id.lock().unwrap().clone(),
                StatusCode::BadRequest,
            ));
        }
        if !self.supports_100rel {
            return Err(Error::DialogError(
                "peer did not offer 100rel".to_string(),
                self.id.lock().unwrap().clone(),
                StatusCode::BadExtension,
            ));
        }
        if status.kind() != StatusCodeKind::Provisional || status == StatusCode::Trying {
            return Err(Error::DialogError(
                "only 101-199 may be sent reliably".to_string(),
                self.id.lock().unwrap().clone(),
                StatusCode::BadRequest,
            ));
        }
        let rseq = self.local_rseq.fetch_add(1, Ordering::Relaxed);
        let mut headers = headers.unwrap_or_default();
        headers.push(Header::Other("RSeq".into(), rseq.to_string().into()));
        headers.push(Header::Other("Require".into(), "100rel".into()));
        let request = self.initial_request.lock().unwrap().clone();
        Ok(self.make_response(&request, status, Some(headers), body))
    }

    /// Send a reliable 1xx through the transaction and start the PRACK-wait
    /// retransmission task (T1 doubling to T2, bounded by 64*T1). Only one
    /// reliable provisional may be outstanding at a time.
    pub fn send_reliable_provisional(&self, response: Response) -> Result<()> {
        if self.reliable_local.lock().unwrap().is_some() {
            return Err(Error::DialogError(
                "a reliable provisional is already outstanding".to_string(),
                self.id.lock().unwrap().clone(),
                StatusCode::RequestPending,
            ));
        }
        let rseq = parse_rseq_header(response.headers()).ok_or_else(|| {
            Error::DialogError(
                "reliable provisional lacks RSeq".to_string(),
                self.id.lock().unwrap().clone(),
                StatusCode::BadRequest,
            )
        })?;
        let cseq_header = response.cseq_header()?;
        let pending = PendingReliable {
            response: response.clone(),
            rseq,
            cseq: cseq_header.seq()?,
            method: cseq_header.method()?,
            interval: self.endpoint_inner.option.t1,
            elapsed: Duration::ZERO,
        };
        self.tu_sender
            .send(TransactionEvent::Respond(response.clone()))?;
        let id = DialogId::try_from((&response, TransactionRole::Server))
            .unwrap_or_else(|_| self.id.lock().unwrap().clone());
        *self.reliable_local.lock().unwrap() = Some(pending);
        self.start_reliable_response_timer(&id);
        self.transition(DialogState::Early(id, response))?;
        Ok(())
    }

    fn start_reliable_response_timer(&self, id: &DialogId) {
        if let Some(layer) = self.layer_timers() {
            let interval = self.endpoint_inner.option.t1;
            self.timer_ids.lock().unwrap().reliable = Some(
                layer
                    .timers
                    .timeout(interval, DialogTimerEvent::ReliableRetransmit(id.clone())),
            );
        }
    }

    pub(super) fn stop_reliable_response_timer(&self) {
        if let Some(layer) = self.layer_timers() {
            if let Some(id) = self.timer_ids.lock().unwrap().reliable.take() {
                layer.timers.cancel(id);
            }
        }
    }

    /// Retransmission tick for the outstanding reliable 1xx. Gives up after
    /// 64*T1 without a PRACK.
    pub(super) fn on_reliable_retransmit(&self) {
        let option_t2 = self.endpoint_inner.option.t2;
        let option_t1x64 = self.endpoint_inner.option.t1x64;
        let interval = {
            let mut guard = self.reliable_local.lock().unwrap();
            let Some(pending) = guard.as_mut() else { return };
            pending.elapsed += pending.interval;
            if pending.elapsed >= option_t1x64 {
                warn!(
                    id = %self.id.lock().unwrap(),
                    rseq = pending.rseq,
                    "reliable provisional never PRACKed, giving up"
                );
                *guard = None;
                return;
            }
            self.tu_sender
                .send(TransactionEvent::Respond(pending.response.clone()))
                .ok();
            pending.interval = (pending.interval * 2).min(option_t2);
            pending.interval
        };
        if let Some(layer) = self.layer_timers() {
            let id = self.id.lock().unwrap().clone();
            self.timer_ids.lock().unwrap().reliable = Some(
                layer
                    .timers
                    .timeout(interval, DialogTimerEvent::ReliableRetransmit(id)),
            );
        }
    }

    /// Match a PRACK's RAck against the outstanding reliable 1xx. On match
    /// the pending response is cleared and the retransmission task stopped;
    /// true means "new PRACK, deliver upward".
    pub fn handle_prack(&self, prack: &Request) -> Result<bool> {
        let Some((rseq, cseq, method)) = parse_rack_header(&prack.headers) else {
            return Ok(false);
        };
        let matched = {
            let mut guard = self.reliable_local.lock().unwrap();
            let matched = guard
                .as_ref()
                .map(|p| p.rseq == rseq && p.cseq == cseq && p.method == method)
                .unwrap_or(false);
            if matched {
                *guard = None;
            }
            matched
        };
        if matched {
            self.stop_reliable_response_timer();
            return Ok(true);
        }
        debug!(
            id = %self.id.lock().unwrap(),
            rseq, cseq, %method,
            "PRACK does not match pending reliable response"
        );
        Ok(false)
    }

    // ---- request sending ----

    /// Send an in-dialog request, serialized per dialog by the keyed
    /// executor: submission order is wire order.
    pub(crate) async fn do_request(self: &Arc<Self>, request: Request) -> Result<Option<Response>> {
        self.do_request_with_interleaving(request, true).await
    }

    /// `allow_interleaving = false` callers (re-INVITE on a B2BUA) rely on
    /// the same per-dialog FIFO: the request queues behind the in-flight
    /// one instead of interleaving with it.
    pub(crate) async fn do_request_with_interleaving(
        self: &Arc<Self>,
        request: Request,
        _allow_interleaving: bool,
    ) -> Result<Option<Response>> {
        let method = request.method;
        if matches!(method, Method::Ack | Method::Cancel) {
            return Err(Error::DialogError(
                format!("{} must not be sent through do_request", method),
                self.id.lock().unwrap().clone(),
                StatusCode::BadRequest,
            ));
        }
        if self.bye_sent.load(Ordering::Relaxed) && method != Method::Bye {
            return Err(Error::DialogError(
                "BYE already sent".to_string(),
                self.id.lock().unwrap().clone(),
                StatusCode::CallTransactionDoesNotExist,
            ));
        }
        if method == Method::Bye {
            self.bye_sent.store(true, Ordering::Relaxed);
        }

        // remember host-supplied credentials for replay on later requests
        if let Some(auth) = request
            .headers
            .iter()
            .find(|h| matches!(h, Header::ProxyAuthorization(_)))
        {
            self.cached_authorization
                .lock()
                .unwrap()
                .replace(auth.clone());
        }

        let key = self.id.lock().unwrap().call_id.clone();
        let (done_tx, done_rx) = oneshot::channel();
        let inner = self.clone();
        self.endpoint_inner.executor.submit_last(&key, async move {
            let result = inner.send_dialog_request(request).await;
            done_tx.send(result).ok();
        });
        done_rx
            .await
            .map_err(|_| Error::Error("executor dropped request task".to_string()))?
    }

    /// CANCEL travels outside `do_request` (it reuses the INVITE's branch
    /// and CSeq) but still respects the per-dialog queue.
    pub(crate) async fn send_cancel(self: &Arc<Self>, request: Request) -> Result<Option<Response>> {
        let key = self.id.lock().unwrap().call_id.clone();
        let (done_tx, done_rx) = oneshot::channel();
        let inner = self.clone();
        self.endpoint_inner.executor.submit_last(&key, async move {
            let result = inner.send_dialog_request(request).await;
            done_tx.send(result).ok();
        });
        done_rx
            .await
            .map_err(|_| Error::Error("executor dropped cancel task".to_string()))?
    }

    async fn send_dialog_request(self: &Arc<Self>, request: Request) -> Result<Option<Response>> {
        let method = request.method().to_owned();
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint_inner.clone(), None);

        if let Some(route) = tx.original.route_header() {
            if let Some(first_route) = route.typed().ok().and_then(|r| r.uris().first().cloned()) {
                tx.destination = SipAddr::try_from(&first_route.uri).ok();
            }
        }

        match tx.send().await {
            Ok(_) => {
                debug!(
                    id = %self.id.lock().unwrap(),
                    method = %method,
                    destination = tx.destination.as_ref().map(|d| d.to_string()).as_deref(),
                    key = %tx.key,
                    "request sent done",
                );
            }
            Err(e) => {
                warn!(
                    id = %self.id.lock().unwrap(),
                    destination = tx.destination.as_ref().map(|d| d.to_string()).as_deref(),
                    "failed to send request error: {}\n{}",
                    e,
                    tx.original
                );
                // transport failure on the critical methods kills the dialog
                if matches!(method, Method::Invite | Method::Bye) {
                    let id = self.id.lock().unwrap().clone();
                    self.transition(DialogState::Terminated(id, TerminatedReason::Timeout))?;
                }
                return Err(e);
            }
        }

        self.endpoint_inner
            .set_transaction_dialog(&tx.key, self.id.lock().unwrap().to_string());

        while let Some(msg) = tx.receive().await {
            match msg {
                rsip::SipMessage::Response(resp) => {
                    let status = resp.status_code.clone();
                    if status == StatusCode::Trying {
                        continue;
                    }

                    if status.kind() == StatusCodeKind::Provisional {
                        if method == Method::Invite {
                            self.handle_provisional_response(&resp).await?;
                        }
                        self.apply_response(&resp)?;
                        continue;
                    }

                    debug!(
                        id = %self.id.lock().unwrap(),
                        method = %method,
                        "dialog do_request done: {:?}",
                        status
                    );
                    if !matches!(method, Method::PRack) {
                        self.clear_remote_reliable();
                    }
                    self.apply_response(&resp)?;
                    return Ok(Some(resp));
                }
                _ => break,
            }
        }
        Ok(None)
    }

    pub async fn process_transaction_handle(
        &self,
        tx: &mut Transaction,
        mut rx: TransactionCommandReceiver,
    ) -> Result<()> {
        let timeout_duration = self.endpoint_inner.option.t1x64;
        let result = tokio::time::timeout(timeout_duration, async {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    TransactionCommand::Respond {
                        status,
                        headers,
                        body,
                    } => {
                        let is_final = status.kind() != StatusCodeKind::Provisional;
                        let response = self.make_response(&tx.original, status, headers, body);
                        tx.respond(response).await?;

                        if is_final {
                            return Ok(());
                        }
                    }
                }
            }
            Err(Error::TransactionError(
                "user dropped handle without final response".into(),
                tx.key.clone(),
            ))
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                let id = self.id.lock().unwrap().to_string();
                warn!(
                    id,
                    "{} handle dropped or timed out without final reply, returning 501",
                    tx.original.method,
                );
                tx.reply(StatusCode::NotImplemented).await
            }
        }
    }

    /// Shrink retained messages after removal: bodies collapse away, only
    /// what in-dialog construction still needs stays.
    pub(super) fn release_references(&self) {
        if let Some(resp) = self.last_response.lock().unwrap().as_mut() {
            resp.body = Vec::new();
        }
        self.initial_request.lock().unwrap().body = Vec::new();
        self.fork_fingerprints.lock().unwrap().clear();
    }
}

impl Dialog {
    pub fn id(&self) -> DialogId {
        self.inner().id.lock().unwrap().clone()
    }

    pub(super) fn inner(&self) -> &DialogInnerRef {
        match self {
            Dialog::ServerInvite(d) => &d.inner,
            Dialog::ClientInvite(d) => &d.inner,
            Dialog::ServerSubscription(d) => &d.inner,
            Dialog::ClientSubscription(d) => &d.inner,
        }
    }

    pub fn state(&self) -> DialogState {
        self.inner().state.lock().unwrap().clone()
    }

    pub fn from(&self) -> &rsip::typed::From {
        &self.inner().from
    }

    pub fn to(&self) -> rsip::typed::To {
        self.inner().to.lock().unwrap().clone()
    }

    pub fn remote_contact(&self) -> Option<rsip::Uri> {
        self.inner()
            .remote_contact
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|c| extract_uri_from_contact(c.value()).ok())
    }

    pub fn set_remote_target(
        &self,
        uri: rsip::Uri,
        contact: Option<rsip::headers::untyped::Contact>,
    ) {
        self.inner().set_remote_target(uri, contact)
    }

    pub async fn handle(&mut self, tx: &mut Transaction) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.handle(tx).await,
            Dialog::ClientInvite(d) => d.handle(tx).await,
            Dialog::ServerSubscription(d) => d.handle(tx).await,
            Dialog::ClientSubscription(d) => d.handle(tx).await,
        }
    }

    pub fn on_remove(&self) {
        self.inner().cancel_token.cancel();
        self.inner().release_references();
    }

    pub async fn hangup(&self) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.bye().await,
            Dialog::ClientInvite(d) => d.hangup().await,
            Dialog::ServerSubscription(d) => d.unsubscribe().await,
            Dialog::ClientSubscription(d) => d.unsubscribe().await,
        }
    }

    pub fn can_cancel(&self) -> bool {
        self.inner().can_cancel()
    }

    pub async fn request(
        &self,
        method: rsip::Method,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        match self {
            Dialog::ServerInvite(d) => d.request(method, headers, body).await,
            Dialog::ClientInvite(d) => d.request(method, headers, body).await,
            Dialog::ServerSubscription(d) => d.request(method, headers, body).await,
            Dialog::ClientSubscription(d) => d.request(method, headers, body).await,
        }
    }
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogState::Calling(id) => write!(f, "{}(Calling)", id),
            DialogState::Trying(id) => write!(f, "{}(Trying)", id),
            DialogState::Early(id, _) => write!(f, "{}(Early)", id),
            DialogState::WaitAck(id, _) => write!(f, "{}(WaitAck)", id),
            DialogState::Confirmed(id, _) => write!(f, "{}(Confirmed)", id),
            DialogState::Updated(id, _, _) => write!(f, "{}(Updated)", id),
            DialogState::Notify(id, _, _) => write!(f, "{}(Notify)", id),
            DialogState::Refer(id, _, _) => write!(f, "{}(Refer)", id),
            DialogState::Message(id, _, _) => write!(f, "{}(Message)", id),
            DialogState::Info(id, _, _) => write!(f, "{}(Info)", id),
            DialogState::Options(id, _, _) => write!(f, "{}(Options)", id),
            DialogState::Timeout(id, kind) => write!(f, "{}(Timeout {:?})", id, kind),
            DialogState::Terminated(id, reason) => write!(f, "{}(Terminated {:?})", id, reason),
        }
    }
}
