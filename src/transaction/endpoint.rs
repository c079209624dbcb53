//! The stack registry and message dispatch.
//!
//! `EndpointInner` owns every concurrent index of the runtime: the active
//! transaction table (with the metadata NOTIFY matching needs), the
//! terminated-pending-ACK table that keeps 2xx server transactions
//! discoverable until Timer H, the merge table for RFC 3261 §8.2.2.2 loop
//! detection and the pending server transaction set. Inbound parsed
//! messages enter through [`EndpointInner::on_transport_event`] and are
//! routed to the owning transaction or down the "new transaction" path.

use super::executor::KeyedExecutor;
use super::key::{merge_id, TransactionKey, TransactionRole};
use super::timer::Timer;
use super::transaction::Transaction;
use super::{
    make_call_id, make_via_branch, TransactionEvent, TransactionEventSender, TransactionReceiver,
    TransactionSender, TransactionTimer, T1, T1X64, T2, T4, TIMER_INTERVAL,
};
use crate::rsip_ext::{make_response, parse_event_header};
use crate::transport::{SipAddr, SipConnection, TransportEvent, TransportLayer};
use crate::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Method, Request, SipMessage, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Stack-wide tunables. Defaults follow RFC 3261 Table 4 and the customary
/// operational values of the source stack.
#[derive(Clone, Debug)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub t1x64: Duration,
    pub timer_interval: Duration,
    /// Seconds a dialog may stay EARLY before the timeout alert fires.
    pub early_dialog_timeout: Duration,
    /// How long a terminated dialog stays discoverable for late ACK/BYE.
    pub connection_linger: Duration,
    /// Whether a 1xx on the same transaction may reassign the remote tag
    /// while the dialog is EARLY (forking environments).
    pub allow_remote_tag_reassignment: bool,
    /// Load shedding thresholds on the transaction table.
    pub low_water_mark: usize,
    pub high_water_mark: usize,
    pub max_tx_lifetime_invite: Duration,
    pub max_tx_lifetime_non_invite: Duration,
}

impl Default for EndpointOption {
    fn default() -> Self {
        Self {
            t1: T1,
            t2: T2,
            t4: T4,
            t1x64: T1X64,
            timer_interval: TIMER_INTERVAL,
            early_dialog_timeout: Duration::from_secs(180),
            connection_linger: Duration::from_secs(8),
            allow_remote_tag_reassignment: true,
            low_water_mark: 4096,
            high_water_mark: 8192,
            max_tx_lifetime_invite: Duration::from_secs(60 * 5),
            max_tx_lifetime_non_invite: Duration::from_secs(64),
        }
    }
}

/// Lifecycle events surfaced to the host, each at most once per object.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    TransactionTerminated(TransactionKey),
    IoException {
        reason: String,
        addr: Option<SipAddr>,
    },
}

pub type EndpointEventSender = UnboundedSender<EndpointEvent>;

/// Pre-transaction hook; returning `false` vetoes the request before any
/// state is allocated for it.
pub trait MessageInspector: Send + Sync {
    fn inspect(&self, msg: &SipMessage) -> bool;
}

/// The router seam: resolves a request to its next hop. The stack ships a
/// URI-driven resolver; hosts install their own for DNS/outbound policy.
#[async_trait]
pub trait TargetLocator: Send + Sync {
    async fn next_hop(&self, request: &Request) -> Result<SipAddr>;
}

/// Default locator: the first Route header wins, otherwise the Request-URI.
pub struct UriLocator;

#[async_trait]
impl TargetLocator for UriLocator {
    async fn next_hop(&self, request: &Request) -> Result<SipAddr> {
        if let Some(route) = request.route_header() {
            if let Some(uri) = route.typed().ok().and_then(|r| r.uris().first().cloned()) {
                return SipAddr::try_from(&uri.uri);
            }
        }
        SipAddr::try_from(&request.uri)
    }
}

/// Metadata kept beside each registered transaction; this is what
/// out-of-dialog NOTIFY matching (RFC 3265 §7.2.1) works from after the
/// transaction value itself moved to the upper layer.
#[derive(Clone)]
pub struct TransactionMeta {
    pub role: TransactionRole,
    pub method: Method,
    pub call_id: String,
    pub from_tag: Option<String>,
    pub event: Option<String>,
    pub contact_uri: Option<String>,
    pub merge_id: Option<String>,
    /// Rendered id of the default dialog this transaction belongs to.
    pub dialog_id: Arc<Mutex<Option<String>>>,
}

struct TransactionEntry {
    sender: TransactionEventSender,
    meta: TransactionMeta,
}

pub struct EndpointInner {
    pub user_agent: String,
    pub option: EndpointOption,
    pub timers: Timer<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub executor: KeyedExecutor,
    /// Outbound proxy set applied to out-of-dialog requests.
    pub route_set: Vec<rsip::Uri>,

    transactions: Mutex<HashMap<TransactionKey, TransactionEntry>>,
    finished_transactions: Mutex<HashMap<TransactionKey, Option<SipMessage>>>,
    terminated_pending_ack: Mutex<HashMap<String, rsip::Response>>,
    merge_txs: Mutex<HashMap<String, TransactionKey>>,
    pending_server_txs: Mutex<HashMap<TransactionKey, Instant>>,

    incoming_sender: Mutex<Option<TransactionSender>>,
    event_sender: Mutex<Option<EndpointEventSender>>,
    valves: Mutex<Vec<Box<dyn MessageInspector>>>,
    locator: Box<dyn TargetLocator>,
    pub cancel_token: CancellationToken,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

impl EndpointInner {
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let (sender, mut receiver) = unbounded_channel();
        self.transport_layer.serve(sender);
        let mut ticker = tokio::time::interval(self.option.timer_interval);
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => self.process_timers(),
                event = receiver.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.on_transport_event(event).await {
                            warn!("transport event error: {}", e);
                        }
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }

    pub fn process_timers(&self) {
        for timer in self.timers.poll(Instant::now()) {
            if let TransactionTimer::TimerCleanup(key) = &timer {
                self.transactions.lock().unwrap().remove(key);
                self.finished_transactions.lock().unwrap().remove(key);
                continue;
            }
            let sender = self
                .transactions
                .lock()
                .unwrap()
                .get(timer.key())
                .map(|entry| entry.sender.clone());
            if let Some(sender) = sender {
                let key = timer.key().clone();
                if sender.send(TransactionEvent::Timer(timer)).is_err() {
                    self.detach_transaction(&key, None);
                }
            }
        }
    }

    pub async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Incoming(msg, connection, from) => match msg {
                SipMessage::Request(req) => self.new_server_request(req, connection, from).await,
                SipMessage::Response(resp) => self.new_server_response(resp).await,
            },
            TransportEvent::New(connection) => {
                trace!(%connection, "new connection");
                Ok(())
            }
            TransportEvent::Closed(connection) => {
                trace!(%connection, "connection closed");
                Ok(())
            }
        }
    }

    /// Dispatch an inbound request: valves, table lookup (RFC 3261 branch or
    /// RFC 2543 full match, both folded into the key), CANCEL/ACK special
    /// paths, load shedding, then the new-transaction path.
    pub async fn new_server_request(
        self: &Arc<Self>,
        request: Request,
        connection: SipConnection,
        from: SipAddr,
    ) -> Result<()> {
        {
            let valves = self.valves.lock().unwrap();
            let msg = SipMessage::Request(request.clone());
            if valves.iter().any(|v| !v.inspect(&msg)) {
                debug!(method = %request.method, %from, "request vetoed by message valve");
                return Ok(());
            }
        }

        let key = TransactionKey::from_request(&request, TransactionRole::Server)?;

        if request.method == Method::Cancel {
            return self.dispatch_cancel(request, key, connection).await;
        }

        // existing transaction (retransmission or ACK on the INVITE branch)
        let sender = self
            .transactions
            .lock()
            .unwrap()
            .get(&key)
            .map(|entry| entry.sender.clone());
        if let Some(sender) = sender {
            if sender
                .send(TransactionEvent::Received(
                    SipMessage::Request(request.clone()),
                    Some(connection.clone()),
                ))
                .is_ok()
            {
                return Ok(());
            }
            // receiver gone: fall through as if unmatched
            self.detach_transaction(&key, None);
        }

        if request.method == Method::Ack {
            // Late ACK: no live transaction. Surface it so the dialog layer
            // can match it during the linger window; ACK never creates
            // transaction state of its own.
            return self.deliver_incoming(Transaction::new_server(
                key,
                request,
                self.clone(),
                Some(connection),
            ));
        }

        let finished = self.finished_transactions.lock().unwrap().get(&key).cloned();
        if let Some(Some(SipMessage::Response(last))) = finished {
            // retransmission for an already finished transaction
            connection.send(last.into(), None).await.ok();
            return Ok(());
        }

        if self.shed_load(&request, &connection).await? {
            return Ok(());
        }

        let mut tx = Transaction::new_server(key.clone(), request, self.clone(), Some(connection));
        tx.start_server_timers();
        self.pending_server_txs
            .lock()
            .unwrap()
            .insert(key, Instant::now());
        self.deliver_incoming(tx)
    }

    async fn dispatch_cancel(
        self: &Arc<Self>,
        cancel: Request,
        key: TransactionKey,
        connection: SipConnection,
    ) -> Result<()> {
        let invite_key = key.with_method(Method::Invite);
        let sender = self
            .transactions
            .lock()
            .unwrap()
            .get(&invite_key)
            .map(|entry| entry.sender.clone());
        match sender {
            Some(sender) => {
                // answer the CANCEL itself, then let the INVITE transaction
                // surface it so the dialog can send 487
                let ok = make_response(&cancel, StatusCode::OK, None);
                connection.send(ok.into(), None).await.ok();
                sender
                    .send(TransactionEvent::Received(
                        SipMessage::Request(cancel),
                        Some(connection),
                    ))
                    .ok();
            }
            None => {
                let resp =
                    make_response(&cancel, StatusCode::CallTransactionDoesNotExist, None);
                connection.send(resp.into(), None).await.ok();
            }
        }
        Ok(())
    }

    /// Probabilistic admission between the low and high water marks.
    async fn shed_load(&self, request: &Request, connection: &SipConnection) -> Result<bool> {
        let occupancy = self.transactions.lock().unwrap().len();
        let option = &self.option;
        if occupancy < option.low_water_mark {
            return Ok(false);
        }
        let drop = if occupancy >= option.high_water_mark {
            true
        } else {
            let span = (option.high_water_mark - option.low_water_mark) as f64;
            let over = (occupancy - option.low_water_mark) as f64;
            rand::thread_rng().gen::<f64>() < over / span
        };
        if drop {
            info!(occupancy, method = %request.method, "shedding request");
            let resp = make_response(request, StatusCode::ServiceUnavailable, None);
            connection.send(resp.into(), None).await.ok();
        }
        Ok(drop)
    }

    fn deliver_incoming(&self, tx: Transaction) -> Result<()> {
        let sender = self.incoming_sender.lock().unwrap().clone();
        match sender {
            Some(sender) => sender
                .send(tx)
                .map_err(|_| Error::EndpointError("incoming channel closed".to_string())),
            None => {
                debug!("no incoming consumer registered, dropping request");
                Ok(())
            }
        }
    }

    /// Route an inbound response to its client transaction.
    pub async fn new_server_response(&self, response: rsip::Response) -> Result<()> {
        {
            let valves = self.valves.lock().unwrap();
            let msg = SipMessage::Response(response.clone());
            if valves.iter().any(|v| !v.inspect(&msg)) {
                debug!(status = %response.status_code, "response vetoed by message valve");
                return Ok(());
            }
        }
        let key = TransactionKey::from_response(&response)?;
        let sender = self
            .transactions
            .lock()
            .unwrap()
            .get(&key)
            .map(|entry| entry.sender.clone());
        match sender {
            Some(sender) => {
                sender
                    .send(TransactionEvent::Received(
                        SipMessage::Response(response),
                        None,
                    ))
                    .ok();
            }
            None => {
                debug!(%key, status = %response.status_code, "response without transaction dropped");
            }
        }
        Ok(())
    }

    pub(super) fn attach_transaction(
        &self,
        key: &TransactionKey,
        sender: TransactionEventSender,
        original: &Request,
        role: TransactionRole,
    ) {
        let meta = TransactionMeta {
            role,
            method: original.method,
            call_id: original
                .call_id_header()
                .map(|c| c.value().to_string())
                .unwrap_or_default(),
            from_tag: original
                .from_header()
                .ok()
                .and_then(|f| f.tag().ok().flatten())
                .map(|t| t.value().to_string()),
            event: parse_event_header(&original.headers),
            contact_uri: original
                .contact_header()
                .ok()
                .and_then(|c| crate::rsip_ext::extract_uri_from_contact(c.value()).ok())
                .map(|u| u.to_string()),
            merge_id: if role == TransactionRole::Server && original.method == Method::Invite {
                merge_id(original)
            } else {
                None
            },
            dialog_id: Arc::new(Mutex::new(None)),
        };
        if let Some(mid) = &meta.merge_id {
            self.merge_txs.lock().unwrap().insert(mid.clone(), key.clone());
        }
        self.transactions
            .lock()
            .unwrap()
            .insert(key.clone(), TransactionEntry { sender, meta });
        trace!(%key, "transaction attached");
    }

    pub(super) fn detach_transaction(
        &self,
        key: &TransactionKey,
        last_message: Option<SipMessage>,
    ) {
        let entry = self.transactions.lock().unwrap().remove(key);
        if let Some(entry) = entry {
            if let Some(mid) = &entry.meta.merge_id {
                let mut merge_txs = self.merge_txs.lock().unwrap();
                if merge_txs.get(mid) == Some(key) {
                    merge_txs.remove(mid);
                }
            }
        }
        self.pending_server_txs.lock().unwrap().remove(key);

        if let Some(msg) = last_message {
            let mut finished = self.finished_transactions.lock().unwrap();
            if finished.contains_key(key) {
                return;
            }
            let linger = match msg {
                SipMessage::Request(_) => self.option.t4,
                SipMessage::Response(_) => self.option.t1x64,
            };
            self.timers
                .timeout(linger, TransactionTimer::TimerCleanup(key.clone()));
            finished.insert(key.clone(), Some(msg));
        }
        trace!(%key, "transaction detached");
    }

    /// Mark a server transaction as done with the upper layer.
    pub fn remove_pending_server_tx(&self, key: &TransactionKey) {
        self.pending_server_txs.lock().unwrap().remove(key);
    }

    pub fn pending_server_txs_len(&self) -> usize {
        self.pending_server_txs.lock().unwrap().len()
    }

    pub fn transactions_len(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    /// Record the dialog a transaction belongs to (rendered dialog id).
    pub fn set_transaction_dialog(&self, key: &TransactionKey, dialog_id: String) {
        if let Some(entry) = self.transactions.lock().unwrap().get(key) {
            entry.meta.dialog_id.lock().unwrap().replace(dialog_id);
        }
    }

    /// RFC 3265 §7.2.1: locate the SUBSCRIBE client transaction an
    /// out-of-dialog NOTIFY belongs to. Returns the matching key and its
    /// metadata; ties prefer transactions whose original Contact equals the
    /// NOTIFY Request-URI and which already have a dialog.
    pub fn find_subscribe_transaction(
        &self,
        notify: &Request,
    ) -> Option<(TransactionKey, TransactionMeta)> {
        let to_tag = notify
            .to_header()
            .ok()
            .and_then(|t| t.tag().ok().flatten())
            .map(|t| t.value().to_string())?;
        let event = parse_event_header(&notify.headers)?;
        let call_id = notify.call_id_header().ok()?.value().to_string();
        let request_uri = notify.uri.to_string();

        let transactions = self.transactions.lock().unwrap();
        let mut first_match: Option<(TransactionKey, TransactionMeta)> = None;
        for (key, entry) in transactions.iter() {
            let meta = &entry.meta;
            if meta.role != TransactionRole::Client || meta.method != Method::Subscribe {
                continue;
            }
            let Some(from_tag) = &meta.from_tag else { continue };
            let Some(tx_event) = &meta.event else { continue };
            if !from_tag.eq_ignore_ascii_case(&to_tag)
                || !tx_event.eq_ignore_ascii_case(&event)
                || meta.call_id != call_id
            {
                continue;
            }
            if first_match.is_none() {
                first_match = Some((key.clone(), meta.clone()));
            }
            let contact_matches = meta
                .contact_uri
                .as_ref()
                .map(|c| c == &request_uri)
                .unwrap_or(false);
            if contact_matches && meta.dialog_id.lock().unwrap().is_some() {
                return Some((key.clone(), meta.clone()));
            }
        }
        first_match
    }

    /// True when another ongoing server INVITE shares the merge id
    /// (RFC 3261 §8.2.2.2). The caller answers 482 Loop Detected.
    pub fn find_merged_transaction(&self, request: &Request) -> Result<bool> {
        if request.method != Method::Invite {
            return Ok(false);
        }
        let Some(mid) = merge_id(request) else {
            return Ok(false);
        };
        let own_key = TransactionKey::from_request(request, TransactionRole::Server)?;
        Ok(self
            .merge_txs
            .lock()
            .unwrap()
            .get(&mid)
            .map(|key| *key != own_key)
            .unwrap_or(false))
    }

    pub(super) fn put_terminated_pending_ack(
        &self,
        key: &TransactionKey,
        response: &rsip::Response,
    ) {
        if let Some(branch) = key.branch() {
            self.terminated_pending_ack
                .lock()
                .unwrap()
                .insert(branch.to_string(), response.clone());
        }
    }

    pub(super) fn remove_terminated_pending_ack(&self, key: &TransactionKey) {
        if let Some(branch) = key.branch() {
            self.terminated_pending_ack.lock().unwrap().remove(branch);
        }
    }

    /// The 2xx a terminated server INVITE transaction is still waiting to
    /// have acknowledged, looked up by branch id.
    pub fn find_terminated_pending_ack(&self, branch: &str) -> Option<rsip::Response> {
        self.terminated_pending_ack
            .lock()
            .unwrap()
            .get(branch)
            .cloned()
    }

    pub fn add_message_inspector(&self, inspector: Box<dyn MessageInspector>) {
        self.valves.lock().unwrap().push(inspector);
    }

    pub fn set_event_sender(&self, sender: EndpointEventSender) {
        self.event_sender.lock().unwrap().replace(sender);
    }

    pub(crate) fn emit_transaction_terminated(&self, key: &TransactionKey) {
        if let Some(sender) = self.event_sender.lock().unwrap().as_ref() {
            sender
                .send(EndpointEvent::TransactionTerminated(key.clone()))
                .ok();
        }
    }

    pub(crate) fn report_io_error(&self, error: &Error, addr: Option<&SipAddr>) {
        warn!(addr = ?addr.map(|a| a.to_string()), "transport failure: {}", error);
        if let Some(sender) = self.event_sender.lock().unwrap().as_ref() {
            sender
                .send(EndpointEvent::IoException {
                    reason: error.to_string(),
                    addr: addr.cloned(),
                })
                .ok();
        }
    }

    pub async fn next_hop(&self, request: &Request) -> Result<SipAddr> {
        self.locator.next_hop(request).await
    }

    /// A Via for a new client transaction, from the given or first
    /// listening point, with a fresh branch unless one is supplied.
    pub fn get_via(
        &self,
        addr: Option<SipAddr>,
        branch: Option<rsip::Param>,
    ) -> Result<rsip::typed::Via> {
        let addr = match addr {
            Some(addr) => addr,
            None => self
                .transport_layer
                .get_addrs()
                .first()
                .cloned()
                .ok_or_else(|| Error::EndpointError("no listening point".to_string()))?,
        };
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport: addr.r#type.unwrap_or(rsip::transport::Transport::Udp),
            uri: rsip::Uri {
                host_with_port: addr.addr.clone(),
                ..Default::default()
            },
            params: vec![branch.unwrap_or_else(make_via_branch)],
        })
    }

    /// Build an out-of-dialog request with the endpoint's route set applied.
    pub fn make_request(
        &self,
        method: Method,
        recipient: rsip::Uri,
        via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        seq: u32,
        call_id: Option<rsip::headers::CallId>,
    ) -> Request {
        let mut headers: Vec<rsip::Header> = Vec::new();
        headers.push(rsip::Header::Via(via.into()));
        headers.push(rsip::Header::From(from.into()));
        headers.push(rsip::Header::To(to.into()));
        let domain = recipient.host_with_port.host.to_string();
        headers.push(rsip::Header::CallId(
            call_id.unwrap_or_else(|| make_call_id(Some(domain.as_str()))),
        ));
        headers.push(rsip::Header::CSeq(rsip::typed::CSeq { seq, method }.into()));
        for route in &self.route_set {
            headers.push(rsip::Header::Route(
                rsip::headers::Route::from(route.to_string()),
            ));
        }
        headers.push(rsip::Header::MaxForwards(70.into()));
        headers.push(rsip::Header::UserAgent(self.user_agent.clone().into()));
        Request {
            method,
            uri: recipient,
            headers: headers.into(),
            version: rsip::Version::V2,
            body: vec![],
        }
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.transport_layer.get_addrs()
    }
}

/// Public handle around [`EndpointInner`].
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

impl Endpoint {
    /// The channel on which freshly admitted server transactions arrive.
    /// May be called once; later calls replace the consumer.
    pub fn incoming_transactions(&self) -> Result<TransactionReceiver> {
        let (tx, rx) = unbounded_channel();
        self.inner.incoming_sender.lock().unwrap().replace(tx);
        Ok(rx)
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.get_addrs()
    }

    pub async fn serve(&self) -> Result<()> {
        self.inner.serve().await
    }
}

pub struct EndpointBuilder {
    user_agent: String,
    cancel_token: Option<CancellationToken>,
    transport_layer: Option<TransportLayer>,
    option: EndpointOption,
    route_set: Vec<rsip::Uri>,
    locator: Option<Box<dyn TargetLocator>>,
    event_sender: Option<EndpointEventSender>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Self {
            user_agent: crate::USER_AGENT.to_string(),
            cancel_token: None,
            transport_layer: None,
            option: EndpointOption::default(),
            route_set: Vec::new(),
            locator: None,
            event_sender: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_transport_layer(mut self, transport_layer: TransportLayer) -> Self {
        self.transport_layer = Some(transport_layer);
        self
    }

    pub fn with_option(mut self, option: EndpointOption) -> Self {
        self.option = option;
        self
    }

    pub fn with_route_set(mut self, route_set: Vec<rsip::Uri>) -> Self {
        self.route_set = route_set;
        self
    }

    pub fn with_target_locator(mut self, locator: Box<dyn TargetLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn with_event_sender(mut self, sender: EndpointEventSender) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn build(self) -> Endpoint {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        let inner = Arc::new(EndpointInner {
            user_agent: self.user_agent,
            option: self.option,
            timers: Timer::new(),
            transport_layer,
            executor: KeyedExecutor::new(cancel_token.child_token()),
            route_set: self.route_set,
            transactions: Mutex::new(HashMap::new()),
            finished_transactions: Mutex::new(HashMap::new()),
            terminated_pending_ack: Mutex::new(HashMap::new()),
            merge_txs: Mutex::new(HashMap::new()),
            pending_server_txs: Mutex::new(HashMap::new()),
            incoming_sender: Mutex::new(None),
            event_sender: Mutex::new(self.event_sender),
            valves: Mutex::new(Vec::new()),
            locator: self.locator.unwrap_or_else(|| Box::new(UriLocator)),
            cancel_token,
        });
        Endpoint { inner }
    }
}
