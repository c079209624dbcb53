//! RFC 3261 §17 transaction layer and the stack registry.
//!
//! The [`endpoint`] module owns every index of the runtime (transactions,
//! terminated-pending-ACK, merge table, pending server transactions) and
//! dispatches inbound parsed messages; [`transaction`] holds the four
//! per-transaction state machines; [`timer`] is the shared timer wheel and
//! [`executor`] the per-key serialized task queue used to order outbound
//! sends per dialog.

use crate::transaction::key::TransactionKey;
use crate::transport::SipConnection;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use rsip::SipMessage;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod endpoint;
pub mod executor;
pub mod key;
pub mod timer;
pub mod transaction;

#[cfg(test)]
mod tests;

pub use endpoint::Endpoint;

/// RFC 3261 Table 4 base timers.
pub(crate) const T1: Duration = Duration::from_millis(500);
pub(crate) const T2: Duration = Duration::from_secs(4);
pub(crate) const T4: Duration = Duration::from_secs(5);
pub(crate) const T1X64: Duration = Duration::from_millis(64 * 500);
pub(crate) const TIMER_INTERVAL: Duration = Duration::from_millis(20);

/// The RFC 3261 magic cookie marking post-2543 branch parameters.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

pub(crate) const BRANCH_LEN: usize = 16;
pub(crate) const TAG_LEN: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

/// Timers of RFC 3261 Table 4 plus the stack-side housekeeping timers.
///
/// Every variant carries the key of the transaction it belongs to so the
/// endpoint can route the firing back through the transaction's event
/// channel; a timer whose transaction is gone is dropped silently.
#[derive(Clone, Debug)]
pub enum TransactionTimer {
    /// Client INVITE retransmission (doubles until 64*T1).
    TimerA(TransactionKey, Duration),
    /// Client INVITE timeout.
    TimerB(TransactionKey),
    /// Client INVITE wait for response retransmissions.
    TimerD(TransactionKey),
    /// Client non-INVITE retransmission (doubles, capped at T2).
    TimerE(TransactionKey, Duration),
    /// Client non-INVITE timeout.
    TimerF(TransactionKey),
    /// Server INVITE final response retransmission (doubles, capped at T2).
    TimerG(TransactionKey, Duration),
    /// Server INVITE wait for ACK.
    TimerH(TransactionKey),
    /// Server INVITE wait for ACK retransmissions.
    TimerI(TransactionKey),
    /// Server non-INVITE wait for request retransmissions.
    TimerJ(TransactionKey),
    /// Client non-INVITE wait for response retransmissions.
    TimerK(TransactionKey),
    /// Absolute transaction lifetime bound.
    TimerMaxLifetime(TransactionKey),
    /// Drop the terminated-transaction record.
    TimerCleanup(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key, _)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerJ(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerMaxLifetime(key)
            | TransactionTimer::TimerCleanup(key) => key,
        }
    }
}

#[derive(Debug)]
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    Respond(rsip::Response),
    Terminate,
}

pub type TransactionEventSender = UnboundedSender<TransactionEvent>;
pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;

/// Channel over which the endpoint hands freshly created server
/// transactions to the upper layer.
pub type TransactionReceiver = UnboundedReceiver<transaction::Transaction>;
pub type TransactionSender = UnboundedSender<transaction::Transaction>;

/// An event sender whose receiver is already gone; used when restoring
/// dialogs that no longer have a live transaction behind them.
pub fn transaction_event_sender_noop() -> TransactionEventSender {
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    tx
}

pub fn random_text(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A fresh Via branch parameter bearing the magic cookie.
pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(format!("{}{}", MAGIC_COOKIE, random_text(BRANCH_LEN)).into())
}

pub fn make_tag() -> rsip::param::Tag {
    random_text(TAG_LEN).into()
}

pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    format!("{}@{}", random_text(22), domain.unwrap_or("localhost")).into()
}
