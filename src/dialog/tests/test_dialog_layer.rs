use super::{create_test_layer, create_test_layer_with, invite_request, response_for};
use crate::dialog::dialog::{DialogState, DialogTimeout, TerminatedReason};
use crate::dialog::invitation::InviteOption;
use crate::dialog::DialogId;
use crate::transaction::endpoint::EndpointOption;
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::StatusCode;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;

fn invite_option(call_id: &str) -> InviteOption {
    InviteOption {
        caller: rsip::Uri::try_from("sip:alice@alice.example.com").unwrap(),
        callee: rsip::Uri::try_from("sip:bob@bob.example.com:5060").unwrap(),
        contact: rsip::Uri::try_from("sip:alice@127.0.0.1:5060").unwrap(),
        call_id: Some(call_id.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_forked_responses_create_secondary_dialogs() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let (state_sender, _) = unbounded_channel();
    let (primary, _tx) =
        layer.create_client_invite_dialog(invite_option("fork-call"), state_sender)?;
    layer.put_dialog(crate::dialog::dialog::Dialog::ClientInvite(primary.clone()));
    let invite = primary.inner.initial_request.lock().unwrap().clone();

    // first peer answers with tag a: the primary dialog takes it
    primary.inner.update_remote_tag("a")?;
    let ringing_a = response_for(&invite, StatusCode::Ringing, "a", vec![]);
    primary.inner.apply_response(&ringing_a)?;
    assert!(primary.inner.is_early());

    // second peer answers with tag b: a secondary dialog appears
    let ringing_b = response_for(&invite, StatusCode::Ringing, "b", vec![]);
    let fork = layer.get_or_create_fork_dialog(&primary, &ringing_b)?;
    fork.inner.apply_response(&ringing_b)?;

    assert_eq!(fork.id().remote_tag, "b");
    assert!(fork.inner.is_early());
    assert_eq!(
        fork.original_dialog().map(|d| d.id()),
        Some(primary.id()),
        "secondary dialog points back at the primary"
    );
    // both are indexed under distinct dialog ids
    assert!(layer.get_dialog(&primary.id()).is_some());
    assert!(layer.get_dialog(&fork.id()).is_some());
    assert_ne!(primary.id(), fork.id());

    // fork isolation: the secondary's target does not leak into the primary
    fork.inner.set_remote_target(
        rsip::Uri::try_from("sip:peer-b@b.example.com").unwrap(),
        None,
    );
    assert_ne!(
        primary.inner.remote_uri.lock().unwrap().to_string(),
        "sip:peer-b@b.example.com"
    );
    Ok(())
}

#[tokio::test]
async fn test_fork_fingerprints_flag_retransmissions() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let (state_sender, _) = unbounded_channel();
    let (primary, _tx) =
        layer.create_client_invite_dialog(invite_option("fp-call"), state_sender)?;
    let invite = primary.inner.initial_request.lock().unwrap().clone();

    let ringing = response_for(&invite, StatusCode::Ringing, "a", vec![]);
    assert!(!primary.inner.check_retransmission_for_forking(&ringing));
    assert!(
        primary.inner.check_retransmission_for_forking(&ringing),
        "identical response is a retransmission"
    );

    // a different RSeq is a new reliable provisional, not a retransmission
    let mut with_rseq = ringing.clone();
    with_rseq
        .headers
        .push(rsip::Header::Other("RSeq".into(), "7".into()));
    assert!(!primary.inner.check_retransmission_for_forking(&with_rseq));
    Ok(())
}

#[tokio::test]
async fn test_merged_request_via_confirmed_dialog() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;

    let mut request = invite_request("merge-ftag", "", "merge-dlg-call");
    request.headers.retain(|h| !matches!(h, rsip::Header::Via(_)));
    request.headers.push(
        rsip::headers::Via::new("SIP/2.0/UDP caller.example.com:5060;branch=z9hG4bKmrg1").into(),
    );
    let key = TransactionKey::from_request(&request, TransactionRole::Server)?;
    let tx = Transaction::new_server(key, request.clone(), layer.endpoint.clone(), None);
    let (state_sender, _) = unbounded_channel();
    let dialog = layer.get_or_create_server_invite(&tx, state_sender, None, None)?;
    dialog.accept(None, None)?;
    // ACK confirms the dialog
    let mut ack = request.clone();
    ack.method = rsip::Method::Ack;
    assert!(dialog.inner.handle_ack(&ack)?);

    // the same INVITE arriving over another path is a merge
    let mut second = request.clone();
    second.headers.retain(|h| !matches!(h, rsip::Header::Via(_)));
    second.headers.push(
        rsip::headers::Via::new("SIP/2.0/UDP other.example.com:5060;branch=z9hG4bKmrg2").into(),
    );
    assert!(layer.find_merged(&second)?, "loop detected, answer 482");

    // a non-INVITE never merges
    let mut options = second.clone();
    options.method = rsip::Method::Options;
    assert!(!layer.find_merged(&options)?);
    Ok(())
}

#[tokio::test]
async fn test_late_ack_during_linger() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;

    let request = invite_request("linger-ftag", "", "linger-call");
    let key = TransactionKey::from_request(&request, TransactionRole::Server)?;
    let tx = Transaction::new_server(key, request.clone(), layer.endpoint.clone(), None);
    let (state_sender, mut state_rx) = unbounded_channel();
    let dialog = layer.get_or_create_server_invite(&tx, state_sender, None, None)?;
    dialog.accept(None, None)?;

    // application hangs up before the ACK arrives
    dialog.inner.transition(DialogState::Terminated(
        dialog.id(),
        TerminatedReason::UasBye,
    ))?;

    // within the linger window the registry still finds the dialog
    let found = layer.get_dialog(&dialog.id());
    assert!(found.is_some(), "terminated dialog discoverable during linger");

    let mut ack = request.clone();
    ack.method = rsip::Method::Ack;
    // terminated: the ACK is matched and recorded, the dialog stays dead
    assert!(!dialog.inner.handle_ack(&ack)?);
    assert!(dialog.inner.is_terminated());
    assert_ne!(
        dialog
            .inner
            .ack_seen_cseq
            .load(std::sync::atomic::Ordering::Relaxed),
        0,
        "late ACK marked as seen"
    );

    // and no second terminated event fires
    let mut terminated = 0;
    while let Ok(state) = state_rx.try_recv() {
        if matches!(state, DialogState::Terminated(_, _)) {
            terminated += 1;
        }
    }
    assert_eq!(terminated, 1);
    Ok(())
}

#[tokio::test]
async fn test_linger_zero_removes_inline() -> crate::Result<()> {
    let mut option = EndpointOption::default();
    option.connection_linger = Duration::ZERO;
    let (_endpoint, layer, _peer) = create_test_layer_with(option).await?;

    let request = invite_request("nolinger-ftag", "", "nolinger-call");
    let key = TransactionKey::from_request(&request, TransactionRole::Server)?;
    let tx = Transaction::new_server(key, request, layer.endpoint.clone(), None);
    let (state_sender, _) = unbounded_channel();
    let dialog = layer.get_or_create_server_invite(&tx, state_sender, None, None)?;

    dialog.inner.transition(DialogState::Terminated(
        dialog.id(),
        TerminatedReason::UasDecline,
    ))?;
    assert!(
        layer.get_dialog(&dialog.id()).is_none(),
        "linger zero removes the dialog inline"
    );
    Ok(())
}

#[tokio::test]
async fn test_early_state_timeout_alert() -> crate::Result<()> {
    let mut option = EndpointOption::default();
    option.early_dialog_timeout = Duration::ZERO;
    let (_endpoint, layer, _peer) = create_test_layer_with(option).await?;
    let (state_sender, mut state_rx) = unbounded_channel();
    let (dialog, _tx) =
        layer.create_client_invite_dialog(invite_option("early-call"), state_sender)?;
    layer.put_dialog(crate::dialog::dialog::Dialog::ClientInvite(dialog.clone()));
    let invite = dialog.inner.initial_request.lock().unwrap().clone();

    let ringing = response_for(&invite, StatusCode::Ringing, "x", vec![]);
    dialog.inner.apply_response(&ringing)?;
    assert!(dialog.inner.is_early());

    layer.process_timers();

    let mut saw_alert = false;
    while let Ok(state) = state_rx.try_recv() {
        if matches!(state, DialogState::Timeout(_, DialogTimeout::EarlyState)) {
            saw_alert = true;
        }
    }
    assert!(saw_alert, "early state timeout raised");
    // the alert does not terminate the dialog; the upper layer decides
    assert!(dialog.inner.is_early());
    Ok(())
}

#[tokio::test]
async fn test_audit_terminates_unrecognized_dialogs() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let (state_sender, _) = unbounded_channel();
    let (dialog, _tx) =
        layer.create_client_invite_dialog(invite_option("audit-call"), state_sender)?;
    dialog.inner.update_remote_tag("x")?;
    layer.put_dialog(crate::dialog::dialog::Dialog::ClientInvite(dialog.clone()));

    let active: HashSet<String> = HashSet::new();
    // first sweep only marks
    assert!(layer.audit_stack(&active, Duration::ZERO).is_none());
    // second sweep terminates and reports
    let report = layer.audit_stack(&active, Duration::ZERO);
    assert!(report.is_some());
    assert!(dialog.inner.is_terminated());

    // a recognized call-id is never touched
    let (state_sender2, _) = unbounded_channel();
    let (kept, _tx2) =
        layer.create_client_invite_dialog(invite_option("kept-call"), state_sender2)?;
    kept.inner.update_remote_tag("y")?;
    layer.put_dialog(crate::dialog::dialog::Dialog::ClientInvite(kept.clone()));
    let mut active = HashSet::new();
    active.insert("kept-call".to_string());
    layer.audit_stack(&active, Duration::ZERO);
    layer.audit_stack(&active, Duration::ZERO);
    assert!(!kept.inner.is_terminated());
    Ok(())
}

#[tokio::test]
async fn test_reindex_on_remote_tag_assignment() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let (state_sender, _) = unbounded_channel();
    let (dialog, _tx) =
        layer.create_client_invite_dialog(invite_option("reindex-call"), state_sender)?;
    layer.put_dialog(crate::dialog::dialog::Dialog::ClientInvite(dialog.clone()));

    let early_id = dialog.id();
    assert!(early_id.is_early());
    assert!(layer.get_dialog(&early_id).is_some());

    dialog.inner.update_remote_tag("fresh-tag")?;
    let full_id = dialog.id();
    assert!(!full_id.is_early());
    assert!(layer.get_dialog(&full_id).is_some());
    assert!(
        layer
            .inner
            .early_dialogs
            .read()
            .unwrap()
            .get(&early_id.early_id())
            .is_none(),
        "old early entry removed on re-index"
    );
    Ok(())
}

#[tokio::test]
async fn test_put_dialog_keeps_incumbent() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let (state_sender, _) = unbounded_channel();
    let (first, _tx1) =
        layer.create_client_invite_dialog(invite_option("dup-call"), state_sender)?;
    first.inner.update_remote_tag("t1")?;
    assert!(layer
        .put_dialog(crate::dialog::dialog::Dialog::ClientInvite(first.clone()))
        .is_none());

    let (state_sender2, _) = unbounded_channel();
    let (second, _tx2) =
        layer.create_client_invite_dialog(invite_option("dup-call"), state_sender2)?;
    // force the same id
    {
        let mut id = second.inner.id.lock().unwrap();
        *id = first.id();
    }
    let incumbent = layer.put_dialog(crate::dialog::dialog::Dialog::ClientInvite(second));
    assert!(incumbent.is_some(), "insert never replaces");
    assert_eq!(incumbent.unwrap().id(), first.id());
    Ok(())
}

#[tokio::test]
async fn test_dialog_id_round_trip() -> crate::Result<()> {
    let request = invite_request("ft", "tt", "Round-Trip-Call");
    let id = DialogId::try_from((&request, TransactionRole::Client))?;
    let rendered = id.to_string();
    assert_eq!(rendered, "round-trip-call:ft:tt");
    // rendering is stable
    assert_eq!(rendered, id.to_string());
    let _ = request.cseq_header()?;
    Ok(())
}
