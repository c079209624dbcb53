use super::{create_test_layer, invite_request, response_for};
use crate::dialog::{
    client_dialog::ClientInviteDialog,
    dialog::{DialogInner, DialogState, TerminatedReason},
    DialogId,
};
use crate::transaction::key::TransactionRole;
use crate::transaction::transaction_event_sender_noop;
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::StatusCode;
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;

fn client_dialog_for(
    layer: &crate::dialog::dialog_layer::DialogLayer,
    from_tag: &str,
    to_tag: &str,
    call_id: &str,
) -> crate::Result<ClientInviteDialog> {
    let (state_sender, _) = unbounded_channel();
    let dialog_id = DialogId {
        call_id: call_id.to_string(),
        local_tag: from_tag.to_string(),
        remote_tag: to_tag.to_string(),
    };
    let invite_req = invite_request(from_tag, to_tag, call_id);
    let dialog_inner = DialogInner::new(
        TransactionRole::Client,
        dialog_id,
        invite_req,
        layer.endpoint.clone(),
        Arc::downgrade(&layer.inner),
        state_sender,
        None,
        Some(rsip::Uri::try_from("sip:alice@alice.example.com:5060").unwrap()),
        transaction_event_sender_noop(),
    )?;
    Ok(ClientInviteDialog {
        inner: Arc::new(dialog_inner),
    })
}

#[tokio::test]
async fn test_client_dialog_creation() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let dialog = client_dialog_for(&layer, "alice-tag", "bob-tag", "test-call-id")?;

    assert_eq!(dialog.id().call_id, "test-call-id");
    assert!(!dialog.inner.is_confirmed());
    Ok(())
}

#[tokio::test]
async fn test_client_dialog_sequence_handling() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let dialog = client_dialog_for(&layer, "alice-tag", "bob-tag", "test-call-seq")?;

    assert_eq!(dialog.inner.get_local_seq(), 1);
    assert_eq!(dialog.inner.increment_local_seq(), 2);
    Ok(())
}

#[tokio::test]
async fn test_cseq_exhaustion_rejected() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let dialog = client_dialog_for(&layer, "alice-tag", "bob-tag", "test-call-exhaust")?;

    dialog
        .inner
        .transition(DialogState::Confirmed(dialog.id(), rsip::Response::default()))?;
    dialog
        .inner
        .local_seq
        .store(u32::MAX as u64 - 1, std::sync::atomic::Ordering::Relaxed);
    let err = dialog
        .inner
        .create_request(rsip::Method::Info, None, None)
        .unwrap_err();
    assert!(matches!(err, crate::Error::DialogError(_, _, _)));
    Ok(())
}

#[tokio::test]
async fn test_create_request_rejects_special_methods() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let dialog = client_dialog_for(&layer, "alice-tag", "bob-tag", "test-call-methods")?;
    dialog
        .inner
        .transition(DialogState::Confirmed(dialog.id(), rsip::Response::default()))?;

    for method in [rsip::Method::Ack, rsip::Method::Cancel, rsip::Method::PRack] {
        assert!(dialog.inner.create_request(method, None, None).is_err());
    }
    // and BYE from the callee side is barred while early; from us (UAC) it
    // is allowed only in early/confirmed, exercised elsewhere
    let req = dialog
        .inner
        .create_request(rsip::Method::Info, None, None)?;
    assert_eq!(req.call_id_header()?.value(), "test-call-methods");
    assert_eq!(req.cseq_header()?.method()?, rsip::Method::Info);
    Ok(())
}

#[tokio::test]
async fn test_route_set_reversed_and_frozen() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let dialog = client_dialog_for(&layer, "alice-tag", "", "test-call-routes")?;
    let invite = dialog.inner.initial_request.lock().unwrap().clone();

    // 180 with Record-Route [R1, R2] -> route set [R2, R1]
    let ringing = response_for(
        &invite,
        StatusCode::Ringing,
        "x",
        vec![
            rsip::headers::RecordRoute::new("<sip:r1.example.com;lr>").into(),
            rsip::headers::RecordRoute::new("<sip:r2.example.com;lr>").into(),
        ],
    );
    dialog.inner.apply_response(&ringing)?;
    assert!(dialog.inner.is_early());
    {
        let routes = dialog.inner.route_set.lock().unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes[0].value().contains("r2.example.com"));
        assert!(routes[1].value().contains("r1.example.com"));
    }

    // 200 with a different Record-Route list confirms but must not change
    // the already reversed set after confirmation freezes it
    let ok = response_for(
        &invite,
        StatusCode::OK,
        "x",
        vec![
            rsip::headers::Contact::new("<sip:bob@bob.example.com:5060>").into(),
            rsip::headers::RecordRoute::new("<sip:r1.example.com;lr>").into(),
            rsip::headers::RecordRoute::new("<sip:r2.example.com;lr>").into(),
        ],
    );
    dialog.inner.apply_response(&ok)?;
    assert!(dialog.inner.is_confirmed());

    let reinvite_ok = response_for(
        &invite,
        StatusCode::OK,
        "x",
        vec![
            rsip::headers::Contact::new("<sip:bob@new-host.example.com>").into(),
            rsip::headers::RecordRoute::new("<sip:evil.example.com;lr>").into(),
        ],
    );
    dialog.inner.apply_response(&reinvite_ok)?;
    {
        let routes = dialog.inner.route_set.lock().unwrap();
        assert_eq!(routes.len(), 2, "route set is frozen after confirmation");
        assert!(routes[0].value().contains("r2.example.com"));
    }
    // but the remote target did refresh
    assert!(dialog
        .inner
        .remote_uri
        .lock()
        .unwrap()
        .to_string()
        .contains("new-host.example.com"));
    Ok(())
}

#[tokio::test]
async fn test_create_ack_matches_last_2xx() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let dialog = client_dialog_for(&layer, "alice-tag", "", "test-call-ack")?;
    let invite = dialog.inner.initial_request.lock().unwrap().clone();

    // no 2xx seen yet
    assert!(dialog.inner.create_ack(1).is_err());

    let ok = response_for(
        &invite,
        StatusCode::OK,
        "x",
        vec![rsip::headers::Contact::new("<sip:bob@bob.example.com:5060>").into()],
    );
    dialog.inner.apply_response(&ok)?;

    let ack = dialog.inner.create_ack(1)?;
    assert_eq!(ack.method, rsip::Method::Ack);
    assert_eq!(
        ack.uri.to_string(),
        "sip:bob@bob.example.com:5060",
        "request-uri is the remote contact"
    );
    let cseq = ack.cseq_header()?;
    assert_eq!(cseq.seq()?, 1);
    assert_eq!(cseq.method()?, rsip::Method::Ack);
    assert!(ack.to_header()?.tag()?.map(|t| t.value().to_string()) == Some("x".to_string()));
    // fresh branch, distinct from the INVITE's
    let invite_via = invite.via_header()?.value().to_string();
    let ack_via = ack.via_header()?.value().to_string();
    assert_ne!(invite_via, ack_via, "2xx ACK takes a fresh branch");
    assert!(ack
        .headers
        .iter()
        .any(|h| matches!(h, rsip::Header::MaxForwards(_))));
    Ok(())
}

#[tokio::test]
async fn test_late_2xx_after_termination_does_not_resurrect() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let dialog = client_dialog_for(&layer, "alice-tag", "x", "test-call-late")?;
    let invite = dialog.inner.initial_request.lock().unwrap().clone();

    dialog.inner.transition(DialogState::Terminated(
        dialog.id(),
        TerminatedReason::UacCancel,
    ))?;

    let ok = response_for(
        &invite,
        StatusCode::OK,
        "x",
        vec![rsip::headers::Contact::new("<sip:bob@bob.example.com:5060>").into()],
    );
    dialog.inner.apply_response(&ok)?;

    assert!(dialog.inner.is_terminated(), "no resurrection");
    // yet a late ACK can still be built
    assert!(dialog.inner.create_ack(1).is_ok());
    Ok(())
}

#[tokio::test]
async fn test_terminated_event_delivered_once() -> crate::Result<()> {
    let (_endpoint, layer, _peer) = create_test_layer().await?;
    let (state_sender, mut state_rx) = unbounded_channel();
    let dialog_id = DialogId {
        call_id: "test-call-once".to_string(),
        local_tag: "alice-tag".to_string(),
        remote_tag: "bob-tag".to_string(),
    };
    let invite_req = invite_request("alice-tag", "bob-tag", "test-call-once");
    let inner = Arc::new(DialogInner::new(
        TransactionRole::Client,
        dialog_id.clone(),
        invite_req,
        layer.endpoint.clone(),
        Arc::downgrade(&layer.inner),
        state_sender,
        None,
        None,
        transaction_event_sender_noop(),
    )?);

    inner.transition(DialogState::Terminated(
        dialog_id.clone(),
        TerminatedReason::UacBye,
    ))?;
    inner.transition(DialogState::Terminated(
        dialog_id.clone(),
        TerminatedReason::UasBye,
    ))?;
    inner.transition(DialogState::Terminated(
        dialog_id,
        TerminatedReason::Timeout,
    ))?;

    let mut terminated = 0;
    while let Ok(state) = state_rx.try_recv() {
        if matches!(state, DialogState::Terminated(_, _)) {
            terminated += 1;
        }
    }
    assert_eq!(terminated, 1, "DialogTerminated is delivered exactly once");
    Ok(())
}

#[tokio::test]
async fn test_remote_tag_reassignment_gated_by_option() -> crate::Result<()> {
    let mut option = crate::transaction::endpoint::EndpointOption::default();
    option.allow_remote_tag_reassignment = false;
    let (_endpoint, layer, _peer) = super::create_test_layer_with(option).await?;
    let dialog = client_dialog_for(&layer, "alice-tag", "", "test-call-retag")?;

    dialog.inner.update_remote_tag("a")?;
    assert_eq!(dialog.id().remote_tag, "a");
    // second distinct tag refused when the stack-wide flag is off
    dialog.inner.update_remote_tag("b")?;
    assert_eq!(dialog.id().remote_tag, "a");
    Ok(())
}
