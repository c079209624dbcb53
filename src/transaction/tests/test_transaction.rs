use super::create_test_endpoint;
use crate::transaction::{
    key::{TransactionKey, TransactionRole},
    transaction::Transaction,
    TransactionEvent, TransactionState,
};
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{headers::*, Response, SipMessage, StatusCode};

fn invite_request(branch: &str) -> rsip::Request {
    rsip::Request {
        method: rsip::Method::Invite,
        uri: rsip::Uri::try_from("sip:test.example.com:5060").unwrap(),
        headers: vec![
            Via::new(format!(
                "SIP/2.0/UDP test.example.com:5060;branch={}",
                branch
            ))
            .into(),
            CSeq::new("1 INVITE").into(),
            From::new("Alice <sip:alice@example.com>;tag=1928301774").into(),
            To::new("Bob <sip:bob@example.com>").into(),
            CallId::new("a84b4c76e66710@pc33.atlanta.com").into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

fn response_for(req: &rsip::Request, status: StatusCode, to_tag: &str) -> Response {
    Response {
        version: rsip::Version::V2,
        status_code: status,
        headers: vec![
            req.headers
                .iter()
                .find_map(|h| match h {
                    rsip::Header::Via(v) => Some(rsip::Header::Via(v.clone())),
                    _ => None,
                })
                .unwrap(),
            CSeq::new("1 INVITE").into(),
            From::new("Alice <sip:alice@example.com>;tag=1928301774").into(),
            To::new(format!("Bob <sip:bob@example.com>;tag={}", to_tag)).into(),
            CallId::new("a84b4c76e66710@pc33.atlanta.com").into(),
        ]
        .into(),
        body: vec![],
    }
}

#[tokio::test]
async fn test_multiple_provisional_responses() -> crate::Result<()> {
    let (endpoint, _peer) = create_test_endpoint(Some("127.0.0.1:0")).await?;

    let invite_req = invite_request("z9hG4bKnashds");
    let key = TransactionKey::from_request(&invite_req, TransactionRole::Client)?;
    let mut tx = Transaction::new_client(key, invite_req.clone(), endpoint.inner.clone(), None);
    tx.send().await?;

    // 1. first 183 Session Progress (no body)
    let resp1 = response_for(&invite_req, StatusCode::SessionProgress, "asdf");
    tx.tu_sender
        .send(TransactionEvent::Received(
            SipMessage::Response(resp1.clone()),
            None,
        ))
        .unwrap();

    let received1 = tx.receive().await.expect("should receive first 183");
    match received1 {
        SipMessage::Response(r) => assert_eq!(r.status_code, StatusCode::SessionProgress),
        _ => panic!("expected response"),
    }
    assert_eq!(tx.state, TransactionState::Proceeding);
    assert!(
        tx.last_ack.is_none(),
        "should not send ACK for provisional response"
    );

    // 2. second 183 with SDP body
    let mut resp2 = response_for(&invite_req, StatusCode::SessionProgress, "asdf");
    resp2.body = b"v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\n".to_vec();
    tx.tu_sender
        .send(TransactionEvent::Received(
            SipMessage::Response(resp2.clone()),
            None,
        ))
        .unwrap();

    let received2 = tx.receive().await.expect("should receive 183 with SDP");
    match received2 {
        SipMessage::Response(r) => assert_eq!(r.body, resp2.body),
        _ => panic!("expected response"),
    }
    assert_eq!(tx.state, TransactionState::Proceeding);

    // 3. exact retransmission of the second 183 is absorbed
    tx.tu_sender
        .send(TransactionEvent::Received(
            SipMessage::Response(resp2.clone()),
            None,
        ))
        .unwrap();
    let result = tokio::time::timeout(std::time::Duration::from_millis(100), tx.receive()).await;
    assert!(result.is_err(), "retransmitted 183 must be ignored");

    Ok(())
}

#[tokio::test]
async fn test_client_invite_2xx_terminates_without_ack() -> crate::Result<()> {
    let (endpoint, _peer) = create_test_endpoint(Some("127.0.0.1:0")).await?;

    let invite_req = invite_request("z9hG4bKok1");
    let key = TransactionKey::from_request(&invite_req, TransactionRole::Client)?;
    let mut tx = Transaction::new_client(key, invite_req.clone(), endpoint.inner.clone(), None);
    tx.send().await?;

    let ok = response_for(&invite_req, StatusCode::OK, "totag-ok");
    tx.tu_sender
        .send(TransactionEvent::Received(SipMessage::Response(ok), None))
        .unwrap();

    let received = tx.receive().await.expect("should receive 200");
    match received {
        SipMessage::Response(r) => assert_eq!(r.status_code, StatusCode::OK),
        _ => panic!("expected response"),
    }
    // RFC 6026 accepted state: absorbing 2xx retransmissions, no ACK here
    assert_eq!(tx.state, TransactionState::Confirmed);
    assert!(
        tx.last_ack.is_none(),
        "the dialog, not the transaction, ACKs a 2xx"
    );
    Ok(())
}

#[tokio::test]
async fn test_client_invite_error_response_is_acked() -> crate::Result<()> {
    let (endpoint, mut peer) = create_test_endpoint(Some("127.0.0.1:0")).await?;

    let invite_req = invite_request("z9hG4bKbusy1");
    let key = TransactionKey::from_request(&invite_req, TransactionRole::Client)?;
    let mut tx = Transaction::new_client(key, invite_req.clone(), endpoint.inner.clone(), None);
    tx.send().await?;
    // drain the INVITE off the wire
    let (sent, _) = peer.outgoing.recv().await.unwrap();
    assert!(matches!(sent, SipMessage::Request(ref r) if r.method == rsip::Method::Invite));

    let busy = response_for(&invite_req, StatusCode::BusyHere, "totag-busy");
    tx.tu_sender
        .send(TransactionEvent::Received(SipMessage::Response(busy), None))
        .unwrap();

    let received = tx.receive().await.expect("should receive 486");
    match received {
        SipMessage::Response(r) => assert_eq!(r.status_code, StatusCode::BusyHere),
        _ => panic!("expected response"),
    }
    assert_eq!(tx.state, TransactionState::Completed);

    // the transaction ACKed on the original branch
    let (ack, _) = peer.outgoing.recv().await.unwrap();
    match ack {
        SipMessage::Request(req) => {
            assert_eq!(req.method, rsip::Method::Ack);
            let invite_via = invite_req.via_header().unwrap().value().to_string();
            let ack_via = req.via_header().unwrap().value().to_string();
            assert_eq!(invite_via, ack_via, "non-2xx ACK reuses the branch");
        }
        _ => panic!("expected ack request"),
    }
    assert!(tx.last_ack.is_some());
    Ok(())
}

#[tokio::test]
async fn test_timer_b_times_out_the_invite() -> crate::Result<()> {
    let (endpoint, _peer) = create_test_endpoint(Some("127.0.0.1:0")).await?;

    let invite_req = invite_request("z9hG4bKtimeout");
    let key = TransactionKey::from_request(&invite_req, TransactionRole::Client)?;
    let mut tx = Transaction::new_client(
        key.clone(),
        invite_req.clone(),
        endpoint.inner.clone(),
        None,
    );
    tx.send().await?;

    tx.tu_sender
        .send(TransactionEvent::Timer(
            crate::transaction::TransactionTimer::TimerB(key),
        ))
        .unwrap();

    let received = tx.receive().await.expect("timeout response expected");
    match received {
        SipMessage::Response(r) => assert_eq!(r.status_code, StatusCode::RequestTimeout),
        _ => panic!("expected synthesized 408"),
    }
    assert_eq!(tx.state, TransactionState::Terminated);
    Ok(())
}

#[tokio::test]
async fn test_server_invite_ack_confirms() -> crate::Result<()> {
    let (endpoint, mut peer) = create_test_endpoint(Some("127.0.0.1:0")).await?;

    let invite_req = invite_request("z9hG4bKsrv1");
    let key = TransactionKey::from_request(&invite_req, TransactionRole::Server)?;
    let connection = endpoint
        .inner
        .transport_layer
        .lookup(&crate::transport::SipAddr::try_from(&invite_req.uri)?)?;
    let mut tx = Transaction::new_server(
        key.clone(),
        invite_req.clone(),
        endpoint.inner.clone(),
        Some(connection),
    );
    tx.start_server_timers();

    let ok = response_for(&invite_req, StatusCode::OK, "srv-tag");
    tx.respond(ok).await?;
    assert_eq!(tx.state, TransactionState::Completed);
    let (sent, _) = peer.outgoing.recv().await.unwrap();
    assert!(matches!(sent, SipMessage::Response(ref r) if r.status_code == StatusCode::OK));

    let mut ack = invite_req.clone();
    ack.method = rsip::Method::Ack;
    tx.tu_sender
        .send(TransactionEvent::Received(
            SipMessage::Request(ack.clone()),
            None,
        ))
        .unwrap();
    let received = tx.receive().await.expect("ack expected");
    assert!(matches!(received, SipMessage::Request(ref r) if r.method == rsip::Method::Ack));
    assert_eq!(tx.state, TransactionState::Confirmed);

    // retransmitted ACK is absorbed
    tx.tu_sender
        .send(TransactionEvent::Received(SipMessage::Request(ack), None))
        .unwrap();
    let result = tokio::time::timeout(std::time::Duration::from_millis(100), tx.receive()).await;
    assert!(result.is_err(), "ACK retransmission must be absorbed");
    Ok(())
}

#[tokio::test]
async fn test_server_invite_2xx_registers_pending_ack() -> crate::Result<()> {
    let (endpoint, _peer) = create_test_endpoint(Some("127.0.0.1:0")).await?;

    let invite_req = invite_request("z9hG4bKsrv2");
    let key = TransactionKey::from_request(&invite_req, TransactionRole::Server)?;
    let connection = endpoint
        .inner
        .transport_layer
        .lookup(&crate::transport::SipAddr::try_from(&invite_req.uri)?)?;
    let mut tx = Transaction::new_server(
        key.clone(),
        invite_req.clone(),
        endpoint.inner.clone(),
        Some(connection),
    );
    tx.start_server_timers();

    let ok = response_for(&invite_req, StatusCode::OK, "srv-tag2");
    tx.respond(ok).await?;

    let pending = endpoint
        .inner
        .find_terminated_pending_ack(key.branch().unwrap());
    assert!(pending.is_some(), "2xx server tx must be pending-ACK");
    Ok(())
}

#[tokio::test]
async fn test_cancel_matches_invite_transaction() -> crate::Result<()> {
    let (endpoint, _peer) = create_test_endpoint(Some("127.0.0.1:0")).await?;

    let invite_req = invite_request("z9hG4bKcancel1");
    let key = TransactionKey::from_request(&invite_req, TransactionRole::Server)?;
    let tx = Transaction::new_server(key, invite_req.clone(), endpoint.inner.clone(), None);

    let mut cancel = invite_req.clone();
    cancel.method = rsip::Method::Cancel;
    cancel.cseq_header_mut()?.mut_method(rsip::Method::Cancel)?;
    assert!(tx.does_cancel_match(&cancel)?);

    let other = invite_request("z9hG4bKother");
    let mut other_cancel = other.clone();
    other_cancel.method = rsip::Method::Cancel;
    assert!(!tx.does_cancel_match(&other_cancel)?);
    Ok(())
}
