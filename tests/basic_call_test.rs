//! End-to-end basic call over the in-memory transport: INVITE → 180 with
//! Record-Route → 200 OK → ACK, asserting the route set reversal and the
//! ACK the dialog constructs.

use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{SipMessage, StatusCode};
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use uastack::dialog::dialog::DialogState;
use uastack::dialog::dialog_layer::DialogLayer;
use uastack::dialog::invitation::InviteOption;
use uastack::transport::{ChannelConnection, SipAddr, TransportLayer};
use uastack::EndpointBuilder;

fn response_echoing(
    req: &rsip::Request,
    status: StatusCode,
    to_tag: &str,
    extra: Vec<rsip::Header>,
) -> rsip::Response {
    let mut headers: Vec<rsip::Header> = vec![
        rsip::Header::Via(req.via_header().unwrap().clone()),
        rsip::Header::From(req.from_header().unwrap().clone()),
        rsip::headers::To::new(format!(
            "{};tag={}",
            req.to_header().unwrap().value(),
            to_tag
        ))
        .into(),
        rsip::Header::CallId(req.call_id_header().unwrap().clone()),
        rsip::Header::CSeq(req.cseq_header().unwrap().clone()),
    ];
    headers.extend(extra);
    rsip::Response {
        status_code: status,
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}

#[tokio::test]
async fn test_basic_call_route_set_and_ack() {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    let local = SipAddr::new(
        rsip::transport::Transport::Udp,
        rsip::HostWithPort::try_from("127.0.0.1:5060").unwrap(),
    );
    let (connection, mut peer) = ChannelConnection::create_connection(local);
    transport_layer.add_transport(connection.into());

    let endpoint = EndpointBuilder::new()
        .with_cancel_token(token.clone())
        .with_user_agent("uastack-test")
        .with_transport_layer(transport_layer)
        .build();
    let endpoint_inner = endpoint.inner.clone();
    tokio::spawn(async move {
        endpoint_inner.serve().await.ok();
    });

    let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
    let (state_sender, mut state_rx) = unbounded_channel();

    // the remote party: answer the INVITE with 180 + 200, collect the ACK
    let peer_task = tokio::spawn(async move {
        let (msg, _dest) = peer.outgoing.recv().await.expect("invite on the wire");
        let invite = match msg {
            SipMessage::Request(req) => {
                assert_eq!(req.method, rsip::Method::Invite);
                req
            }
            _ => panic!("expected INVITE"),
        };

        let ringing = response_echoing(
            &invite,
            StatusCode::Ringing,
            "bob-tag",
            vec![
                rsip::headers::RecordRoute::new("<sip:r1.example.com;lr>").into(),
                rsip::headers::RecordRoute::new("<sip:r2.example.com;lr>").into(),
            ],
        );
        peer.incoming.send(SipMessage::Response(ringing)).unwrap();

        let ok = response_echoing(
            &invite,
            StatusCode::OK,
            "bob-tag",
            vec![
                rsip::headers::Contact::new("<sip:bob@bob.example.com:5060>").into(),
                rsip::headers::RecordRoute::new("<sip:r1.example.com;lr>").into(),
                rsip::headers::RecordRoute::new("<sip:r2.example.com;lr>").into(),
            ],
        );
        peer.incoming.send(SipMessage::Response(ok)).unwrap();

        // the ACK follows on the wire
        let (msg, _dest) = peer.outgoing.recv().await.expect("ack on the wire");
        let ack = match msg {
            SipMessage::Request(req) => req,
            _ => panic!("expected ACK"),
        };
        (invite, ack)
    });

    let opt = InviteOption {
        caller: rsip::Uri::try_from("sip:alice@alice.example.com").unwrap(),
        callee: rsip::Uri::try_from("sip:bob@bob.example.com:5060").unwrap(),
        contact: rsip::Uri::try_from("sip:alice@127.0.0.1:5060").unwrap(),
        call_id: Some("basic-call-test".to_string()),
        ..Default::default()
    };

    let (dialog, final_resp) = dialog_layer
        .do_invite(opt, state_sender)
        .await
        .expect("invite should complete");

    let final_resp = final_resp.expect("final response");
    assert_eq!(final_resp.status_code, StatusCode::OK);
    assert!(dialog.state().is_confirmed());
    assert_eq!(dialog.id().remote_tag, "bob-tag");

    let (invite, ack) = peer_task.await.unwrap();

    // route set reversal shows up as Route headers on the ACK: R2 then R1
    let routes: Vec<String> = ack
        .headers
        .iter()
        .filter_map(|h| match h {
            rsip::Header::Route(r) => Some(r.value().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(routes.len(), 2);
    assert!(routes[0].contains("r2.example.com"));
    assert!(routes[1].contains("r1.example.com"));

    // loose routing: the request-uri is the remote contact
    assert_eq!(ack.uri.to_string(), "sip:bob@bob.example.com:5060");

    let cseq = ack.cseq_header().unwrap();
    assert_eq!(cseq.seq().unwrap(), invite.cseq_header().unwrap().seq().unwrap());
    assert_eq!(cseq.method().unwrap(), rsip::Method::Ack);

    // fresh branch on the 2xx ACK
    let invite_branch = invite
        .via_header()
        .unwrap()
        .typed()
        .unwrap()
        .params
        .iter()
        .find_map(|p| match p {
            rsip::Param::Branch(b) => Some(b.value().to_string()),
            _ => None,
        });
    let ack_branch = ack
        .via_header()
        .unwrap()
        .typed()
        .unwrap()
        .params
        .iter()
        .find_map(|p| match p {
            rsip::Param::Branch(b) => Some(b.value().to_string()),
            _ => None,
        });
    assert_ne!(invite_branch, ack_branch);

    // the state stream saw early then confirmed
    let mut saw_early = false;
    let mut saw_confirmed = false;
    while let Ok(state) = state_rx.try_recv() {
        match state {
            DialogState::Early(_, _) => saw_early = true,
            DialogState::Confirmed(_, _) => saw_confirmed = true,
            _ => {}
        }
    }
    assert!(saw_early, "180 drove the dialog to early");
    assert!(saw_confirmed, "200 confirmed the dialog");

    token.cancel();
}
