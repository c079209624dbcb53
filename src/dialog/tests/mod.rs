use crate::dialog::dialog_layer::DialogLayer;
use crate::transaction::endpoint::Endpoint;
use crate::transport::channel::ChannelPeer;
use crate::transport::{ChannelConnection, SipAddr, TransportLayer};
use crate::EndpointBuilder;
use rsip::prelude::UntypedHeader;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod test_client_dialog;
mod test_dialog_layer;

pub(crate) async fn create_test_layer(
) -> crate::Result<(Endpoint, Arc<DialogLayer>, ChannelPeer)> {
    create_test_layer_with(crate::transaction::endpoint::EndpointOption::default()).await
}

pub(crate) async fn create_test_layer_with(
    option: crate::transaction::endpoint::EndpointOption,
) -> crate::Result<(Endpoint, Arc<DialogLayer>, ChannelPeer)> {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    let sip_addr = SipAddr::new(
        rsip::transport::Transport::Udp,
        rsip::HostWithPort::try_from("127.0.0.1:5060")?,
    );
    let (connection, peer) = ChannelConnection::create_connection(sip_addr);
    transport_layer.add_transport(connection.into());
    let endpoint = EndpointBuilder::new()
        .with_cancel_token(token)
        .with_user_agent("uastack-test")
        .with_transport_layer(transport_layer)
        .with_option(option)
        .build();
    let layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
    Ok((endpoint, layer, peer))
}

pub(crate) fn invite_request(from_tag: &str, to_tag: &str, call_id: &str) -> rsip::Request {
    use rsip::headers::*;
    let to = if to_tag.is_empty() {
        "Bob <sip:bob@example.com>".to_string()
    } else {
        format!("Bob <sip:bob@example.com>;tag={}", to_tag)
    };
    rsip::Request {
        method: rsip::Method::Invite,
        uri: rsip::Uri::try_from("sip:bob@example.com:5060").unwrap(),
        headers: vec![
            Via::new("SIP/2.0/UDP alice.example.com:5060;branch=z9hG4bKnashds").into(),
            CSeq::new("1 INVITE").into(),
            From::new(format!("Alice <sip:alice@example.com>;tag={}", from_tag)).into(),
            To::new(to).into(),
            CallId::new(call_id).into(),
            Contact::new("<sip:alice@alice.example.com:5060>").into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: b"v=0\r\no=alice 2890844526 2890844527 IN IP4 host.atlanta.com\r\n".to_vec(),
    }
}

pub(crate) fn response_for(
    request: &rsip::Request,
    status: rsip::StatusCode,
    to_tag: &str,
    extra: Vec<rsip::Header>,
) -> rsip::Response {
    use rsip::prelude::HeadersExt;
    let mut headers: Vec<rsip::Header> = vec![
        rsip::Header::Via(request.via_header().unwrap().clone()),
        rsip::Header::From(request.from_header().unwrap().clone()),
        rsip::headers::To::new(format!("Bob <sip:bob@example.com>;tag={}", to_tag)).into(),
        rsip::Header::CallId(request.call_id_header().unwrap().clone()),
        rsip::Header::CSeq(request.cseq_header().unwrap().clone()),
    ];
    headers.extend(extra);
    rsip::Response {
        status_code: status,
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}
