use crate::transaction::endpoint::Endpoint;
use crate::transport::{ChannelConnection, SipAddr, TransportLayer};
use crate::transport::channel::ChannelPeer;
use crate::EndpointBuilder;
use tokio_util::sync::CancellationToken;

mod test_transaction;

pub(crate) async fn create_test_endpoint(
    addr: Option<&str>,
) -> crate::Result<(Endpoint, ChannelPeer)> {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    let sip_addr = SipAddr::new(
        rsip::transport::Transport::Udp,
        rsip::HostWithPort::try_from(addr.unwrap_or("127.0.0.1:5060"))?,
    );
    let (connection, peer) = ChannelConnection::create_connection(sip_addr);
    transport_layer.add_transport(connection.into());
    let endpoint = EndpointBuilder::new()
        .with_cancel_token(token)
        .with_user_agent("uastack-test")
        .with_transport_layer(transport_layer)
        .build();
    Ok((endpoint, peer))
}
