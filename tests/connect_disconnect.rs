// Connect/disconnect over the real UDP transport: MAX_CTO/MAX_DTO come back
// as advertised, and a command after DISCONNECT is rejected.

use std::net::{Ipv4Addr, SocketAddr};

use xcp_client::{XcpClient, XcpClientError, CC_GET_STATUS};
use xcp_lite::{XcpBuilder, XcpTransportLayer};

#[tokio::test]
async fn connect_then_disconnect_round_trip() {
    let xcp = XcpBuilder::new("test_connect_disconnect")
        .set_log_level(log::LevelFilter::Warn)
        .set_epk("EPK_TEST")
        .start_server(XcpTransportLayer::Udp, [127, 0, 0, 1], 5601)
        .expect("failed to start XCP server");

    let server_addr: SocketAddr = (Ipv4Addr::LOCALHOST, 5601).into();
    let mut client = XcpClient::connect(server_addr).await.expect("connect failed");

    assert_eq!(client.max_cto, 248);
    assert!(client.max_dto > 0);

    client.disconnect().await.expect("disconnect failed");

    // Any command sent without reconnecting sees the server back in
    // DISCONNECTED state: GET_STATUS is refused with an XCP error rather
    // than answered as if still connected.
    match client.command(&[CC_GET_STATUS]).await {
        Err(XcpClientError::ServerError(_)) => {}
        other => panic!("expected a server error after disconnect, got {other:?}"),
    }

    xcp.stop_server();
}
