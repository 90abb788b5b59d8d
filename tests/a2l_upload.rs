// A2L upload: GET_ID(IDT_ASAM_UPLOAD) reports the description's length,
// then repeated SHORT_UPLOAD calls (advancing by MAX_CTO-1 bytes each)
// reconstruct it byte for byte.

use std::net::{Ipv4Addr, SocketAddr};

use byteorder::{LittleEndian, ReadBytesExt};
use xcp_client::{XcpClient, CC_GET_ID};
use xcp_lite::*;

const IDT_ASAM_UPLOAD: u8 = 4;

#[tokio::test]
async fn repeated_short_upload_reconstructs_the_a2l_file() {
    let xcp = XcpBuilder::new("test_a2l_upload")
        .set_log_level(log::LevelFilter::Warn)
        .set_epk("EPK_TEST")
        .start_server(XcpTransportLayer::Udp, [127, 0, 0, 1], 5605)
        .expect("failed to start XCP server");

    let _seg = xcp.create_calseg("Params", &0u32);
    xcp.write_a2l();

    let server_addr: SocketAddr = (Ipv4Addr::LOCALHOST, 5605).into();
    let mut client = XcpClient::connect(server_addr).await.expect("connect failed");

    let resp = client.command(&[CC_GET_ID, IDT_ASAM_UPLOAD]).await.unwrap();
    assert!(resp.len() >= 7, "GET_ID response too short: {resp:?}");
    let length = (&resp[3..7]).read_u32::<LittleEndian>().unwrap() as usize;
    assert!(length > 0, "A2L description should not be empty once write_a2l() has run");

    let chunk = (client.max_cto - 1) as usize;
    let mut reassembled = Vec::with_capacity(length);
    client.set_mta(address::XCP_ADDR_EXT_A2L, 0).await.unwrap();
    while reassembled.len() < length {
        let remaining = length - reassembled.len();
        let size = remaining.min(chunk);
        let bytes = client.short_upload(size as u8, address::XCP_ADDR_EXT_A2L, reassembled.len() as u32).await.unwrap();
        assert_eq!(bytes.len(), size);
        reassembled.extend_from_slice(&bytes);
    }

    assert_eq!(reassembled.len(), length);
    let text = String::from_utf8(reassembled).expect("A2L upload should be valid UTF-8");
    assert!(text.contains("ASAP2_VERSION"));
    assert!(text.contains("Params"));

    let epk = client.read_epk("EPK_TEST".len() as u8).await.expect("EPK upload failed");
    assert_eq!(epk, "EPK_TEST");

    xcp.stop_server();
}
