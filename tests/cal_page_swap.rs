// Page swap round-trip: client switches the ECU over to the reference
// (FLASH) page, observes the untouched defaults, then copies reference back
// onto the working page and observes defaults there too.

use std::net::{Ipv4Addr, SocketAddr};

use xcp_client::XcpClient;
use xcp_lite::*;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Params {
    gain: u32,
}

const DEFAULT_PARAMS: Params = Params { gain: 100 };

#[tokio::test]
async fn set_cal_page_then_copy_cal_page_round_trips_to_defaults() {
    let xcp = XcpBuilder::new("test_cal_page_swap")
        .set_log_level(log::LevelFilter::Warn)
        .set_epk("EPK_TEST")
        .start_server(XcpTransportLayer::Udp, [127, 0, 0, 1], 5604)
        .expect("failed to start XCP server");

    let calseg = xcp.create_calseg("Params", &DEFAULT_PARAMS);
    let seg_index = calseg.index() as u8;

    let server_addr: SocketAddr = (Ipv4Addr::LOCALHOST, 5604).into();
    let mut client = XcpClient::connect(server_addr).await.expect("connect failed");

    let (ext, addr) = address::encode(address::MemoryLocation::Segment { seg_index: seg_index as u16, offset: 0 });

    // Overwrite the working page away from the default.
    client.short_download(ext, addr, &999u32.to_le_bytes()).await.unwrap();
    assert_ne!(calseg.read(), DEFAULT_PARAMS);

    // Switch the ECU to the reference page: back to the untouched defaults.
    client.set_cal_page(true, false, 1).await.unwrap();
    assert_eq!(calseg.read(), DEFAULT_PARAMS);

    // Copy reference onto working, then switch back: working now matches
    // defaults too, and the pre-swap edit is gone for good.
    client.copy_cal_page(seg_index, 1, seg_index, 0).await.unwrap();
    client.set_cal_page(true, false, 0).await.unwrap();
    assert_eq!(calseg.read(), DEFAULT_PARAMS);

    xcp.stop_server();
}
