// Calibration consistency: an ECU thread holds `test_byte1 == -test_byte2`
// as an invariant and checks it under lock on every cycle. A client downloads
// both bytes one at a time inside an atomic transaction; the ECU must never
// observe a half-applied pair.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use xcp_client::XcpClient;
use xcp_lite::*;

#[derive(Debug, Clone, Copy)]
struct Params {
    test_byte1: i8,
    test_byte2: i8,
}

const DEFAULT_PARAMS: Params = Params { test_byte1: 1, test_byte2: -1 };

#[tokio::test]
async fn atomic_transaction_never_exposes_a_half_applied_pair() {
    let xcp = XcpBuilder::new("test_calibration_atomic_transaction")
        .set_log_level(log::LevelFilter::Warn)
        .set_epk("EPK_TEST")
        .start_server(XcpTransportLayer::Udp, [127, 0, 0, 1], 5603)
        .expect("failed to start XCP server");

    let calseg = xcp.create_calseg("Params", &DEFAULT_PARAMS);

    let violated = Arc::new(AtomicBool::new(false));
    let checker_violated = Arc::clone(&violated);
    let checker_seg = calseg.clone();
    let stop = Arc::new(AtomicBool::new(false));
    let checker_stop = Arc::clone(&stop);
    let checker = thread::spawn(move || {
        while !checker_stop.load(Ordering::Relaxed) {
            checker_seg.with_locked(|p| {
                if p.test_byte1 != -p.test_byte2 {
                    checker_violated.store(true, Ordering::Relaxed);
                }
            });
        }
    });

    let server_addr: SocketAddr = (Ipv4Addr::LOCALHOST, 5603).into();
    let mut client = XcpClient::connect(server_addr).await.expect("connect failed");

    let (ext, addr_byte1) = address::encode(address::MemoryLocation::Segment { seg_index: calseg.index() as u16, offset: 0 });
    let (_, addr_byte2) = address::encode(address::MemoryLocation::Segment { seg_index: calseg.index() as u16, offset: 1 });

    client.begin_cal_transaction().await.unwrap();
    client.short_download(ext, addr_byte1, &[5u8]).await.unwrap();
    // A checker sampling right here would see the pre-transaction defaults
    // (1, -1), never a mix of the old byte2 with the new byte1 - writes are
    // staged, not applied, until end_cal_transaction below.
    client.short_download(ext, addr_byte2, &[(-5i8) as u8]).await.unwrap();
    client.end_cal_transaction().await.unwrap();

    // Give the checker thread a little time to observe the post-transaction state.
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.store(true, Ordering::Relaxed);
    checker.join().unwrap();

    assert!(!violated.load(Ordering::Relaxed), "ECU observed test_byte1 != -test_byte2 mid-transaction");
    let after = calseg.read();
    assert_eq!(after.test_byte1, 5);
    assert_eq!(after.test_byte2, -5);

    xcp.stop_server();
}
