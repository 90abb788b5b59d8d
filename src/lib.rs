//-----------------------------------------------------------------------------
// xcp_lite
// XCP on Ethernet measurement and calibration server.
//
// ```no_run
// use xcp_lite::*;
//
// #[derive(Debug, Clone, Copy)]
// struct CalPage {
//     counter_max: u16,
// }
// static CAL_PAGE: CalPage = CalPage { counter_max: 100 };
//
// fn main() {
//     let xcp = XcpBuilder::new("hello_xcp")
//         .set_log_level(log::LevelFilter::Info)
//         .set_epk("EPK_00000001")
//         .start_server(XcpTransportLayer::Udp, [127, 0, 0, 1], 5555)
//         .unwrap();
//
//     let calseg = xcp.create_calseg("CalPage", &CAL_PAGE);
//     let mut event = daq_create_event!("mainloop");
//     let mut counter: u16 = 0;
//     let offset = daq_register!(counter, event);
//     let _ = offset;
//
//     loop {
//         counter = (counter + 1) % calseg.read().counter_max;
//         event.capture(&counter.to_le_bytes(), offset);
//         xcp.trigger(&event);
//         std::thread::sleep(std::time::Duration::from_millis(10));
//         break; // doctest: don't actually loop forever
//     }
//     xcp.write_a2l();
// }
// ```

pub mod address;
pub mod cal;
pub mod daq;
pub mod platform;
pub mod protocol;
pub mod queue;
pub mod server;

pub use cal::cal_seg::CalSeg;
pub use cal::{CalError, CalPageKind, CalSegmentManager, PageTarget};
pub use daq::event::{DaqEvent, EventRegistry, XcpEvent};
pub use daq::{DaqEngine, DaqError, DaqState};
pub use platform::{Clock, ClockUnit};
pub use protocol::{NullAppCallbacks, ProtocolEngine, XcpAppCallbacks, XcpError};
pub use queue::{Queue, QueueConsumer};
pub use server::{Xcp, XcpBuilder, XcpTransportLayer};

/// Print through the server's own logger at `info` level.
#[macro_export]
macro_rules! xcp_println {
    ($($arg:tt)*) => {
        log::info!($($arg)*)
    };
}

/// Register a static default value as a calibration segment in one
/// expression.
#[macro_export]
macro_rules! cal_register_static {
    ($var:ident) => {
        $crate::Xcp::get().create_calseg(stringify!($var), &$var)
    };
    ($var:ident, $name:expr) => {
        $crate::Xcp::get().create_calseg($name, &$var)
    };
}
