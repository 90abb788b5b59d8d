// calibration_demo - a calibration segment, page switching and a
// consistency invariant checked every cycle (test_byte1 == -test_byte2).

use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use clap::Parser;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use xcp_lite::*;

const APP_NAME: &str = "calibration_demo";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = 3)]
    log_level: u8,

    #[arg(short, long, default_value_t = Ipv4Addr::new(127, 0, 0, 1))]
    bind: Ipv4Addr,

    #[arg(short, long, default_value_t = false)]
    tcp: bool,

    #[arg(short, long, default_value_t = 5555)]
    port: u16,
}

fn log_level_filter(level: u8) -> log::LevelFilter {
    match level {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        4 => log::LevelFilter::Debug,
        5 => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    }
}

#[derive(Debug, Clone, Copy)]
struct Params {
    // Invariant the ECU checks on every cycle: test_byte1 == -test_byte2.
    // A client performing an atomic calibration transaction (USER_CMD 0x01/
    // 0x02) must never let the ECU observe a state where this breaks.
    test_byte1: i8,
    test_byte2: i8,
    counter_max: u16,
}

const PARAMS: Params = Params { test_byte1: 5, test_byte2: -5, counter_max: 1000 };

fn main() {
    let args = Args::parse();
    let transport = if args.tcp { XcpTransportLayer::Tcp } else { XcpTransportLayer::Udp };

    let xcp = XcpBuilder::new(APP_NAME)
        .set_log_level(log_level_filter(args.log_level))
        .set_epk("EPK_00000001")
        .start_server(transport, args.bind.octets(), args.port)
        .expect("failed to start XCP server");

    let calseg = xcp.create_calseg("Params", &PARAMS);
    xcp.write_a2l();

    info!("calibration_demo running on {:?}:{} ({})", args.bind, args.port, transport.protocol_name());

    let mut counter: u16 = 0;
    let mut event = daq_create_event!("mainloop");
    let counter_offset = daq_register!(counter, event);

    loop {
        // Pin the segment for the whole check: a client-issued SET_CAL_PAGE
        // or atomic transaction can never surface here as a half-applied
        // update, only as a clean before/after value.
        calseg.with_locked(|params| {
            assert_eq!(params.test_byte1, -params.test_byte2, "calibration consistency invariant violated");
        });

        let max = calseg.read().counter_max;
        counter = (counter + 1) % max;
        event.capture(&counter.to_le_bytes(), counter_offset);
        xcp.trigger(&event);

        thread::sleep(Duration::from_millis(10));
    }
}
