// hello_xcp - minimal xcp_lite measurement/calibration demo

use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use clap::Parser;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use xcp_lite::*;

const APP_NAME: &str = "hello_xcp";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (Off=0, Error=1, Warn=2, Info=3, Debug=4, Trace=5)
    #[arg(short, long, default_value_t = 3)]
    log_level: u8,

    /// Bind address, default is loopback
    #[arg(short, long, default_value_t = Ipv4Addr::new(127, 0, 0, 1))]
    bind: Ipv4Addr,

    /// Use TCP as transport layer, default is UDP
    #[arg(short, long, default_value_t = false)]
    tcp: bool,

    /// Port number
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
struct CalPage {
    min: u16,
    max: u16,
    delay_ms: u64,
}

const CAL_PAGE: CalPage = CalPage { min: 0, max: 100, delay_ms: 10 };

fn main() {
    let args = Args::parse();
    let transport = if args.tcp { XcpTransportLayer::Tcp } else { XcpTransportLayer::Udp };

    let xcp = XcpBuilder::new(APP_NAME)
        .set_log_level(log_level_filter(args.log_level))
        .set_epk("EPK_00000001")
        .start_server(transport, args.bind.octets(), args.port)
        .expect("failed to start XCP server");

    let calseg = xcp.create_calseg("CalPage", &CAL_PAGE);

    // Measurement signal
    let mut counter: u16 = calseg.read().min;

    // Register a measurement event and bind the counter to it
    let mut event = daq_create_event!("mainloop");
    let counter_offset = daq_register!(counter, event);

    xcp.write_a2l();

    info!("hello_xcp running on {:?}:{} ({})", args.bind, args.port, transport.protocol_name());

    loop {
        let page = calseg.read();
        counter += 1;
        if counter > page.max {
            counter = page.min;
        }
        event.capture(&counter.to_le_bytes(), counter_offset);
        xcp.trigger(&event);
        thread::sleep(Duration::from_millis(page.delay_ms));
    }
}
