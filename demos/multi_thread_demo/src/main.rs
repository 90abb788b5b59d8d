// multi_thread_demo - several worker threads sharing one calibration
// segment, each with its own measurement event.

use std::f64::consts::PI;
use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use xcp_lite::*;

lazy_static::lazy_static! {
    static ref START_TIME: Instant = Instant::now();
}

const APP_NAME: &str = "multi_thread_demo";
const WORKER_COUNT: u32 = 8;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = 3)]
    log_level: u8,

    #[arg(short, long, default_value_t = Ipv4Addr::new(0, 0, 0, 0))]
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
    delay_us: u32,
    ampl: f64,
    period_s: f64,
    counter_max: u32,
}

const CALPAGE1: Params = Params { delay_us: 10_000, ampl: 100.0, period_s: 5.0, counter_max: 100 };

// Each worker spawns its own event and registers its own variables: two
// threads running the same function never share an offset into a buffer
// that belongs to the other.
fn task(id: u32, calseg: CalSeg<Params>) {
    let mut event = daq_create_event!("task");
    info!("worker {id} started");

    let mut counter: u32 = 0;
    let mut sine: f64 = 0.0;
    // Allocate both variables' offsets once; every subsequent cycle only
    // overwrites the same bytes via `capture`.
    let counter_offset = daq_register!(counter, event);
    let sine_offset = daq_register!(sine, event);

    loop {
        let page = calseg.read();
        thread::sleep(Duration::from_micros(page.delay_us as u64));

        counter += 1;
        if counter > page.counter_max {
            counter = 0;
        }

        let time = START_TIME.elapsed().as_secs_f64();
        sine = (id as f64) * 10.0 + page.ampl * ((PI * time) / page.period_s).sin();

        event.capture(&counter.to_le_bytes(), counter_offset);
        event.capture(&sine.to_le_bytes(), sine_offset);

        Xcp::get().trigger(&event);
    }
}

fn main() {
    let args = Args::parse();
    let transport = if args.tcp { XcpTransportLayer::Tcp } else { XcpTransportLayer::Udp };

    let xcp = XcpBuilder::new(APP_NAME)
        .set_log_level(log_level_filter(args.log_level))
        .set_epk("EPK_00000001")
        .start_server(transport, args.bind.octets(), args.port)
        .expect("failed to start XCP server");

    // One segment, shared by cloning the handle into every worker thread.
    let calseg = xcp.create_calseg("Params", &CALPAGE1);
    xcp.write_a2l();

    info!("multi_thread_demo running on {:?}:{} ({})", args.bind, args.port, transport.protocol_name());

    let workers: Vec<_> = (0..WORKER_COUNT)
        .map(|id| {
            let calseg = calseg.clone();
            thread::spawn(move || task(id, calseg))
        })
        .collect();

    for w in workers {
        w.join().expect("worker thread panicked");
    }
}
