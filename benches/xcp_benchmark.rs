// cargo bench
//
// Micro-benchmarks for the hot paths an ECU mainloop actually pays for every
// cycle: a calibration segment read, a transport queue acquire/commit, and a
// full measurement trigger through a live server instance.

#![allow(unused_imports)]

use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use xcp_lite::*;

#[derive(Debug, Clone, Copy)]
struct CalPage {
    ampl: f64,
    delay: u32,
}

const CAL_PAGE: CalPage = CalPage { ampl: 123.456, delay: 100 };

fn queue_acquire_commit(c: &mut Criterion) {
    let (queue, mut consumer) = Queue::new(1024 * 64, 256);

    c.bench_function("queue acquire+commit", |b| {
        b.iter(|| {
            if let Some(buf) = queue.acquire(8) {
                buf.commit(false);
            }
            // Drain so the ring never fills up mid-benchmark.
            if let Some((segment, _bytes)) = consumer.peek(4096) {
                consumer.release(segment);
            }
        })
    });
}

// One process-wide `Xcp` instance backs every server-dependent benchmark
// below; the `Xcp::get()` singleton can only be started once per process,
// so all of them run off this one entry point.
fn xcp_benchmark(c: &mut Criterion) {
    let xcp = XcpBuilder::new("xcp_benchmark")
        .set_log_level(log::LevelFilter::Warn)
        .set_epk("EPK_BENCH")
        .start_server(XcpTransportLayer::Udp, [127, 0, 0, 1], 0)
        .expect("failed to start XCP server");
    let cal_page = xcp.create_calseg("CalPage", &CAL_PAGE);

    c.bench_function("calibration segment read", |b| {
        b.iter(|| {
            let page = cal_page.read();
            std::hint::black_box(page.ampl);
        })
    });

    let mut signal1: u32 = 0;
    let mut signal2: u64 = 0;
    let mut event = daq_create_event!("mainloop");
    let off1 = daq_register!(signal1, event);
    let off2 = daq_register!(signal2, event);

    c.bench_function("measurement trigger", |b| {
        b.iter(|| {
            signal1 = signal1.wrapping_add(1);
            signal2 = signal2.wrapping_add(1);
            event.capture(&signal1.to_le_bytes(), off1);
            event.capture(&signal2.to_le_bytes(), off2);
            xcp.trigger(&event);
        })
    });

    xcp.stop_server();
    std::thread::sleep(Duration::from_millis(50));
}

criterion_group!(benches, queue_acquire_commit, xcp_benchmark);
criterion_main!(benches);
