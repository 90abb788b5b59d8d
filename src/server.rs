//-----------------------------------------------------------------------------
// Module server
// The `Xcp` singleton and `XcpBuilder`: wires the queue, calibration
// manager, DAQ engine, and protocol engine together behind two long-lived
// threads (command receive/dispatch, DAQ segment transmit), built as a plain
// `std::net` server loop.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn, LevelFilter};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::cal::cal_seg::CalSeg;
use crate::cal::CalSegmentManager;
use crate::daq::event::{DaqEvent, EventRegistry, XcpEvent};
use crate::daq::{CalSegmentReader, DaqEngine};
use crate::platform::{Clock, ClockUnit};
use crate::protocol::{NullAppCallbacks, ProtocolEngine, XcpAppCallbacks};
use crate::queue::Queue;

/// Which socket type carries the protocol ("Transport Layer").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XcpTransportLayer {
    Udp = 0,
    Tcp = 1,
}

impl XcpTransportLayer {
    pub fn protocol_name(self) -> &'static str {
        match self {
            XcpTransportLayer::Udp => "UDP",
            XcpTransportLayer::Tcp => "TCP",
        }
    }
}

const TRANSPORT_HEADER_LEN: usize = 4;

fn frame(ctr: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TRANSPORT_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&ctr.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

static XCP_INSTANCE: OnceCell<Arc<Xcp>> = OnceCell::new();

/// The measurement/calibration server. One process-wide instance, created
/// by [`XcpBuilder::start_server`] and retrieved anywhere via [`Xcp::get`]
/// (spec design notes: "global singleton").
pub struct Xcp {
    cal: Arc<CalSegmentManager>,
    daq: Arc<DaqEngine>,
    events: Arc<EventRegistry>,
    clock: Arc<Clock>,
    queue: Arc<Queue>,
    protocol: Arc<ProtocolEngine>,
    shutdown: Arc<AtomicBool>,
    client_addr: Arc<RwLock<Option<SocketAddr>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Xcp {
    /// Returns the running server. Panics if [`XcpBuilder::start_server`]
    /// has not been called yet.
    pub fn get() -> Arc<Xcp> {
        Arc::clone(XCP_INSTANCE.get().expect("Xcp::start_server was not called"))
    }

    pub fn create_event(&self, name: &str) -> XcpEvent {
        self.events.create_event(name)
    }

    pub fn create_calseg<T: Copy + 'static>(&self, name: &str, default: &T) -> CalSeg<T> {
        CalSeg::new(&self.cal, name, default)
    }

    pub fn cal_segment_manager(&self) -> &Arc<CalSegmentManager> {
        &self.cal
    }

    pub fn daq_engine(&self) -> &Arc<DaqEngine> {
        &self.daq
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Fire `event`, scattering every bound DAQ list entry out of
    /// `daq_event`'s capture buffer into the transport queue.
    pub fn trigger<const N: usize>(&self, daq_event: &DaqEvent<N>) {
        let base = daq_event.buffer_ptr();
        let reader = CalSegmentReader(Arc::clone(&self.cal));
        self.daq.trigger(daq_event.get_event().get_id(), base, &self.clock, &self.queue, Some(&reader));
    }

    /// Fire a bare event with no associated capture buffer - only useful
    /// for DAQ lists whose entries are all absolute or segment-relative.
    pub fn trigger_event(&self, event: XcpEvent) {
        let reader = CalSegmentReader(Arc::clone(&self.cal));
        self.daq.trigger(event.get_id(), std::ptr::null(), &self.clock, &self.queue, Some(&reader));
    }

    /// Regenerate the A2L description served via `GET_ID`/`UPLOAD`. Called
    /// once application registration is complete. Produces a minimal but
    /// structurally valid module listing every calibration segment and
    /// event; it does not emit per-field CHARACTERISTIC/MEASUREMENT records,
    /// since derive-based field-metadata generation was dropped as an
    /// explicit dependency (see DESIGN.md).
    pub fn write_a2l(&self) {
        let mut out = String::new();
        out.push_str("/* A2L */\nASAP2_VERSION 1 71\n/begin PROJECT xcp_lite \"\"\n/begin MODULE xcp_lite \"\"\n");
        for index in 0..self.cal.segment_count() {
            if let Some(name) = self.cal.segment_name(index) {
                let size = self.cal.segment_size(index).unwrap_or(0);
                out.push_str(&format!("/* calibration segment: {name} size={size} */\n"));
            }
        }
        for index in 0..self.events.count() {
            out.push_str(&format!("/* event: id={index} */\n"));
        }
        out.push_str("/end MODULE\n/end PROJECT\n");
        self.protocol.set_a2l(out.into_bytes());
    }

    /// The currently known client address, if any command or DAQ segment
    /// has been exchanged with one yet.
    pub fn connected_client(&self) -> Option<SocketAddr> {
        *self.client_addr.read()
    }

    pub fn disconnect_client(&self) {
        self.protocol.dispatch(&[crate::protocol::codes::CC_DISCONNECT]);
    }

    /// Cooperative shutdown: signals both server threads and waits for them
    /// to exit. There is no forced/async-cancel path (spec design notes'
    /// Open Question resolution: "cooperative-only shutdown").
    pub fn stop_server(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Builds and starts an [`Xcp`] server via a
/// `XcpBuilder::new(...).start_server(...)` chain.
pub struct XcpBuilder {
    app_name: String,
    log_level: LevelFilter,
    epk: String,
    app_callbacks: Arc<dyn XcpAppCallbacks>,
    queue_size: usize,
    clock_unit: ClockUnit,
    multicast_group: Option<Ipv4Addr>,
}

impl XcpBuilder {
    pub fn new(app_name: &str) -> XcpBuilder {
        XcpBuilder {
            app_name: app_name.to_string(),
            log_level: LevelFilter::Info,
            epk: String::new(),
            app_callbacks: Arc::new(NullAppCallbacks),
            queue_size: 64 * 1024,
            clock_unit: ClockUnit::Microseconds,
            multicast_group: None,
        }
    }

    /// Join `group` and answer `GET_DAQ_CLOCK` requests received on it, in
    /// addition to the unicast command socket. Optional: a platform or
    /// network that refuses the multicast join simply runs without it
    /// (logged, not a startup failure).
    pub fn set_multicast_group(mut self, group: Ipv4Addr) -> XcpBuilder {
        self.multicast_group = Some(group);
        self
    }

    pub fn set_log_level(mut self, level: LevelFilter) -> XcpBuilder {
        self.log_level = level;
        self
    }

    pub fn set_epk(mut self, epk: &str) -> XcpBuilder {
        self.epk = epk.to_string();
        self
    }

    pub fn set_app_callbacks(mut self, callbacks: Arc<dyn XcpAppCallbacks>) -> XcpBuilder {
        self.app_callbacks = callbacks;
        self
    }

    pub fn set_queue_size(mut self, bytes: usize) -> XcpBuilder {
        self.queue_size = bytes;
        self
    }

    pub fn set_clock_unit(mut self, unit: ClockUnit) -> XcpBuilder {
        self.clock_unit = unit;
        self
    }

    pub fn start_server(self, transport: XcpTransportLayer, addr: [u8; 4], port: u16) -> io::Result<Arc<Xcp>> {
        let _ = env_logger::Builder::new().filter_level(self.log_level).try_init();
        info!("starting XCP server ({}) on {:?}:{}", transport.protocol_name(), addr, port);

        let cal = Arc::new(CalSegmentManager::new());
        let daq = Arc::new(DaqEngine::new());
        let events = Arc::new(EventRegistry::new());
        let clock = Arc::new(Clock::new(self.clock_unit));
        let (queue, consumer) = Queue::new(self.queue_size, crate::protocol::codes::MAX_DTO + 16);
        let protocol = Arc::new(ProtocolEngine::new(
            Arc::clone(&cal),
            Arc::clone(&daq),
            Arc::clone(&events),
            Arc::clone(&clock),
            self.app_callbacks,
            self.epk,
        ));
        let shutdown = Arc::new(AtomicBool::new(false));
        let client_addr: Arc<RwLock<Option<SocketAddr>>> = Arc::new(RwLock::new(None));

        let mut threads = Vec::new();
        match transport {
            XcpTransportLayer::Udp => {
                let socket = UdpSocket::bind((std::net::Ipv4Addr::from(addr), port))?;
                socket.set_read_timeout(Some(Duration::from_millis(200)))?;
                let recv_socket = socket.try_clone()?;
                let send_socket = socket;
                // One consumer, shared by both tasks behind a mutex: the
                // receive task drains it once right after every dispatch for
                // low command latency, the transmit task drains it on its own
                // flush cycle. Mutual exclusion keeps exactly one logical
                // consumer active at a time, matching the queue's single-
                // consumer contract.
                let shared_consumer = Arc::new(Mutex::new(consumer));
                let recv_protocol = Arc::clone(&protocol);
                let recv_queue = Arc::clone(&queue);
                let recv_consumer = Arc::clone(&shared_consumer);
                let recv_shutdown = Arc::clone(&shutdown);
                let recv_client_addr = Arc::clone(&client_addr);
                threads.push(thread::spawn(move || {
                    udp_receive_loop(recv_socket, recv_protocol, recv_queue, recv_consumer, recv_shutdown, recv_client_addr);
                }));

                let tx_consumer = Arc::clone(&shared_consumer);
                let tx_shutdown = Arc::clone(&shutdown);
                let tx_client_addr = Arc::clone(&client_addr);
                threads.push(thread::spawn(move || {
                    transmit_loop_udp(send_socket, tx_consumer, tx_shutdown, tx_client_addr);
                }));

                if let Some(group) = self.multicast_group {
                    let bind_addr = std::net::Ipv4Addr::from(addr);
                    let mc_clock = Arc::clone(&clock);
                    let mc_shutdown = Arc::clone(&shutdown);
                    match spawn_multicast_responder(group, bind_addr, port, mc_clock, mc_shutdown) {
                        Ok(handle) => threads.push(handle),
                        Err(e) => warn!("multicast group {group} unavailable, GET_DAQ_CLOCK_MULTICAST disabled: {e}"),
                    }
                }
            }
            XcpTransportLayer::Tcp => {
                let listener = TcpListener::bind((std::net::Ipv4Addr::from(addr), port))?;
                listener.set_nonblocking(true)?;
                let tcp_protocol = Arc::clone(&protocol);
                let tcp_queue = Arc::clone(&queue);
                let tcp_shutdown = Arc::clone(&shutdown);
                threads.push(thread::spawn(move || {
                    tcp_loop(listener, tcp_protocol, tcp_queue, tcp_shutdown, consumer);
                }));
            }
        }

        let xcp = Arc::new(Xcp {
            cal,
            daq,
            events,
            clock,
            queue,
            protocol,
            shutdown,
            client_addr,
            threads: Mutex::new(threads),
        });
        XCP_INSTANCE.set(Arc::clone(&xcp)).map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "Xcp already started"))?;
        Ok(xcp)
    }
}

/// Push `payload` (a full CTO response, `0xFF`/`0xFE`-prefixed) onto the
/// shared transport queue as one entry, the same path a DAQ sample takes -
/// the consumer assigns the real transport counter at `peek()` time rather
/// than the command's own echoed counter, giving one total order across
/// every response and sample (spec §5: "total order across producers given
/// by the consumer-assigned transport counter").
fn enqueue_response(queue: &Queue, payload: &[u8]) {
    match queue.acquire(payload.len()) {
        Some(mut buf) => {
            buf.payload_mut().copy_from_slice(payload);
            buf.commit(true);
        }
        None => warn!("transport queue full, dropping a command response"),
    }
}

/// Pop and send one ready segment, if any. Shared by the receive task's
/// post-dispatch drain and the transmit task's flush cycle.
fn drain_one_segment(consumer: &Mutex<crate::queue::QueueConsumer>, socket: &UdpSocket, addr: SocketAddr) -> bool {
    let mut consumer = consumer.lock();
    match consumer.peek(crate::protocol::codes::XCPTL_MAX_SEGMENT_SIZE) {
        Some((seg, bytes)) => {
            if let Err(e) = socket.send_to(bytes, addr) {
                warn!("failed to send transport segment to {addr}: {e}");
            }
            consumer.release(seg);
            true
        }
        None => false,
    }
}

fn udp_receive_loop(
    socket: UdpSocket,
    protocol: Arc<ProtocolEngine>,
    queue: Arc<Queue>,
    consumer: Arc<Mutex<crate::queue::QueueConsumer>>,
    shutdown: Arc<AtomicBool>,
    client_addr: Arc<RwLock<Option<SocketAddr>>>,
) {
    let mut buf = [0u8; crate::protocol::codes::MAX_CTO + TRANSPORT_HEADER_LEN];
    while !shutdown.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) if n >= TRANSPORT_HEADER_LEN => {
                *client_addr.write() = Some(from);
                let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
                if n < TRANSPORT_HEADER_LEN + len {
                    warn!("dropping truncated command packet from {from}");
                    continue;
                }
                let cmd = &buf[TRANSPORT_HEADER_LEN..TRANSPORT_HEADER_LEN + len];
                let response = protocol.dispatch(cmd);
                enqueue_response(&queue, &response);
                // Spec §4.6 item 1: drain once right after dispatch so
                // command latency doesn't wait on the transmit task's own
                // flush cycle.
                drain_one_segment(&consumer, &socket, from);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                error!("udp receive error: {e}");
                break;
            }
        }
    }
}

fn transmit_loop_udp(socket: UdpSocket, consumer: Arc<Mutex<crate::queue::QueueConsumer>>, shutdown: Arc<AtomicBool>, client_addr: Arc<RwLock<Option<SocketAddr>>>) {
    while !shutdown.load(Ordering::Acquire) {
        let sent = client_addr.read().map(|addr| drain_one_segment(&consumer, &socket, addr));
        if sent != Some(true) {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Joins `group` on `bind_addr`/`port` and answers every datagram that looks
/// like a `GET_DAQ_CLOCK` command with the same 32-bit timestamp payload
/// `ProtocolEngine::get_daq_clock` would produce, echoed back to the
/// multicast group. Optional transport feature (spec: "optional multicast");
/// failing to join never aborts server startup, only this one responder.
fn spawn_multicast_responder(group: Ipv4Addr, bind_addr: Ipv4Addr, port: u16, clock: Arc<Clock>, shutdown: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    socket.join_multicast_v4(&group, &bind_addr)?;
    socket.set_read_timeout(Some(Duration::from_millis(200)))?;
    Ok(thread::spawn(move || multicast_loop(socket, group, port, clock, shutdown)))
}

fn multicast_loop(socket: UdpSocket, group: Ipv4Addr, port: u16, clock: Arc<Clock>, shutdown: Arc<AtomicBool>) {
    let mut buf = [0u8; TRANSPORT_HEADER_LEN + 8];
    while !shutdown.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((n, _from)) if n >= TRANSPORT_HEADER_LEN + 1 && buf[TRANSPORT_HEADER_LEN] == crate::protocol::codes::CC_GET_DAQ_CLOCK => {
                let ctr = u16::from_le_bytes([buf[2], buf[3]]);
                let ts = clock.now_32();
                let payload = [crate::protocol::codes::RES_POSITIVE, 0, 0, 0, (ts & 0xFF) as u8, ((ts >> 8) & 0xFF) as u8, ((ts >> 16) & 0xFF) as u8, ((ts >> 24) & 0xFF) as u8];
                let framed = frame(ctr, &payload);
                if let Err(e) = socket.send_to(&framed, (group, port)) {
                    warn!("failed to send GET_DAQ_CLOCK_MULTICAST response: {e}");
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                error!("multicast receive error: {e}");
                break;
            }
        }
    }
}

fn tcp_loop(listener: TcpListener, protocol: Arc<ProtocolEngine>, queue: Arc<Queue>, shutdown: Arc<AtomicBool>, mut consumer: crate::queue::QueueConsumer) {
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                info!("XCP client connected from {addr}");
                handle_tcp_client(stream, &protocol, &queue, &shutdown, &mut consumer);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(10)),
            Err(e) => {
                error!("tcp accept error: {e}");
                break;
            }
        }
    }
}

fn handle_tcp_client(stream: TcpStream, protocol: &Arc<ProtocolEngine>, queue: &Arc<Queue>, shutdown: &Arc<AtomicBool>, consumer: &mut crate::queue::QueueConsumer) {
    use std::io::{Read, Write};
    let _ = stream.set_read_timeout(Some(Duration::from_millis(50)));
    let mut stream = stream;
    let mut header = [0u8; TRANSPORT_HEADER_LEN];
    while !shutdown.load(Ordering::Acquire) {
        match stream.read_exact(&mut header) {
            Ok(()) => {
                let len = u16::from_le_bytes([header[0], header[1]]) as usize;
                let mut cmd = vec![0u8; len];
                if stream.read_exact(&mut cmd).is_err() {
                    break;
                }
                let response = protocol.dispatch(&cmd);
                enqueue_response(queue, &response);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
            Err(_) => break,
        }
        if let Some((seg, bytes)) = consumer.peek(crate::protocol::codes::XCPTL_MAX_SEGMENT_SIZE) {
            if stream.write_all(bytes).is_err() {
                consumer.release(seg);
                break;
            }
            consumer.release(seg);
        }
    }
}
