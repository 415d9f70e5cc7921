//! EDI transports: UDP unicast/multicast, a TCP server fanning out to any
//! number of clients, and a reconnecting TCP client, all fed through the
//! time-spread scheduler that paces PFT fragments over the 24 ms frame
//! period.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, warn};

use super::pft::{Pft, PftError, PftSettings};

/// The spreader wakes at this period to transmit due fragments.
const SPREADER_TICK: Duration = Duration::from_micros(500);

/// Initial and maximum reconnect backoff of the TCP client.
const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(8);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("PFT: {0}")]
    Pft(#[from] PftError),

    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// UDP destination, unicast or multicast.
#[derive(Debug, Clone, Default)]
pub struct UdpDestination {
    pub dest_addr: String,
    pub dest_port: u16,
    /// Source interface address, needed for multicast sends.
    pub source_addr: Option<String>,
    pub source_port: u16,
    pub ttl: u32,
}

#[derive(Debug, Clone)]
pub struct TcpServerDestination {
    pub listen_port: u16,
    /// Per-client queue bound; a client that falls this far behind is
    /// disconnected.
    pub max_frames_queued: usize,
    /// Number of most recent transmission units replayed to a freshly
    /// connected client.
    pub preroll_buffers: usize,
}

#[derive(Debug, Clone)]
pub struct TcpClientDestination {
    pub dest_addr: String,
    pub dest_port: u16,
    pub max_frames_queued: usize,
}

#[derive(Debug, Clone)]
pub enum Destination {
    Udp(UdpDestination),
    TcpServer(TcpServerDestination),
    TcpClient(TcpClientDestination),
}

#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub destination: Destination,
    pub pft: PftSettings,
}

#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub verbose: bool,
    /// TAG packet alignment in bytes; 8 by default.
    pub tagpacket_alignment: usize,
    pub destinations: Vec<DestinationConfig>,
}

impl Configuration {
    pub fn enabled(&self) -> bool {
        !self.destinations.is_empty()
    }

    pub fn print(&self) {
        info!("EDI Output");
        for dest in &self.destinations {
            match &dest.destination {
                Destination::Udp(udp) => {
                    info!(" UDP to {}:{}", udp.dest_addr, udp.dest_port);
                    if let Some(source) = &udp.source_addr {
                        info!("  source      {}", source);
                        info!("  ttl         {}", udp.ttl);
                    }
                    info!("  source port {}", udp.source_port);
                }
                Destination::TcpServer(tcp) => {
                    info!(" TCP listening on port {}", tcp.listen_port);
                    info!("  max frames queued    {}", tcp.max_frames_queued);
                    info!("  preroll buffers      {}", tcp.preroll_buffers);
                }
                Destination::TcpClient(tcp) => {
                    info!(" TCP client connecting to {}:{}", tcp.dest_addr, tcp.dest_port);
                    info!("  max frames queued    {}", tcp.max_frames_queued);
                }
            }
            info!("  PFT={}", dest.pft.enable_pft);
            if dest.pft.enable_pft {
                info!("  FEC={}", dest.pft.fec);
                info!("  Chunk Len={}", dest.pft.chunk_len);
                info!(
                    "  Fragment spreading factor={}",
                    dest.pft.fragment_spreading_factor
                );
            }
        }
    }
}

trait SendPacket: Send {
    fn send_packet(&mut self, frame: &Bytes);
    fn info(&self) -> String;
}

// ------------------------------------------------------------------- UDP

struct UdpSender {
    socket: UdpSocket,
    dest: SocketAddr,
    info: String,
}

impl UdpSender {
    fn new(conf: &UdpDestination) -> Result<Self, TransportError> {
        let dest = (conf.dest_addr.as_str(), conf.dest_port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve(conf.dest_addr.clone()))?
            .next()
            .ok_or_else(|| TransportError::Resolve(conf.dest_addr.clone()))?;

        let socket = UdpSocket::bind(("0.0.0.0", conf.source_port))?;

        // Multicast interface and TTL must be set before the first send.
        if let IpAddr::V4(group) = dest.ip() {
            if group.is_multicast() {
                let source = match &conf.source_addr {
                    Some(addr) => addr
                        .parse::<Ipv4Addr>()
                        .map_err(|_| TransportError::Resolve(addr.clone()))?,
                    None => Ipv4Addr::UNSPECIFIED,
                };
                socket2::SockRef::from(&socket).set_multicast_if_v4(&source)?;
                socket.set_multicast_ttl_v4(conf.ttl)?;
            }
        }

        Ok(UdpSender {
            socket,
            dest,
            info: format!("udp://{}:{}", conf.dest_addr, conf.dest_port),
        })
    }
}

impl SendPacket for UdpSender {
    fn send_packet(&mut self, frame: &Bytes) {
        if let Err(e) = self.socket.send_to(frame, self.dest) {
            warn!("EDI UDP send to {} failed: {}", self.dest, e);
        }
    }

    fn info(&self) -> String {
        self.info.clone()
    }
}

// ------------------------------------------------------- TCP dispatcher

struct DispatcherInner {
    max_frames_queued: usize,
    preroll_capacity: usize,
    preroll: Mutex<VecDeque<Bytes>>,
    clients: Mutex<Vec<SyncSender<Bytes>>>,
}

/// TCP server fan-out: accepts any number of clients, replays the preroll
/// to each new one, and drops clients whose bounded queue overruns.
/// Also used for ETI-over-TCP output, which shares these semantics.
#[derive(Clone)]
pub struct TcpDispatcher {
    inner: Arc<DispatcherInner>,
    listen_port: u16,
}

impl TcpDispatcher {
    pub fn start(
        listen_port: u16,
        max_frames_queued: usize,
        preroll_buffers: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port))?;
        let listen_port = listener.local_addr()?.port();

        let inner = Arc::new(DispatcherInner {
            max_frames_queued: max_frames_queued.max(1),
            preroll_capacity: preroll_buffers,
            preroll: Mutex::new(VecDeque::new()),
            clients: Mutex::new(Vec::new()),
        });

        let accept_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name(format!("tcp-listen-{}", listen_port))
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => accept_client(&accept_inner, stream),
                        Err(e) => error!("TCP accept failed: {}", e),
                    }
                }
            })?;

        Ok(TcpDispatcher { inner, listen_port })
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn connected_clients(&self) -> usize {
        self.inner.clients.lock().unwrap().len()
    }

    pub fn write(&self, frame: Bytes) {
        {
            let mut preroll = self.inner.preroll.lock().unwrap();
            if self.inner.preroll_capacity > 0 {
                if preroll.len() == self.inner.preroll_capacity {
                    preroll.pop_front();
                }
                preroll.push_back(frame.clone());
            }
        }

        let mut clients = self.inner.clients.lock().unwrap();
        clients.retain(|client| match client.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("TCP client queue overrun, disconnecting");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

fn accept_client(inner: &Arc<DispatcherInner>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_owned());
    info!("TCP client {} connected", peer);

    let (tx, rx) = sync_channel::<Bytes>(inner.max_frames_queued);

    // Replay the preroll before any live frame; the preroll is a raw FIFO
    // of the last transmitted units, indifferent to sequence numbers.
    {
        let preroll = inner.preroll.lock().unwrap();
        for frame in preroll.iter() {
            if tx.try_send(frame.clone()).is_err() {
                break;
            }
        }
    }

    inner.clients.lock().unwrap().push(tx);

    thread::Builder::new()
        .name(format!("tcp-client-{}", peer))
        .spawn(move || {
            let mut stream = stream;
            while let Ok(frame) = rx.recv() {
                if let Err(e) = stream.write_all(&frame) {
                    info!("TCP client {} write failed: {}", peer, e);
                    return;
                }
            }
            // channel closed: we were disconnected by the dispatcher
        })
        .ok();
}

struct TcpDispatcherSender {
    dispatcher: TcpDispatcher,
}

impl SendPacket for TcpDispatcherSender {
    fn send_packet(&mut self, frame: &Bytes) {
        self.dispatcher.write(frame.clone());
    }

    fn info(&self) -> String {
        format!("tcp-server://:{}", self.dispatcher.listen_port())
    }
}

// ------------------------------------------------------------ TCP client

struct TcpClientSender {
    dest_addr: String,
    dest_port: u16,
    stream: Option<TcpStream>,
    queue: VecDeque<Bytes>,
    max_frames_queued: usize,
    last_attempt: Option<Instant>,
    backoff: Duration,
}

impl TcpClientSender {
    fn new(conf: &TcpClientDestination) -> Self {
        TcpClientSender {
            dest_addr: conf.dest_addr.clone(),
            dest_port: conf.dest_port,
            stream: None,
            queue: VecDeque::new(),
            max_frames_queued: conf.max_frames_queued.max(1),
            last_attempt: None,
            backoff: RECONNECT_BACKOFF_MIN,
        }
    }

    fn try_connect(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < self.backoff {
                return;
            }
        }
        self.last_attempt = Some(now);

        match TcpStream::connect((self.dest_addr.as_str(), self.dest_port)) {
            Ok(stream) => {
                info!("EDI TCP connected to {}:{}", self.dest_addr, self.dest_port);
                self.stream = Some(stream);
                self.backoff = RECONNECT_BACKOFF_MIN;
            }
            Err(e) => {
                debug!(
                    "EDI TCP connect to {}:{} failed: {}, retrying in {:?}",
                    self.dest_addr, self.dest_port, e, self.backoff
                );
                self.backoff = (self.backoff * 2).min(RECONNECT_BACKOFF_MAX);
            }
        }
    }
}

impl SendPacket for TcpClientSender {
    fn send_packet(&mut self, frame: &Bytes) {
        self.queue.push_back(frame.clone());
        while self.queue.len() > self.max_frames_queued {
            self.queue.pop_front();
        }

        if self.stream.is_none() {
            self.try_connect();
        }

        let mut failed = false;
        if let Some(stream) = &mut self.stream {
            while let Some(frame) = self.queue.front() {
                match stream.write_all(frame) {
                    Ok(()) => {
                        self.queue.pop_front();
                    }
                    Err(e) => {
                        warn!(
                            "EDI TCP write to {}:{} failed: {}",
                            self.dest_addr, self.dest_port, e
                        );
                        failed = true;
                        break;
                    }
                }
            }
        }
        if failed {
            self.stream = None;
        }
    }

    fn info(&self) -> String {
        format!("tcp-client://{}:{}", self.dest_addr, self.dest_port)
    }
}

// --------------------------------------------------------- the spreader

/// Pending fragments keyed by transmission deadline. The tiebreak counter
/// keeps fragments with equal deadlines distinct and in insertion order.
type PendingMap = BTreeMap<(Instant, u64), Bytes>;

struct Spreader {
    pft: Mutex<Pft>,
    pending: Mutex<PendingMap>,
    insert_counter: AtomicU64,
    sender: Mutex<Box<dyn SendPacket>>,
    verbose: bool,
    last_num_fragments: AtomicU64,
}

impl Spreader {
    fn new(pft: Pft, sender: Box<dyn SendPacket>, verbose: bool) -> Self {
        Spreader {
            pft: Mutex::new(pft),
            pending: Mutex::new(BTreeMap::new()),
            insert_counter: AtomicU64::new(0),
            sender: Mutex::new(sender),
            verbose,
            last_num_fragments: AtomicU64::new(0),
        }
    }

    /// Queue one AF packet; actual transmission happens on the spreader
    /// tick.
    fn send_af_packet(&self, af_packet: &Bytes) -> Result<(), TransportError> {
        let now = Instant::now();
        let mut pft = self.pft.lock().unwrap();

        if pft.is_enabled() {
            let fragments = pft.assemble(af_packet)?;

            if self.verbose
                && self.last_num_fragments.swap(fragments.len() as u64, Ordering::Relaxed)
                    != fragments.len() as u64
            {
                debug!("EDI Output: Number of PFT fragments {}", fragments.len());
            }

            // Spread transmission over part of the frame duration to
            // reduce the risk of losing a whole burst to congestion.
            let mut interval = Duration::from_micros(1);
            if fragments.len() > 1 && pft.spreading_factor() > 0.0 {
                interval = Duration::from_micros(
                    (pft.spreading_factor() * 24_000.0 / fragments.len() as f64).round() as u64,
                );
            }

            let mut pending = self.pending.lock().unwrap();
            let mut tp = now;
            for fragment in fragments {
                let seq = self.insert_counter.fetch_add(1, Ordering::Relaxed);
                pending.insert((tp, seq), Bytes::from(fragment));
                tp += interval;
            }
        } else {
            let seq = self.insert_counter.fetch_add(1, Ordering::Relaxed);
            self.pending
                .lock()
                .unwrap()
                .insert((now, seq), af_packet.clone());
        }

        Ok(())
    }

    /// Transmit every pending fragment whose deadline has passed.
    fn tick(&self, now: Instant) {
        let due: Vec<Bytes> = {
            let mut pending = self.pending.lock().unwrap();
            let later = pending.split_off(&(now, u64::MAX));
            let due = std::mem::replace(&mut *pending, later);
            due.into_values().collect()
        };

        if !due.is_empty() {
            let mut sender = self.sender.lock().unwrap();
            for fragment in due {
                sender.send_packet(&fragment);
            }
        }
    }

    fn drain(&self) {
        let remaining: Vec<Bytes> = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending).into_values().collect()
        };
        let mut sender = self.sender.lock().unwrap();
        for fragment in remaining {
            sender.send_packet(&fragment);
        }
    }
}

// --------------------------------------------------------------- Sender

/// The EDI output: one spreader per destination and the 500 µs tick
/// thread draining them.
pub struct Sender {
    spreaders: Vec<Arc<Spreader>>,
    running: Arc<AtomicBool>,
    tick_thread: Option<thread::JoinHandle<()>>,
}

impl Sender {
    pub fn new(conf: &Configuration) -> Result<Self, TransportError> {
        let mut spreaders = Vec::with_capacity(conf.destinations.len());

        for dest in &conf.destinations {
            let sender: Box<dyn SendPacket> = match &dest.destination {
                Destination::Udp(udp) => Box::new(UdpSender::new(udp)?),
                Destination::TcpServer(tcp) => Box::new(TcpDispatcherSender {
                    dispatcher: TcpDispatcher::start(
                        tcp.listen_port,
                        tcp.max_frames_queued,
                        tcp.preroll_buffers,
                    )?,
                }),
                Destination::TcpClient(tcp) => Box::new(TcpClientSender::new(tcp)),
            };

            let pft = Pft::new(dest.pft.clone())?;
            spreaders.push(Arc::new(Spreader::new(pft, sender, conf.verbose)));
        }

        let running = Arc::new(AtomicBool::new(true));

        let tick_running = Arc::clone(&running);
        let tick_spreaders = spreaders.clone();
        let tick_thread = thread::Builder::new()
            .name("edi-spreader".to_owned())
            .spawn(move || {
                while tick_running.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    for spreader in &tick_spreaders {
                        spreader.tick(now);
                    }
                    thread::sleep(SPREADER_TICK);
                }
                // cooperative shutdown: flush what is still pending, once
                for spreader in &tick_spreaders {
                    spreader.drain();
                }
            })?;

        if conf.verbose {
            info!("EDI output set up");
        }

        Ok(Sender {
            spreaders,
            running,
            tick_thread: Some(tick_thread),
        })
    }

    /// Hand one AF packet to every destination.
    pub fn write_af_packet(&self, af_packet: &Bytes) {
        for spreader in &self.spreaders {
            if let Err(e) = spreader.send_af_packet(af_packet) {
                error!("EDI send failed: {}", e);
            }
        }
    }

    pub fn override_pft_sequence(&self, pseq: u16) {
        for spreader in &self.spreaders {
            spreader.pft.lock().unwrap().override_pseq(pseq);
        }
    }

    pub fn destinations_info(&self) -> Vec<String> {
        self.spreaders
            .iter()
            .map(|s| s.sender.lock().unwrap().info())
            .collect()
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.tick_thread.take() {
            let _ = handle.join();
        }
    }
}
