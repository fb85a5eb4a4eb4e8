//! Transmitters and the transport layer seam
//!
//! A stream picks a [`TransmitterKind`]; the conference resolves that kind to a
//! [`Transport`] through its [`TransmitterRegistry`]. The transport is asked to
//! establish a set of remote candidates and answers per component.

use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    fmt,
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::dispatcher::EventSender;
use crate::model::candidate::{CandidateType, ComponentId, NetworkProtocol, TransportCandidate};
use crate::model::propagated::Propagated;
use crate::model::stream::StreamKey;

/// How a stream finds its remote endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmitterKind {
    /// Fixed multicast group, candidates are always forced.
    Multicast,
    /// Plain UDP to addresses learned out of band.
    RawUdp,
    /// Candidates discovered and exchanged at runtime.
    Nice,
}

impl TransmitterKind {
    /// Whether remote candidates may arrive incrementally.
    pub fn uses_discovery(&self) -> bool {
        !matches!(self, TransmitterKind::Multicast)
    }

    /// Components that must be covered before media can flow.
    pub fn required_components(&self) -> &'static [ComponentId] {
        &[ComponentId::Rtp, ComponentId::Rtcp]
    }
}

impl fmt::Display for TransmitterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmitterKind::Multicast => f.write_str("multicast"),
            TransmitterKind::RawUdp => f.write_str("rawudp"),
            TransmitterKind::Nice => f.write_str("nice"),
        }
    }
}

impl FromStr for TransmitterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "multicast" => Ok(TransmitterKind::Multicast),
            "rawudp" => Ok(TransmitterKind::RawUdp),
            "nice" => Ok(TransmitterKind::Nice),
            other => Err(format!("unknown transmitter '{other}'")),
        }
    }
}

/// Outcome of establishing one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    Ready,
    Failed,
}

/// The network side of a stream.
pub trait Transport: Send + Sync {
    /// Tries to set up transport towards `candidates` and reports, for each
    /// component touched, whether it is ready.
    fn establish(
        &self,
        key: &StreamKey,
        candidates: &[TransportCandidate],
    ) -> Vec<(ComponentId, ComponentState)>;

    /// Frees whatever was set up for `key`. Called when the stream goes away.
    fn release(&self, _key: &StreamKey) {}
}

/// Transports available to a conference, by transmitter kind.
#[derive(Default)]
pub struct TransmitterRegistry {
    transports: RwLock<HashMap<TransmitterKind, Arc<dyn Transport>>>,
}

impl TransmitterRegistry {
    pub fn new() -> TransmitterRegistry {
        TransmitterRegistry::default()
    }

    pub fn register(&self, kind: TransmitterKind, transport: Arc<dyn Transport>) {
        self.transports.write().insert(kind, transport);
    }

    pub fn get(&self, kind: TransmitterKind) -> Option<Arc<dyn Transport>> {
        self.transports.read().get(&kind).cloned()
    }

    pub fn contains(&self, kind: TransmitterKind) -> bool {
        self.transports.read().contains_key(&kind)
    }
}

/// Sockets are shared per local endpoint. Multicast candidates map to one
/// socket per (group, port) no matter how many streams force them; unicast
/// candidates get one socket per stream and remote address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PortKey {
    Multicast { group: IpAddr, port: u16 },
    Unicast { key: StreamKey, remote: SocketAddr },
}

impl PortKey {
    fn for_candidate(key: &StreamKey, candidate: &TransportCandidate) -> PortKey {
        if candidate.kind() == CandidateType::Multicast {
            PortKey::Multicast {
                group: candidate.ip(),
                port: candidate.port(),
            }
        } else {
            PortKey::Unicast {
                key: *key,
                remote: candidate.socket_addr(),
            }
        }
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKey::Multicast { group, port } => {
                write!(f, "multicast {}", SocketAddr::new(*group, *port))
            }
            PortKey::Unicast { key, remote } => write!(f, "unicast {} for {}", remote, key),
        }
    }
}

/// A bound socket and the streams using it. The port is closed once the last
/// stream releases it.
struct UdpPort {
    socket: UdpSocket,
    listeners: Arc<Mutex<HashSet<StreamKey>>>,
    shutdown: Arc<AtomicBool>,
    receiving: bool,
}

impl UdpPort {
    fn new(socket: UdpSocket) -> UdpPort {
        UdpPort {
            socket,
            listeners: Arc::new(Mutex::new(HashSet::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            receiving: false,
        }
    }
}

/// UDP transport.
///
/// Multicast candidates join their group on the candidate port with the
/// candidate ttl, other candidates get an ephemeral socket connected to the
/// remote address. When built with an [`EventSender`], every RTP port gets a
/// receiver thread that reports each new SSRC to every stream using the port.
pub struct UdpTransport {
    events: Option<EventSender>,
    ports: Mutex<HashMap<PortKey, UdpPort>>,
}

impl UdpTransport {
    pub fn new() -> UdpTransport {
        UdpTransport {
            events: None,
            ports: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_events(events: EventSender) -> UdpTransport {
        UdpTransport {
            events: Some(events),
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// Number of sockets currently held open.
    pub fn open_ports(&self) -> usize {
        self.ports.lock().len()
    }

    #[cfg(test)]
    fn local_port(&self, key: &StreamKey) -> Option<u16> {
        let ports = self.ports.lock();
        let port = ports.values().find(|p| p.listeners.lock().contains(key))?;
        port.socket.local_addr().ok().map(|a| a.port())
    }

    fn acquire(&self, key: &StreamKey, candidate: &TransportCandidate) -> io::Result<()> {
        let port_key = PortKey::for_candidate(key, candidate);
        let mut ports = self.ports.lock();

        let port = match ports.entry(port_key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let socket = bind(candidate)?;
                info!("Opened {}", port_key);
                entry.insert(UdpPort::new(socket))
            }
        };

        port.listeners.lock().insert(*key);

        if candidate.component() == ComponentId::Rtp && !port.receiving {
            if let Some(events) = &self.events {
                match port.socket.try_clone() {
                    Ok(socket) => {
                        spawn_receiver(
                            events.clone(),
                            port_key,
                            socket,
                            Arc::clone(&port.listeners),
                            Arc::clone(&port.shutdown),
                        );
                        port.receiving = true;
                    }
                    Err(e) => warn!("Cannot watch {}: {:?}", port_key, e),
                }
            }
        }

        Ok(())
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        UdpTransport::new()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        for port in self.ports.lock().values() {
            port.shutdown.store(true, Ordering::Relaxed);
        }
    }
}

impl Transport for UdpTransport {
    fn establish(
        &self,
        key: &StreamKey,
        candidates: &[TransportCandidate],
    ) -> Vec<(ComponentId, ComponentState)> {
        let mut outcome = vec![];

        for candidate in candidates {
            if candidate.protocol() == NetworkProtocol::Tcp {
                warn!("TCP candidates are not supported: {}", candidate);
                outcome.push((candidate.component(), ComponentState::Failed));
                continue;
            }

            match self.acquire(key, candidate) {
                Ok(()) => {
                    info!("Established {} for {}", candidate, key);
                    outcome.push((candidate.component(), ComponentState::Ready));
                }
                Err(e) => {
                    warn!("Cannot establish {}: {:?}", candidate, e);
                    outcome.push((candidate.component(), ComponentState::Failed));
                }
            }
        }

        outcome
    }

    fn release(&self, key: &StreamKey) {
        self.ports.lock().retain(|port_key, port| {
            let mut listeners = port.listeners.lock();
            if !listeners.remove(key) || !listeners.is_empty() {
                return true;
            }
            port.shutdown.store(true, Ordering::Relaxed);
            info!("Closed {}", port_key);
            false
        });
    }
}

fn bind(candidate: &TransportCandidate) -> io::Result<UdpSocket> {
    if candidate.kind() == CandidateType::Multicast {
        let socket = multicast_socket(candidate.ip(), candidate.ttl())?;
        let local = SocketAddr::new(unspecified(candidate.ip()), candidate.port());
        socket.bind(&local.into())?;
        match candidate.ip() {
            IpAddr::V4(group) => socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(group) => socket.join_multicast_v6(&group, 0)?,
        }
        return Ok(socket.into());
    }

    let socket = UdpSocket::bind(SocketAddr::new(unspecified(candidate.ip()), 0))?;
    socket.connect(candidate.socket_addr())?;
    Ok(socket)
}

/// An unbound socket that may share its port with other sockets and sends
/// with `ttl` as multicast ttl (IPv4) or hop limit (IPv6).
fn multicast_socket(group: IpAddr, ttl: u8) -> io::Result<Socket> {
    let domain = Domain::for_address(SocketAddr::new(group, 0));
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    match group {
        IpAddr::V4(_) => socket.set_multicast_ttl_v4(u32::from(ttl))?,
        IpAddr::V6(_) => socket.set_multicast_hops_v6(u32::from(ttl))?,
    }
    Ok(socket)
}

fn unspecified(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    }
}

fn spawn_receiver(
    events: EventSender,
    port: PortKey,
    socket: UdpSocket,
    listeners: Arc<Mutex<HashSet<StreamKey>>>,
    shutdown: Arc<AtomicBool>,
) {
    thread::spawn(move || {
        let mut seen: HashSet<(StreamKey, u32)> = HashSet::new();
        let mut buf = vec![0; 2000];

        if let Err(e) = socket.set_read_timeout(Some(Duration::from_millis(100))) {
            warn!("Cannot set read timeout for {}: {:?}", port, e);
            return;
        }

        while !shutdown.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((n, source)) => {
                    let Some((payload_type, ssrc)) = parse_rtp_header(&buf[..n]) else {
                        continue;
                    };
                    let keys: Vec<StreamKey> = listeners.lock().iter().copied().collect();
                    for key in keys {
                        if !seen.insert((key, ssrc)) {
                            continue;
                        }
                        debug!("New RTP source {:#010x} from {} for {}", ssrc, source, key);
                        let event = Propagated::SourceDiscovered {
                            key,
                            ssrc,
                            payload_type,
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => match e.kind() {
                    // Expected error for set_read_timeout(). One for windows, one for the rest.
                    ErrorKind::WouldBlock | ErrorKind::TimedOut => {}
                    _ => {
                        warn!("UDP receive failed on {}: {:?}", port, e);
                        return;
                    }
                },
            }
        }
        debug!("Receiver for {} stopped", port);
    });
}

/// Payload type and SSRC of an RTP packet. RTCP packets sharing the port are
/// ignored.
fn parse_rtp_header(packet: &[u8]) -> Option<(u8, u32)> {
    if packet.len() < 12 || packet[0] >> 6 != 2 {
        return None;
    }
    if (200..=204).contains(&packet[1]) {
        return None;
    }

    let payload_type = packet[1] & 0x7f;
    let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
    Some((payload_type, ssrc))
}
