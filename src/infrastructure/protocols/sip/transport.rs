//! SIP transport layer - UDP sockets, TLS client connections and the
//! manager that owns them

use super::message::{SipError, SipMessage};
use crate::infrastructure::protocols::stun::{is_stun_packet, StunError, StunResolver};
use crate::infrastructure::tls::TlsConfig;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpSocket, UdpSocket};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tls,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tls => "TLS",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Udp => 5060,
            TransportProtocol::Tls => 5061,
        }
    }

    /// Reliable transports need no retransmissions
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportProtocol::Tls)
    }
}

/// A signalling transport messages are sent over
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SipTransport: Send + Sync {
    async fn send(&self, data: &[u8], destination: SocketAddr) -> Result<(), SipError>;

    /// Address the socket is bound to, with the interface IP filled in
    fn local_addr(&self) -> SocketAddr;

    /// Address peers see: STUN-mapped when available, local otherwise
    fn public_addr(&self) -> SocketAddr;

    fn protocol(&self) -> TransportProtocol;

    /// Why the STUN lookup for this transport failed, if it did
    fn stun_failure(&self) -> Option<StunError> {
        None
    }
}

/// Incoming SIP message with source information
#[derive(Clone)]
pub struct InboundMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub transport: Arc<dyn SipTransport>,
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("message", &self.message)
            .field("source", &self.source)
            .field("protocol", &self.transport.protocol())
            .finish()
    }
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    public: SocketAddr,
    stun_failure: Option<StunError>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind on `ip:port`. An unspecified `bind_ip` listens everywhere and
    /// advertises `advertised_ip`.
    pub async fn bind(bind_ip: IpAddr, advertised_ip: IpAddr, port: u16) -> Result<Self, SipError> {
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, port))
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let bound = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))?;
        let local = SocketAddr::new(advertised_ip, bound.port());

        info!("UDP transport listening on {}", bound);
        Ok(Self {
            socket: Arc::new(socket),
            local,
            public: local,
            stun_failure: None,
            task: StdMutex::new(None),
        })
    }

    /// Learn the public address through STUN. Must run before `start`
    /// since the binding response arrives on the same socket.
    pub async fn discover_public(&mut self, resolver: &dyn StunResolver, server: &str) {
        match resolver.mapped_address(&self.socket, server).await {
            Ok(mapped) => {
                info!(local = %self.local, public = %mapped, "STUN mapping found");
                self.public = mapped;
            }
            Err(e) => {
                warn!("STUN lookup via {} failed, using local address: {}", server, e);
                self.stun_failure = Some(e);
            }
        }
    }

    /// Spawn the receive loop feeding `tx`
    pub fn start(self: &Arc<Self>, tx: mpsc::Sender<InboundMessage>) {
        let transport = Arc::clone(self);
        let handle = tokio::spawn(async move {
            transport.receive_loop(tx).await;
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
            info!("Stopped UDP transport on {}", self.local);
        }
    }

    async fn receive_loop(self: Arc<Self>, tx: mpsc::Sender<InboundMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    let data = &buf[..size];
                    if is_stun_packet(data) || data.iter().all(|b| b.is_ascii_whitespace()) {
                        debug!("Ignoring keep-alive or STUN datagram from {}", source);
                        continue;
                    }
                    debug!("Received {} bytes from {} via UDP", size, source);

                    match SipMessage::parse(data) {
                        Ok(message) => {
                            let incoming = InboundMessage {
                                message,
                                source,
                                transport: self.clone(),
                            };

                            if let Err(e) = tx.send(incoming).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    // ICMP unreachable surfaces here on some platforms
                    warn!("Failed to receive UDP packet: {}", e);
                }
            }
        }
    }
}

#[async_trait]
impl SipTransport for UdpTransport {
    async fn send(&self, data: &[u8], destination: SocketAddr) -> Result<(), SipError> {
        debug!("Sending {} bytes to {} via UDP", data.len(), destination);
        self.socket
            .send_to(data, destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn public_addr(&self) -> SocketAddr {
        self.public
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn stun_failure(&self) -> Option<StunError> {
        self.stun_failure.clone()
    }
}

/// TLS client connection to one server
pub struct TlsTransport {
    writer: Mutex<WriteHalf<TlsStream<tokio::net::TcpStream>>>,
    local: SocketAddr,
    server: SocketAddr,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl TlsTransport {
    pub async fn connect(
        local_ip: IpAddr,
        server: SocketAddr,
        server_name: &str,
        config: &TlsConfig,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Result<Arc<Self>, SipError> {
        let client_config = config
            .client_config()
            .map_err(|e| SipError::TransportError(e.to_string()))?;
        let connector = TlsConnector::from(client_config);
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| SipError::TransportError(format!("Invalid server name: {}", e)))?;

        let connect = async {
            let socket = match server {
                SocketAddr::V4(_) => TcpSocket::new_v4(),
                SocketAddr::V6(_) => TcpSocket::new_v6(),
            };
            let socket = socket.map_err(|e| SipError::TransportError(e.to_string()))?;
            if !local_ip.is_unspecified() {
                socket
                    .bind(SocketAddr::new(local_ip, 0))
                    .map_err(|e| SipError::TransportError(e.to_string()))?;
            }
            let stream = socket.connect(server).await.map_err(|e| {
                SipError::TransportError(format!("Failed to connect to {}: {}", server, e))
            })?;
            let local = stream
                .local_addr()
                .map_err(|e| SipError::TransportError(e.to_string()))?;
            let tls = connector.connect(name, stream).await.map_err(|e| {
                SipError::TransportError(format!("TLS handshake with {} failed: {}", server, e))
            })?;
            Ok::<_, SipError>((local, tls))
        };

        let (local, tls) = tokio::time::timeout(Duration::from_secs(config.handshake_timeout), connect)
            .await
            .map_err(|_| SipError::TransportError(format!("TLS connect to {} timed out", server)))??;
        info!("TLS transport connected {} -> {}", local, server);

        let (reader, writer) = tokio::io::split(tls);
        let transport = Arc::new(Self {
            writer: Mutex::new(writer),
            local: SocketAddr::new(local_ip, local.port()),
            server,
            task: StdMutex::new(None),
        });

        let reader_transport = Arc::clone(&transport);
        let handle = tokio::spawn(async move {
            reader_transport.receive_loop(reader, tx).await;
        });
        *transport.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(transport)
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
            info!("Closed TLS transport to {}", self.server);
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut reader: ReadHalf<TlsStream<tokio::net::TcpStream>>,
        tx: mpsc::Sender<InboundMessage>,
    ) {
        let mut buf = BytesMut::with_capacity(8192);

        loop {
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    info!("TLS connection closed by {}", self.server);
                    break;
                }
                Ok(_) => {
                    for frame in drain_sip_frames(&mut buf) {
                        match SipMessage::parse(&frame) {
                            Ok(message) => {
                                let incoming = InboundMessage {
                                    message,
                                    source: self.server,
                                    transport: self.clone(),
                                };
                                if tx.send(incoming).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("Failed to parse SIP message from {}: {}", self.server, e),
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to read from TLS connection: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl SipTransport for TlsTransport {
    async fn send(&self, data: &[u8], destination: SocketAddr) -> Result<(), SipError> {
        if destination != self.server {
            debug!(
                "TLS connection to {} used for {}, sending on the connection",
                self.server, destination
            );
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send TLS data: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to flush TLS stream: {}", e)))?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn public_addr(&self) -> SocketAddr {
        self.local
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Tls
    }
}

/// Split complete SIP messages off a stream buffer. A bare CRLF keep-alive
/// clears the buffer.
pub fn drain_sip_frames(buf: &mut BytesMut) -> Vec<Bytes> {
    let mut frames = Vec::new();
    loop {
        // Handle CRLF keep-alive pings
        if buf.len() <= 4 && buf.iter().all(|b| *b == b'\r' || *b == b'\n') {
            buf.clear();
            break;
        }

        let head_end = match buf.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => pos,
            None => break,
        };

        let content_length = parse_content_length(&buf[..head_end]);
        let needed = head_end + 4 + content_length.unwrap_or(0);
        if buf.len() < needed {
            break;
        }

        frames.push(buf.split_to(needed).freeze());
    }
    frames
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Address of a configured interface: an IP literal, or "default" for the
/// address of the outgoing route.
pub async fn resolve_local_ip(interface: &str) -> Result<IpAddr, SipError> {
    let interface = interface.trim();
    if interface.is_empty() || interface.eq_ignore_ascii_case("default") {
        return Ok(default_route_ip().await);
    }
    interface.parse::<IpAddr>().map_err(|_| {
        SipError::TransportError(format!(
            "Interface '{}' is not an IP address; named interfaces are not supported",
            interface
        ))
    })
}

/// Local address the kernel picks for an outgoing route. Connecting a UDP
/// socket sends nothing.
async fn default_route_ip() -> IpAddr {
    let probe = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect("8.8.8.8:53").await.ok()?;
        socket.local_addr().ok().map(|addr| addr.ip())
    };
    match probe.await {
        Some(ip) if !ip.is_unspecified() => ip,
        _ => {
            warn!("No default route, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Resolve `host[:port]` to a socket address
pub async fn resolve_target(host_port: &str, default_port: u16) -> Result<SocketAddr, SipError> {
    if let Ok(addr) = host_port.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let target = if host_port.contains(':') {
        host_port.to_string()
    } else {
        format!("{}:{}", host_port, default_port)
    };
    let found = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| SipError::TransportError(format!("Cannot resolve {}: {}", target, e)))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| SipError::TransportError(format!("No IPv4 address for {}", target)));
    found
}

/// Owns every transport, keyed by interface and port. Accounts sharing an
/// interface and port share the UDP socket.
pub struct TransportManager {
    udp: RwLock<HashMap<(String, u16), Arc<UdpTransport>>>,
    tls: RwLock<HashMap<(String, SocketAddr), Arc<TlsTransport>>>,
    inbound: mpsc::Sender<InboundMessage>,
    stun: Arc<dyn StunResolver>,
    tls_config: TlsConfig,
}

impl TransportManager {
    pub fn new(
        inbound: mpsc::Sender<InboundMessage>,
        stun: Arc<dyn StunResolver>,
        tls_config: TlsConfig,
    ) -> Self {
        Self {
            udp: RwLock::new(HashMap::new()),
            tls: RwLock::new(HashMap::new()),
            inbound,
            stun,
            tls_config,
        }
    }

    /// UDP transport for `interface:port`, created on first use. A STUN
    /// server only applies when the transport is created.
    pub async fn udp_transport(
        &self,
        interface: &str,
        port: u16,
        stun_server: Option<&str>,
    ) -> Result<Arc<dyn SipTransport>, SipError> {
        let key = (interface.to_string(), port);
        if let Some(existing) = self.udp.read().await.get(&key) {
            return Ok(existing.clone());
        }

        let mut transports = self.udp.write().await;
        if let Some(existing) = transports.get(&key) {
            return Ok(existing.clone());
        }

        let advertised = resolve_local_ip(interface).await?;
        let bind_ip = if interface.parse::<IpAddr>().is_ok() {
            advertised
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };

        let mut transport = UdpTransport::bind(bind_ip, advertised, port).await?;
        if let Some(server) = stun_server.filter(|s| !s.is_empty()) {
            transport.discover_public(self.stun.as_ref(), server).await;
        }

        let transport = Arc::new(transport);
        transport.start(self.inbound.clone());
        transports.insert(key, transport.clone());
        Ok(transport)
    }

    /// TLS connection from `interface` to `server`, reused while it lives
    pub async fn tls_transport(
        &self,
        interface: &str,
        server_host: &str,
        server: SocketAddr,
    ) -> Result<Arc<dyn SipTransport>, SipError> {
        let key = (interface.to_string(), server);
        if let Some(existing) = self.tls.read().await.get(&key) {
            return Ok(existing.clone());
        }

        let local_ip = resolve_local_ip(interface).await?;
        let name = self.tls_config.server_name_for(server_host);
        let transport = TlsTransport::connect(
            local_ip,
            server,
            &name,
            &self.tls_config,
            self.inbound.clone(),
        )
        .await?;

        self.tls.write().await.insert(key, transport.clone());
        Ok(transport)
    }

    pub async fn transport_count(&self) -> usize {
        self.udp.read().await.len() + self.tls.read().await.len()
    }

    /// Stop every receive loop and forget the transports
    pub async fn shutdown(&self) {
        for (_, transport) in self.udp.write().await.drain() {
            transport.stop();
        }
        for (_, transport) in self.tls.write().await.drain() {
            transport.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::stun::client::MockStunResolver;

    const OPTIONS: &[u8] = b"OPTIONS sip:bob@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5999;branch=z9hG4bKopt\r\n\
From: <sip:alice@127.0.0.1>;tag=1\r\n\
To: <sip:bob@127.0.0.1>\r\n\
Call-ID: opt-1\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n";

    fn manager(stun: MockStunResolver) -> (TransportManager, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (
            TransportManager::new(tx, Arc::new(stun), TlsConfig::default()),
            rx,
        )
    }

    #[tokio::test]
    async fn test_udp_receive_loop_delivers_messages() {
        let (manager, mut rx) = manager(MockStunResolver::new());
        let transport = manager.udp_transport("127.0.0.1", 0, None).await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender.send_to(b"\r\n\r\n", transport.local_addr()).await.unwrap();
        sender.send_to(OPTIONS, transport.local_addr()).await.unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(inbound.message.is_request());
        assert_eq!(inbound.source, sender.local_addr().unwrap());
        assert_eq!(inbound.transport.protocol(), TransportProtocol::Udp);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_resolve_target_applies_default_port() {
        let addr = resolve_target("127.0.0.1", 5061).await.unwrap();
        assert_eq!(addr, "127.0.0.1:5061".parse().unwrap());
        let addr = resolve_target("192.0.2.7:5070", 5061).await.unwrap();
        assert_eq!(addr.port(), 5070);
    }

    #[tokio::test]
    async fn test_transports_are_shared_per_interface_and_port() {
        let (manager, _rx) = manager(MockStunResolver::new());
        let first = manager.udp_transport("127.0.0.1", 0, None).await.unwrap();
        let second = manager.udp_transport("127.0.0.1", 0, None).await.unwrap();
        assert_eq!(first.local_addr(), second.local_addr());
        assert_eq!(manager.transport_count().await, 1);
    }

    #[tokio::test]
    async fn test_stun_mapping_becomes_public_address() {
        let mut stun = MockStunResolver::new();
        stun.expect_mapped_address()
            .returning(|_, _| Ok("203.0.113.9:40000".parse().unwrap()));
        let (manager, _rx) = manager(stun);

        let transport = manager
            .udp_transport("127.0.0.1", 0, Some("stun.example.com"))
            .await
            .unwrap();
        assert_eq!(transport.public_addr(), "203.0.113.9:40000".parse().unwrap());
        assert!(transport.stun_failure().is_none());
    }

    #[tokio::test]
    async fn test_stun_failure_falls_back_to_local() {
        let mut stun = MockStunResolver::new();
        stun.expect_mapped_address()
            .returning(|_, _| Err(StunError::NoMappedAddress));
        let (manager, _rx) = manager(stun);

        let transport = manager
            .udp_transport("127.0.0.1", 0, Some("stun.example.com"))
            .await
            .unwrap();
        assert_eq!(transport.public_addr(), transport.local_addr());
        assert_eq!(transport.stun_failure(), Some(StunError::NoMappedAddress));
    }

    #[tokio::test]
    async fn test_named_interface_is_rejected() {
        assert!(resolve_local_ip("eth0").await.is_err());
        assert_eq!(
            resolve_local_ip("127.0.0.1").await.unwrap(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
    }

    #[test]
    fn test_drain_frames_with_bodies() {
        let msg1 = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 4\r\n\r\nbody";
        let msg2 = b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n";
        let payload = [msg1.as_slice(), msg2.as_slice()].concat();
        let mut buf = BytesMut::from(&payload[..]);

        let frames = drain_sip_frames(&mut buf);
        assert_eq!(frames.len(), 2);
        assert!(buf.is_empty());
        assert_eq!(frames[0].as_ref(), msg1);
        assert_eq!(frames[1].as_ref(), msg2);
    }

    #[test]
    fn test_partial_body_stays_buffered() {
        let mut buf = BytesMut::from(&b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 5\r\n\r\nhi"[..]);
        assert!(drain_sip_frames(&mut buf).is_empty());
        assert!(!buf.is_empty());

        let mut keep_alive = BytesMut::from(&b"\r\n\r\n"[..]);
        assert!(drain_sip_frames(&mut keep_alive).is_empty());
        assert!(keep_alive.is_empty());
    }
}
