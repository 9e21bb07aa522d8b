/// STUN client used to learn the public address of a SIP socket
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::message::{parse_binding_response, BindingRequest, StunError};

/// Resolves the address a socket is seen as from the outside
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StunResolver: Send + Sync {
    /// Run a binding request on `socket` against `server`. The socket must
    /// not have a receive loop attached yet.
    async fn mapped_address(&self, socket: &UdpSocket, server: &str) -> Result<SocketAddr, StunError>;
}

/// RFC 5389 binding over UDP with a few retransmissions
#[derive(Debug, Clone)]
pub struct StunClient {
    timeout: Duration,
    attempts: u32,
    software: String,
}

impl StunClient {
    pub fn new(software: &str) -> Self {
        Self {
            timeout: Duration::from_millis(500),
            attempts: 3,
            software: software.to_string(),
        }
    }

    /// Per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn resolve_server(server: &str) -> Result<SocketAddr, StunError> {
        let target = if server.contains(':') {
            server.to_string()
        } else {
            format!("{}:3478", server)
        };
        let found = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| StunError::Io(format!("cannot resolve {}: {}", target, e)))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| StunError::Io(format!("no IPv4 address for {}", target)));
        found
    }
}

#[async_trait]
impl StunResolver for StunClient {
    async fn mapped_address(&self, socket: &UdpSocket, server: &str) -> Result<SocketAddr, StunError> {
        let server_addr = Self::resolve_server(server).await?;
        info!("Performing STUN binding request to {}", server_addr);

        let request = BindingRequest::new().with_software(&self.software);
        let bytes = request.to_bytes();
        let mut buffer = [0u8; 1500];

        for attempt in 1..=self.attempts {
            socket
                .send_to(&bytes, server_addr)
                .await
                .map_err(|e| StunError::Io(e.to_string()))?;

            match tokio::time::timeout(self.timeout, socket.recv_from(&mut buffer)).await {
                Ok(Ok((size, from))) if from == server_addr => {
                    let mapped = parse_binding_response(&buffer[..size], &request)?;
                    info!("Discovered public address: {}", mapped);
                    return Ok(mapped);
                }
                Ok(Ok((_, from))) => {
                    debug!("Ignoring datagram from {} during STUN binding", from);
                }
                Ok(Err(e)) => return Err(StunError::Io(e.to_string())),
                Err(_) => {
                    warn!(attempt, "STUN request to {} timed out", server_addr);
                }
            }
        }

        Err(StunError::Timeout(server_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::stun::message::MAGIC_COOKIE;
    use std::net::Ipv4Addr;

    /// Minimal STUN server answering one request with the sender's address
    async fn spawn_server() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (size, from) = socket.recv_from(&mut buf).await.unwrap();
            assert!(size >= 20);

            let ip = match from.ip() {
                std::net::IpAddr::V4(ip) => u32::from(ip),
                _ => u32::from(Ipv4Addr::LOCALHOST),
            };
            let mut resp = vec![0x01, 0x01, 0x00, 0x0C];
            resp.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
            resp.extend_from_slice(&buf[8..20]);
            resp.extend_from_slice(&[0x00, 0x20, 0x00, 0x08, 0x00, 0x01]);
            resp.extend_from_slice(&(from.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
            resp.extend_from_slice(&(ip ^ MAGIC_COOKIE).to_be_bytes());
            socket.send_to(&resp, from).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_binding_against_local_server() {
        let server = spawn_server().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();

        let client = StunClient::new("voiplink");
        let mapped = client
            .mapped_address(&socket, &server.to_string())
            .await
            .unwrap();
        assert_eq!(mapped, local);
    }

    #[tokio::test]
    async fn test_server_without_port_uses_3478() {
        let addr = StunClient::resolve_server("127.0.0.1").await.unwrap();
        assert_eq!(addr, "127.0.0.1:3478".parse().unwrap());
    }

    #[tokio::test]
    async fn test_timeout_without_server() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let client = StunClient::new("voiplink").with_timeout(Duration::from_millis(20));
        let result = client
            .mapped_address(&socket, &silent.local_addr().unwrap().to_string())
            .await;
        assert!(matches!(result, Err(StunError::Timeout(_))));
    }
}
