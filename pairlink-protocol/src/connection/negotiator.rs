//! Connection Negotiator
//!
//! Turns a raw byte stream into an authenticated link to a known device
//! identity. The handshake on the connection channel is:
//!
//! 1. The client writes its identity packet as one plaintext line.
//! 2. The server reads that line byte-by-byte, so that no TLS bytes are
//!    pulled off the socket, and checks the role rule and the protocol version.
//! 3. TLS handshake, client and server as assigned by [`determine_role`].
//! 4. Both sides exchange identity packets again over TLS. The server checks
//!    the encrypted identity against the plaintext one, the client checks it
//!    against the identity it discovered.
//! 5. The peer certificate fingerprint is classified through the
//!    [`TrustStore`].
//!
//! A trust violation tears the connection down before anything else is read
//! or written.

use super::role::{determine_role, TlsRole};
use crate::codec::{read_line_unbuffered, PacketStream};
use crate::transport::tls::{peer_fingerprint, server_name_for};
use crate::transport::{AsyncStream, BoxedStream, TlsConfig, TransportAddress};
use crate::trust::TrustStore;
use crate::{DeviceInfo, Fingerprint, Packet, ProtocolError, Result};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Default connection port range
pub const DEFAULT_PORT_RANGE: (u16, u16) = (1739, 1764);

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for each handshake step
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection listener and handshake configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Address the listener binds to
    pub bind_addr: IpAddr,
    /// Inclusive port range; the first free port is used. `(0, 0)` binds an
    /// ephemeral port.
    pub port_range: (u16, u16),
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Timeout for each handshake step
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: DEFAULT_PORT_RANGE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Loopback listener on an ephemeral port
    pub fn loopback() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_range: (0, 0),
            ..Default::default()
        }
    }
}

/// Bind the connection listener on the first free port of the range
pub async fn bind_listener(config: &ConnectionConfig) -> Result<TcpListener> {
    let (start, end) = config.port_range;
    let mut last_error = None;

    for port in start..=end {
        match TcpListener::bind((config.bind_addr, port)).await {
            Ok(listener) => {
                info!(
                    "Connection listener bound to {}",
                    listener.local_addr().map_err(ProtocolError::from)?
                );
                return Ok(listener);
            }
            Err(e) => {
                debug!("Port {} unavailable: {}", port, e);
                last_error = Some(e);
            }
        }
    }

    Err(ProtocolError::Transport(format!(
        "no free port in range {}-{}{}",
        start,
        end,
        last_error
            .map(|e| format!(" (last error: {})", e))
            .unwrap_or_default()
    )))
}

/// A handshaken, identified link that has not been handed to a session yet
pub struct EstablishedLink {
    /// Identity the peer sent over TLS
    pub peer: DeviceInfo,
    /// Fingerprint of the certificate the peer presented
    pub fingerprint: Fingerprint,
    /// Role the local device took in the TLS handshake
    pub role: TlsRole,
    pub address: TransportAddress,
    pub stream: PacketStream<BoxedStream>,
}

impl fmt::Debug for EstablishedLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedLink")
            .field("peer", &self.peer.device_id)
            .field("fingerprint", &self.fingerprint)
            .field("role", &self.role)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful negotiation
#[derive(Debug)]
pub enum Negotiated {
    /// The peer presented its trusted certificate
    Ready(EstablishedLink),
    /// No trusted record exists; the link must go through pairing
    PairingRequired(EstablishedLink),
}

impl Negotiated {
    pub fn link(&self) -> &EstablishedLink {
        match self {
            Negotiated::Ready(link) | Negotiated::PairingRequired(link) => link,
        }
    }

    pub fn into_link(self) -> EstablishedLink {
        match self {
            Negotiated::Ready(link) | Negotiated::PairingRequired(link) => link,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Negotiated::Ready(_))
    }
}

async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| ProtocolError::Timeout(format!("{} took longer than {:?}", what, limit)))?
}

/// Performs the connection handshake for the local device
pub struct Negotiator {
    local: DeviceInfo,
    tls: TlsConfig,
    trust: Arc<TrustStore>,
    config: ConnectionConfig,
}

impl Negotiator {
    pub fn new(
        local: DeviceInfo,
        tls: TlsConfig,
        trust: Arc<TrustStore>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            local,
            tls,
            trust,
            config,
        }
    }

    /// Identity this negotiator presents
    pub fn local(&self) -> &DeviceInfo {
        &self.local
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connect to `expected` at `addr` over TCP
    ///
    /// Fails with `RoleConflict` without touching the network when the local
    /// device is the server for this pair.
    pub async fn connect(&self, addr: SocketAddr, expected: &DeviceInfo) -> Result<Negotiated> {
        self.require_role(&expected.device_id, TlsRole::Client)?;

        info!("Connecting to {} ({}) at {}", expected.device_name, expected.device_id, addr);
        let tcp = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| ProtocolError::from_io_error(e, &format!("connecting to {}", addr)))?;
        tcp.set_nodelay(true)?;

        self.negotiate_outbound(tcp, TransportAddress::Tcp(addr), expected)
            .await
    }

    /// Run the server side of the handshake on an accepted TCP connection
    pub async fn accept(&self, tcp: TcpStream, addr: SocketAddr) -> Result<Negotiated> {
        tcp.set_nodelay(true)?;
        self.negotiate_inbound(tcp, TransportAddress::Tcp(addr)).await
    }

    /// Client side of the handshake over any byte stream
    pub async fn negotiate_outbound<S: AsyncStream>(
        &self,
        mut io: S,
        address: TransportAddress,
        expected: &DeviceInfo,
    ) -> Result<Negotiated> {
        let role = self.require_role(&expected.device_id, TlsRole::Client)?;
        let limit = self.config.handshake_timeout;

        let plaintext = self.local.to_identity_packet().to_bytes()?;
        with_timeout(limit, "sending plaintext identity", async {
            io.write_all(&plaintext).await?;
            io.flush().await?;
            Ok(())
        })
        .await?;

        let server_name = server_name_for(
            address
                .socket_addr()
                .map(|addr| addr.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        );
        let tls_stream = with_timeout(limit, "TLS handshake", async {
            self.tls
                .connector()
                .connect(server_name, io)
                .await
                .map_err(|e| ProtocolError::TlsHandshake(e.to_string()))
        })
        .await?;

        let fingerprint = peer_fingerprint(tls_stream.get_ref().1.peer_certificates())?;
        debug!("TLS established with {} ({})", address, fingerprint);

        let mut stream = PacketStream::new(Box::new(tls_stream) as BoxedStream);
        let peer = self.exchange_identities(&mut stream, limit).await?;

        if peer.device_id != expected.device_id {
            warn!(
                "Device at {} identified as {} but {} was expected",
                address, peer.device_id, expected.device_id
            );
            let _ = stream.shutdown().await;
            return Err(ProtocolError::IdentityMismatch(format!(
                "expected {}, peer identified as {}",
                expected.device_id, peer.device_id
            )));
        }
        if !peer.is_compatible() {
            let _ = stream.shutdown().await;
            return Err(version_mismatch(&peer));
        }

        self.classify(EstablishedLink {
            peer,
            fingerprint,
            role,
            address,
            stream,
        })
        .await
    }

    /// Server side of the handshake over any byte stream
    pub async fn negotiate_inbound<S: AsyncStream>(
        &self,
        mut io: S,
        address: TransportAddress,
    ) -> Result<Negotiated> {
        let limit = self.config.handshake_timeout;

        let line = with_timeout(limit, "reading plaintext identity", read_line_unbuffered(&mut io))
            .await?;
        let announced = DeviceInfo::from_identity_packet(&Packet::from_bytes(&line)?)?;
        debug!(
            "Plaintext identity from {}: {} ({})",
            address, announced.device_name, announced.device_id
        );

        if !announced.is_compatible() {
            return Err(version_mismatch(&announced));
        }
        let role = self.require_role(&announced.device_id, TlsRole::Server)?;

        let tls_stream = with_timeout(limit, "TLS handshake", async {
            self.tls
                .acceptor()
                .accept(io)
                .await
                .map_err(|e| ProtocolError::TlsHandshake(e.to_string()))
        })
        .await?;

        let fingerprint = peer_fingerprint(tls_stream.get_ref().1.peer_certificates())?;
        debug!("TLS established with {} ({})", address, fingerprint);

        let mut stream = PacketStream::new(Box::new(tls_stream) as BoxedStream);
        let peer = self.exchange_identities(&mut stream, limit).await?;

        if peer.device_id != announced.device_id {
            warn!(
                "Device at {} announced {} in plaintext but {} over TLS",
                address, announced.device_id, peer.device_id
            );
            let _ = stream.shutdown().await;
            return Err(ProtocolError::IdentityMismatch(format!(
                "plaintext identity {}, encrypted identity {}",
                announced.device_id, peer.device_id
            )));
        }

        self.classify(EstablishedLink {
            peer,
            fingerprint,
            role,
            address,
            stream,
        })
        .await
    }

    fn require_role(&self, peer_id: &str, wanted: TlsRole) -> Result<TlsRole> {
        let role = determine_role(&self.local.device_id, peer_id)?;
        if role != wanted {
            return Err(ProtocolError::RoleConflict(format!(
                "local device {} is the TLS {:?} for peer {}",
                self.local.device_id, role, peer_id
            )));
        }
        Ok(role)
    }

    async fn exchange_identities(
        &self,
        stream: &mut PacketStream<BoxedStream>,
        limit: Duration,
    ) -> Result<DeviceInfo> {
        with_timeout(limit, "identity exchange", async {
            stream
                .write_packet(&self.local.to_identity_packet())
                .await?;
            let packet = stream.read_packet().await?.ok_or_else(|| {
                ProtocolError::Transport("peer closed during identity exchange".to_string())
            })?;
            DeviceInfo::from_identity_packet(&packet)
        })
        .await
    }

    async fn classify(&self, mut link: EstablishedLink) -> Result<Negotiated> {
        let device_id = link.peer.device_id.clone();

        match self.trust.check(&device_id, &link.fingerprint) {
            Ok(true) => {
                if let Err(e) = self.trust.touch(&device_id) {
                    warn!("Failed to refresh trust record for {}: {}", device_id, e);
                }
                info!(
                    "Trusted device {} ({}) connected via {}",
                    link.peer.device_name, device_id, link.address
                );
                Ok(Negotiated::Ready(link))
            }
            Ok(false) => {
                info!(
                    "Device {} ({}) is not trusted, pairing required",
                    link.peer.device_name, device_id
                );
                Ok(Negotiated::PairingRequired(link))
            }
            Err(e) => {
                if e.is_security_event() {
                    error!("Refusing connection from {}: {}", device_id, e);
                } else {
                    warn!("Trust lookup for {} failed: {}", device_id, e);
                }
                let _ = link.stream.shutdown().await;
                Err(e)
            }
        }
    }
}

fn version_mismatch(peer: &DeviceInfo) -> ProtocolError {
    ProtocolError::ProtocolVersionMismatch(format!(
        "device {} speaks version {}, local version is {}",
        peer.device_id,
        peer.protocol_version,
        crate::PROTOCOL_VERSION
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CertificateInfo, DeviceType, TrustState};
    use tokio::io::{duplex, AsyncWriteExt};

    struct Peer {
        info: DeviceInfo,
        cert: CertificateInfo,
        trust: Arc<TrustStore>,
    }

    impl Peer {
        fn new(id: &str, name: &str) -> Self {
            Self {
                info: DeviceInfo::with_id(id, name, DeviceType::Desktop, 1739),
                cert: CertificateInfo::generate(id).unwrap(),
                trust: Arc::new(TrustStore::in_memory()),
            }
        }

        fn negotiator(&self) -> Negotiator {
            self.negotiator_with(ConnectionConfig::loopback())
        }

        fn negotiator_with(&self, config: ConnectionConfig) -> Negotiator {
            Negotiator::new(
                self.info.clone(),
                TlsConfig::new(&self.cert).unwrap(),
                self.trust.clone(),
                config,
            )
        }
    }

    async fn handshake(
        client: &Peer,
        server: &Peer,
        expected: &DeviceInfo,
    ) -> (Result<Negotiated>, Result<Negotiated>) {
        let (client_io, server_io) = duplex(64 * 1024);
        let client_neg = client.negotiator();
        let server_neg = server.negotiator();

        tokio::join!(
            client_neg.negotiate_outbound(client_io, TransportAddress::Memory, expected),
            server_neg.negotiate_inbound(server_io, TransportAddress::Memory),
        )
    }

    #[tokio::test]
    async fn test_unknown_peers_require_pairing() {
        let alpha = Peer::new("1000", "alpha");
        let beta = Peer::new("2000", "beta");

        let (client, server) = handshake(&alpha, &beta, &beta.info).await;
        let client = client.unwrap();
        let server = server.unwrap();

        assert!(matches!(client, Negotiated::PairingRequired(_)));
        assert!(matches!(server, Negotiated::PairingRequired(_)));

        assert_eq!(client.link().peer.device_id, "2000");
        assert_eq!(client.link().fingerprint, beta.cert.fingerprint);
        assert_eq!(client.link().role, TlsRole::Client);
        assert_eq!(server.link().peer.device_id, "1000");
        assert_eq!(server.link().fingerprint, alpha.cert.fingerprint);
        assert_eq!(server.link().role, TlsRole::Server);
    }

    #[tokio::test]
    async fn test_trusted_peers_are_ready() {
        let alpha = Peer::new("1000", "alpha");
        let beta = Peer::new("2000", "beta");
        alpha
            .trust
            .put("2000", beta.cert.fingerprint.clone(), TrustState::Trusted)
            .unwrap();
        beta.trust
            .put("1000", alpha.cert.fingerprint.clone(), TrustState::Trusted)
            .unwrap();

        let (client, server) = handshake(&alpha, &beta, &beta.info).await;
        let mut client = client.unwrap().into_link();
        let server = server.unwrap();
        assert!(server.is_ready());

        // The link carries application packets after the handshake
        let mut server = server.into_link();
        client
            .stream
            .write_packet(&Packet::with_id(1, "ping", serde_json::json!({})))
            .await
            .unwrap();
        let packet = server.stream.read_packet().await.unwrap().unwrap();
        assert_eq!(packet.packet_type, "ping");
    }

    #[tokio::test]
    async fn test_trust_violation_tears_down() {
        let alpha = Peer::new("1000", "alpha");
        let beta = Peer::new("2000", "beta");
        let impostor = CertificateInfo::generate("2000").unwrap();
        alpha
            .trust
            .put("2000", impostor.fingerprint.clone(), TrustState::Trusted)
            .unwrap();

        let (client, server) = handshake(&alpha, &beta, &beta.info).await;

        match client {
            Err(ProtocolError::TrustViolation {
                device_id,
                expected,
                presented,
            }) => {
                assert_eq!(device_id, "2000");
                assert_eq!(expected, impostor.fingerprint);
                assert_eq!(presented, beta.cert.fingerprint);
            }
            other => panic!("expected trust violation, got {:?}", other),
        }

        // The record is untouched and the server sees the link go away
        assert_eq!(
            alpha.trust.lookup("2000").unwrap().unwrap().fingerprint,
            impostor.fingerprint
        );
        let mut server = server.unwrap().into_link();
        assert!(!matches!(server.stream.read_packet().await, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_server_refuses_to_connect() {
        let alpha = Peer::new("1000", "alpha");
        let beta = Peer::new("2000", "beta");
        let (io, _other) = duplex(1024);

        let result = beta
            .negotiator()
            .negotiate_outbound(io, TransportAddress::Memory, &alpha.info)
            .await;
        assert!(matches!(result, Err(ProtocolError::RoleConflict(_))));

        let result = beta
            .negotiator()
            .connect("127.0.0.1:9".parse().unwrap(), &alpha.info)
            .await;
        assert!(matches!(result, Err(ProtocolError::RoleConflict(_))));
    }

    #[tokio::test]
    async fn test_client_refuses_inbound() {
        let alpha = Peer::new("1000", "alpha");
        let beta = Peer::new("2000", "beta");
        let (io, mut remote) = duplex(64 * 1024);

        remote
            .write_all(&beta.info.to_identity_packet().to_bytes().unwrap())
            .await
            .unwrap();

        let result = alpha
            .negotiator()
            .negotiate_inbound(io, TransportAddress::Memory)
            .await;
        assert!(matches!(result, Err(ProtocolError::RoleConflict(_))));
    }

    #[tokio::test]
    async fn test_equal_ids_conflict() {
        let alpha = Peer::new("1000", "alpha");
        let twin = Peer::new("1000", "twin");
        let (io, _other) = duplex(1024);

        let result = alpha
            .negotiator()
            .negotiate_outbound(io, TransportAddress::Memory, &twin.info)
            .await;
        assert!(matches!(result, Err(ProtocolError::RoleConflict(_))));
    }

    #[tokio::test]
    async fn test_identity_mismatch_on_client() {
        let alpha = Peer::new("1000", "alpha");
        let beta = Peer::new("2000", "beta");
        let gamma = Peer::new("3000", "gamma");

        // alpha believes it is talking to beta, but gamma answers
        let (client, _server) = handshake(&alpha, &gamma, &beta.info).await;
        assert!(matches!(client, Err(ProtocolError::IdentityMismatch(_))));
    }

    #[tokio::test]
    async fn test_incompatible_version_rejected_before_tls() {
        let alpha = Peer::new("1000", "alpha");
        let beta = Peer::new("2000", "beta");
        let (io, mut remote) = duplex(64 * 1024);

        let mut old = alpha.info.clone();
        old.protocol_version = crate::PROTOCOL_VERSION - 1;
        remote
            .write_all(&old.to_identity_packet().to_bytes().unwrap())
            .await
            .unwrap();

        let result = beta
            .negotiator()
            .negotiate_inbound(io, TransportAddress::Memory)
            .await;
        assert!(matches!(
            result,
            Err(ProtocolError::ProtocolVersionMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let beta = Peer::new("2000", "beta");
        let (io, _remote) = duplex(1024);
        let config = ConnectionConfig {
            handshake_timeout: Duration::from_millis(100),
            ..ConnectionConfig::loopback()
        };

        let result = beta
            .negotiator_with(config)
            .negotiate_inbound(io, TransportAddress::Memory)
            .await;
        assert!(matches!(result, Err(ProtocolError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_garbage_plaintext_is_malformed() {
        let beta = Peer::new("2000", "beta");
        let (io, mut remote) = duplex(1024);
        remote.write_all(b"hello there\n").await.unwrap();

        let result = beta
            .negotiator()
            .negotiate_inbound(io, TransportAddress::Memory)
            .await;
        assert!(matches!(result, Err(ProtocolError::MalformedPacket(_))));
    }

    #[tokio::test]
    async fn test_tcp_loopback_handshake() {
        let alpha = Peer::new("1000", "alpha");
        let beta = Peer::new("2000", "beta");

        let listener = bind_listener(&ConnectionConfig::loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_neg = beta.negotiator();

        let server = tokio::spawn(async move {
            let (tcp, remote) = listener.accept().await.unwrap();
            server_neg
                .accept(tcp, remote)
                .await
                .map(|n| n.into_link().peer.device_id)
        });

        let client = alpha.negotiator().connect(addr, &beta.info).await.unwrap();
        let link = client.link();
        assert_eq!(link.address, TransportAddress::Tcp(addr));
        assert_eq!(link.peer.device_id, "2000");

        assert_eq!(server.await.unwrap().unwrap(), "1000");
    }

    #[tokio::test]
    async fn test_bind_listener_skips_taken_ports() {
        let first = bind_listener(&ConnectionConfig::loopback()).await.unwrap();
        let taken = first.local_addr().unwrap().port();
        let config = ConnectionConfig {
            port_range: (taken, taken.saturating_add(5)),
            ..ConnectionConfig::loopback()
        };

        let second = bind_listener(&config).await.unwrap();
        assert_ne!(second.local_addr().unwrap().port(), taken);
    }
}
