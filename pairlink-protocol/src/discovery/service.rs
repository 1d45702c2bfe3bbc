//! Async Discovery Service
//!
//! One background task owns the UDP socket. It broadcasts the local identity
//! at a fixed interval during the announcement window after start, and keeps
//! listening for announcements until stopped.

use super::dedup::{Sighting, SightingFilter};
use super::events::DiscoveryEvent;
use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{DeviceInfo, Packet, ProtocolError, Result};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Default UDP port for device discovery
pub const DISCOVERY_PORT: u16 = 1716;

/// Port range for fallback when primary port is unavailable
pub const PORT_RANGE_START: u16 = 1714;
pub const PORT_RANGE_END: u16 = 1764;

/// Broadcast address for IPv4
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// Default broadcast interval (2 seconds)
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

/// Default announcement window (30 seconds)
pub const DEFAULT_ANNOUNCEMENT_WINDOW: Duration = Duration::from_secs(30);

/// Default deduplication window (5 seconds)
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Sightings not refreshed for this long are dropped from the table
pub const SIGHTING_TTL: Duration = Duration::from_secs(10 * 60);

/// Largest datagram we accept
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Configuration for discovery service
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Local address to bind
    pub bind_addr: IpAddr,

    /// Preferred UDP port; 0 binds an ephemeral port
    pub port: u16,

    /// Ports tried when the preferred one is taken
    pub fallback_ports: (u16, u16),

    /// Where announcements are sent
    pub broadcast_targets: Vec<SocketAddr>,

    /// How often to broadcast identity packets
    pub broadcast_interval: Duration,

    /// How long after start announcements are broadcast
    pub announcement_window: Duration,

    /// Repeated sightings of a device within this window produce one event
    pub dedup_window: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DISCOVERY_PORT,
            fallback_ports: (PORT_RANGE_START, PORT_RANGE_END),
            broadcast_targets: vec![SocketAddr::new(IpAddr::V4(BROADCAST_ADDR), DISCOVERY_PORT)],
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            announcement_window: DEFAULT_ANNOUNCEMENT_WINDOW,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

impl DiscoveryConfig {
    /// Loopback-only configuration on an ephemeral port
    pub fn loopback(targets: Vec<SocketAddr>) -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            broadcast_targets: targets,
            ..Self::default()
        }
    }
}

/// Async discovery service
///
/// Restartable: `start` after `stop` opens a fresh socket and a fresh event
/// stream.
pub struct DiscoveryService {
    /// Service configuration
    config: DiscoveryConfig,

    /// Every device heard since start, compatible or not
    sightings: Arc<RwLock<HashMap<String, Sighting>>>,

    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,

    /// Background task
    task: Option<JoinHandle<()>>,

    /// Address the socket is bound to while running
    local_addr: Option<SocketAddr>,
}

impl DiscoveryService {
    /// Create a new discovery service
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            sightings: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx: None,
            task: None,
            local_addr: None,
        }
    }

    /// Create a discovery service with default configuration
    pub fn with_defaults() -> Self {
        Self::new(DiscoveryConfig::default())
    }

    /// Bind UDP socket with fallback ports
    async fn bind_socket(config: &DiscoveryConfig) -> Result<UdpSocket> {
        let socket = match UdpSocket::bind((config.bind_addr, config.port)).await {
            Ok(socket) => {
                info!("Bound to UDP port {}", socket.local_addr()?.port());
                socket
            }
            Err(e) if config.port != 0 => {
                warn!(
                    "Failed to bind to primary port {}: {}. Trying fallback range...",
                    config.port, e
                );

                let (start, end) = config.fallback_ports;
                let mut bound = None;
                for port in start..=end {
                    if port == config.port {
                        continue;
                    }
                    if let Ok(socket) = UdpSocket::bind((config.bind_addr, port)).await {
                        info!("Bound to fallback UDP port {}", port);
                        bound = Some(socket);
                        break;
                    }
                }

                bound.ok_or_else(|| {
                    ProtocolError::Io(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("Failed to bind to any port in range {}-{}", start, end),
                    ))
                })?
            }
            Err(e) => return Err(e.into()),
        };

        socket.set_broadcast(true)?;
        Ok(socket)
    }

    /// Start the discovery service
    ///
    /// Returns the stream of discovery events for this run. The stream ends
    /// after `stop`.
    pub async fn start(
        &mut self,
        local: DeviceInfo,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        if self.is_running() {
            self.stop().await;
        }

        let socket = Self::bind_socket(&self.config).await?;
        let local_addr = socket.local_addr()?;
        info!(
            "Starting discovery service on {} for {}",
            local_addr, local.device_id
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(DiscoveryEvent::ServiceStarted {
            port: local_addr.port(),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.sightings.write().await.clear();

        let listener = Listener {
            socket,
            local,
            config: self.config.clone(),
            sightings: self.sightings.clone(),
            event_tx,
        };
        self.task = Some(tokio::spawn(listener.run(shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        Ok(event_rx)
    }

    /// Stop the discovery service and wait for its task to finish
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            info!("Stopping discovery service");
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Discovery task ended abnormally: {}", e);
            }
        }
        self.local_addr = None;
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Address the socket is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Every sighting recorded since the last start
    pub async fn sightings(&self) -> Vec<Sighting> {
        let mut sightings: Vec<Sighting> = self.sightings.read().await.values().cloned().collect();
        sightings.sort_by(|a, b| a.info.device_id.cmp(&b.info.device_id));
        sightings
    }
}

/// State owned by the background task
struct Listener {
    socket: UdpSocket,
    local: DeviceInfo,
    config: DiscoveryConfig,
    sightings: Arc<RwLock<HashMap<String, Sighting>>>,
    event_tx: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl Listener {
    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) {
        let started = Instant::now();
        let mut ticker = interval(self.config.broadcast_interval);
        let mut broadcasting = true;
        let mut filter = SightingFilter::new(self.config.dedup_window);
        // One directed reply per device per announcement window
        let mut replies = SightingFilter::new(self.config.announcement_window);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = ticker.tick(), if broadcasting => {
                    if started.elapsed() >= self.config.announcement_window {
                        info!("Announcement window over, listening passively");
                        broadcasting = false;
                        continue;
                    }
                    self.announce().await;
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((size, src_addr)) => {
                            self.handle_datagram(&buf[..size], src_addr, &mut filter, &mut replies)
                                .await;
                        }
                        Err(e) => {
                            // ICMP port-unreachable from an earlier send surfaces here
                            debug!("Error receiving datagram: {}", e);
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    info!("Discovery service shutting down");
                    break;
                }
            }
        }

        let _ = self.event_tx.send(DiscoveryEvent::ServiceStopped);
    }

    async fn announce(&self) {
        let bytes = match self.local.to_identity_packet().to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode identity packet: {}", e);
                return;
            }
        };

        for target in &self.config.broadcast_targets {
            match self.socket.send_to(&bytes, target).await {
                Ok(sent) => debug!(
                    "Broadcasted identity packet ({} bytes) to {}",
                    sent, target
                ),
                Err(e) => warn!("Failed to send broadcast to {}: {}", target, e),
            }
        }
    }

    async fn send_directed_identity(&self, target: SocketAddr) {
        let result = match self.local.to_identity_packet().to_bytes() {
            Ok(bytes) => self.socket
                .send_to(&bytes, target)
                .await
                .map_err(ProtocolError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(sent) => debug!("Sent directed identity packet ({} bytes) to {}", sent, target),
            Err(e) => warn!("Failed to send directed identity to {}: {}", target, e),
        }
    }

    async fn handle_datagram(
        &self,
        data: &[u8],
        src_addr: SocketAddr,
        filter: &mut SightingFilter,
        replies: &mut SightingFilter,
    ) {
        let packet = match Packet::from_bytes(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Ignoring undecodable datagram from {}: {}", src_addr, e);
                return;
            }
        };

        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            debug!("Ignoring non-identity packet from {}", src_addr);
            return;
        }

        let info = match DeviceInfo::from_identity_packet(&packet) {
            Ok(info) => info,
            Err(e) => {
                debug!("Ignoring invalid identity from {}: {}", src_addr, e);
                return;
            }
        };

        if info.device_id == self.local.device_id {
            return;
        }

        let compatible = info.is_compatible();
        {
            let mut sightings = self.sightings.write().await;
            match sightings.get_mut(&info.device_id) {
                Some(sighting) => sighting.update(info.clone(), src_addr),
                None => {
                    sightings.retain(|_, sighting| !sighting.is_stale(SIGHTING_TTL));
                    sightings.insert(info.device_id.clone(), Sighting::new(info.clone(), src_addr));
                }
            }
        }

        if !compatible {
            debug!(
                "Ignoring {} at {}: protocol version {} is incompatible",
                info.device_id, src_addr, info.protocol_version
            );
            return;
        }

        let now = Instant::now();
        if replies.should_emit(&info.device_id, now) {
            self.send_directed_identity(src_addr).await;
        }

        if filter.should_emit(&info.device_id, now) {
            info!(
                "Discovered device: {} ({}) at {}",
                info.device_name,
                info.device_type.as_str(),
                src_addr
            );
            let _ = self.event_tx.send(DiscoveryEvent::DeviceDiscovered {
                info,
                address: src_addr,
            });
        } else {
            debug!("Duplicate sighting of {} from {}", info.device_id, src_addr);
        }
    }
}
