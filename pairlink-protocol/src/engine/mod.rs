//! Pairlink Engine
//!
//! Owns one running instance of every component: the discovery service, the
//! connection listener, the pairing service and the session table. Nothing
//! here is process-wide; two engines in one process are independent.
//!
//! ## Lifecycle
//!
//! [`Engine::start`] binds the connection listener, starts discovery and
//! spawns three tasks: the accept loop, the discovery consumer and the
//! session consumer. [`Engine::stop`] cancels them, aborts running pairing
//! attempts and closes every session. An engine can be started again after
//! it was stopped.
//!
//! ## Connection policy
//!
//! When a device is discovered, the engine connects to it only if the local
//! device is the TLS client for the pair and there is neither a session nor
//! a connection attempt for it yet. A device that declined pairing is not
//! asked again until [`Engine::pair`] is called for it.

pub mod events;

pub use events::EngineEvent;

use crate::connection::{
    bind_listener, determine_role, should_initiate_connection, ConnectionConfig, EstablishedLink,
    Negotiated, Negotiator, TlsRole,
};
use crate::discovery::{DiscoveryConfig, DiscoveryEvent, DiscoveryService};
use crate::pairing::{PairingConfig, PairingDelegate, PairingEvent, PairingPacket, PairingService};
use crate::plugins::{PeerSender, PluginDispatcher};
use crate::session::{CloseReason, DeviceSession, SessionConfig, SessionEvent, SessionTable};
use crate::transport::{TlsConfig, TransportAddress};
use crate::trust::TrustStore;
use crate::{
    CertificateInfo, Device, DeviceInfo, DeviceManager, Fingerprint, Packet, ProtocolError, Result,
    TrustState,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration of every engine component
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub discovery: DiscoveryConfig,
    pub connection: ConnectionConfig,
    pub pairing: PairingConfig,
    pub session: SessionConfig,
}

impl EngineConfig {
    /// Loopback-only configuration on ephemeral ports
    pub fn loopback(discovery_targets: Vec<SocketAddr>) -> Self {
        Self {
            discovery: DiscoveryConfig::loopback(discovery_targets),
            connection: ConnectionConfig::loopback(),
            ..Self::default()
        }
    }
}

/// Identity and certificate of the local device
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub info: DeviceInfo,
    pub certificate: CertificateInfo,
}

impl LocalIdentity {
    /// Pair an identity with its certificate; both must name the same device
    pub fn new(info: DeviceInfo, certificate: CertificateInfo) -> Result<Self> {
        if info.device_id != certificate.device_id {
            return Err(ProtocolError::Configuration(format!(
                "certificate belongs to {} but the device id is {}",
                certificate.device_id, info.device_id
            )));
        }
        Ok(Self { info, certificate })
    }

    /// Identity with a freshly generated certificate
    pub fn generate(info: DeviceInfo) -> Result<Self> {
        let certificate = CertificateInfo::generate(info.device_id.clone())?;
        Ok(Self { info, certificate })
    }

    pub fn device_id(&self) -> &str {
        &self.info.device_id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.certificate.fingerprint
    }
}

/// Replaceable event channel
#[derive(Clone, Default)]
struct EventSink(Arc<StdMutex<Option<mpsc::UnboundedSender<EngineEvent>>>>);

impl EventSink {
    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = lock(&self.0).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn replace(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.0) = Some(tx);
        rx
    }
}

/// Peers with an outgoing connection attempt
#[derive(Clone, Default)]
struct InFlight(Arc<StdMutex<HashSet<String>>>);

impl InFlight {
    fn claim(&self, device_id: &str) -> Option<InFlightGuard> {
        if !lock(&self.0).insert(device_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: self.0.clone(),
            device_id: device_id.to_string(),
        })
    }

    fn contains(&self, device_id: &str) -> bool {
        lock(&self.0).contains(device_id)
    }
}

struct InFlightGuard {
    set: Arc<StdMutex<HashSet<String>>>,
    device_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.device_id);
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn not_running() -> ProtocolError {
    ProtocolError::Configuration("engine is not running".to_string())
}

/// Resources that exist only while the engine runs
struct RunState {
    discovery: DiscoveryService,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct EngineInner {
    identity: LocalIdentity,
    config: EngineConfig,
    trust: Arc<TrustStore>,
    dispatcher: Arc<PluginDispatcher>,
    pairing: PairingService,
    pairing_rx: StdMutex<Option<mpsc::UnboundedReceiver<PairingEvent>>>,
    /// Local identity as announced, with the bound port and capabilities
    local: RwLock<DeviceInfo>,
    devices: RwLock<DeviceManager>,
    sessions: SessionTable,
    connecting: InFlight,
    /// Devices that declined pairing during this run
    declined: StdMutex<HashSet<String>>,
    negotiator: RwLock<Option<Arc<Negotiator>>>,
    session_tx: StdMutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    events: EventSink,
    running: AtomicBool,
    run: Mutex<Option<RunState>>,
}

/// Device pairing and messaging engine
///
/// Cheap to clone; clones share the same engine. Call [`Engine::stop`]
/// before dropping the last handle, its background tasks hold a handle of
/// their own.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        identity: LocalIdentity,
        trust: Arc<TrustStore>,
        dispatcher: PluginDispatcher,
        delegate: Arc<dyn PairingDelegate>,
    ) -> Self {
        let mut pairing = PairingService::new(
            identity.fingerprint().clone(),
            trust.clone(),
            delegate,
            config.pairing.clone(),
        );
        let pairing_rx = pairing.subscribe();

        Self {
            inner: Arc::new(EngineInner {
                local: RwLock::new(identity.info.clone()),
                identity,
                config,
                trust,
                dispatcher: Arc::new(dispatcher),
                pairing,
                pairing_rx: StdMutex::new(Some(pairing_rx)),
                devices: RwLock::new(DeviceManager::new()),
                sessions: SessionTable::new(),
                connecting: InFlight::default(),
                declined: StdMutex::new(HashSet::new()),
                negotiator: RwLock::new(None),
                session_tx: StdMutex::new(None),
                events: EventSink::default(),
                running: AtomicBool::new(false),
                run: Mutex::new(None),
            }),
        }
    }

    /// Receive engine events. A later call replaces the earlier receiver.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.inner.events.replace()
    }

    /// Start listening, discovering and accepting connections
    pub async fn start(&self) -> Result<()> {
        let mut run = self.inner.run.lock().await;
        if run.is_some() {
            debug!("Engine already running");
            return Ok(());
        }
        let inner = &self.inner;
        inner.pairing.resume();

        let listener = bind_listener(&inner.config.connection).await?;
        let tcp_port = listener.local_addr()?.port();
        let local = {
            let mut local = inner.local.write().await;
            local.tcp_port = tcp_port;
            local.incoming_capabilities = inner.dispatcher.local_incoming();
            local.outgoing_capabilities = inner.dispatcher.local_outgoing();
            local.clone()
        };

        let tls = TlsConfig::new(&inner.identity.certificate)?;
        let negotiator = Negotiator::new(
            local.clone(),
            tls,
            inner.trust.clone(),
            inner.config.connection.clone(),
        );

        let mut discovery = DiscoveryService::new(inner.config.discovery.clone());
        let discovery_rx = discovery.start(local.clone()).await?;
        let discovery_port = discovery.local_addr().map(|addr| addr.port());

        *inner.negotiator.write().await = Some(Arc::new(negotiator));
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        *lock(&inner.session_tx) = Some(session_tx);
        inner.running.store(true, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(self.clone().accept_loop(listener, shutdown_rx.clone())),
            tokio::spawn(
                self.clone()
                    .discovery_loop(discovery_rx, shutdown_rx.clone()),
            ),
            tokio::spawn(self.clone().session_loop(session_rx, shutdown_rx)),
        ];

        // Lives as long as the pairing service
        if let Some(pairing_rx) = lock(&inner.pairing_rx).take() {
            tokio::spawn(forward_pairing_events(pairing_rx, inner.events.clone()));
        }

        info!(
            "Engine started for {} ({}) on TCP port {}",
            local.device_name, local.device_id, tcp_port
        );
        inner.events.emit(EngineEvent::Started {
            tcp_port,
            discovery_port,
        });

        *run = Some(RunState {
            discovery,
            shutdown_tx,
            tasks,
        });
        Ok(())
    }

    /// Stop discovery and the listener, abort pairing attempts and close
    /// every session. Idempotent.
    pub async fn stop(&self) {
        let mut run = self.inner.run.lock().await;
        let Some(RunState {
            mut discovery,
            shutdown_tx,
            tasks,
        }) = run.take()
        else {
            return;
        };

        info!("Stopping engine");
        self.inner.running.store(false, Ordering::SeqCst);
        shutdown_tx.send_replace(true);
        self.inner.pairing.abort_all();

        discovery.stop().await;
        for task in tasks {
            if let Err(e) = task.await {
                error!("Engine task ended abnormally: {}", e);
            }
        }

        *self.inner.negotiator.write().await = None;
        lock(&self.inner.session_tx).take();

        for session in self.inner.sessions.close_all().await {
            session.wait_closed().await;
            if let Err(e) = self
                .inner
                .devices
                .write()
                .await
                .mark_disconnected(session.device_id())
            {
                debug!("{}", e);
            }
            self.inner.events.emit(EngineEvent::SessionClosed {
                device_id: session.device_id().to_string(),
            });
        }

        self.inner.events.emit(EngineEvent::Stopped);
        info!("Engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Connect to the device `info` listening at `addr`
    ///
    /// Pairs first when the device is not trusted yet, unless it declined
    /// pairing before. Does nothing if a session or a connection attempt
    /// already exists for it.
    pub async fn connect(&self, addr: SocketAddr, info: DeviceInfo) -> Result<()> {
        let device_id = info.device_id.clone();
        let result = self.connect_to(addr, info).await;
        if let Err(e) = &result {
            self.report_failure(Some(device_id), TransportAddress::Tcp(addr), e)
                .await;
        }
        result
    }

    /// Ask a known device to pair, clearing an earlier decline
    ///
    /// When the local device is the TLS server for this pair it cannot
    /// connect out; the request is then made by waiting for the peer to
    /// connect.
    pub async fn pair(&self, device_id: &str) -> Result<()> {
        lock(&self.inner.declined).remove(device_id);
        if self.inner.trust.is_rejected(device_id)? {
            self.inner.trust.remove(device_id)?;
        }

        if self.inner.sessions.contains(device_id).await {
            info!("{} is already paired and connected", device_id);
            return Ok(());
        }

        let device = self
            .inner
            .devices
            .read()
            .await
            .get_device(device_id)
            .cloned()
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        match determine_role(self.inner.identity.device_id(), device_id)? {
            TlsRole::Client => {
                let addr = device.connect_address().ok_or_else(|| {
                    ProtocolError::DeviceNotFound(format!("{} has no known address", device_id))
                })?;
                self.connect(addr, device.info).await
            }
            TlsRole::Server => {
                info!(
                    "Waiting for {} ({}) to connect and request pairing",
                    device.info.device_name, device_id
                );
                Ok(())
            }
        }
    }

    /// Send `packet` to a connected device
    ///
    /// Returns `Ok(false)` when the peer does not accept the packet type.
    pub async fn send(&self, device_id: &str, packet: &Packet) -> Result<bool> {
        let session = self
            .inner
            .sessions
            .get(device_id)
            .await
            .ok_or(ProtocolError::SessionClosed)?;
        PeerSender::new(session).send(packet).await
    }

    /// Close the session with `device_id`, keeping its trust record
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        let session = self
            .inner
            .sessions
            .get(device_id)
            .await
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        info!("Disconnecting from {}", device_id);
        session.close().await;
        Ok(())
    }

    /// Forget `device_id`: tell it, close the session and remove the trust
    /// record. Returns whether a record existed.
    pub async fn unpair(&self, device_id: &str) -> Result<bool> {
        if let Some(session) = self.inner.sessions.get(device_id).await {
            if let Err(e) = session.send(&PairingPacket::reject()).await {
                debug!("Could not notify {} of unpairing: {}", device_id, e);
            }
            session.close().await;
        }

        let removed = self.inner.trust.remove(device_id)?;
        if let Err(e) =
            self.inner
                .devices
                .write()
                .await
                .update_trust(device_id, TrustState::Unknown, None)
        {
            debug!("{}", e);
        }

        info!("Unpaired {}", device_id);
        self.inner
            .events
            .emit(EngineEvent::Pairing(PairingEvent::Unpaired {
                device_id: device_id.to_string(),
            }));
        Ok(removed)
    }

    /// Identities of the devices with an open session, sorted by id
    pub async fn connected_devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .inner
            .sessions
            .sessions()
            .await
            .iter()
            .map(|session| session.peer().clone())
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    /// Every device seen since the engine was created, sorted by id
    pub async fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.inner.devices.read().await.devices().cloned().collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.inner.devices.read().await.get_device(device_id).cloned()
    }

    pub async fn session(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.inner.sessions.get(device_id).await
    }

    /// Local identity as currently announced
    pub async fn local_device(&self) -> DeviceInfo {
        self.inner.local.read().await.clone()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.inner.trust
    }

    pub fn dispatcher(&self) -> &Arc<PluginDispatcher> {
        &self.inner.dispatcher
    }

    /// Address the discovery socket is bound to, while running
    pub async fn discovery_addr(&self) -> Option<SocketAddr> {
        self.inner
            .run
            .lock()
            .await
            .as_ref()
            .and_then(|run| run.discovery.local_addr())
    }

    async fn negotiator(&self) -> Option<Arc<Negotiator>> {
        self.inner.negotiator.read().await.clone()
    }

    fn is_declined(&self, device_id: &str) -> Result<bool> {
        if lock(&self.inner.declined).contains(device_id) {
            return Ok(true);
        }
        self.inner.trust.is_rejected(device_id)
    }

    async fn connect_to(&self, addr: SocketAddr, expected: DeviceInfo) -> Result<()> {
        let device_id = expected.device_id.clone();
        if self.inner.sessions.contains(&device_id).await {
            debug!("Already connected to {}", device_id);
            return Ok(());
        }
        let Some(_in_flight) = self.inner.connecting.claim(&device_id) else {
            debug!("Connection to {} already in progress", device_id);
            return Ok(());
        };
        let negotiator = self.negotiator().await.ok_or_else(not_running)?;

        {
            let mut devices = self.inner.devices.write().await;
            devices.update_from_discovery(expected.clone(), Some(addr));
            if let Err(e) = devices.mark_connecting(&device_id) {
                debug!("{}", e);
            }
        }

        let link = match negotiator.connect(addr, &expected).await? {
            Negotiated::Ready(link) => link,
            Negotiated::PairingRequired(mut link) => {
                if self.is_declined(&device_id)? {
                    info!("Not pairing with {}: it declined before", device_id);
                    let _ = link.stream.shutdown().await;
                    if let Err(e) = self.inner.devices.write().await.mark_disconnected(&device_id) {
                        debug!("{}", e);
                    }
                    return Ok(());
                }
                self.note_pairing(
                    link.peer.clone(),
                    link.address.socket_addr(),
                    link.fingerprint.clone(),
                )
                .await;
                match self.inner.pairing.run_outgoing(link).await {
                    Ok(link) => link,
                    Err(e) => {
                        self.note_pairing_failed(&device_id, &e).await;
                        if matches!(e, ProtocolError::PairingRejected(_)) {
                            lock(&self.inner.declined).insert(device_id);
                        }
                        return Err(e);
                    }
                }
            }
        };

        self.open_session(link).await
    }

    async fn handle_inbound(self, tcp: TcpStream, addr: SocketAddr) {
        let address = TransportAddress::Tcp(addr);
        let Some(negotiator) = self.negotiator().await else {
            return;
        };

        let link = match negotiator.accept(tcp, addr).await {
            Ok(Negotiated::Ready(link)) => link,
            Ok(Negotiated::PairingRequired(link)) => {
                let device_id = link.peer.device_id.clone();
                self.note_pairing(
                    link.peer.clone(),
                    link.address.socket_addr(),
                    link.fingerprint.clone(),
                )
                .await;
                match self.inner.pairing.run_incoming(link).await {
                    Ok(link) => link,
                    Err(e) => {
                        self.note_pairing_failed(&device_id, &e).await;
                        return self.report_failure(Some(device_id), address, &e).await;
                    }
                }
            }
            Err(e) => return self.report_failure(None, address, &e).await,
        };

        let device_id = link.peer.device_id.clone();
        if let Err(e) = self.open_session(link).await {
            self.report_failure(Some(device_id), address, &e).await;
        }
    }

    /// Record an untrusted peer entering pairing
    async fn note_pairing(
        &self,
        peer: DeviceInfo,
        address: Option<SocketAddr>,
        fingerprint: Fingerprint,
    ) {
        let device_id = peer.device_id.clone();
        let mut devices = self.inner.devices.write().await;
        devices.update_from_discovery(peer, address);
        let noted = devices
            .update_trust(&device_id, TrustState::PairingPending, Some(fingerprint))
            .and_then(|()| devices.mark_connecting(&device_id));
        if let Err(e) = noted {
            debug!("{}", e);
        }
    }

    async fn note_pairing_failed(&self, device_id: &str, error: &ProtocolError) {
        let state = match error {
            ProtocolError::PairingRejected(_) => TrustState::Rejected,
            _ => TrustState::Unknown,
        };
        if let Err(e) = self
            .inner
            .devices
            .write()
            .await
            .update_trust(device_id, state, None)
        {
            debug!("{}", e);
        }
    }

    async fn open_session(&self, link: EstablishedLink) -> Result<()> {
        let session_tx = lock(&self.inner.session_tx)
            .clone()
            .ok_or_else(not_running)?;
        let peer = link.peer.clone();
        let fingerprint = link.fingerprint.clone();
        let address = link.address;

        let session = DeviceSession::start_with_config(
            link,
            self.inner.dispatcher.clone(),
            session_tx,
            self.inner.config.session,
        )
        .await?;
        self.inner.sessions.install(session.clone()).await;

        {
            let mut devices = self.inner.devices.write().await;
            devices.update_from_discovery(peer.clone(), address.socket_addr());
            devices.update_trust(
                &peer.device_id,
                TrustState::Trusted,
                Some(fingerprint.clone()),
            )?;
            devices.mark_connected(&peer.device_id)?;
        }

        self.inner.events.emit(EngineEvent::SessionOpened {
            device_id: peer.device_id.clone(),
            device_name: peer.device_name.clone(),
            fingerprint,
        });

        if !self.is_running() {
            debug!("Engine stopped while opening session with {}", peer.device_id);
            session.close().await;
            self.inner
                .sessions
                .remove_if_same(&peer.device_id, session.id())
                .await;
        }
        Ok(())
    }

    async fn report_failure(
        &self,
        device_id: Option<String>,
        address: TransportAddress,
        error: &ProtocolError,
    ) {
        if let Some(device_id) = &device_id {
            if let Err(e) = self.inner.devices.write().await.mark_failed(device_id) {
                debug!("{}", e);
            }
        }

        match error {
            ProtocolError::TrustViolation {
                device_id,
                expected,
                presented,
            } => {
                warn!("Refused {} at {}: certificate changed", device_id, address);
                self.inner
                    .pairing
                    .delegate()
                    .on_trust_violation(device_id, expected, presented)
                    .await;
                self.inner.events.emit(EngineEvent::TrustViolation {
                    device_id: device_id.clone(),
                    expected: expected.clone(),
                    presented: presented.clone(),
                });
            }
            ProtocolError::PairingRejected(_) | ProtocolError::PairingTimedOut(_) => {
                // Already published as a pairing event
                info!("{}", error);
            }
            _ => {
                warn!(
                    "Connection with {} at {} failed: {}",
                    device_id.as_deref().unwrap_or("unknown device"),
                    address,
                    error
                );
                self.inner.events.emit(EngineEvent::ConnectionFailed {
                    device_id,
                    address,
                    error: error.to_string(),
                });
            }
        }
    }

    async fn accept_loop(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((tcp, addr)) => {
                        debug!("Incoming connection from {}", addr);
                        tokio::spawn(self.clone().handle_inbound(tcp, addr));
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("Accept loop stopped");
    }

    async fn discovery_loop(
        self,
        mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(DiscoveryEvent::DeviceDiscovered { info, address }) => {
                        self.on_device_discovered(info, address).await;
                    }
                    Some(other) => debug!("Discovery: {:?}", other),
                    None => break,
                },
            }
        }
        debug!("Discovery consumer stopped");
    }

    async fn on_device_discovered(&self, info: DeviceInfo, address: SocketAddr) {
        self.inner
            .devices
            .write()
            .await
            .update_from_discovery(info.clone(), Some(address));
        self.inner.events.emit(EngineEvent::DeviceDiscovered {
            info: info.clone(),
            address,
        });

        let device_id = info.device_id.clone();
        if !should_initiate_connection(self.inner.identity.device_id(), &device_id) {
            debug!("Waiting for {} to connect to us", device_id);
            return;
        }
        if self.inner.sessions.contains(&device_id).await || self.inner.connecting.contains(&device_id)
        {
            return;
        }
        match self.is_declined(&device_id) {
            Ok(false) => {}
            Ok(true) => {
                debug!("Not connecting to {}: it declined pairing", device_id);
                return;
            }
            Err(e) => {
                warn!("Trust lookup for {} failed: {}", device_id, e);
                return;
            }
        }

        let addr = SocketAddr::new(address.ip(), info.tcp_port);
        let engine = self.clone();
        tokio::spawn(async move {
            // Failures are reported as events
            let _ = engine.connect(addr, info).await;
        });
    }

    async fn session_loop(
        self,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(SessionEvent::Closed { device_id, session_id, reason }) => {
                        self.on_session_closed(&device_id, session_id, reason).await;
                    }
                    Some(SessionEvent::PeerUnpaired { device_id, session_id }) => {
                        self.on_peer_unpaired(&device_id, session_id).await;
                    }
                    None => break,
                },
            }
        }
        debug!("Session consumer stopped");
    }

    async fn on_session_closed(&self, device_id: &str, session_id: u64, reason: CloseReason) {
        if !self.inner.sessions.remove_if_same(device_id, session_id).await {
            return;
        }
        debug!("Session with {} ended: {:?}", device_id, reason);
        if let Err(e) = self.inner.devices.write().await.mark_disconnected(device_id) {
            debug!("{}", e);
        }
        self.inner.events.emit(EngineEvent::SessionClosed {
            device_id: device_id.to_string(),
        });
    }

    async fn on_peer_unpaired(&self, device_id: &str, session_id: u64) {
        if let Err(e) = self.inner.trust.remove(device_id) {
            error!("Failed to remove trust record for {}: {}", device_id, e);
        }
        if let Err(e) =
            self.inner
                .devices
                .write()
                .await
                .update_trust(device_id, TrustState::Unknown, None)
        {
            debug!("{}", e);
        }
        self.inner
            .events
            .emit(EngineEvent::Pairing(PairingEvent::Unpaired {
                device_id: device_id.to_string(),
            }));

        if let Some(session) = self.inner.sessions.get(device_id).await {
            if session.id() == session_id {
                session.close().await;
            }
        }
    }
}

async fn forward_pairing_events(
    mut pairing_rx: mpsc::UnboundedReceiver<PairingEvent>,
    events: EventSink,
) {
    while let Some(event) = pairing_rx.recv().await {
        events.emit(EngineEvent::Pairing(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::{FixedDecision, PairingDecision};
    use crate::DeviceType;
    use serde_json::json;

    fn engine(id: &str) -> Engine {
        let info = DeviceInfo::with_id(id, id, DeviceType::Desktop, 0);
        Engine::new(
            EngineConfig::loopback(Vec::new()),
            LocalIdentity::generate(info).unwrap(),
            Arc::new(TrustStore::in_memory()),
            PluginDispatcher::new(),
            Arc::new(FixedDecision(PairingDecision::Reject)),
        )
    }

    #[test]
    fn test_identity_must_match_certificate() {
        let info = DeviceInfo::with_id("1000", "alpha", DeviceType::Desktop, 1739);
        let cert = CertificateInfo::generate("2000").unwrap();
        assert!(matches!(
            LocalIdentity::new(info.clone(), cert),
            Err(ProtocolError::Configuration(_))
        ));

        let cert = CertificateInfo::generate("1000").unwrap();
        let identity = LocalIdentity::new(info, cert).unwrap();
        assert_eq!(identity.device_id(), "1000");
    }

    fn assert_send<T: Send>(_: T) {}

    #[tokio::test]
    async fn test_connection_futures_are_send() {
        let engine = engine("1000");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tcp = TcpStream::connect(addr).await.unwrap();
        let peer = DeviceInfo::with_id("2000", "beta", DeviceType::Phone, addr.port());

        // Spawned by the accept loop and the discovery consumer
        assert_send(engine.clone().handle_inbound(tcp, addr));
        assert_send(engine.connect(addr, peer.clone()));
        assert_send(engine.pair("2000"));
        assert_send(engine.on_device_discovered(peer, addr));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let engine = engine("1000");
        let mut events = engine.subscribe();
        assert!(!engine.is_running());

        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(engine.discovery_addr().await.is_some());

        let local = engine.local_device().await;
        assert_ne!(local.tcp_port, 0);
        assert!(matches!(
            events.recv().await,
            Some(EngineEvent::Started { tcp_port, .. }) if tcp_port == local.tcp_port
        ));

        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running());
        assert!(engine.discovery_addr().await.is_none());
        assert!(matches!(events.recv().await, Some(EngineEvent::Stopped)));

        // Restartable
        engine.start().await.unwrap();
        assert!(engine.is_running());
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_operations_on_unknown_devices() {
        let engine = engine("1000");
        engine.start().await.unwrap();

        assert!(matches!(
            engine.pair("9999").await,
            Err(ProtocolError::DeviceNotFound(_))
        ));
        assert!(matches!(
            engine.send("9999", &Packet::new("ping", json!({}))).await,
            Err(ProtocolError::SessionClosed)
        ));
        assert!(matches!(
            engine.disconnect("9999").await,
            Err(ProtocolError::DeviceNotFound(_))
        ));
        assert!(!engine.unpair("9999").await.unwrap());
        assert!(engine.connected_devices().await.is_empty());

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_connect_requires_running_engine() {
        let engine = engine("1000");
        let peer = DeviceInfo::with_id("2000", "beta", DeviceType::Phone, 1739);
        let result = engine
            .connect("127.0.0.1:1".parse().unwrap(), peer)
            .await;
        assert!(matches!(result, Err(ProtocolError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_server_side_pair_waits() {
        let engine = engine("2000");
        engine.start().await.unwrap();

        let peer = DeviceInfo::with_id("1000", "alpha", DeviceType::Phone, 1739);
        engine
            .on_device_discovered(peer, "127.0.0.1:1716".parse().unwrap())
            .await;
        assert!(engine.device("1000").await.is_some());

        // The peer is the client for this pair, so nothing is dialed
        engine.pair("1000").await.unwrap();
        assert!(engine.connected_devices().await.is_empty());

        engine.stop().await;
    }
}
