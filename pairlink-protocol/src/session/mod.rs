//! Device Session
//!
//! The live, trusted connection to one peer. Each session owns one read task
//! that decodes packets and hands them to the [`PluginDispatcher`] strictly in
//! arrival order. Writes go through a separate half of the stream and may
//! interleave with reads.
//!
//! A session ends when the peer closes the stream, when the stream fails or
//! repeatedly carries malformed lines, or when [`DeviceSession::close`] is
//! called. Every session reports its end exactly once as a
//! [`SessionEvent::Closed`].
//!
//! Closing never waits on the peer: writes are bounded by
//! [`SessionConfig::write_timeout`] and abort as soon as the session is
//! closed, and the transport shutdown is bounded the same way.

pub mod table;

pub use table::SessionTable;

use crate::codec::{PacketReader, PacketWriter, MAX_CONSECUTIVE_MALFORMED};
use crate::connection::EstablishedLink;
use crate::packet::{PACKET_TYPE_CAPABILITIES, PACKET_TYPE_PAIR};
use crate::pairing::PairingPacket;
use crate::plugins::{PeerContext, PeerSender, PluginDispatcher};
use crate::transport::{BoxedStream, TransportAddress};
use crate::{DeviceInfo, Fingerprint, Packet, ProtocolError, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Longest time a single packet write may take
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Session tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Malformed lines tolerated in a row before the session is torn down
    pub max_consecutive_malformed: u32,
    /// A write that takes longer closes the session
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_consecutive_malformed: MAX_CONSECUTIVE_MALFORMED,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close` was called locally
    Local,
    /// The peer closed the stream
    PeerClosed,
    /// The stream failed or carried too many malformed lines
    Error(String),
}

/// Notifications from running sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session ended and its transport is released
    Closed {
        device_id: String,
        session_id: u64,
        reason: CloseReason,
    },
    /// The peer sent `pair: false` on a trusted session
    PeerUnpaired { device_id: String, session_id: u64 },
}

type SessionWriter = PacketWriter<WriteHalf<BoxedStream>>;
type SessionReader = PacketReader<ReadHalf<BoxedStream>>;

/// Live connection to one trusted peer
pub struct DeviceSession {
    id: u64,
    peer: DeviceInfo,
    fingerprint: Fingerprint,
    address: TransportAddress,
    writer: tokio::sync::Mutex<Option<SessionWriter>>,
    write_timeout: Duration,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    /// Flips to `true` once; pending writes and the read task watch it
    cancel: watch::Sender<bool>,
    /// Packet types the peer accepts from us
    outbound: RwLock<BTreeSet<String>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Resolves once the session is closed
async fn closed_signal(cancelled: &mut watch::Receiver<bool>) {
    let _ = cancelled.wait_for(|closed| *closed).await;
}

impl DeviceSession {
    /// Start a session over a trusted link with the default configuration
    pub async fn start(
        link: EstablishedLink,
        dispatcher: Arc<PluginDispatcher>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>> {
        Self::start_with_config(link, dispatcher, events, SessionConfig::default()).await
    }

    /// Start a session over a trusted link
    ///
    /// Sends the local capability announcement and spawns the read task.
    pub async fn start_with_config(
        link: EstablishedLink,
        dispatcher: Arc<PluginDispatcher>,
        events: mpsc::UnboundedSender<SessionEvent>,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        let EstablishedLink {
            peer,
            fingerprint,
            address,
            stream,
            ..
        } = link;
        let (mut reader, writer) = stream.into_split();
        reader.set_threshold(config.max_consecutive_malformed);
        let (cancel, cancel_rx) = watch::channel(false);

        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            outbound: RwLock::new(dispatcher.negotiate(&peer.incoming_capabilities)),
            peer,
            fingerprint,
            address,
            writer: tokio::sync::Mutex::new(Some(writer)),
            write_timeout: config.write_timeout,
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            cancel,
            reader_task: Mutex::new(None),
        });

        if let Err(e) = session.send(&dispatcher.capabilities_packet()).await {
            session.release_writer().await;
            return Err(e);
        }

        let task = tokio::spawn(
            session
                .clone()
                .read_loop(reader, dispatcher, cancel_rx, events),
        );
        *lock(&session.reader_task) = Some(task);

        info!(
            "Session {} opened with {} ({}) via {}",
            session.id, session.peer.device_name, session.peer.device_id, session.address
        );
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.peer.device_id
    }

    /// Identity the peer presented during the handshake
    pub fn peer(&self) -> &DeviceInfo {
        &self.peer
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn address(&self) -> TransportAddress {
        self.address
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the negotiated capability set lets us send `packet_type`
    pub fn allows_outgoing(&self, packet_type: &str) -> bool {
        self.outbound
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(packet_type)
    }

    /// Packet types the peer accepts from us
    pub fn outbound_types(&self) -> BTreeSet<String> {
        self.outbound
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Send a packet, unfiltered
    ///
    /// Fails with `SessionClosed` once the session is closed, including when
    /// it is closed while the write is in progress. A write that exceeds the
    /// write timeout fails with `Timeout` and closes the session.
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        let mut cancelled = self.cancel.subscribe();
        if self.is_closed() || *cancelled.borrow() {
            return Err(ProtocolError::SessionClosed);
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(ProtocolError::SessionClosed)?;
            writer.write_packet(packet).await
        };

        tokio::select! {
            _ = closed_signal(&mut cancelled) => Err(ProtocolError::SessionClosed),
            result = tokio::time::timeout(self.write_timeout, write) => match result {
                Ok(result) => result,
                Err(_) => {
                    let message = format!(
                        "writing '{}' to {} took longer than {:?}",
                        packet.packet_type, self.peer.device_id, self.write_timeout
                    );
                    warn!("Session {}: {}", self.id, message);
                    self.signal_close(CloseReason::Error(message.clone()));
                    Err(ProtocolError::Timeout(message))
                }
            },
        }
    }

    /// Close the session. Idempotent, and never waits on the peer.
    ///
    /// The read task ends on its own; use [`DeviceSession::wait_closed`] to
    /// wait for it.
    pub async fn close(&self) {
        if !self.signal_close(CloseReason::Local) {
            return;
        }
        debug!("Closing session {} with {}", self.id, self.peer.device_id);

        // A write in progress gives the writer up once it sees the signal;
        // the read task shuts the transport down then
        let writer = match self.writer.try_lock() {
            Ok(mut writer) => writer.take(),
            Err(_) => None,
        };
        if let Some(writer) = writer {
            self.shutdown_writer(writer).await;
        }
    }

    /// Wait until the read task has finished
    ///
    /// Must not be called from a packet handler of this same session.
    pub async fn wait_closed(&self) {
        let task = lock(&self.reader_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Session {} read task ended abnormally: {}", self.id, e);
            }
        }
    }

    /// Mark the session closed and wake everything watching it. Returns
    /// whether this call closed it.
    fn signal_close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *lock(&self.close_reason) = Some(reason);
        self.cancel.send_replace(true);
        true
    }

    async fn release_writer(&self) {
        self.signal_close(CloseReason::Local);
        let writer = self.writer.lock().await.take();
        if let Some(writer) = writer {
            self.shutdown_writer(writer).await;
        }
    }

    async fn shutdown_writer(&self, mut writer: SessionWriter) {
        match tokio::time::timeout(self.write_timeout, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Session {} shutdown: {}", self.id, e),
            Err(_) => debug!("Session {} shutdown timed out", self.id),
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: SessionReader,
        dispatcher: Arc<PluginDispatcher>,
        mut cancelled: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) {
        let context = PeerContext {
            device_id: self.peer.device_id.clone(),
            device_name: self.peer.device_name.clone(),
            sender: PeerSender::new(self.clone()),
        };

        let reason = loop {
            tokio::select! {
                _ = closed_signal(&mut cancelled) => {
                    break lock(&self.close_reason).clone().unwrap_or(CloseReason::Local);
                }
                read = reader.read_packet() => match read {
                    Ok(Some(packet)) => {
                        if self.handle_protocol_packet(&packet, &dispatcher, &events) {
                            continue;
                        }
                        dispatcher.dispatch(&packet, &context).await;
                    }
                    Ok(None) => break CloseReason::PeerClosed,
                    Err(e) => {
                        warn!("Session {} with {} failed: {}", self.id, self.peer.device_id, e);
                        break CloseReason::Error(e.to_string());
                    }
                },
            }
        };

        drop(context);
        drop(reader);
        self.release_writer().await;

        info!(
            "Session {} with {} closed ({:?})",
            self.id, self.peer.device_id, reason
        );
        let _ = events.send(SessionEvent::Closed {
            device_id: self.peer.device_id.clone(),
            session_id: self.id,
            reason,
        });
    }

    /// Handle packets addressed to the session itself. Returns whether the
    /// packet was consumed.
    fn handle_protocol_packet(
        &self,
        packet: &Packet,
        dispatcher: &PluginDispatcher,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> bool {
        if packet.is_type(PACKET_TYPE_CAPABILITIES) {
            let incoming = packet
                .get_body_field::<Vec<String>>("incomingCapabilities")
                .unwrap_or_default();
            let allowed = dispatcher.negotiate(&incoming);
            debug!(
                "{} accepts {} of our packet types",
                self.peer.device_id,
                allowed.len()
            );
            *self.outbound.write().unwrap_or_else(|e| e.into_inner()) = allowed;
            return true;
        }

        if packet.is_type(PACKET_TYPE_PAIR) {
            match PairingPacket::from_packet(packet) {
                Ok(PairingPacket { pair: false }) => {
                    info!("{} unpaired us", self.peer.device_id);
                    let _ = events.send(SessionEvent::PeerUnpaired {
                        device_id: self.peer.device_id.clone(),
                        session_id: self.id,
                    });
                }
                Ok(PairingPacket { pair: true }) => {
                    debug!("Ignoring pairing request from trusted {}", self.peer.device_id);
                }
                Err(e) => warn!("Bad pairing packet from {}: {}", self.peer.device_id, e),
            }
            return true;
        }

        false
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("device_id", &self.peer.device_id)
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}
