//! Pairing Service
//!
//! Drives [`PairingHandler`]s over negotiated but untrusted links. The
//! connecting side runs [`PairingService::run_outgoing`], the listening side
//! runs [`PairingService::run_incoming`] and asks the [`PairingDelegate`].
//!
//! On acceptance the peer fingerprint is written to the trust store before
//! the link is handed back, and on the accepting side before the accept
//! packet is sent. Only one attempt per peer may be active at a time.

use super::events::PairingEvent;
use super::handler::{PairingHandler, PairingState, PAIRING_TIMEOUT};
use crate::connection::EstablishedLink;
use crate::packet::PACKET_TYPE_PAIR;
use crate::trust::TrustStore;
use crate::{DeviceInfo, Fingerprint, Packet, ProtocolError, Result, TrustState};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Pairing service configuration
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// How long a pending state may last
    pub timeout: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout: PAIRING_TIMEOUT,
        }
    }
}

/// Answer of the local approver to an incoming request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingDecision {
    Accept,
    Reject,
}

/// How a pairing attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    Accepted,
    Rejected,
    TimedOut,
}

/// User-facing collaborator for pairing
#[async_trait]
pub trait PairingDelegate: Send + Sync {
    /// Decide on an incoming request. Never answered automatically by the
    /// engine; the attempt times out if this does not return in time.
    async fn on_incoming_pairing_request(
        &self,
        device: &DeviceInfo,
        fingerprint: &Fingerprint,
    ) -> PairingDecision;

    async fn on_pairing_result(&self, _device: &DeviceInfo, _outcome: PairingOutcome) {}

    /// A trusted device presented a different certificate
    async fn on_trust_violation(
        &self,
        _device_id: &str,
        _expected: &Fingerprint,
        _presented: &Fingerprint,
    ) {
    }
}

/// Delegate that answers every request the same way
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub PairingDecision);

#[async_trait]
impl PairingDelegate for FixedDecision {
    async fn on_incoming_pairing_request(
        &self,
        device: &DeviceInfo,
        fingerprint: &Fingerprint,
    ) -> PairingDecision {
        info!(
            "Answering pairing request from {} ({}) with {:?}",
            device.device_name, fingerprint, self.0
        );
        self.0
    }
}

/// Set of peers with an active pairing attempt
#[derive(Debug, Clone, Default)]
pub struct PairingRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl PairingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the attempt slot for `device_id`
    ///
    /// Fails with `PairingInProgress` if it is taken. The slot is released
    /// when the guard is dropped.
    pub fn try_begin(&self, device_id: &str) -> Result<PairingGuard> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(device_id.to_string()) {
            warn!("Refusing second pairing attempt with {}", device_id);
            return Err(ProtocolError::PairingInProgress(device_id.to_string()));
        }
        Ok(PairingGuard {
            active: self.active.clone(),
            device_id: device_id.to_string(),
        })
    }

    pub fn is_active(&self, device_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(device_id)
    }
}

/// Held while a pairing attempt runs
#[derive(Debug)]
pub struct PairingGuard {
    active: Arc<Mutex<HashSet<String>>>,
    device_id: String,
}

impl Drop for PairingGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.device_id);
    }
}

/// Resolves once the abort flag is raised
async fn aborted(mut flag: watch::Receiver<bool>) {
    loop {
        let raised = *flag.borrow_and_update();
        if raised {
            return;
        }
        if flag.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Pairing service for managing device pairing
pub struct PairingService {
    local_fingerprint: Fingerprint,
    trust: Arc<TrustStore>,
    delegate: Arc<dyn PairingDelegate>,
    config: PairingConfig,
    registry: PairingRegistry,
    event_tx: Option<mpsc::UnboundedSender<PairingEvent>>,
    abort_tx: watch::Sender<bool>,
}

impl PairingService {
    pub fn new(
        local_fingerprint: Fingerprint,
        trust: Arc<TrustStore>,
        delegate: Arc<dyn PairingDelegate>,
        config: PairingConfig,
    ) -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            local_fingerprint,
            trust,
            delegate,
            config,
            registry: PairingRegistry::new(),
            event_tx: None,
            abort_tx,
        }
    }

    /// Receive pairing events. A later call replaces the earlier receiver.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PairingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_tx = Some(tx);
        rx
    }

    pub fn delegate(&self) -> &Arc<dyn PairingDelegate> {
        &self.delegate
    }

    /// Whether an attempt with `device_id` is running
    pub fn is_pairing(&self, device_id: &str) -> bool {
        self.registry.is_active(device_id)
    }

    /// End every running attempt as `TimedOut`, and any started later,
    /// until [`PairingService::resume`]
    pub fn abort_all(&self) {
        self.abort_tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.abort_tx.send_replace(false);
    }

    fn emit(&self, event: PairingEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Ask the peer on `link` to pair
    ///
    /// Returns the link once the peer accepted and the trust record is
    /// written. Every other outcome closes the link.
    pub async fn run_outgoing(&self, mut link: EstablishedLink) -> Result<EstablishedLink> {
        let device_id = link.peer.device_id.clone();
        let _guard = self.registry.try_begin(&device_id)?;
        let mut handler = PairingHandler::new(device_id.clone());

        let request = handler.request_pairing()?;
        link.stream.write_packet(&request).await?;
        self.emit(PairingEvent::RequestSent {
            device_id: device_id.clone(),
            device_name: link.peer.device_name.clone(),
            our_fingerprint: self.local_fingerprint.clone(),
        });

        let deadline = Instant::now() + self.config.timeout;
        let abort = aborted(self.abort_tx.subscribe());
        tokio::pin!(abort);

        while !handler.state().is_terminal() {
            tokio::select! {
                read = link.stream.read_packet() => {
                    let packet = expect_packet(read, &device_id)?;
                    feed(&mut handler, &packet);
                }
                _ = sleep_until(deadline) => handler.time_out()?,
                _ = &mut abort => handler.time_out()?,
            }
        }

        self.conclude(handler.state(), None, link).await
    }

    /// Wait for the peer on `link` to ask for pairing and let the delegate
    /// decide
    pub async fn run_incoming(&self, mut link: EstablishedLink) -> Result<EstablishedLink> {
        let device_id = link.peer.device_id.clone();
        let _guard = self.registry.try_begin(&device_id)?;
        let mut handler = PairingHandler::new(device_id.clone());

        let abort = aborted(self.abort_tx.subscribe());
        tokio::pin!(abort);

        let deadline = Instant::now() + self.config.timeout;
        while handler.state() == PairingState::Unpaired {
            tokio::select! {
                read = link.stream.read_packet() => {
                    let packet = expect_packet(read, &device_id)?;
                    feed(&mut handler, &packet);
                }
                _ = sleep_until(deadline) => handler.time_out()?,
                _ = &mut abort => handler.time_out()?,
            }
        }

        let mut response = None;
        if handler.state() == PairingState::IncomingRequestReceived {
            self.emit(PairingEvent::RequestReceived {
                device_id: device_id.clone(),
                device_name: link.peer.device_name.clone(),
                their_fingerprint: link.fingerprint.clone(),
            });

            let EstablishedLink {
                peer,
                fingerprint,
                stream,
                ..
            } = &mut link;
            let mut decision = self
                .delegate
                .on_incoming_pairing_request(peer, fingerprint);

            let deadline = Instant::now() + self.config.timeout;
            while handler.state() == PairingState::IncomingRequestReceived {
                tokio::select! {
                    answer = &mut decision => {
                        response = Some(match answer {
                            PairingDecision::Accept => handler.accept()?,
                            PairingDecision::Reject => handler.reject()?,
                        });
                    }
                    read = stream.read_packet() => {
                        let packet = expect_packet(read, &device_id)?;
                        feed(&mut handler, &packet);
                    }
                    _ = sleep_until(deadline) => handler.time_out()?,
                    _ = &mut abort => handler.time_out()?,
                }
            }
        }

        self.conclude(handler.state(), response, link).await
    }

    /// Persist the outcome, answer the peer, then notify
    async fn conclude(
        &self,
        state: PairingState,
        response: Option<Packet>,
        mut link: EstablishedLink,
    ) -> Result<EstablishedLink> {
        let device_id = link.peer.device_id.clone();

        let recorded = match state {
            PairingState::Accepted => {
                self.trust
                    .put(&device_id, link.fingerprint.clone(), TrustState::Trusted)
            }
            PairingState::Rejected => {
                if let Err(e) =
                    self.trust
                        .put(&device_id, link.fingerprint.clone(), TrustState::Rejected)
                {
                    warn!("Failed to record rejection of {}: {}", device_id, e);
                }
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = recorded {
            error!("Failed to record trust for {}: {}", device_id, e);
            let _ = link.stream.shutdown().await;
            return Err(e);
        }

        if let Some(packet) = response {
            if let Err(e) = link.stream.write_packet(&packet).await {
                warn!("Failed to send pairing response to {}: {}", device_id, e);
                if state == PairingState::Accepted {
                    return Err(e);
                }
            }
        }

        let (event, outcome) = match state {
            PairingState::Accepted => (
                PairingEvent::Accepted {
                    device_id: device_id.clone(),
                    device_name: link.peer.device_name.clone(),
                    fingerprint: link.fingerprint.clone(),
                },
                PairingOutcome::Accepted,
            ),
            PairingState::Rejected => (
                PairingEvent::Rejected {
                    device_id: device_id.clone(),
                    reason: None,
                },
                PairingOutcome::Rejected,
            ),
            _ => (
                PairingEvent::TimedOut {
                    device_id: device_id.clone(),
                },
                PairingOutcome::TimedOut,
            ),
        };
        self.emit(event);
        self.delegate.on_pairing_result(&link.peer, outcome).await;

        match outcome {
            PairingOutcome::Accepted => {
                info!(
                    "Paired with {} ({})",
                    link.peer.device_name, link.fingerprint
                );
                Ok(link)
            }
            PairingOutcome::Rejected => {
                let _ = link.stream.shutdown().await;
                Err(ProtocolError::PairingRejected(device_id))
            }
            PairingOutcome::TimedOut => {
                let _ = link.stream.shutdown().await;
                Err(ProtocolError::PairingTimedOut(device_id))
            }
        }
    }
}

fn expect_packet(read: Result<Option<Packet>>, device_id: &str) -> Result<Packet> {
    read?.ok_or_else(|| {
        ProtocolError::Transport(format!("{} closed the connection during pairing", device_id))
    })
}

/// Apply a packet received during pairing. Anything but a valid pairing
/// packet is ignored: the peer is not trusted yet.
fn feed(handler: &mut PairingHandler, packet: &Packet) {
    if !packet.is_type(PACKET_TYPE_PAIR) {
        debug!(
            "Ignoring '{}' from untrusted {}",
            packet.packet_type,
            handler.device_id()
        );
        return;
    }
    if let Err(e) = handler.handle_pairing_packet(packet) {
        warn!("Ignoring pairing packet from {}: {}", handler.device_id(), e);
    }
}
