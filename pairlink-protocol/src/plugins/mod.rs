//! Pairlink Plugin Dispatcher
//!
//! Packet handlers extend a session with features. Each handler declares the
//! packet types it can receive (`incoming`) and send (`outgoing`); the
//! dispatcher routes inbound packets to handlers by exact type match.
//!
//! ## Capability negotiation
//!
//! Devices announce their capabilities in the identity packet and again in a
//! `pairlink.capabilities` packet when a session opens. A session only sends
//! packet types that are both in the local outgoing set and in the peer's
//! incoming set. Packets that fall outside that intersection are dropped with
//! a debug diagnostic when sent through a [`PeerSender`].
//!
//! ## Registration
//!
//! At most one handler may claim a given incoming type, and handler names are
//! unique. Conflicts fail at registration time; nothing is overridden
//! silently. Protocol packet types (`pairlink.identity`, `pairlink.pair`,
//! `pairlink.capabilities`) cannot be claimed.
//!
//! ## Example Handler
//!
//! ```rust
//! use async_trait::async_trait;
//! use pairlink_protocol::plugins::{Capability, PacketHandler, PeerContext};
//! use pairlink_protocol::{Packet, Result};
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl PacketHandler for Ping {
//!     fn name(&self) -> &str {
//!         "ping"
//!     }
//!
//!     fn capability(&self) -> Capability {
//!         Capability::new(["pairlink.ping"], ["pairlink.ping"])
//!     }
//!
//!     async fn handle_packet(&self, _packet: &Packet, peer: &PeerContext) -> Result<()> {
//!         peer.sender
//!             .send(&Packet::new("pairlink.ping", serde_json::json!({})))
//!             .await?;
//!         Ok(())
//!     }
//! }
//! ```

use crate::packet::{PACKET_TYPE_CAPABILITIES, PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR};
use crate::session::DeviceSession;
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Packet types reserved for the protocol itself
const RESERVED_TYPES: [&str; 3] = [
    PACKET_TYPE_IDENTITY,
    PACKET_TYPE_PAIR,
    PACKET_TYPE_CAPABILITIES,
];

/// Packet types a handler receives and sends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capability {
    pub incoming: BTreeSet<String>,
    pub outgoing: BTreeSet<String>,
}

impl Capability {
    pub fn new<I, O>(incoming: I, outgoing: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            incoming: incoming.into_iter().map(Into::into).collect(),
            outgoing: outgoing.into_iter().map(Into::into).collect(),
        }
    }
}

/// A feature that consumes packets of the types it declares
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Short, unique identifier such as "ping"
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    /// Handle one inbound packet
    ///
    /// Called in arrival order for each session. An error is logged and the
    /// session keeps running.
    async fn handle_packet(&self, packet: &Packet, peer: &PeerContext) -> Result<()>;
}

/// Sends packets to one peer through its session, applying the negotiated
/// outbound filter
#[derive(Clone)]
pub struct PeerSender {
    session: Arc<DeviceSession>,
}

impl PeerSender {
    pub fn new(session: Arc<DeviceSession>) -> Self {
        Self { session }
    }

    /// Send `packet` if the peer accepts its type
    ///
    /// Returns `Ok(false)` when the packet was filtered out.
    pub async fn send(&self, packet: &Packet) -> Result<bool> {
        if !self.session.allows_outgoing(&packet.packet_type) {
            debug!(
                "Not sending '{}' to {}: not in the negotiated capability set",
                packet.packet_type,
                self.session.device_id()
            );
            return Ok(false);
        }
        self.session.send(packet).await?;
        Ok(true)
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }
}

impl fmt::Debug for PeerSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSender")
            .field("device_id", &self.session.device_id())
            .finish()
    }
}

/// The peer a packet came from
#[derive(Debug, Clone)]
pub struct PeerContext {
    pub device_id: String,
    pub device_name: String,
    pub sender: PeerSender,
}

/// Capability registry and packet router
#[derive(Default)]
pub struct PluginDispatcher {
    handlers: Vec<Arc<dyn PacketHandler>>,

    /// Incoming packet type -> index into `handlers`
    routes: HashMap<String, usize>,
}

impl PluginDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler
    ///
    /// # Errors
    ///
    /// Returns `Plugin` if:
    /// - A handler with the same name is already registered
    /// - One of its incoming types is already handled by another handler
    /// - One of its incoming types is a protocol packet type
    pub fn register(&mut self, handler: Arc<dyn PacketHandler>) -> Result<()> {
        let name = handler.name().to_string();
        if self.handlers.iter().any(|h| h.name() == name) {
            return Err(ProtocolError::Plugin(format!(
                "Handler '{}' is already registered",
                name
            )));
        }

        let capability = handler.capability();
        for packet_type in &capability.incoming {
            if RESERVED_TYPES.contains(&packet_type.as_str()) {
                return Err(ProtocolError::Plugin(format!(
                    "Handler '{}' cannot claim protocol packet type '{}'",
                    name, packet_type
                )));
            }
            if let Some(existing) = self.routes.get(packet_type) {
                return Err(ProtocolError::Plugin(format!(
                    "Packet type '{}' already handled by '{}'",
                    packet_type,
                    self.handlers[*existing].name()
                )));
            }
        }

        let index = self.handlers.len();
        for packet_type in capability.incoming {
            self.routes.insert(packet_type, index);
        }
        info!("Registered packet handler: {}", name);
        self.handlers.push(handler);
        Ok(())
    }

    /// Route `packet` to its handler
    ///
    /// Returns whether a handler was found. Packets without a handler are
    /// dropped with a diagnostic; handler errors are logged.
    pub async fn dispatch(&self, packet: &Packet, peer: &PeerContext) -> bool {
        let Some(&index) = self.routes.get(&packet.packet_type) else {
            debug!(
                "No handler for '{}' from {}, dropping",
                packet.packet_type, peer.device_id
            );
            return false;
        };

        let handler = &self.handlers[index];
        if let Err(e) = handler.handle_packet(packet, peer).await {
            error!(
                "Handler '{}' failed on '{}' from {}: {}",
                handler.name(),
                packet.packet_type,
                peer.device_id,
                e
            );
        }
        true
    }

    /// Packet types we may send to a peer that receives `peer_incoming`
    pub fn negotiate<'a, I>(&self, peer_incoming: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let outgoing = self.outgoing_set();
        peer_incoming
            .into_iter()
            .filter(|t| outgoing.contains(*t))
            .cloned()
            .collect()
    }

    fn outgoing_set(&self) -> BTreeSet<String> {
        self.handlers
            .iter()
            .flat_map(|h| h.capability().outgoing)
            .collect()
    }

    /// Every packet type a handler is registered for, sorted
    pub fn local_incoming(&self) -> Vec<String> {
        let mut types: Vec<String> = self.routes.keys().cloned().collect();
        types.sort();
        types
    }

    /// Every packet type some handler may send, sorted
    pub fn local_outgoing(&self) -> Vec<String> {
        self.outgoing_set().into_iter().collect()
    }

    /// Name of the handler for `packet_type`
    pub fn handler_for(&self, packet_type: &str) -> Option<&str> {
        self.routes
            .get(packet_type)
            .map(|&index| self.handlers[index].name())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Capability announcement sent when a session opens
    pub fn capabilities_packet(&self) -> Packet {
        Packet::new(
            PACKET_TYPE_CAPABILITIES,
            json!({
                "incomingCapabilities": self.local_incoming(),
                "outgoingCapabilities": self.local_outgoing(),
            }),
        )
    }
}
