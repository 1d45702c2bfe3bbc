//! Engine Events
//!
//! Events the engine publishes for UI layers and daemons.

use crate::pairing::PairingEvent;
use crate::transport::TransportAddress;
use crate::{DeviceInfo, Fingerprint};
use std::net::SocketAddr;

/// Engine event types
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The engine is listening
    Started {
        /// Connection port
        tcp_port: u16,
        /// Discovery port
        discovery_port: Option<u16>,
    },

    /// The engine stopped and closed every session
    Stopped,

    /// A compatible device announced itself
    DeviceDiscovered {
        /// Announced identity
        info: DeviceInfo,
        /// Source of the announcement
        address: SocketAddr,
    },

    /// A trusted session is open
    SessionOpened {
        device_id: String,
        device_name: String,
        fingerprint: Fingerprint,
    },

    /// A session ended
    SessionClosed { device_id: String },

    /// Pairing progress
    Pairing(PairingEvent),

    /// A trusted device presented a different certificate. The connection
    /// was refused.
    TrustViolation {
        device_id: String,
        expected: Fingerprint,
        presented: Fingerprint,
    },

    /// A connection attempt failed
    ConnectionFailed {
        /// Device ID (if known)
        device_id: Option<String>,
        /// Remote address
        address: TransportAddress,
        /// Error message
        error: String,
    },
}

impl EngineEvent {
    /// Get the device ID if this event is about a device
    pub fn device_id(&self) -> Option<&str> {
        match self {
            EngineEvent::DeviceDiscovered { info, .. } => Some(&info.device_id),
            EngineEvent::SessionOpened { device_id, .. }
            | EngineEvent::SessionClosed { device_id }
            | EngineEvent::TrustViolation { device_id, .. } => Some(device_id),
            EngineEvent::Pairing(event) => Some(event.device_id()),
            EngineEvent::ConnectionFailed { device_id, .. } => device_id.as_deref(),
            EngineEvent::Started { .. } | EngineEvent::Stopped => None,
        }
    }
}
