//! Discovery Event System
//!
//! Events emitted by the discovery service.

use crate::DeviceInfo;
use std::net::SocketAddr;

/// Events emitted by the discovery service
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A compatible device was sighted and is not a duplicate of a recent
    /// sighting
    DeviceDiscovered {
        /// Announced identity
        info: DeviceInfo,
        /// Source address of the announcement
        address: SocketAddr,
    },

    /// Discovery service started successfully
    ServiceStarted {
        /// Port the discovery service is listening on
        port: u16,
    },

    /// Discovery service stopped
    ServiceStopped,
}

impl DiscoveryEvent {
    /// Check if this is a device discovered event
    pub fn is_device_discovered(&self) -> bool {
        matches!(self, DiscoveryEvent::DeviceDiscovered { .. })
    }

    /// Get the device ID if this event is about a device
    pub fn device_id(&self) -> Option<&str> {
        match self {
            DiscoveryEvent::DeviceDiscovered { info, .. } => Some(&info.device_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceType;

    #[test]
    fn test_event_accessors() {
        let info = DeviceInfo::with_id("1000", "alpha", DeviceType::Desktop, 1739);
        let event = DiscoveryEvent::DeviceDiscovered {
            info,
            address: "127.0.0.1:1716".parse().unwrap(),
        };
        assert!(event.is_device_discovered());
        assert_eq!(event.device_id(), Some("1000"));

        let event = DiscoveryEvent::ServiceStarted { port: 1716 };
        assert!(!event.is_device_discovered());
        assert_eq!(event.device_id(), None);
    }
}
