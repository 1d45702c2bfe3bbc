//! Pairlink Device Discovery
//!
//! Devices announce themselves by sending identity packets as UDP datagrams
//! on a well-known port, one packet per datagram.
//!
//! ## Discovery Protocol
//!
//! 1. **Announce**: broadcast the identity packet every 2 seconds for the
//!    first 30 seconds after start
//! 2. **Listen**: receive identity packets from other devices for as long as
//!    the service runs
//! 3. **Reply**: answer a device's first sighting in each announcement
//!    window with a directed identity packet, so devices past their
//!    announcement window still find late joiners
//! 4. **Connect**: the engine connects to the announced `tcpPort`
//!
//! ## Port Configuration
//!
//! - Primary port: UDP 1716
//! - Fallback range: 1714-1764

pub mod dedup;
pub mod events;
pub mod service;

pub use dedup::{Sighting, SightingFilter};
pub use events::DiscoveryEvent;
pub use service::{
    DiscoveryConfig, DiscoveryService, BROADCAST_ADDR, DEFAULT_ANNOUNCEMENT_WINDOW,
    DEFAULT_BROADCAST_INTERVAL, DEFAULT_DEDUP_WINDOW, DISCOVERY_PORT, PORT_RANGE_END,
    PORT_RANGE_START,
};
