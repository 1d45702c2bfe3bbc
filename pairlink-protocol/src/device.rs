//! Pairlink Device Identity and State
//!
//! A [`Device`] is created the first time a peer is seen and is never removed
//! automatically. Its trust state mirrors the trust store and the pairing
//! state machine; its connection state mirrors the session table.
//!
//! ## Identity Packet Format
//!
//! Identity packets (`pairlink.identity`) contain:
//! - `deviceId`: UUIDv4 with underscores (e.g., `740bd4b9_b418_4ee4_97d6_caf1da8151be`)
//! - `deviceName`: 1-32 character device name
//! - `deviceType`: desktop, laptop, phone, tablet, or tv
//! - `protocolVersion`: protocol version integer
//! - `incomingCapabilities`: packet types this device can receive
//! - `outgoingCapabilities`: packet types this device can send
//! - `tcpPort`: TCP port the device accepts connections on

use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{Fingerprint, Packet, ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    /// Convert device type to string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }

    /// Parse a device type tag
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "desktop" => Some(DeviceType::Desktop),
            "laptop" => Some(DeviceType::Laptop),
            "phone" => Some(DeviceType::Phone),
            "tablet" => Some(DeviceType::Tablet),
            "tv" => Some(DeviceType::Tv),
            _ => None,
        }
    }
}

/// Device identity information
///
/// Contains everything a device announces about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Unique device identifier (UUIDv4 with underscores)
    pub device_id: String,

    /// Human-readable device name (1-32 characters)
    pub device_name: String,

    /// Type of device
    pub device_type: DeviceType,

    /// Protocol version
    pub protocol_version: u32,

    /// Packet types this device can receive
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    pub outgoing_capabilities: Vec<String>,

    /// TCP port for connections
    pub tcp_port: u16,
}

impl DeviceInfo {
    /// Create a new DeviceInfo with a freshly generated device id
    ///
    /// ```
    /// use pairlink_protocol::{DeviceInfo, DeviceType};
    ///
    /// let info = DeviceInfo::new("My Computer", DeviceType::Desktop, 1739);
    /// assert_eq!(info.device_id.len(), 36);
    /// ```
    pub fn new(device_name: impl Into<String>, device_type: DeviceType, tcp_port: u16) -> Self {
        Self::with_id(Self::generate_device_id(), device_name, device_type, tcp_port)
    }

    /// Generate a UUIDv4 device ID with underscores
    pub fn generate_device_id() -> String {
        Uuid::new_v4().to_string().replace('-', "_")
    }

    /// Create a DeviceInfo with explicit device ID
    pub fn with_id(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        let device_name = device_name.into();
        if device_name.is_empty() || device_name.chars().count() > 32 {
            warn!(
                "Device name should be 1-32 characters, got: {}",
                device_name
            );
        }

        Self {
            device_id: device_id.into(),
            device_name,
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port,
        }
    }

    /// Add an incoming capability
    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.push(capability.into());
        self
    }

    /// Add an outgoing capability
    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(capability.into());
        self
    }

    /// Set all incoming capabilities at once
    pub fn with_incoming_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.incoming_capabilities = capabilities;
        self
    }

    /// Set all outgoing capabilities at once
    pub fn with_outgoing_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.outgoing_capabilities = capabilities;
        self
    }

    /// Whether this device speaks a protocol version we can talk to
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }

    /// Convert DeviceInfo to an identity packet
    pub fn to_identity_packet(&self) -> Packet {
        Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "deviceType": self.device_type.as_str(),
                "protocolVersion": self.protocol_version,
                "incomingCapabilities": self.incoming_capabilities,
                "outgoingCapabilities": self.outgoing_capabilities,
                "tcpPort": self.tcp_port,
            }),
        )
    }

    /// Parse DeviceInfo from an identity packet
    pub fn from_identity_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::MalformedPacket(format!(
                "expected identity packet, got {}",
                packet.packet_type
            )));
        }

        let device_id = packet
            .get_body_field::<String>("deviceId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing deviceId".to_string()))?;

        let device_name = packet
            .get_body_field::<String>("deviceName")
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing deviceName".to_string()))?;

        let device_type_str = packet
            .get_body_field::<String>("deviceType")
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing deviceType".to_string()))?;

        let device_type = DeviceType::parse(&device_type_str).ok_or_else(|| {
            ProtocolError::MalformedPacket(format!("Unknown device type: {}", device_type_str))
        })?;

        let protocol_version = packet
            .get_body_field::<u32>("protocolVersion")
            .ok_or_else(|| {
                ProtocolError::MalformedPacket("Missing protocolVersion".to_string())
            })?;

        let tcp_port = packet
            .get_body_field::<u16>("tcpPort")
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing tcpPort".to_string()))?;

        let incoming_capabilities = packet
            .get_body_field::<Vec<String>>("incomingCapabilities")
            .unwrap_or_default();

        let outgoing_capabilities = packet
            .get_body_field::<Vec<String>>("outgoingCapabilities")
            .unwrap_or_default();

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            incoming_capabilities,
            outgoing_capabilities,
            tcp_port,
        })
    }
}

/// Trust state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    /// Never paired
    Unknown,
    /// A pairing attempt is running
    PairingPending,
    /// Paired; the recorded fingerprint is trusted
    Trusted,
    /// Pairing was declined
    Rejected,
}

impl TrustState {
    pub fn is_trusted(&self) -> bool {
        matches!(self, TrustState::Trusted)
    }
}

/// Device connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Device is disconnected
    Disconnected,
    /// Handshake or pairing in progress
    Connecting,
    /// A session is open
    Connected,
    /// Last connection attempt failed
    Failed,
}

impl ConnectionState {
    /// Check if device is connected
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Complete device state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Announced identity
    #[serde(flatten)]
    pub info: DeviceInfo,

    /// Current connection state
    pub connection_state: ConnectionState,

    /// Current trust state
    pub trust_state: TrustState,

    /// Fingerprint of the certificate the device last presented
    pub certificate_fingerprint: Option<Fingerprint>,

    /// Address the device was last seen at
    pub address: Option<SocketAddr>,

    /// Last time device was seen (UNIX timestamp, seconds)
    pub last_seen: u64,

    /// Last connection timestamp (UNIX timestamp, seconds)
    pub last_connected: Option<u64>,
}

impl Device {
    /// Create a new device from discovery info
    pub fn from_discovery(info: DeviceInfo, address: Option<SocketAddr>) -> Self {
        Self {
            info,
            connection_state: ConnectionState::Disconnected,
            trust_state: TrustState::Unknown,
            certificate_fingerprint: None,
            address,
            last_seen: current_timestamp(),
            last_connected: None,
        }
    }

    /// Get device ID
    pub fn id(&self) -> &str {
        &self.info.device_id
    }

    /// Get device name
    pub fn name(&self) -> &str {
        &self.info.device_name
    }

    /// Check if device is currently connected
    pub fn is_connected(&self) -> bool {
        self.connection_state.is_connected()
    }

    /// Check if device is trusted
    pub fn is_trusted(&self) -> bool {
        self.trust_state.is_trusted()
    }

    /// Update last seen timestamp
    pub fn update_last_seen(&mut self) {
        self.last_seen = current_timestamp();
    }

    /// Address to connect to: the last seen IP with the announced TCP port
    pub fn connect_address(&self) -> Option<SocketAddr> {
        self.address
            .map(|addr| SocketAddr::new(addr.ip(), self.info.tcp_port))
    }

    /// Mark device as connected
    pub fn mark_connected(&mut self) {
        self.connection_state = ConnectionState::Connected;
        self.last_connected = Some(current_timestamp());
        self.update_last_seen();
        info!("Device {} ({}) connected", self.id(), self.name());
    }

    /// Mark device as disconnected
    pub fn mark_disconnected(&mut self) {
        self.connection_state = ConnectionState::Disconnected;
        self.update_last_seen();
        info!("Device {} ({}) disconnected", self.id(), self.name());
    }

    /// Mark device as connecting
    pub fn mark_connecting(&mut self) {
        self.connection_state = ConnectionState::Connecting;
        self.update_last_seen();
        debug!("Device {} ({}) connecting", self.id(), self.name());
    }

    /// Mark device connection as failed
    pub fn mark_failed(&mut self) {
        self.connection_state = ConnectionState::Failed;
        warn!("Device {} ({}) connection failed", self.id(), self.name());
    }
}

/// Registry of every device seen since the engine started
#[derive(Debug, Default)]
pub struct DeviceManager {
    devices: HashMap<String, Device>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_device(&mut self, device: Device) {
        let device_id = device.id().to_string();
        debug!("Adding/updating device: {} ({})", device.name(), device_id);
        self.devices.insert(device_id, device);
    }

    /// Get a device by ID
    pub fn get_device(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    fn device_mut(&mut self, device_id: &str) -> Result<&mut Device> {
        self.devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))
    }

    /// Get all devices
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Update device from a discovery sighting or handshake identity
    pub fn update_from_discovery(&mut self, info: DeviceInfo, address: Option<SocketAddr>) {
        let device_id = info.device_id.clone();

        if let Some(device) = self.devices.get_mut(&device_id) {
            device.info = info;
            if address.is_some() {
                device.address = address;
            }
            device.update_last_seen();
            debug!("Updated device from discovery: {}", device_id);
        } else {
            self.add_device(Device::from_discovery(info, address));
        }
    }

    /// Update device trust state and, when known, its fingerprint
    pub fn update_trust(
        &mut self,
        device_id: &str,
        state: TrustState,
        fingerprint: Option<Fingerprint>,
    ) -> Result<()> {
        let device = self.device_mut(device_id)?;
        device.trust_state = state;
        if fingerprint.is_some() {
            device.certificate_fingerprint = fingerprint;
        }
        device.update_last_seen();
        Ok(())
    }

    pub fn mark_connecting(&mut self, device_id: &str) -> Result<()> {
        self.device_mut(device_id)?.mark_connecting();
        Ok(())
    }

    pub fn mark_connected(&mut self, device_id: &str) -> Result<()> {
        self.device_mut(device_id)?.mark_connected();
        Ok(())
    }

    pub fn mark_disconnected(&mut self, device_id: &str) -> Result<()> {
        self.device_mut(device_id)?.mark_disconnected();
        Ok(())
    }

    /// Record a failed connection attempt; an open session is left alone
    pub fn mark_failed(&mut self, device_id: &str) -> Result<()> {
        let device = self.device_mut(device_id)?;
        if !device.is_connected() {
            device.mark_failed();
        }
        Ok(())
    }
}

/// Current UNIX timestamp in seconds
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_device_info(id: &str) -> DeviceInfo {
        DeviceInfo::with_id(id, "Test Device", DeviceType::Phone, 1739)
            .with_incoming_capability("pairlink.ping")
            .with_outgoing_capability("pairlink.battery")
    }

    #[test]
    fn test_device_type_round_trip() {
        for ty in [
            DeviceType::Desktop,
            DeviceType::Laptop,
            DeviceType::Phone,
            DeviceType::Tablet,
            DeviceType::Tv,
        ] {
            assert_eq!(DeviceType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(DeviceType::parse("toaster"), None);
    }

    #[test]
    fn test_device_id_format() {
        let info = DeviceInfo::new("Test", DeviceType::Desktop, 1739);
        assert_eq!(info.device_id.len(), 36);
        assert_eq!(info.device_id.matches('_').count(), 4);
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_identity_packet_roundtrip() {
        let original = create_test_device_info("test_device_id");

        let packet = original.to_identity_packet();
        assert!(packet.is_type(PACKET_TYPE_IDENTITY));

        let parsed = DeviceInfo::from_identity_packet(&packet).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_invalid_identity_packet() {
        let packet = Packet::new("pairlink.ping", json!({}));
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());

        let packet = Packet::new(PACKET_TYPE_IDENTITY, json!({ "deviceId": "test_id" }));
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());

        let mut info = create_test_device_info("x");
        info.device_id.clear();
        assert!(DeviceInfo::from_identity_packet(&info.to_identity_packet()).is_err());
    }

    #[test]
    fn test_compatibility_is_version_equality() {
        let mut info = create_test_device_info("a");
        assert!(info.is_compatible());
        info.protocol_version = PROTOCOL_VERSION + 1;
        assert!(!info.is_compatible());
    }

    #[test]
    fn test_connect_address_uses_announced_port() {
        let addr: SocketAddr = "192.168.1.5:1716".parse().unwrap();
        let device = Device::from_discovery(create_test_device_info("a"), Some(addr));
        assert_eq!(
            device.connect_address(),
            Some("192.168.1.5:1739".parse().unwrap())
        );
    }

    #[test]
    fn test_device_manager_lifecycle() {
        let mut manager = DeviceManager::new();
        manager.update_from_discovery(create_test_device_info("a"), None);
        manager.update_from_discovery(create_test_device_info("b"), None);
        assert_eq!(manager.devices().count(), 2);

        let state = |m: &DeviceManager, id: &str| m.get_device(id).unwrap().connection_state;
        assert_eq!(state(&manager, "a"), ConnectionState::Disconnected);

        manager.mark_connecting("a").unwrap();
        assert_eq!(state(&manager, "a"), ConnectionState::Connecting);
        manager.mark_connected("a").unwrap();
        assert!(manager.get_device("a").unwrap().is_connected());
        assert!(manager.get_device("a").unwrap().last_connected.is_some());

        // A failed second attempt does not hide the open session
        manager.mark_failed("a").unwrap();
        assert_eq!(state(&manager, "a"), ConnectionState::Connected);

        manager
            .update_trust("a", TrustState::Trusted, Some(Fingerprint::from_bytes(vec![1; 32])))
            .unwrap();
        assert!(manager.get_device("a").unwrap().is_trusted());
        assert!(manager.get_device("a").unwrap().certificate_fingerprint.is_some());

        manager.mark_disconnected("a").unwrap();
        assert!(!manager.get_device("a").unwrap().is_connected());

        manager.mark_connecting("b").unwrap();
        manager.mark_failed("b").unwrap();
        assert_eq!(state(&manager, "b"), ConnectionState::Failed);

        assert!(matches!(
            manager.mark_connected("missing"),
            Err(ProtocolError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_rediscovery_keeps_trust_state() {
        let mut manager = DeviceManager::new();
        manager.update_from_discovery(create_test_device_info("a"), None);
        manager.update_trust("a", TrustState::Trusted, None).unwrap();

        let mut renamed = create_test_device_info("a");
        renamed.device_name = "Renamed".to_string();
        manager.update_from_discovery(renamed, None);

        let device = manager.get_device("a").unwrap();
        assert_eq!(device.name(), "Renamed");
        assert!(device.is_trusted());
    }
}
