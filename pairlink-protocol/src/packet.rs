//! Pairlink Network Packet
//!
//! Packets are JSON objects sent one per line. On the stream channel each
//! serialized packet is followed by exactly one `\n` byte; on the discovery
//! channel each datagram carries one packet.
//!
//! ## Packet Structure
//!
//! - `id`: strictly increasing integer, seeded from the wall clock in milliseconds
//! - `type`: non-empty type tag, e.g. `pairlink.identity`
//! - `body`: JSON object with type-specific fields (may be empty)
//! - `payloadSize`: (optional) size of an out-of-band payload in bytes
//! - `payloadTransferInfo`: (optional) transport hints for that payload

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Identity announcement / handshake packet type
pub const PACKET_TYPE_IDENTITY: &str = "pairlink.identity";

/// Pairing request / response packet type
pub const PACKET_TYPE_PAIR: &str = "pairlink.pair";

/// Capability announcement packet type
pub const PACKET_TYPE_CAPABILITIES: &str = "pairlink.capabilities";

/// Last id handed out by [`next_packet_id`]
static LAST_PACKET_ID: AtomicI64 = AtomicI64::new(0);

/// A Pairlink network packet
///
/// # Examples
///
/// ```
/// use pairlink_protocol::Packet;
/// use serde_json::json;
///
/// let packet = Packet::new("pairlink.ping", json!({}));
/// let bytes = packet.to_bytes().unwrap();
/// assert_eq!(bytes.last(), Some(&b'\n'));
///
/// let parsed = Packet::from_bytes(&bytes).unwrap();
/// assert_eq!(parsed, packet);
/// ```
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Packet {
    /// Ordering / deduplication id, not cryptographic
    pub id: i64,

    /// Packet type tag
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Type-specific parameters, always a JSON object
    pub body: Value,

    /// Optional payload size in bytes (-1 for indefinite streams)
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Optional payload transfer negotiation info
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<HashMap<String, Value>>,
}

impl Packet {
    /// Creates a new packet with the next packet id
    ///
    /// A `null` body is normalised to an empty object.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self::with_id(next_packet_id(), packet_type, body)
    }

    /// Create a new packet with an explicit id
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        let body = match body {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Check the packet invariants: non-empty type, object body
    pub fn validate(&self) -> Result<()> {
        if self.packet_type.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "packet type is empty".to_string(),
            ));
        }
        if !self.body.is_object() {
            return Err(ProtocolError::MalformedPacket(format!(
                "body of '{}' is not an object",
                self.packet_type
            )));
        }
        Ok(())
    }

    /// Serialize packet to bytes with newline terminator
    ///
    /// Compact JSON never contains a raw newline, so every packet occupies
    /// exactly one line.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize a packet from one line
    ///
    /// A trailing `\n` or `\r\n` is accepted, so datagrams and stream lines
    /// share this entry point.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        let value: Value = serde_json::from_slice(trimmed)
            .map_err(|e| ProtocolError::MalformedPacket(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Build a packet from a parsed JSON value, enforcing the invariants
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::MalformedPacket(
                "packet is not a JSON object".to_string(),
            ));
        };

        let id = match object.remove("id") {
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| ProtocolError::MalformedPacket("id is not an integer".into()))?,
            // Some peers send the id as a string
            Some(Value::String(s)) => s
                .parse::<i64>()
                .map_err(|_| ProtocolError::MalformedPacket(format!("invalid id '{}'", s)))?,
            Some(_) => {
                return Err(ProtocolError::MalformedPacket(
                    "id must be a number or string".into(),
                ))
            }
            None => return Err(ProtocolError::MalformedPacket("missing id".into())),
        };

        let packet_type = match object.remove("type") {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::String(_)) => {
                return Err(ProtocolError::MalformedPacket("empty type".into()))
            }
            _ => return Err(ProtocolError::MalformedPacket("missing type".into())),
        };

        let body = match object.remove("body") {
            Some(body @ Value::Object(_)) => body,
            Some(_) => {
                return Err(ProtocolError::MalformedPacket(format!(
                    "body of '{}' is not an object",
                    packet_type
                )))
            }
            None => {
                return Err(ProtocolError::MalformedPacket(format!(
                    "missing body in '{}'",
                    packet_type
                )))
            }
        };

        let payload_size = match object.remove("payloadSize") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_i64().ok_or_else(|| {
                ProtocolError::MalformedPacket("payloadSize is not an integer".into())
            })?),
        };

        let payload_transfer_info = match object.remove("payloadTransferInfo") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map.into_iter().collect()),
            Some(_) => {
                return Err(ProtocolError::MalformedPacket(
                    "payloadTransferInfo is not an object".into(),
                ))
            }
        };

        Ok(Self {
            id,
            packet_type,
            body,
            payload_size,
            payload_transfer_info,
        })
    }

    /// Builder pattern: Set payload size
    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Builder pattern: Set payload transfer info
    pub fn with_payload_transfer_info(mut self, info: HashMap<String, Value>) -> Self {
        self.payload_transfer_info = Some(info);
        self
    }

    /// Builder pattern: Add a key-value pair to the body
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Check if packet is of a specific type (exact match)
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Get a field from the body as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Generate current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

/// Next packet id: the current time in milliseconds, bumped so that ids
/// handed out by this process are strictly increasing
pub fn next_packet_id() -> i64 {
    let now = current_timestamp();
    let mut last = LAST_PACKET_ID.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_PACKET_ID.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_packet() {
        let packet = Packet::new("pairlink.ping", json!({}));
        assert_eq!(packet.packet_type, "pairlink.ping");
        assert!(packet.body.is_object());
        assert!(packet.id > 0);
    }

    #[test]
    fn test_null_body_becomes_empty_object() {
        let packet = Packet::new("pairlink.ping", Value::Null);
        assert_eq!(packet.body, json!({}));
    }

    #[test]
    fn test_serialization_is_single_line() {
        let packet = Packet::new(
            "pairlink.note",
            json!({ "text": "line one\nline two" }),
        );

        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(bytes.last(), Some(&b'\n'));
    }

    #[test]
    fn test_deserialization_with_crlf() {
        let data = "{\"id\":1234567890,\"type\":\"pairlink.ping\",\"body\":{}}\r\n";
        let packet = Packet::from_bytes(data.as_bytes()).unwrap();
        assert_eq!(packet.id, 1234567890);
        assert_eq!(packet.packet_type, "pairlink.ping");
    }

    #[test]
    fn test_roundtrip_preserves_payload_descriptor() {
        let mut info = HashMap::new();
        info.insert("port".to_string(), json!(1739));

        let original = Packet::with_id(7, "pairlink.share", json!({ "filename": "a.txt" }))
            .with_payload_size(1024)
            .with_payload_transfer_info(info);

        let parsed = Packet::from_bytes(&original.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.payload_size, Some(1024));
    }

    #[test]
    fn test_id_as_string() {
        let data = r#"{"id":"1234567890","type":"pairlink.ping","body":{}}"#;
        let packet = Packet::from_bytes(data.as_bytes()).unwrap();
        assert_eq!(packet.id, 1234567890);
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let cases = [
            r#"{"type":"pairlink.ping","body":{}}"#,
            r#"{"id":1,"body":{}}"#,
            r#"{"id":1,"type":"","body":{}}"#,
            r#"{"id":1,"type":"pairlink.ping"}"#,
            r#"{"id":1,"type":"pairlink.ping","body":[]}"#,
            r#"[1,2,3]"#,
            "not json data",
        ];

        for case in cases {
            let result = Packet::from_bytes(case.as_bytes());
            assert!(
                matches!(result, Err(ProtocolError::MalformedPacket(_))),
                "expected malformed for {}",
                case
            );
        }
    }

    #[test]
    fn test_encode_rejects_invalid_packet() {
        let mut packet = Packet::new("pairlink.ping", json!({}));
        packet.body = json!("scalar");
        assert!(packet.to_bytes().is_err());

        let packet = Packet::with_id(1, "", json!({}));
        assert!(packet.to_bytes().is_err());
    }

    #[test]
    fn test_builder_and_body_fields() {
        let packet = Packet::new("pairlink.identity", json!({}))
            .with_body_field("deviceId", "test-device")
            .with_body_field("protocolVersion", 8);

        assert_eq!(
            packet.get_body_field::<String>("deviceId"),
            Some("test-device".to_string())
        );
        assert_eq!(packet.get_body_field::<i64>("protocolVersion"), Some(8));
        assert_eq!(packet.get_body_field::<String>("nonexistent"), None);
    }

    #[test]
    fn test_packet_ids_strictly_increase() {
        let ids: Vec<i64> = (0..1000).map(|_| next_packet_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
