//! Sighting deduplication and the diagnostic sighting table

use crate::DeviceInfo;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Suppresses repeated discovery events for the same device
///
/// A device produces at most one event per window, measured from the last
/// event emitted for it.
#[derive(Debug)]
pub struct SightingFilter {
    window: Duration,
    last_emitted: HashMap<String, Instant>,
}

impl SightingFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emitted: HashMap::new(),
        }
    }

    /// Whether a sighting of `device_id` at `now` should produce an event
    pub fn should_emit(&mut self, device_id: &str, now: Instant) -> bool {
        match self.last_emitted.get(device_id) {
            Some(last) if now.saturating_duration_since(*last) < self.window => false,
            _ => {
                let window = self.window;
                self.last_emitted
                    .retain(|_, last| now.saturating_duration_since(*last) < window);
                self.last_emitted.insert(device_id.to_string(), now);
                true
            }
        }
    }
}

/// One recorded announcement source, kept for diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sighting {
    pub info: DeviceInfo,
    pub address: SocketAddr,
    /// Whether the announced protocol version is one we can talk to
    pub compatible: bool,
    /// Number of announcements received since the service started
    pub count: u64,
    /// UNIX timestamp of the latest announcement, seconds
    pub last_seen: u64,
}

impl Sighting {
    pub fn new(info: DeviceInfo, address: SocketAddr) -> Self {
        let compatible = info.is_compatible();
        Self {
            info,
            address,
            compatible,
            count: 1,
            last_seen: now_secs(),
        }
    }

    /// Fold a newer announcement from the same device into this sighting
    pub fn update(&mut self, info: DeviceInfo, address: SocketAddr) {
        self.compatible = info.is_compatible();
        self.info = info;
        self.address = address;
        self.count += 1;
        self.last_seen = now_secs();
    }

    /// Whether no announcement arrived within `ttl`
    pub fn is_stale(&self, ttl: Duration) -> bool {
        now_secs().saturating_sub(self.last_seen) > ttl.as_secs()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
