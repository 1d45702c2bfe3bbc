//! Trust Store
//!
//! Maps device ids to the certificate fingerprint that is trusted for them.
//! At most one fingerprint is trusted per device id; presenting a different
//! one is a [`ProtocolError::TrustViolation`], never an overwrite.
//!
//! Reads may run concurrently. Writes for the same device id are serialized;
//! writes for different devices are not. Every write reaches the
//! [`KeyValueStore`] before the call returns.

pub mod store;

pub use store::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};

use crate::{Fingerprint, ProtocolError, Result, TrustState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// Persisted trust record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRecord {
    pub device_id: String,
    pub fingerprint: Fingerprint,
    pub state: TrustState,
    /// UNIX timestamp, seconds
    pub last_seen: u64,
}

/// Trust store over an injected key-value backend
pub struct TrustStore {
    backend: Arc<dyn KeyValueStore>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TrustStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Trust store backed by memory only
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyValueStore::new()))
    }

    /// Per-device write lock. Entries nobody holds are dropped here, so the
    /// table only keeps devices with a write in progress.
    fn device_lock(&self, device_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .write_locks
            .lock()
            .map_err(|_| ProtocolError::Storage("trust lock table poisoned".to_string()))?;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    fn write_record(&self, record: &TrustRecord) -> Result<()> {
        let data = serde_json::to_vec_pretty(record)?;
        self.backend.put(&record.device_id, &data)
    }

    /// Look up the record for a device
    pub fn lookup(&self, device_id: &str) -> Result<Option<TrustRecord>> {
        match self.backend.get(device_id)? {
            Some(data) => serde_json::from_slice(&data).map(Some).map_err(|e| {
                ProtocolError::Storage(format!("corrupt trust record for {}: {}", device_id, e))
            }),
            None => Ok(None),
        }
    }

    /// Record a fingerprint and state for a device
    ///
    /// Fails with `TrustViolation` when the device is already trusted with a
    /// different fingerprint; the stored record is left untouched.
    pub fn put(&self, device_id: &str, fingerprint: Fingerprint, state: TrustState) -> Result<()> {
        let lock = self.device_lock(device_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| ProtocolError::Storage("trust record lock poisoned".to_string()))?;

        if let Some(existing) = self.lookup(device_id)? {
            if existing.state.is_trusted() && existing.fingerprint != fingerprint {
                error!(
                    "Refusing to replace trusted fingerprint for {}: {} -> {}",
                    device_id, existing.fingerprint, fingerprint
                );
                return Err(ProtocolError::TrustViolation {
                    device_id: device_id.to_string(),
                    expected: existing.fingerprint,
                    presented: fingerprint,
                });
            }
        }

        let record = TrustRecord {
            device_id: device_id.to_string(),
            fingerprint,
            state,
            last_seen: now_secs(),
        };
        self.write_record(&record)?;

        info!(
            "Trust record for {} set to {:?} ({})",
            device_id, record.state, record.fingerprint
        );
        Ok(())
    }

    /// Remove a device's record. Returns whether one existed.
    pub fn remove(&self, device_id: &str) -> Result<bool> {
        let lock = self.device_lock(device_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| ProtocolError::Storage("trust record lock poisoned".to_string()))?;

        let removed = self.backend.delete(device_id)?;
        if removed {
            info!("Removed trust record for {}", device_id);
        }
        Ok(removed)
    }

    /// Classify a fingerprint presented by `device_id`
    ///
    /// `Ok(true)`: trusted. `Ok(false)`: no trusted record, pairing required.
    /// `Err(TrustViolation)`: trusted with a different fingerprint.
    pub fn check(&self, device_id: &str, presented: &Fingerprint) -> Result<bool> {
        match self.lookup(device_id)? {
            Some(record) if record.state.is_trusted() => {
                if &record.fingerprint == presented {
                    Ok(true)
                } else {
                    Err(ProtocolError::TrustViolation {
                        device_id: device_id.to_string(),
                        expected: record.fingerprint,
                        presented: presented.clone(),
                    })
                }
            }
            _ => Ok(false),
        }
    }

    /// Whether the device was declined on a previous attempt
    pub fn is_rejected(&self, device_id: &str) -> Result<bool> {
        Ok(matches!(
            self.lookup(device_id)?,
            Some(TrustRecord {
                state: TrustState::Rejected,
                ..
            })
        ))
    }

    /// Refresh the last-seen timestamp of an existing record
    pub fn touch(&self, device_id: &str) -> Result<()> {
        let lock = self.device_lock(device_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| ProtocolError::Storage("trust record lock poisoned".to_string()))?;

        if let Some(mut record) = self.lookup(device_id)? {
            record.last_seen = now_secs();
            self.write_record(&record)?;
            debug!("Touched trust record for {}", device_id);
        }
        Ok(())
    }

    /// Every stored record, sorted by device id
    pub fn records(&self) -> Result<Vec<TrustRecord>> {
        let mut records = Vec::new();
        for key in self.backend.keys()? {
            if let Some(record) = self.lookup(&key)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(records)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
