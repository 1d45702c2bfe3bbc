//! Active sessions keyed by device id
//!
//! At most one session per peer. Installing a new session for a peer that
//! already has one closes the old one first.

use super::DeviceSession;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Arc<DeviceSession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session`, replacing and closing any previous session for the
    /// same peer. Returns the replaced session.
    pub async fn install(&self, session: Arc<DeviceSession>) -> Option<Arc<DeviceSession>> {
        let device_id = session.device_id().to_string();
        let session_id = session.id();
        let previous = self.sessions.write().await.insert(device_id.clone(), session);

        // Closed outside the table lock
        if let Some(old) = &previous {
            info!(
                "Replacing session {} with {} for {}",
                old.id(),
                session_id,
                device_id
            );
            old.close().await;
        }
        previous
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.read().await.get(device_id).cloned()
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.sessions.read().await.contains_key(device_id)
    }

    pub async fn remove(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.write().await.remove(device_id)
    }

    /// Remove the entry for `device_id` only if it is still `session_id`
    ///
    /// A session that was already replaced must not evict its successor.
    pub async fn remove_if_same(&self, device_id: &str, session_id: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(device_id) {
            Some(current) if current.id() == session_id => {
                sessions.remove(device_id);
                true
            }
            Some(current) => {
                debug!(
                    "Session {} for {} already replaced by {}",
                    session_id,
                    device_id,
                    current.id()
                );
                false
            }
            None => false,
        }
    }

    /// Ids of all peers with a session, sorted
    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn sessions(&self) -> Vec<Arc<DeviceSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close and remove every session
    pub async fn close_all(&self) -> Vec<Arc<DeviceSession>> {
        let drained: Vec<Arc<DeviceSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in &drained {
            session.close().await;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginDispatcher;
    use crate::session::SessionEvent;
    use crate::testing::{linked_pair, TestPeer};
    use crate::Packet;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn session_with(
        alpha: &TestPeer,
        beta: &TestPeer,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> (Arc<DeviceSession>, crate::connection::EstablishedLink) {
        let (link, remote) = linked_pair(alpha, beta).await;
        let session = DeviceSession::start(link, Arc::new(PluginDispatcher::new()), events.clone())
            .await
            .unwrap();
        (session, remote)
    }

    #[tokio::test]
    async fn test_install_replaces_previous_session() {
        let alpha = TestPeer::new("1000", "alpha");
        let beta = TestPeer::new("2000", "beta");
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = SessionTable::new();

        let (first, _remote1) = session_with(&alpha, &beta, &tx).await;
        let (second, _remote2) = session_with(&alpha, &beta, &tx).await;
        assert_ne!(first.id(), second.id());

        assert!(table.install(first.clone()).await.is_none());
        let replaced = table.install(second.clone()).await.unwrap();
        assert_eq!(replaced.id(), first.id());
        assert!(first.is_closed());
        assert!(!second.is_closed());

        assert_eq!(table.len().await, 1);
        assert_eq!(table.get("2000").await.unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_install_does_not_block_on_stalled_session() {
        let alpha = TestPeer::new("1000", "alpha");
        let beta = TestPeer::new("2000", "beta");
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = Arc::new(SessionTable::new());

        // Nobody reads from the first session's remote end
        let (first, _remote1) = session_with(&alpha, &beta, &tx).await;
        table.install(first.clone()).await;
        let blob = "x".repeat(1024 * 1024);
        let writer = first.clone();
        let _pending = tokio::spawn(async move {
            writer
                .send(&Packet::new("test.data", json!({ "blob": blob })))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (second, _remote2) = session_with(&alpha, &beta, &tx).await;
        let replaced = tokio::time::timeout(Duration::from_secs(3), table.install(second.clone()))
            .await
            .expect("install returned while the old session was stalled");
        assert_eq!(replaced.unwrap().id(), first.id());
        assert!(first.is_closed());

        let current = tokio::time::timeout(Duration::from_secs(1), table.get("2000"))
            .await
            .unwrap();
        assert_eq!(current.unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_remove_if_same_ignores_stale_ids() {
        let alpha = TestPeer::new("1000", "alpha");
        let beta = TestPeer::new("2000", "beta");
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = SessionTable::new();

        let (first, _remote1) = session_with(&alpha, &beta, &tx).await;
        let (second, _remote2) = session_with(&alpha, &beta, &tx).await;
        table.install(first.clone()).await;
        table.install(second.clone()).await;

        assert!(!table.remove_if_same("2000", first.id()).await);
        assert!(table.contains("2000").await);
        assert!(table.remove_if_same("2000", second.id()).await);
        assert!(table.is_empty().await);
        assert!(!table.remove_if_same("2000", second.id()).await);
    }

    #[tokio::test]
    async fn test_close_all() {
        let alpha = TestPeer::new("1000", "alpha");
        let beta = TestPeer::new("2000", "beta");
        let gamma = TestPeer::new("3000", "gamma");
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = SessionTable::new();

        let (s1, _r1) = session_with(&alpha, &beta, &tx).await;
        let (s2, _r2) = session_with(&alpha, &gamma, &tx).await;
        table.install(s1.clone()).await;
        table.install(s2.clone()).await;
        assert_eq!(table.device_ids().await, vec!["2000", "3000"]);

        let closed = table.close_all().await;
        assert_eq!(closed.len(), 2);
        assert!(s1.is_closed() && s2.is_closed());
        assert!(table.is_empty().await);
    }
}
