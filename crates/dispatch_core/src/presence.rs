//! Live connection registry: one entry per connected user, independent of
//! role.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::events::{OutboundEvent, UserId};

pub type EventSender = mpsc::UnboundedSender<OutboundEvent>;

/// Handle to a live connection: the channel feeding its writer task, plus
/// the connection identity used to guard teardown.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    sender: EventSender,
}

impl ConnectionHandle {
    pub fn new(sender: EventSender) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            sender,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Queues an event on the connection's writer. Returns `false` once the
    /// writer is gone (socket closed under us).
    pub fn send(&self, event: OutboundEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// Tracks which users currently hold a live connection.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
    users: Arc<RwLock<HashMap<UserId, ConnectionHandle>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the user's connection, replacing any prior one.
    pub async fn register(&self, user_id: UserId, handle: ConnectionHandle) {
        let mut users = self.users.write().await;
        users.insert(user_id, handle);
    }

    /// Removes the user's entry only when the stored handle belongs to the
    /// caller's connection. A stale disconnect from an older socket must not
    /// evict a newer registration.
    pub async fn unregister(&self, user_id: &str, conn_id: Uuid) -> bool {
        let mut users = self.users.write().await;
        if users
            .get(user_id)
            .is_some_and(|handle| handle.conn_id == conn_id)
        {
            users.remove(user_id);
            return true;
        }
        false
    }

    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        let users = self.users.read().await;
        users.get(user_id).cloned()
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        let users = self.users.read().await;
        users.contains_key(user_id)
    }

    pub async fn connected_count(&self) -> usize {
        let users = self.users.read().await;
        users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::connection;

    #[tokio::test]
    async fn register_then_lookup_returns_the_handle() {
        let registry = PresenceRegistry::new();
        let (handle, _rx) = connection();
        registry.register("u-1".to_string(), handle.clone()).await;

        let found = registry.lookup("u-1").await.expect("registered user");
        assert_eq!(found.conn_id(), handle.conn_id());
        assert_eq!(registry.connected_count().await, 1);
    }

    #[tokio::test]
    async fn unregister_requires_matching_connection() {
        let registry = PresenceRegistry::new();
        let (old_handle, _old_rx) = connection();
        let (new_handle, _new_rx) = connection();

        registry.register("u-1".to_string(), old_handle.clone()).await;
        registry.register("u-1".to_string(), new_handle.clone()).await;

        // The old socket's teardown arrives after the reconnect.
        assert!(!registry.unregister("u-1", old_handle.conn_id()).await);
        assert!(registry.is_connected("u-1").await);

        assert!(registry.unregister("u-1", new_handle.conn_id()).await);
        assert!(!registry.is_connected("u-1").await);
    }

    #[tokio::test]
    async fn send_reports_a_dropped_receiver() {
        let (handle, rx) = connection();
        drop(rx);
        assert!(!handle.send(crate::events::OutboundEvent::RideUnassignable {
            ride_id: "r-1".to_string(),
        }));
    }
}
