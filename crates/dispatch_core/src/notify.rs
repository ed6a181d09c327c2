//! Typed event delivery to connected users.
//!
//! Delivery failure is never fatal: the notifier reports it and hands the
//! event to the push gateway so an out-of-band channel (push notification,
//! SMS) can pick it up.

use std::sync::Arc;

use log::{debug, warn};

use crate::events::OutboundEvent;
use crate::presence::{ConnectionHandle, PresenceRegistry};

/// Out-of-band fallback invoked when the target has no live connection.
pub trait PushGateway: Send + Sync {
    fn push(&self, user_id: &str, event: &OutboundEvent);
}

#[derive(Debug, Default)]
pub struct NoopPushGateway;

impl PushGateway for NoopPushGateway {
    fn push(&self, user_id: &str, event: &OutboundEvent) {
        debug!("push gateway (noop): {} for {user_id}", event.kind());
    }
}

#[derive(Clone)]
pub struct Notifier {
    presence: PresenceRegistry,
    push: Arc<dyn PushGateway>,
}

impl Notifier {
    pub fn new(presence: PresenceRegistry, push: Arc<dyn PushGateway>) -> Self {
        Self { presence, push }
    }

    /// Delivers to the user's live connection, falling back to the push
    /// gateway when there is none. Returns whether the live delivery
    /// happened.
    pub async fn notify(&self, user_id: &str, event: OutboundEvent) -> bool {
        if let Some(handle) = self.presence.lookup(user_id).await {
            if handle.send(event.clone()) {
                return true;
            }
        }
        warn!("no live connection for {user_id}; {} goes to push gateway", event.kind());
        self.push.push(user_id, &event);
        false
    }

    /// Delivers over a known handle (offers go to the handle the driver
    /// registered with, not whatever presence currently maps). No push
    /// fallback: an unreachable candidate simply loses the offer.
    pub fn send_via(&self, handle: &ConnectionHandle, event: OutboundEvent) -> bool {
        handle.send(event)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::events::{OutboundEvent, UserId};
    use crate::test_support::connection;

    #[derive(Default)]
    struct RecordingGateway {
        pushed: Mutex<Vec<UserId>>,
    }

    impl PushGateway for RecordingGateway {
        fn push(&self, user_id: &str, _event: &OutboundEvent) {
            self.pushed.lock().expect("gateway lock").push(user_id.to_string());
        }
    }

    fn unassignable() -> OutboundEvent {
        OutboundEvent::RideUnassignable {
            ride_id: "r-1".to_string(),
        }
    }

    #[tokio::test]
    async fn notify_delivers_to_a_connected_user() {
        let presence = PresenceRegistry::new();
        let gateway = Arc::new(RecordingGateway::default());
        let notifier = Notifier::new(presence.clone(), gateway.clone());

        let (handle, mut rx) = connection();
        presence.register("u-1".to_string(), handle).await;

        assert!(notifier.notify("u-1", unassignable()).await);
        assert_eq!(rx.recv().await, Some(unassignable()));
        assert!(gateway.pushed.lock().expect("gateway lock").is_empty());
    }

    #[tokio::test]
    async fn notify_falls_back_to_the_push_gateway_when_offline() {
        let presence = PresenceRegistry::new();
        let gateway = Arc::new(RecordingGateway::default());
        let notifier = Notifier::new(presence, gateway.clone());

        assert!(!notifier.notify("u-offline", unassignable()).await);
        assert_eq!(
            *gateway.pushed.lock().expect("gateway lock"),
            vec!["u-offline".to_string()]
        );
    }

    #[tokio::test]
    async fn notify_falls_back_when_the_connection_is_gone() {
        let presence = PresenceRegistry::new();
        let gateway = Arc::new(RecordingGateway::default());
        let notifier = Notifier::new(presence.clone(), gateway.clone());

        let (handle, rx) = connection();
        presence.register("u-1".to_string(), handle).await;
        drop(rx);

        assert!(!notifier.notify("u-1", unassignable()).await);
        assert_eq!(gateway.pushed.lock().expect("gateway lock").len(), 1);
    }
}
