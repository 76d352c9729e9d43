//! Invalidation subscriptions.
//!
//! Observers subscribe explicitly and receive an owned handle that can be
//! awaited or polled. Fan-out delivers to subscribers in registration
//! order and isolates per-observer failures: a subscriber that went away
//! is dropped from the registry without disturbing the others.

use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::chain::types::Login;

/// Delivered when the bus invalidates a session's login.
///
/// Carries the login that was held at the moment of invalidation; by the
/// time a subscriber processes the event the session itself reports no
/// login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub login: Login,
}

/// Owned handle over one invalidation subscription.
pub struct InvalidationSubscription {
    rx: mpsc::UnboundedReceiver<InvalidationEvent>,
}

impl InvalidationSubscription {
    /// Await the next invalidation. `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<InvalidationEvent> {
        self.rx.recv().await
    }

    /// Poll for an already-delivered invalidation.
    pub fn try_recv(&mut self) -> Option<InvalidationEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
pub(crate) struct ObserverRegistry {
    slots: Mutex<Vec<mpsc::UnboundedSender<InvalidationEvent>>>,
}

impl ObserverRegistry {
    pub(crate) fn subscribe(&self) -> InvalidationSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        InvalidationSubscription { rx }
    }

    /// Deliver to every live subscriber in registration order, dropping
    /// the ones whose receiving side is gone.
    pub(crate) fn notify_all(&self, login: &Login) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|tx| {
            tx.send(InvalidationEvent {
                login: login.clone(),
            })
            .is_ok()
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login() -> Login {
        Login::new("a1", "alice", 60)
    }

    #[tokio::test]
    async fn test_notify_reaches_every_subscriber() {
        let registry = ObserverRegistry::default();
        let mut first = registry.subscribe();
        let mut second = registry.subscribe();

        registry.notify_all(&login());

        assert_eq!(first.try_recv().unwrap().login, login());
        assert_eq!(second.try_recv().unwrap().login, login());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block_others() {
        let registry = ObserverRegistry::default();
        let first = registry.subscribe();
        let mut second = registry.subscribe();
        drop(first);

        registry.notify_all(&login());

        assert_eq!(second.try_recv().unwrap().login, login());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_recv_awaits_delivery() {
        let registry = ObserverRegistry::default();
        let mut sub = registry.subscribe();

        registry.notify_all(&login());
        let event = sub.recv().await.unwrap();
        assert_eq!(event.login.entity, "alice");
    }
}
