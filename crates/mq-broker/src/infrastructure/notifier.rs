//! In-process "delivery available" signals.
//!
//! When a session queues a message it pokes the destination's [`Notify`], so
//! the destination's select loop dequeues immediately instead of waiting for
//! the next poll tick.  The signal carries no data; the store stays the only
//! source of truth and a missed signal only costs one poll interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mq_core::Address;
use tokio::sync::Notify;

type Waiters = HashMap<Address, Arc<Notify>>;

/// Registry of connected addresses and their wake-up handles.
#[derive(Debug, Default)]
pub struct DeliveryNotifier {
    waiters: Arc<Mutex<Waiters>>,
}

impl DeliveryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address`; the returned handle unregisters it on drop.
    pub fn subscribe(&self, address: Address) -> Subscription {
        let notify = Arc::new(Notify::new());
        lock(&self.waiters).insert(address.clone(), Arc::clone(&notify));
        Subscription {
            address,
            notify,
            waiters: Arc::clone(&self.waiters),
        }
    }

    /// Wakes the session connected as `address`, if any.
    ///
    /// Returns whether a subscriber was found.  A wake-up sent while the
    /// session is busy is stored and consumed by its next wait.
    pub fn notify(&self, address: &Address) -> bool {
        match lock(&self.waiters).get(address) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn subscribers(&self) -> usize {
        lock(&self.waiters).len()
    }
}

/// A registered address.  Dropping it unregisters the address.
#[derive(Debug)]
pub struct Subscription {
    address: Address,
    notify: Arc<Notify>,
    waiters: Arc<Mutex<Waiters>>,
}

impl Subscription {
    /// Resolves at the next [`DeliveryNotifier::notify`] for this address.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut waiters = lock(&self.waiters);
        // A newer subscription for the same address must survive.
        if waiters
            .get(&self.address)
            .is_some_and(|current| Arc::ptr_eq(current, &self.notify))
        {
            waiters.remove(&self.address);
        }
    }
}

fn lock(waiters: &Mutex<Waiters>) -> MutexGuard<'_, Waiters> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn addr(port: u16) -> Address {
        Address::new("10.0.0.7", port)
    }

    #[tokio::test]
    async fn test_notify_wakes_subscriber() {
        // Arrange
        let notifier = DeliveryNotifier::new();
        let sub = notifier.subscribe(addr(2));

        // Act
        let found = notifier.notify(&addr(2));

        // Assert
        assert!(found);
        assert!(timeout(Duration::from_millis(100), sub.notified()).await.is_ok());
    }

    #[tokio::test]
    async fn test_notify_unknown_address_is_noop() {
        let notifier = DeliveryNotifier::new();
        let _sub = notifier.subscribe(addr(2));
        assert!(!notifier.notify(&addr(3)));
    }

    #[tokio::test]
    async fn test_no_wakeup_without_notify() {
        let notifier = DeliveryNotifier::new();
        let sub = notifier.subscribe(addr(2));
        assert!(timeout(Duration::from_millis(20), sub.notified()).await.is_err());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let notifier = DeliveryNotifier::new();
        let sub = notifier.subscribe(addr(2));
        assert_eq!(notifier.subscribers(), 1);
        drop(sub);
        assert_eq!(notifier.subscribers(), 0);
        assert!(!notifier.notify(&addr(2)));
    }

    #[test]
    fn test_dropping_stale_subscription_keeps_newer_one() {
        let notifier = DeliveryNotifier::new();
        let old = notifier.subscribe(addr(2));
        let _new = notifier.subscribe(addr(2));
        drop(old);
        assert_eq!(notifier.subscribers(), 1);
    }
}
