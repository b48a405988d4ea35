//! Listener registries for state, done and diagnostic notifications.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A registered callback.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Listeners keyed by subscription id.
///
/// Notification order is registration order. Listeners run without any map
/// lock held, so they may subscribe or unsubscribe from inside the callback.
pub struct Listeners<T> {
    entries: DashMap<String, (u64, Listener<T>)>,
    seq: AtomicU64,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            seq: AtomicU64::new(0),
        })
    }

    pub fn subscribe(self: &Arc<Self>, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let subscription_id = format!("sub-{}", uuid::Uuid::new_v4());
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries
            .insert(subscription_id.clone(), (seq, Arc::new(listener)));

        let registry: Weak<Self> = Arc::downgrade(self);
        let id = subscription_id.clone();
        Subscription {
            subscription_id,
            remove: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.entries.remove(&id);
                }
            })),
        }
    }

    pub fn notify(&self, value: &T) {
        let mut listeners: Vec<(u64, Listener<T>)> = self
            .entries
            .iter()
            .map(|entry| {
                let (seq, listener) = entry.value();
                (*seq, Arc::clone(listener))
            })
            .collect();
        listeners.sort_by_key(|(seq, _)| *seq);
        for (_, listener) in listeners {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    subscription_id: String,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.subscription_id
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_notify_in_registration_order() {
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            listeners.subscribe(move |v: &u32| seen.lock().push(format!("{}{}", tag, v)));
        }
        listeners.notify(&1);
        assert_eq!(*seen.lock(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_unsubscribe() {
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        let sub = listeners.subscribe(move |v: &u32| s.lock().push(*v));
        assert!(sub.id().starts_with("sub-"));
        listeners.notify(&1);
        sub.unsubscribe();
        listeners.notify(&2);

        assert_eq!(*seen.lock(), vec![1]);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_unsubscribe_after_registry_dropped() {
        let listeners = Listeners::<u32>::new();
        let sub = listeners.subscribe(|_: &u32| {});
        drop(listeners);
        sub.unsubscribe();
    }

    #[test]
    fn test_listener_may_subscribe_during_notify() {
        let listeners = Listeners::<u32>::new();
        let inner = Arc::clone(&listeners);
        listeners.subscribe(move |_: &u32| {
            inner.subscribe(|_: &u32| {});
        });
        listeners.notify(&0);
        assert_eq!(listeners.len(), 2);
    }
}
