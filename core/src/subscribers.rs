//! Per-session listener sets, decoupled from session lifetime.
//!
//! Observers attach a zero-argument callback and re-read session snapshots
//! through the registry when poked. Dropping the [`Subscription`] guard
//! detaches; switching an observer between sessions is atomic with respect
//! to the hub lock, so a callback is never registered on two sessions at
//! once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::registry::SessionRegistry;

pub type Callback = Arc<dyn Fn() + Send + Sync>;

struct Listener {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct HubInner {
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
}

/// Remove listener `id`, trying `key_hint` first. A hub-level rename may
/// have moved the listener since the guard recorded its key, so fall back
/// to a scan when the hint misses.
fn remove_listener(listeners: &mut HashMap<String, Vec<Listener>>, key_hint: &str, id: u64) {
    let mut removed = false;
    if let Some(set) = listeners.get_mut(key_hint) {
        let before = set.len();
        set.retain(|listener| listener.id != id);
        removed = set.len() != before;
        if set.is_empty() {
            listeners.remove(key_hint);
        }
    }
    if !removed {
        listeners.retain(|_, set| {
            set.retain(|listener| listener.id != id);
            !set.is_empty()
        });
    }
}

impl HubInner {
    fn detach(&self, key: &str, id: u64) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        remove_listener(&mut listeners, key, id);
    }
}

pub struct SubscriptionHub {
    inner: Arc<HubInner>,
    registry: Arc<SessionRegistry>,
}

impl SubscriptionHub {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            inner: Arc::new(HubInner::default()),
            registry,
        }
    }

    /// Attach `callback` to `key`. Attaching to a session that is still
    /// streaming fires the callback once, synchronously, so an observer
    /// that detached and came back does not sit on stale state.
    pub fn subscribe(&self, key: &str, callback: Callback) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            listeners.entry(key.to_string()).or_default().push(Listener {
                id,
                callback: Arc::clone(&callback),
            });
        }
        if self
            .registry
            .snapshot(key)
            .is_some_and(|state| state.is_streaming)
        {
            callback();
        }
        Subscription {
            inner: Arc::clone(&self.inner),
            registry: Arc::clone(&self.registry),
            key: key.to_string(),
            id,
            callback,
        }
    }

    /// Invoke every callback registered for `key`. Synchronous, arbitrary
    /// order; each listener reads the same registry snapshot afterwards.
    pub fn notify(&self, key: &str) {
        let callbacks: Vec<Callback> = {
            let listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match listeners.get(key) {
                Some(set) => set
                    .iter()
                    .map(|listener| Arc::clone(&listener.callback))
                    .collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Carry listener sets across an identity rebinding so live observers
    /// keep resolving state under the new key.
    pub fn rename(&self, old: &str, new: &str) {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(moved) = listeners.remove(old) {
            listeners.entry(new.to_string()).or_default().extend(moved);
        }
    }

    #[cfg(test)]
    fn listener_count(&self, key: &str) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, Vec::len)
    }
}

/// RAII attachment of one observer callback to one session key.
pub struct Subscription {
    inner: Arc<HubInner>,
    registry: Arc<SessionRegistry>,
    key: String,
    id: u64,
    callback: Callback,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Move this observer to another session. Detach and attach happen
    /// under one hub lock; there is no window in which the callback is
    /// registered on both sessions.
    pub fn switch_to(&mut self, new_key: &str) {
        if new_key == self.key {
            return;
        }
        {
            let mut listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            remove_listener(&mut listeners, &self.key, self.id);
            listeners
                .entry(new_key.to_string())
                .or_default()
                .push(Listener {
                    id: self.id,
                    callback: Arc::clone(&self.callback),
                });
        }
        self.key = new_key.to_string();
        if self
            .registry
            .snapshot(new_key)
            .is_some_and(|state| state.is_streaming)
        {
            (self.callback)();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.detach(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionState;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Callback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&count);
        let callback: Callback = Arc::new(move || {
            cloned.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[test]
    fn notify_reaches_every_listener_for_the_key() {
        let registry = Arc::new(SessionRegistry::new());
        let hub = SubscriptionHub::new(Arc::clone(&registry));
        let (cb_a, count_a) = counter();
        let (cb_b, count_b) = counter();

        let _sub_a = hub.subscribe("c-1", cb_a);
        let _sub_b = hub.subscribe("c-1", cb_b);
        let (cb_other, count_other) = counter();
        let _sub_other = hub.subscribe("c-2", cb_other);

        hub.notify("c-1");
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
        assert_eq!(count_other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_the_guard_detaches() {
        let registry = Arc::new(SessionRegistry::new());
        let hub = SubscriptionHub::new(registry);
        let (callback, count) = counter();
        let sub = hub.subscribe("c-1", callback);
        assert_eq!(hub.listener_count("c-1"), 1);

        drop(sub);
        assert_eq!(hub.listener_count("c-1"), 0);
        hub.notify("c-1");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn attaching_while_streaming_fires_immediately() {
        let registry = Arc::new(SessionRegistry::new());
        registry
            .create(SessionState::new("c-1", false))
            .expect("create");
        let hub = SubscriptionHub::new(Arc::clone(&registry));
        let (callback, count) = counter();

        let _sub = hub.subscribe("c-1", callback);
        assert_eq!(count.load(Ordering::SeqCst), 1, "stale-state guard");
    }

    #[test]
    fn switch_to_moves_the_listener() {
        let registry = Arc::new(SessionRegistry::new());
        let hub = SubscriptionHub::new(registry);
        let (callback, count) = counter();
        let mut sub = hub.subscribe("c-1", callback);

        sub.switch_to("c-2");
        assert_eq!(hub.listener_count("c-1"), 0);
        assert_eq!(hub.listener_count("c-2"), 1);

        hub.notify("c-1");
        assert_eq!(count.load(Ordering::SeqCst), 0);
        hub.notify("c-2");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rename_carries_listeners_to_the_new_key() {
        let registry = Arc::new(SessionRegistry::new());
        let hub = SubscriptionHub::new(registry);
        let (callback, count) = counter();
        let _sub = hub.subscribe("anon-1", callback);

        hub.rename("anon-1", "c-1");
        hub.notify("c-1");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
