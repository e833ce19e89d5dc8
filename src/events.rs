use crate::model::Model;
use log::error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Rewrites a requested visor state: receives the proposed value and returns the one to pass on.
pub type VisorOverride = dyn Fn(Model<'_>, bool) -> bool + Send + Sync;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    name: Arc<str>,
    handler: Arc<VisorOverride>,
}

/// Raised whenever the engine itself asks to change a visor.
///
/// Subscribers run synchronously, in registration order, each seeing the value produced by the
/// previous one. Every subscriber always runs; there is no way to stop propagation.
#[derive(Default)]
pub struct VisorStateChanged {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl VisorStateChanged {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, name: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(Model<'_>, bool) -> bool + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name: Arc<str> = Arc::from(name.into());
        self.subscribers.write().unwrap_or_else(PoisonError::into_inner).push(Subscriber {
            id,
            name,
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_names(&self) -> Vec<String> {
        self.snapshot().iter().map(|subscriber| subscriber.name.to_string()).collect()
    }

    /// Folds `proposed` through every subscriber and returns the final request.
    ///
    /// The subscriber list is snapshotted first, so handlers may subscribe, unsubscribe or
    /// re-enter the visor service. A panicking handler is logged and leaves the value untouched.
    pub fn dispatch(&self, model: Model<'_>, proposed: bool) -> bool {
        self.snapshot().iter().fold(proposed, |value, subscriber| {
            match panic::catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(model, value))) {
                Ok(next) => next,
                Err(_) => {
                    error!(
                        "[visor] subscriber '{}' ({}) panicked on {}; keeping {value}",
                        subscriber.name,
                        subscriber.id,
                        model.address()
                    );
                    value
                }
            }
        })
    }

    fn snapshot(&self) -> Vec<Subscriber> {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl fmt::Debug for VisorStateChanged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisorStateChanged").field("subscribers", &self.subscriber_names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelLayout;
    use crate::recorder::SimulatedDrawObject;
    use std::sync::Mutex;

    #[test]
    fn dispatch_without_subscribers_passes_the_request_through() {
        let layout = ModelLayout::default();
        let object = SimulatedDrawObject::human(&layout);
        let event = VisorStateChanged::new();
        assert!(event.dispatch(object.model(), true));
        assert!(!event.dispatch(object.model(), false));
    }

    #[test]
    fn subscribers_run_in_registration_order_and_see_previous_rewrites() {
        let layout = ModelLayout::default();
        let object = SimulatedDrawObject::human(&layout);
        let event = VisorStateChanged::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        event.subscribe("first", move |_, proposed| {
            log.lock().unwrap().push(("first", proposed));
            !proposed
        });
        let log = seen.clone();
        event.subscribe("second", move |_, proposed| {
            log.lock().unwrap().push(("second", proposed));
            true
        });

        assert!(event.dispatch(object.model(), true), "the last writer decides");
        assert_eq!(*seen.lock().unwrap(), vec![("first", true), ("second", false)]);
    }

    #[test]
    fn unsubscribe_removes_only_the_matching_handler() {
        let layout = ModelLayout::default();
        let object = SimulatedDrawObject::human(&layout);
        let event = VisorStateChanged::new();
        let invert = event.subscribe("invert", |_, proposed| !proposed);
        event.subscribe("identity", |_, proposed| proposed);
        assert_eq!(event.len(), 2);

        assert!(event.unsubscribe(invert));
        assert!(!event.unsubscribe(invert), "second removal is a no-op");
        assert_eq!(event.subscriber_names(), vec!["identity".to_string()]);
        assert!(event.dispatch(object.model(), true));
    }

    #[test]
    fn panicking_subscriber_does_not_stop_later_subscribers() {
        let layout = ModelLayout::default();
        let object = SimulatedDrawObject::human(&layout);
        let event = VisorStateChanged::new();
        let reached = Arc::new(Mutex::new(None));

        event.subscribe("force_off", |_, _| false);
        event.subscribe("panicker", |_, _| panic!("intentional panicking subscriber"));
        let last = reached.clone();
        event.subscribe("observer", move |_, proposed| {
            *last.lock().unwrap() = Some(proposed);
            proposed
        });

        assert!(!event.dispatch(object.model(), true));
        assert_eq!(*reached.lock().unwrap(), Some(false));
    }

    #[test]
    fn subscribers_may_subscribe_during_dispatch() {
        let layout = ModelLayout::default();
        let object = SimulatedDrawObject::human(&layout);
        let event = Arc::new(VisorStateChanged::new());

        let inner = Arc::downgrade(&event);
        event.subscribe("spawner", move |_, proposed| {
            if let Some(event) = inner.upgrade() {
                event.subscribe("late", |_, _| false);
            }
            proposed
        });

        assert!(event.dispatch(object.model(), true), "late subscriber joins after the snapshot");
        assert_eq!(event.len(), 2);
        assert!(!event.dispatch(object.model(), true));
    }
}
