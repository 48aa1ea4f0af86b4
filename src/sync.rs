//! In-process publish/subscribe used to announce that stored data changed.
//!
//! Delivery is synchronous: [`SyncEventBus::publish`] runs every handler
//! subscribed to the event name, in subscription order, before returning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::models::SyncEvent;

pub const SYNC_DATA: &str = "SYNC_DATA";

pub const DEFAULT_SUBSCRIBER_SOFT_CAP: usize = 20;

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    event: String,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }
}

pub struct SyncEventBus {
    handlers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
    soft_cap: usize,
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_SOFT_CAP)
    }
}

impl SyncEventBus {
    /// `soft_cap` only triggers a warning; subscriptions past it are kept.
    pub fn new(soft_cap: usize) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            soft_cap,
        }
    }

    pub fn subscribe<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let subscribers = handlers.entry(event.to_string()).or_default();
        subscribers.push((id, Arc::new(handler)));

        if subscribers.len() > self.soft_cap {
            log::warn!(
                "{} subscribers registered for '{}' (soft cap {}); possible handler leak",
                subscribers.len(),
                event,
                self.soft_cap
            );
        }

        Subscription {
            event: event.to_string(),
            id,
        }
    }

    /// Removes exactly the handler behind `subscription`. Returns false when
    /// it was already removed.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = handlers.get_mut(&subscription.event) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != subscription.id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            handlers.remove(&subscription.event);
        }
        removed
    }

    /// Runs the handlers subscribed to `event` on the calling thread and
    /// returns how many ran. Handlers may subscribe or unsubscribe while
    /// running; such changes apply from the next publish.
    pub fn publish(&self, event: &str, payload: Option<serde_json::Value>) -> usize {
        let snapshot: Vec<Handler> = {
            let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            match handlers.get(event) {
                Some(subscribers) => subscribers.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return 0,
            }
        };

        let sync_event = SyncEvent {
            name: event.to_string(),
            payload,
        };
        log::debug!("Publishing {} to {} handlers", event, snapshot.len());
        for handler in &snapshot {
            handler(&sync_event);
        }
        snapshot.len()
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Manual "sync now" control. Publishes `SYNC_DATA` and ignores requests that
/// arrive while a sync is already being delivered, so a handler that asks for
/// a sync cannot recurse.
pub struct SyncTrigger {
    bus: Arc<SyncEventBus>,
    syncing: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl SyncTrigger {
    pub fn new(bus: Arc<SyncEventBus>) -> Self {
        Self {
            bus,
            syncing: AtomicBool::new(false),
            last_sync: Mutex::new(None),
        }
    }

    /// Returns false when a sync was already in progress.
    pub fn sync_now(&self) -> bool {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("Sync already in progress, ignoring request");
            return false;
        }

        let _in_progress = InProgress(&self.syncing);
        let delivered = self.bus.publish(
            SYNC_DATA,
            Some(serde_json::json!({ "fromSyncContext": true })),
        );
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());

        log::info!("Sync delivered to {delivered} subscribers");
        true
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the syncing flag when dropped, including while a panicking
/// handler unwinds.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&SyncEvent) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_factory = Arc::clone(&log);
        let factory = move |tag: &str| -> Box<dyn Fn(&SyncEvent) + Send + Sync> {
            let log = Arc::clone(&log_for_factory);
            let tag = tag.to_string();
            Box::new(move |event: &SyncEvent| {
                log.lock().unwrap().push(format!("{tag}:{}", event.name));
            })
        };
        (log, factory)
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = SyncEventBus::default();
        let (log, handler) = recorder();
        bus.subscribe(SYNC_DATA, handler("first"));
        bus.subscribe(SYNC_DATA, handler("second"));
        bus.subscribe("OTHER", handler("other"));

        assert_eq!(bus.publish(SYNC_DATA, None), 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:SYNC_DATA".to_string(), "second:SYNC_DATA".to_string()]
        );
    }

    #[test]
    fn unsubscribe_removes_only_its_handler() {
        let bus = SyncEventBus::default();
        let (log, handler) = recorder();
        let first = bus.subscribe(SYNC_DATA, handler("first"));
        bus.subscribe(SYNC_DATA, handler("second"));

        assert!(bus.unsubscribe(&first));
        assert!(!bus.unsubscribe(&first));
        bus.publish(SYNC_DATA, None);
        assert_eq!(*log.lock().unwrap(), vec!["second:SYNC_DATA".to_string()]);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = SyncEventBus::default();
        assert_eq!(bus.publish(SYNC_DATA, None), 0);
    }

    #[test]
    fn soft_cap_does_not_reject_subscribers() {
        let bus = SyncEventBus::new(2);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let calls = Arc::clone(&calls);
            bus.subscribe(SYNC_DATA, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(bus.subscriber_count(SYNC_DATA), 5);
        assert_eq!(bus.publish(SYNC_DATA, None), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn handler_may_unsubscribe_itself_during_publish() {
        let bus = Arc::new(SyncEventBus::default());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let bus_for_handler = Arc::clone(&bus);
        let slot_for_handler = Arc::clone(&slot);
        let calls_for_handler = Arc::clone(&calls);
        let subscription = bus.subscribe(SYNC_DATA, move |_| {
            calls_for_handler.fetch_add(1, Ordering::SeqCst);
            if let Some(subscription) = slot_for_handler.lock().unwrap().take() {
                bus_for_handler.unsubscribe(&subscription);
            }
        });
        *slot.lock().unwrap() = Some(subscription);

        bus.publish(SYNC_DATA, None);
        bus.publish(SYNC_DATA, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn trigger_ignores_nested_sync_requests() {
        let bus = Arc::new(SyncEventBus::default());
        let trigger = Arc::new(SyncTrigger::new(Arc::clone(&bus)));
        let nested = Arc::new(Mutex::new(Vec::new()));

        let trigger_for_handler = Arc::clone(&trigger);
        let nested_for_handler = Arc::clone(&nested);
        bus.subscribe(SYNC_DATA, move |event| {
            assert_eq!(
                event.payload,
                Some(serde_json::json!({ "fromSyncContext": true }))
            );
            nested_for_handler
                .lock()
                .unwrap()
                .push(trigger_for_handler.sync_now());
        });

        assert!(trigger.last_sync_time().is_none());
        assert!(trigger.sync_now());
        assert_eq!(*nested.lock().unwrap(), vec![false]);
        assert!(!trigger.is_syncing());
        assert!(trigger.last_sync_time().is_some());
    }

    #[test]
    fn panicking_handler_does_not_leave_trigger_stuck() {
        let bus = Arc::new(SyncEventBus::default());
        let trigger = SyncTrigger::new(Arc::clone(&bus));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_for_handler = Arc::clone(&calls);
        bus.subscribe(SYNC_DATA, move |_| {
            if calls_for_handler.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("handler failed");
            }
        });

        let first = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| trigger.sync_now()));
        assert!(first.is_err());
        assert!(!trigger.is_syncing());

        assert!(trigger.sync_now());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
