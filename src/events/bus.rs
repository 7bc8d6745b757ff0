//! In-process broadcast with per-subscriber filters and explicit unsubscribe.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::HubEvent;

type Filter = Box<dyn Fn(&HubEvent) -> bool + Send + Sync>;

struct Subscriber {
    id: u64,
    filter: Filter,
    tx: mpsc::UnboundedSender<HubEvent>,
}

/// Fan-out hub and the process-wide revision counter.
///
/// Each subscriber owns an unbounded queue, so a slow consumer never blocks
/// a publisher (and therefore never blocks a registry lock).
pub struct EventBus {
    revision: AtomicU64,
    next_subscriber: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            revision: AtomicU64::new(0),
            next_subscriber: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Reserve the next revision. Callers stamp it on the entity they are
    /// mutating, under the lock that guards that entity.
    pub fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest revision reserved so far.
    pub fn current_revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Deliver `event` to every matching subscriber. Closed subscribers are
    /// pruned.
    pub fn publish(&self, event: HubEvent) {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|sub| {
            if !(sub.filter)(&event) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    /// Subscribe to events matching `filter`.
    pub fn subscribe<F>(self: &Arc<Self>, filter: F) -> Subscription
    where
        F: Fn(&HubEvent) -> bool + Send + Sync + 'static,
    {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                filter: Box::new(filter),
                tx,
            });
        Subscription {
            rx,
            handle: UnsubscribeHandle {
                id,
                bus: Arc::downgrade(self),
            },
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id != id);
    }
}

/// Detaches a subscriber. Safe to call more than once.
#[derive(Debug, Clone)]
pub struct UnsubscribeHandle {
    id: u64,
    bus: Weak<EventBus>,
}

impl UnsubscribeHandle {
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

/// Receiving side of a subscription. Unsubscribes when dropped.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<HubEvent>,
    handle: UnsubscribeHandle,
}

impl Subscription {
    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe_handle(&self) -> UnsubscribeHandle {
        self.handle.clone()
    }
}

impl Stream for Subscription {
    type Item = HubEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<HubEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Task, TaskKind, TaskSpec};

    fn task_event(version: u64, name: &str) -> HubEvent {
        let task = Task::new(TaskSpec::new(TaskKind::Shell, name), version);
        HubEvent::TaskUpdated { task }
    }

    #[tokio::test]
    async fn test_filtered_delivery() {
        let bus = Arc::new(EventBus::new());
        let mut tasks = bus.subscribe(HubEvent::is_task_event);
        let mut servers = bus.subscribe(HubEvent::is_server_event);

        bus.publish(task_event(1, "a"));
        assert_eq!(tasks.recv().await.map(|e| e.revision()), Some(1));
        assert!(servers.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_publish_order_is_preserved() {
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe(|_| true);
        for v in 1..=50 {
            bus.publish(task_event(v, "t"));
        }
        for v in 1..=50 {
            assert_eq!(sub.recv().await.map(|e| e.revision()), Some(v));
        }
    }

    #[test]
    fn test_unsubscribe_handle_and_drop() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe(|_| true);
        let handle = sub.unsubscribe_handle();
        let other = bus.subscribe(|_| true);
        assert_eq!(bus.subscriber_count(), 2);

        handle.unsubscribe();
        handle.unsubscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(other);
        assert_eq!(bus.subscriber_count(), 0);
        drop(sub);
    }

    #[test]
    fn test_revisions_are_monotonic() {
        let bus = EventBus::new();
        let a = bus.next_revision();
        let b = bus.next_revision();
        assert!(b > a);
        assert_eq!(bus.current_revision(), b);
    }
}
