//! In-process pub/sub over CDP events.
//!
//! Two delivery styles: pull-based stream subscriptions with a bounded
//! per-subscriber buffer (drop-oldest, with a `DroppedEvents` marker
//! surfaced in-stream), and fire-and-forget callback handlers invoked from
//! the dispatch path. A slow subscriber only ever loses its own events.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use zendriver_cdp::target::{SessionId, TargetId};
use zendriver_cdp::{CdpEvent, EventKind};

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// An event annotated with its originating session and target, when known.
#[derive(Clone, Debug)]
pub struct TaggedEvent {
    pub event: Arc<CdpEvent>,
    pub session_id: Option<SessionId>,
    pub target_id: Option<TargetId>,
}

impl TaggedEvent {
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

/// Session scope of a subscription.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum SessionFilter {
    /// Events from every session, plus browser-level ones.
    #[default]
    Any,
    /// Only events with no session id.
    Browser,
    /// Only events from the given session.
    Session(SessionId),
}

impl SessionFilter {
    fn matches(&self, session: Option<&SessionId>) -> bool {
        match self {
            SessionFilter::Any => true,
            SessionFilter::Browser => session.is_none(),
            SessionFilter::Session(wanted) => session == Some(wanted),
        }
    }
}

/// Filter for subscriptions and handlers.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub kind: Option<EventKind>,
    pub session: SessionFilter,
}

impl EventFilter {
    /// All events, every session.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn event(kind: EventKind) -> Self {
        Self {
            kind: Some(kind),
            session: SessionFilter::Any,
        }
    }

    pub fn session(kind: EventKind, session: SessionId) -> Self {
        Self {
            kind: Some(kind),
            session: SessionFilter::Session(session),
        }
    }

    pub fn browser(kind: EventKind) -> Self {
        Self {
            kind: Some(kind),
            session: SessionFilter::Browser,
        }
    }

    fn matches(&self, event: &TaggedEvent) -> bool {
        if let Some(kind) = self.kind {
            if event.kind() != kind {
                return false;
            }
        }
        self.session.matches(event.session_id.as_ref())
    }
}

/// What a subscription pull yields.
#[derive(Clone, Debug)]
pub enum BusMessage {
    Event(TaggedEvent),
    /// `n` events were discarded for this subscriber because it fell behind.
    DroppedEvents(u64),
}

/// Synchronous callback handler. Must not block the dispatch path.
pub type EventHandler = Arc<dyn Fn(&TaggedEvent) + Send + Sync>;

/// Asynchronous handler, spawned onto a detached task per event.
pub type AsyncEventHandler =
    Arc<dyn Fn(TaggedEvent) -> BoxFuture<'static, ()> + Send + Sync>;

enum HandlerSlot {
    Sync(EventFilter, EventHandler),
    Async(EventFilter, AsyncEventHandler),
}

/// Identifier returned by handler registration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HandlerId(Uuid);

struct QueueState {
    items: VecDeque<TaggedEvent>,
    dropped: u64,
    closed: bool,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(64)),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        })
    }

    fn push(&self, event: TaggedEvent) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
            }
            state.items.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

struct SubscriberSlot {
    filter: EventFilter,
    queue: Arc<SubscriberQueue>,
}

struct BusInner {
    subscribers: DashMap<Uuid, SubscriberSlot>,
    handlers: DashMap<Uuid, HandlerSlot>,
    terminated: AtomicBool,
}

/// The per-connection event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                handlers: DashMap::new(),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.subscribe_with_capacity(filter, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, filter: EventFilter, capacity: usize) -> Subscription {
        let id = Uuid::new_v4();
        let queue = SubscriberQueue::new(capacity.max(1));
        if self.inner.terminated.load(Ordering::Acquire) {
            queue.close();
        } else {
            self.inner.subscribers.insert(
                id,
                SubscriberSlot {
                    filter,
                    queue: Arc::clone(&queue),
                },
            );
            // A terminate may have raced the insert.
            if self.inner.terminated.load(Ordering::Acquire) {
                queue.close();
            }
        }
        Subscription {
            id,
            queue,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn add_handler(&self, filter: EventFilter, handler: EventHandler) -> HandlerId {
        let id = Uuid::new_v4();
        self.inner
            .handlers
            .insert(id, HandlerSlot::Sync(filter, handler));
        HandlerId(id)
    }

    pub fn add_async_handler(&self, filter: EventFilter, handler: AsyncEventHandler) -> HandlerId {
        let id = Uuid::new_v4();
        self.inner
            .handlers
            .insert(id, HandlerSlot::Async(filter, handler));
        HandlerId(id)
    }

    pub fn remove_handler(&self, id: HandlerId) {
        self.inner.handlers.remove(&id.0);
    }

    /// Deliver one event to every matching subscriber and handler.
    pub(crate) fn publish(&self, event: TaggedEvent) {
        if self.inner.terminated.load(Ordering::Acquire) {
            return;
        }

        for entry in self.inner.subscribers.iter() {
            if entry.filter.matches(&event) {
                entry.queue.push(event.clone());
            }
        }

        for entry in self.inner.handlers.iter() {
            match entry.value() {
                HandlerSlot::Sync(filter, handler) => {
                    if filter.matches(&event) {
                        let handler = Arc::clone(handler);
                        if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                            warn!(target: "zendriver::bus", method = event.event.method(), "event handler panicked");
                        }
                    }
                }
                HandlerSlot::Async(filter, handler) => {
                    if filter.matches(&event) {
                        let fut = handler(event.clone());
                        tokio::spawn(async move {
                            if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                                warn!(target: "zendriver::bus", "async event handler panicked");
                            }
                        });
                    }
                }
            }
        }
    }

    /// Terminal: close every subscription stream. Used on connection close.
    pub(crate) fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::Release);
        for entry in self.inner.subscribers.iter() {
            entry.queue.close();
        }
        self.inner.subscribers.clear();
        self.inner.handlers.clear();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull side of a stream subscription. Dropping it detaches from the bus
/// and discards anything still buffered.
pub struct Subscription {
    id: Uuid,
    queue: Arc<SubscriberQueue>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Next message, or `None` once the subscription is cancelled or the
    /// bus has terminated and the buffer is drained.
    pub async fn next(&mut self) -> Option<BusMessage> {
        loop {
            {
                let mut state = self.queue.state.lock();
                if state.dropped > 0 {
                    let n = state.dropped;
                    state.dropped = 0;
                    debug!(target: "zendriver::bus", count = n, "subscriber lagged; events dropped");
                    return Some(BusMessage::DroppedEvents(n));
                }
                if let Some(event) = state.items.pop_front() {
                    return Some(BusMessage::Event(event));
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Cancel the subscription; buffered events are discarded.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.remove(&self.id);
        }
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind_method: &str, session: Option<&str>) -> TaggedEvent {
        let params = match kind_method {
            "Page.frameStoppedLoading" => json!({"frameId": "F"}),
            "Target.targetDestroyed" => json!({"targetId": "T"}),
            _ => json!({}),
        };
        TaggedEvent {
            event: Arc::new(CdpEvent::parse(kind_method, params).unwrap()),
            session_id: session.map(|s| SessionId(s.to_string())),
            target_id: None,
        }
    }

    #[tokio::test]
    async fn delivers_matching_events_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::event(EventKind::FrameStoppedLoading));

        bus.publish(event("Page.frameStoppedLoading", Some("A")));
        bus.publish(event("Target.targetDestroyed", Some("A")));
        bus.publish(event("Page.frameStoppedLoading", Some("B")));

        match sub.next().await.unwrap() {
            BusMessage::Event(ev) => assert_eq!(ev.session_id.as_ref().unwrap().0, "A"),
            other => panic!("unexpected {other:?}"),
        }
        match sub.next().await.unwrap() {
            BusMessage::Event(ev) => assert_eq!(ev.session_id.as_ref().unwrap().0, "B"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_filter_scopes_delivery() {
        let bus = EventBus::new();
        let mut scoped = bus.subscribe(EventFilter::session(
            EventKind::FrameStoppedLoading,
            SessionId("S1".into()),
        ));
        let mut browser_only = bus.subscribe(EventFilter {
            kind: None,
            session: SessionFilter::Browser,
        });

        bus.publish(event("Page.frameStoppedLoading", Some("S2")));
        bus.publish(event("Page.frameStoppedLoading", Some("S1")));
        bus.publish(event("Target.targetDestroyed", None));

        match scoped.next().await.unwrap() {
            BusMessage::Event(ev) => assert_eq!(ev.session_id.as_ref().unwrap().0, "S1"),
            other => panic!("unexpected {other:?}"),
        }
        match browser_only.next().await.unwrap() {
            BusMessage::Event(ev) => assert!(ev.session_id.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_sees_marker() {
        let bus = EventBus::new();
        let mut sub =
            bus.subscribe_with_capacity(EventFilter::event(EventKind::FrameStoppedLoading), 2);

        for _ in 0..5 {
            bus.publish(event("Page.frameStoppedLoading", Some("S")));
        }

        match sub.next().await.unwrap() {
            BusMessage::DroppedEvents(n) => assert_eq!(n, 3),
            other => panic!("expected drop marker, got {other:?}"),
        }
        assert!(matches!(
            sub.next().await.unwrap(),
            BusMessage::Event(_)
        ));
        assert!(matches!(
            sub.next().await.unwrap(),
            BusMessage::Event(_)
        ));
    }

    #[tokio::test]
    async fn terminate_ends_streams() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::any());
        bus.terminate();
        assert!(sub.next().await.is_none());
        assert!(bus.is_terminated());
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicBool::new(false));
        bus.add_handler(
            EventFilter::any(),
            Arc::new(|_| panic!("handler boom")),
        );
        let seen_clone = Arc::clone(&seen);
        bus.add_handler(
            EventFilter::any(),
            Arc::new(move |_| {
                seen_clone.store(true, Ordering::SeqCst);
            }),
        );

        bus.publish(event("Page.frameStoppedLoading", None));
        assert!(seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn async_handler_runs_detached() {
        let bus = EventBus::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<String>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        bus.add_async_handler(
            EventFilter::event(EventKind::FrameStoppedLoading),
            Arc::new(move |ev| {
                let tx = Arc::clone(&tx);
                async move {
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(ev.event.method().to_string());
                    }
                }
                .boxed()
            }),
        );

        bus.publish(event("Page.frameStoppedLoading", None));
        assert_eq!(rx.await.unwrap(), "Page.frameStoppedLoading");
    }
}
