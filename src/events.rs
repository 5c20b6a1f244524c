//! Event emission capability.
//!
//! Every component (environment, detector, notifier) embeds an [`Emitter`]
//! rather than inheriting from a common base. Handlers run synchronously in
//! the emitting turn; [`EventStream`] gives a buffered, pull-based view for
//! collaborators and tests.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detector::{DetectorInfo, SignalSource};
use crate::environment::EnvironmentState;
use crate::error::{ExecutionError, SignalError, SignalResult};
use crate::notifier::DeliveryReport;
use crate::value::Value;

/// Unique identifier for a handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Discriminant of [`Event`], used when subscribing.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Changed,
    IgnoredChange,
    Detected,
    Skipped,
    Delivered,
}

/// Events emitted by the core.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub enum Event {
    /// An environment replaced its state.
    Changed {
        environment: String,
        old: EnvironmentState,
        new: EnvironmentState,
    },

    /// A composite received a value that is not an environment.
    IgnoredChange {
        environment: String,
        state: EnvironmentState,
        value: Value,
    },

    /// The full filter chain accepted a signal.
    Detected {
        prior: Option<Value>,
        value: Value,
        detector: DetectorInfo,
        source: SignalSource,
    },

    /// A filter blocked a signal; `value` is what the blocking filter saw.
    Skipped {
        prior: Option<Value>,
        value: Value,
        detector: DetectorInfo,
        source: SignalSource,
    },

    /// A notifier finished (or failed) a delivery.
    Delivered(DeliveryReport),
}

impl Event {
    /// The kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Changed { .. } => EventKind::Changed,
            Self::IgnoredChange { .. } => EventKind::IgnoredChange,
            Self::Detected { .. } => EventKind::Detected,
            Self::Skipped { .. } => EventKind::Skipped,
            Self::Delivered(_) => EventKind::Delivered,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct HandlerEntry {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
struct EmitterInner {
    handlers: RwLock<Vec<HandlerEntry>>,
    dropped_events: AtomicU64,
}

impl EmitterInner {
    fn remove(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }
}

/// Subscribe/emit capability shared by all components.
///
/// Cloning yields another handle to the same handler table.
#[derive(Clone, Default)]
pub struct Emitter {
    inner: Arc<EmitterInner>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .inner
            .handlers
            .read()
            .map_or(0, |handlers| handlers.len());
        f.debug_struct("Emitter").field("handlers", &count).finish()
    }
}

impl Emitter {
    /// An emitter with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(HandlerEntry {
                id,
                kind,
                handler: Arc::new(handler),
            });
        id
    }

    /// Removes a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove(id)
    }

    /// Calls every handler registered for the event's kind, in registration order.
    ///
    /// Handlers are snapshotted first, so a handler may subscribe or
    /// unsubscribe without deadlocking.
    pub fn emit(&self, event: &Event) {
        let kind = event.kind();
        let targets: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| h.kind == kind)
            .map(|h| Arc::clone(&h.handler))
            .collect();

        for handler in targets {
            handler(event);
        }
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| h.kind == kind)
            .count()
    }

    /// Opens a buffered stream of events of `kind`.
    ///
    /// The emitting side never blocks: events that do not fit in the buffer
    /// are dropped and counted in [`Emitter::dropped_events`].
    #[must_use]
    pub fn stream(&self, kind: EventKind, capacity: usize) -> EventStream {
        let (tx, rx) = bounded::<Event>(capacity.max(1));
        let inner = Arc::downgrade(&self.inner);
        let counter = Weak::clone(&inner);
        let id = self.subscribe(kind, move |event| match tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                if let Some(inner) = counter.upgrade() {
                    inner.dropped_events.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        EventStream {
            subscription_id: id,
            rx,
            emitter: inner,
            unsubscribed: AtomicBool::new(false),
        }
    }

    /// Events lost because a stream's buffer was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped_events.load(Ordering::Relaxed)
    }
}

/// A buffered subscription to one kind of event.
///
/// Dropping the stream unregisters its handler.
pub struct EventStream {
    subscription_id: SubscriptionId,
    rx: Receiver<Event>,
    emitter: Weak<EmitterInner>,
    unsubscribed: AtomicBool,
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("subscription_id", &self.subscription_id)
            .field("pending", &self.rx.len())
            .finish()
    }
}

impl EventStream {
    /// The subscription id backing this stream.
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Explicit unregistration. Idempotent.
    pub fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.emitter.upgrade() {
            inner.remove(self.subscription_id);
        }
    }

    /// Next buffered event, if any.
    #[must_use]
    pub fn try_recv(&self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drains every buffered event.
    #[must_use]
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }

    /// Blocks until the next event arrives.
    pub fn recv(&self) -> SignalResult<Event> {
        self.rx.recv().map_err(|_| {
            SignalError::Execution(ExecutionError::Disconnected {
                path: "event_stream".to_string(),
            })
        })
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> SignalResult<Event> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => SignalError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => SignalError::Execution(ExecutionError::Disconnected {
                path: "event_stream".to_string(),
            }),
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
