//! Per-pipeline lifecycle event bus.
//!
//! Every pipeline owns one `EventBus`. Lifecycle transitions are published on
//! a closed set of [`Topic`]s and delivered two ways:
//!
//! - synchronously to registered listeners, in registration order, on the
//!   publishing task (used to mirror state between pipelines);
//! - through a tokio broadcast channel for monitoring and for
//!   message-driven triggers.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity for bus messages.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Lifecycle topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A trigger source is about to run one cycle.
    CycleBegin,
    /// A trigger source finished one cycle.
    CycleEnd,
    /// A cycle was interrupted by cancellation.
    CycleCanceled,
    /// The pipeline became ready.
    Ready,
    /// The pipeline stopped being ready.
    NotReady,
    /// An internal source crossed its high watermark.
    BackpressureOn,
    /// An internal source drained back below its low watermark.
    BackpressureOff,
}

impl Topic {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Topic::CycleBegin => "pipeline.cycle_begin",
            Topic::CycleEnd => "pipeline.cycle_end",
            Topic::CycleCanceled => "pipeline.cycle_canceled",
            Topic::Ready => "pipeline.ready",
            Topic::NotReady => "pipeline.not_ready",
            Topic::BackpressureOn => "internalsource.backpressure_on",
            Topic::BackpressureOff => "internalsource.backpressure_off",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message published on a pipeline bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: Topic,
    /// Id of the pipeline owning the bus.
    pub pipeline: Arc<str>,
    /// Id of the component that published the message.
    pub origin: Arc<str>,
}

/// Handle returned by [`EventBus::listen`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&BusMessage) + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    topics: Vec<Topic>,
    callback: Listener,
}

struct BusInner {
    pipeline: Arc<str>,
    sender: broadcast::Sender<BusMessage>,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_id: AtomicU64,
}

/// Typed event bus owned by one pipeline. Cloning yields another handle to
/// the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(pipeline: impl Into<Arc<str>>) -> Self {
        Self::with_capacity(pipeline, DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(pipeline: impl Into<Arc<str>>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                pipeline: pipeline.into(),
                sender,
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Id of the owning pipeline.
    pub fn pipeline_id(&self) -> &str {
        &self.inner.pipeline
    }

    /// Subscribe to every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.inner.sender.subscribe()
    }

    /// Register a synchronous listener for `topics`.
    ///
    /// Listeners run on the publishing task and must not block.
    pub fn listen<F>(&self, topics: &[Topic], callback: F) -> ListenerId
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push(ListenerEntry {
            id,
            topics: topics.to_vec(),
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unlisten(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    /// Publish `topic` on behalf of `origin`.
    ///
    /// Returns the number of broadcast receivers that got the message.
    pub fn publish(&self, topic: Topic, origin: &str) -> usize {
        let message = BusMessage {
            topic,
            pipeline: self.inner.pipeline.clone(),
            origin: Arc::from(origin),
        };
        trace!(pipeline = %message.pipeline, origin, topic = %topic, "Publishing bus message");

        // Snapshot the matching callbacks so listeners may (un)register freely.
        let callbacks: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .iter()
            .filter(|entry| entry.topics.contains(&topic))
            .map(|entry| entry.callback.clone())
            .collect();
        for callback in callbacks {
            callback(&message);
        }

        // send() returns Err if there are no receivers, which is fine
        self.inner.sender.send(message).unwrap_or(0)
    }

    /// Number of broadcast subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("pipeline", &self.inner.pipeline)
            .field("listeners", &self.inner.listeners.read().len())
            .finish()
    }
}
