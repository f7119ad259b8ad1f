//! Queue-backed source used to hand events from one pipeline to another.
//!
//! Producers [`put`](InternalSource::put) events; the source's main loop
//! dequeues them whenever its pipeline is ready and dispatches them at
//! depth 0 with the producer's context as ancestor.
//!
//! Fill level is signaled with hysteresis: `internalsource.backpressure_on`
//! once the queue reaches the high watermark (`capacity * ratio`, rounded),
//! `internalsource.backpressure_off` once it drains below `high - 1` or
//! empties.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::Topic;
use crate::config::InternalSourceConfig;
use crate::context::Context;
use crate::error::{PumpError, Result};
use crate::pipeline::Pipeline;
use crate::processor::Event;
use crate::source::Source;

type Item<E> = (Context, E);

struct Inner<E: Event> {
    id: String,
    capacity: usize,
    high_watermark: usize,
    tx: flume::Sender<Item<E>>,
    rx: flume::Receiver<Item<E>>,
    backpressure: Mutex<bool>,
    pipeline: Mutex<Weak<Pipeline<E>>>,
}

/// Bounded-queue source with backpressure signaling.
///
/// Cloning yields another handle to the same queue.
pub struct InternalSource<E: Event> {
    inner: Arc<Inner<E>>,
}

impl<E: Event> Clone for InternalSource<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Event> InternalSource<E> {
    pub fn new(id: impl Into<String>, config: InternalSourceConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.queue_max_size.max(2);
        let high_watermark = ((capacity as f64 * config.backpressure_ratio).round() as usize).max(1);
        let (tx, rx) = flume::bounded(capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                id: id.into(),
                capacity,
                high_watermark,
                tx,
                rx,
                backpressure: Mutex::new(false),
                pipeline: Mutex::new(Weak::new()),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn high_watermark(&self) -> usize {
        self.inner.high_watermark
    }

    pub fn len(&self) -> usize {
        self.inner.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.rx.is_empty()
    }

    pub fn is_backpressured(&self) -> bool {
        *self.inner.backpressure.lock()
    }

    /// The pipeline this source feeds, if it is still alive.
    pub fn pipeline(&self) -> Option<Arc<Pipeline<E>>> {
        self.inner.pipeline.lock().upgrade()
    }

    /// Enqueue without waiting. Fails with [`PumpError::QueueFull`] at capacity.
    pub fn put(&self, context: Context, event: E) -> Result<()> {
        self.inner
            .tx
            .try_send((context, event))
            .map_err(|e| match e {
                flume::TrySendError::Full(_) => PumpError::QueueFull(self.inner.id.clone()),
                flume::TrySendError::Disconnected(_) => PumpError::ChannelClosed("internal source"),
            })?;
        self.after_enqueue();
        Ok(())
    }

    /// Enqueue, waiting for room if the queue is full.
    pub async fn put_async(&self, context: Context, event: E) -> Result<()> {
        self.inner
            .tx
            .send_async((context, event))
            .await
            .map_err(|_| PumpError::ChannelClosed("internal source"))?;
        self.after_enqueue();
        Ok(())
    }

    /// Dequeue without waiting.
    pub fn try_get(&self) -> Option<(Context, E)> {
        let item = self.inner.rx.try_recv().ok()?;
        self.after_dequeue();
        Some(item)
    }

    fn after_enqueue(&self) {
        let changed = {
            let mut on = self.inner.backpressure.lock();
            if !*on && self.len() >= self.inner.high_watermark {
                *on = true;
                true
            } else {
                false
            }
        };
        if changed {
            debug!(source = %self.inner.id, len = self.len(), "Backpressure on");
            self.publish(Topic::BackpressureOn);
        }
    }

    fn after_dequeue(&self) {
        let changed = {
            let mut on = self.inner.backpressure.lock();
            let len = self.len();
            if *on && (len + 1 < self.inner.high_watermark || len == 0) {
                *on = false;
                true
            } else {
                false
            }
        };
        if changed {
            debug!(source = %self.inner.id, len = self.len(), "Backpressure off");
            self.publish(Topic::BackpressureOff);
        }
    }

    fn publish(&self, topic: Topic) {
        if let Some(pipeline) = self.pipeline() {
            pipeline.bus().publish(topic, &self.inner.id);
        }
    }
}

#[async_trait]
impl<E: Event> Source<E> for InternalSource<E> {
    fn id(&self) -> &str {
        &self.inner.id
    }

    async fn main(&self, pipeline: Arc<Pipeline<E>>, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = pipeline.ready() => {}
            }
            let (context, event) = tokio::select! {
                _ = cancel.cancelled() => break,
                item = self.inner.rx.recv_async() => match item {
                    Ok(item) => item,
                    Err(_) => break,
                },
            };
            self.after_dequeue();

            let context = Context::with_ancestor(context);
            if let Err(e) = pipeline.process(context.clone(), event) {
                pipeline.set_error(context, None, Some(e));
            }
        }

        let left = self.len();
        if left > 0 {
            warn!(source = %self.inner.id, left, "Internal source stopped with events in its queue");
        } else {
            info!(source = %self.inner.id, "Internal source stopped");
        }
        Ok(())
    }

    fn attach(&self, pipeline: &Weak<Pipeline<E>>) {
        *self.inner.pipeline.lock() = pipeline.clone();
    }
}
