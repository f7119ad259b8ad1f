//! Out-of-band processing: a bounded queue served by a fixed set of workers.
//!
//! [`OobGenerator`] is a [`Generator`] whose `generate` only enqueues the
//! event. Workers dequeue `(context, event, depth)` jobs, run the suspending
//! [`OobProcessor::process_oob`] and inject results back into the pipeline.
//!
//! While the queue is full the generator holds the `oob:<id>` throttle token
//! on its own pipeline, so trigger-driven sources stop starting new cycles.
//! Shutdown pushes one sentinel per worker and waits for all of them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OobConfig;
use crate::context::Context;
use crate::error::{PumpError, Result};
use crate::pipeline::{Injector, Pipeline, ThrottleToken};
use crate::processor::{Event, Generator};

/// The suspending work performed by OOB workers.
#[async_trait]
pub trait OobProcessor<E: Event>: Send + Sync + 'static {
    /// Return `Ok(None)` to drop the event.
    async fn process_oob(&self, context: &Context, event: E) -> Result<Option<E>>;
}

struct OobJob<E> {
    context: Context,
    event: E,
    depth: usize,
}

/// `None` is the shutdown sentinel.
type Slot<E> = Option<OobJob<E>>;

#[derive(Debug, Default)]
struct OobStats {
    events_in: AtomicU64,
    events_out: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time counters of an [`OobGenerator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OobSnapshot {
    pub events_in: u64,
    pub events_out: u64,
    pub dropped: u64,
    pub errors: u64,
    pub queued: usize,
}

struct Shared<E: Event> {
    id: String,
    token: ThrottleToken,
    pipeline: Mutex<Weak<Pipeline<E>>>,
    throttled: AtomicBool,
    stats: OobStats,
}

impl<E: Event> Shared<E> {
    fn set_throttled(&self, enable: bool) {
        if self.throttled.swap(enable, Ordering::SeqCst) == enable {
            return;
        }
        let pipeline = self.pipeline.lock().upgrade();
        match pipeline {
            Some(pipeline) => pipeline.throttle(self.token.clone(), enable),
            None => debug!(oob = %self.id, enable, "No pipeline attached, throttle skipped"),
        }
    }
}

pub struct OobGenerator<E: Event, P> {
    processor: Arc<P>,
    num_of_workers: usize,
    tx: flume::Sender<Slot<E>>,
    rx: flume::Receiver<Slot<E>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared<E>>,
}

impl<E: Event, P: OobProcessor<E>> OobGenerator<E, P> {
    pub fn new(id: impl Into<String>, processor: P, config: OobConfig) -> Result<Self> {
        config.validate()?;
        let id = id.into();
        let (tx, rx) = flume::bounded(config.queue_max_size);
        Ok(Self {
            processor: Arc::new(processor),
            num_of_workers: config.num_of_workers,
            tx,
            rx,
            workers: Mutex::new(Vec::new()),
            shared: Arc::new(Shared {
                token: ThrottleToken::from(format!("oob:{id}")),
                id,
                pipeline: Mutex::new(Weak::new()),
                throttled: AtomicBool::new(false),
                stats: OobStats::default(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn throttle_token(&self) -> &ThrottleToken {
        &self.shared.token
    }

    pub fn queue_len(&self) -> usize {
        self.rx.len()
    }

    /// Number of worker tasks that have not exited yet.
    pub fn active_workers(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    pub fn snapshot(&self) -> OobSnapshot {
        let stats = &self.shared.stats;
        OobSnapshot {
            events_in: stats.events_in.load(Ordering::Relaxed),
            events_out: stats.events_out.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            errors: stats.errors.load(Ordering::Relaxed),
            queued: self.queue_len(),
        }
    }

    /// Push one sentinel per worker and wait until every worker has exited.
    pub async fn drain(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }

        for _ in 0..workers.len() {
            if self.tx.send_async(None).await.is_err() {
                break;
            }
        }
        for handle in workers {
            if let Err(e) = handle.await
                && e.is_panic()
            {
                warn!(oob = %self.shared.id, error = %e, "OOB worker panicked");
            }
        }

        let left = self.rx.len();
        if left > 0 {
            warn!(oob = %self.shared.id, left, "OOB queue not empty after drain");
        }
        self.shared.set_throttled(false);
        info!(oob = %self.shared.id, "OOB workers drained");
    }
}

async fn run_worker<E: Event, P: OobProcessor<E>>(
    index: usize,
    processor: Arc<P>,
    rx: flume::Receiver<Slot<E>>,
    capacity: usize,
    injector: Injector<E>,
    shared: Arc<Shared<E>>,
) {
    debug!(oob = %shared.id, worker = index, "OOB worker started");
    while let Ok(Some(job)) = rx.recv_async().await {
        if rx.len() < capacity {
            shared.set_throttled(false);
        }

        let OobJob {
            context,
            event,
            depth,
        } = job;
        match processor.process_oob(&context, event).await {
            Ok(Some(result)) => {
                shared.stats.events_out.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = injector.inject(context.clone(), result, depth) {
                    shared.stats.errors.fetch_add(1, Ordering::Relaxed);
                    injector.report_error(context, e);
                }
            }
            Ok(None) => {
                shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                shared.stats.errors.fetch_add(1, Ordering::Relaxed);
                injector.report_error(context, e);
            }
        }
    }
    debug!(oob = %shared.id, worker = index, "OOB worker exited");
}

#[async_trait]
impl<E: Event, P: OobProcessor<E>> Generator<E> for OobGenerator<E, P> {
    fn name(&self) -> &str {
        &self.shared.id
    }

    async fn generate(
        &self,
        context: Context,
        event: E,
        depth: usize,
        _injector: &Injector<E>,
    ) -> Result<()> {
        self.shared.stats.events_in.fetch_add(1, Ordering::Relaxed);
        if self.tx.is_full() {
            debug!(oob = %self.shared.id, "OOB queue full");
            self.shared.set_throttled(true);
        }
        self.tx
            .send_async(Some(OobJob {
                context,
                event,
                depth,
            }))
            .await
            .map_err(|_| PumpError::ChannelClosed("oob queue"))
    }

    fn attach(&self, pipeline: &Weak<Pipeline<E>>) {
        *self.shared.pipeline.lock() = pipeline.clone();
    }

    fn on_start(&self, injector: &Injector<E>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        let capacity = self.tx.capacity().unwrap_or(usize::MAX);
        for index in 0..self.num_of_workers {
            workers.push(tokio::spawn(run_worker(
                index,
                self.processor.clone(),
                self.rx.clone(),
                capacity,
                injector.clone(),
                self.shared.clone(),
            )));
        }
        info!(oob = %self.shared.id, workers = self.num_of_workers, "OOB workers started");
    }

    async fn on_stop(&self) {
        self.drain().await;
    }
}
