//! Trigger fan-out and trigger-driven sources.
//!
//! A [`Trigger`] arms the [`TriggerFlag`]s of its subscribed sources. A
//! [`TriggerSource`] waits for its pipeline to become ready, then for its
//! flag, and runs one *cycle* of its [`CycleSource`] before clearing the flag
//! and reporting back with [`Trigger::done`].
//!
//! Firing policies live in the submodules and run as tasks that call
//! [`Trigger::fire`]:
//! - [`opportunistic`]: fire immediately and again after every completed
//!   cycle, no more often than a chilldown period
//! - [`periodic`]: fire on a fixed interval
//! - [`pubsub`]: fire once per matching broadcast message
//! - [`run_once`]: fire once, then request application shutdown

pub mod opportunistic;
pub mod periodic;
pub mod pubsub;
pub mod run_once;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::Topic;
use crate::context::Context;
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::processor::Event;
use crate::source::Source;

pub use opportunistic::OpportunisticTrigger;
pub use periodic::PeriodicTrigger;
pub use pubsub::PubSubTrigger;
pub use run_once::RunOnceTrigger;

/// Per-source "triggered" flag.
#[derive(Debug)]
pub struct TriggerFlag {
    id: Arc<str>,
    armed: watch::Sender<bool>,
}

impl TriggerFlag {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self {
            id: id.into(),
            armed: watch::Sender::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Set the flag. Returns `true` if it was not set before.
    pub fn arm(&self) -> bool {
        self.armed.send_if_modified(|armed| !std::mem::replace(armed, true))
    }

    pub fn clear(&self) {
        self.armed.send_replace(false);
    }

    pub fn is_armed(&self) -> bool {
        *self.armed.borrow()
    }

    pub async fn wait_armed(&self) {
        let mut rx = self.armed.subscribe();
        let _ = rx.wait_for(|armed| *armed).await;
    }
}

/// Fan-out firing primitive owning a set of subscribed sources.
#[derive(Debug)]
pub struct Trigger {
    id: String,
    sources: Mutex<Vec<Arc<TriggerFlag>>>,
    max_triggered: Option<usize>,
    paused: AtomicBool,
    last_fire_at: Mutex<Option<Instant>>,
    completed: watch::Sender<u64>,
    wakeup: Notify,
}

impl Trigger {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sources: Mutex::new(Vec::new()),
            max_triggered: None,
            paused: AtomicBool::new(false),
            last_fire_at: Mutex::new(None),
            completed: watch::Sender::new(0),
            wakeup: Notify::new(),
        }
    }

    /// Arm at most `max` sources per fire.
    pub fn with_max_triggered(mut self, max: usize) -> Self {
        self.max_triggered = Some(max);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn max_triggered(&self) -> Option<usize> {
        self.max_triggered
    }

    /// Subscribe a source flag. Adding the same flag twice has no effect.
    pub fn add(&self, flag: Arc<TriggerFlag>) {
        let mut sources = self.sources.lock();
        if !sources.iter().any(|f| Arc::ptr_eq(f, &flag)) {
            sources.push(flag);
        }
    }

    /// Unsubscribe every flag registered under `source_id`.
    pub fn remove(&self, source_id: &str) -> bool {
        let mut sources = self.sources.lock();
        let before = sources.len();
        sources.retain(|f| f.id() != source_id);
        sources.len() != before
    }

    pub fn source_count(&self) -> usize {
        self.sources.lock().len()
    }

    /// Arm subscribed sources and return how many were newly armed.
    ///
    /// With `max_triggered = k`, the number of armed sources after the call
    /// never exceeds `k` unless it already did; the newly armed ones are a
    /// uniformly shuffled pick among the unarmed.
    pub fn fire(&self) -> usize {
        if self.is_paused() {
            debug!(trigger = %self.id, "Trigger paused, not firing");
            return 0;
        }
        *self.last_fire_at.lock() = Some(Instant::now());

        let sources = self.sources.lock().clone();
        let armed = match self.max_triggered {
            None => sources.iter().filter(|flag| flag.arm()).count(),
            Some(max) => {
                let (triggered, mut untriggered): (Vec<_>, Vec<_>) =
                    sources.into_iter().partition(|flag| flag.is_armed());
                let to_trigger = max.saturating_sub(triggered.len());
                untriggered.shuffle(&mut rand::rng());
                untriggered
                    .iter()
                    .take(to_trigger)
                    .filter(|flag| flag.arm())
                    .count()
            }
        };
        debug!(trigger = %self.id, armed, "Trigger fired");
        armed
    }

    /// Called by a source when its cycle is complete.
    pub fn done(&self, flag: &TriggerFlag) {
        debug!(trigger = %self.id, source = flag.id(), "Cycle done");
        self.completed.send_modify(|count| *count += 1);
        self.wakeup.notify_one();
    }

    /// Number of cycles reported complete so far.
    pub fn completed_cycles(&self) -> u64 {
        *self.completed.borrow()
    }

    /// Wait until at least `count` cycles have been reported complete.
    pub async fn wait_completed(&self, count: u64) {
        let mut rx = self.completed.subscribe();
        let _ = rx.wait_for(|completed| *completed >= count).await;
    }

    pub fn pause(&self, pause: bool) {
        self.paused.store(pause, Ordering::SeqCst);
        info!(trigger = %self.id, paused = pause, "Trigger pause changed");
        if !pause {
            self.wakeup.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn last_fire_at(&self) -> Option<Instant> {
        *self.last_fire_at.lock()
    }

    /// Resolves after a completed cycle or an unpause.
    pub(crate) async fn woken(&self) {
        self.wakeup.notified().await;
    }
}

/// The unit of work of a [`TriggerSource`].
#[async_trait]
pub trait CycleSource<E: Event>: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Run one cycle, typically submitting events with [`Pipeline::process`].
    async fn cycle(&self, pipeline: &Arc<Pipeline<E>>) -> Result<()>;

    /// Called once when the owning pipeline is built.
    fn attach(&self, _pipeline: &Weak<Pipeline<E>>) {}
}

/// A source that runs one cycle each time one of its triggers arms it.
pub struct TriggerSource<E, C> {
    cycle: C,
    flag: Arc<TriggerFlag>,
    triggers: Vec<Arc<Trigger>>,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event, C: CycleSource<E>> TriggerSource<E, C> {
    pub fn new(cycle: C) -> Self {
        let flag = Arc::new(TriggerFlag::new(cycle.id()));
        Self {
            cycle,
            flag,
            triggers: Vec::new(),
            _event: PhantomData,
        }
    }

    /// Subscribe to `trigger`.
    pub fn on(mut self, trigger: &Arc<Trigger>) -> Self {
        trigger.add(self.flag.clone());
        self.triggers.push(trigger.clone());
        self
    }

    pub fn flag(&self) -> &Arc<TriggerFlag> {
        &self.flag
    }

    pub fn cycle_source(&self) -> &C {
        &self.cycle
    }
}

#[async_trait]
impl<E, C> Source<E> for TriggerSource<E, C>
where
    E: Event,
    C: CycleSource<E>,
{
    fn id(&self) -> &str {
        self.cycle.id()
    }

    async fn main(&self, pipeline: Arc<Pipeline<E>>, cancel: CancellationToken) -> Result<()> {
        let id = self.cycle.id();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = pipeline.ready() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.flag.wait_armed() => {}
            }

            debug!(pipeline = pipeline.id(), source = id, "Cycle begin");
            pipeline.bus().publish(Topic::CycleBegin, id);

            let result = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.cycle.cycle(&pipeline) => Some(result),
            };
            match result {
                None => {
                    debug!(pipeline = pipeline.id(), source = id, "Cycle canceled");
                    pipeline.bus().publish(Topic::CycleCanceled, id);
                    return Ok(());
                }
                Some(Err(e)) if e.is_cancelled() => {
                    pipeline.bus().publish(Topic::CycleCanceled, id);
                    return Ok(());
                }
                Some(Err(e)) => pipeline.set_error(Context::new(), None, Some(e)),
                Some(Ok(())) => {}
            }

            pipeline.bus().publish(Topic::CycleEnd, id);
            debug!(pipeline = pipeline.id(), source = id, "Cycle end");
            self.flag.clear();
            for trigger in &self.triggers {
                trigger.done(&self.flag);
            }
        }
    }

    fn attach(&self, pipeline: &Weak<Pipeline<E>>) {
        self.cycle.attach(pipeline);
    }
}
