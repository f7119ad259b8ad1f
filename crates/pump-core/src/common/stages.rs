use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::LatchConfig;
use crate::context::Context;
use crate::error::Result;
use crate::processor::{Event, Outcome, Processor};

type ProcessFn<E> = dyn Fn(&Context, E) -> Result<Outcome<E>> + Send + Sync;

/// Closure-backed processor.
pub struct FnProcessor<E> {
    name: String,
    f: Box<ProcessFn<E>>,
}

impl<E: Event> FnProcessor<E> {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Context, E) -> Result<Outcome<E>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }

    /// Processor applying an infallible one-to-one mapping.
    pub fn map<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(E) -> E + Send + Sync + 'static,
    {
        Self::new(name, move |_, event| Ok(Outcome::Next(f(event))))
    }
}

impl<E: Event> Processor<E> for FnProcessor<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, context: &Context, event: E) -> Result<Outcome<E>> {
        (self.f)(context, event)
    }
}

/// Remembers the most recent events and passes every event through.
///
/// Clones share the same buffer.
#[derive(Clone)]
pub struct LatchProcessor<E> {
    limit: usize,
    latch: Arc<Mutex<VecDeque<E>>>,
}

impl<E: Event> LatchProcessor<E> {
    /// Keep the last `limit` events; `0` keeps everything.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            latch: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn from_config(config: &LatchConfig) -> Self {
        Self::new(config.queue_max_size)
    }

    pub fn latched(&self) -> Vec<E> {
        self.latch.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.latch.lock().clear();
    }
}

impl<E: Event> Processor<E> for LatchProcessor<E> {
    fn name(&self) -> &str {
        "LatchProcessor"
    }

    fn process(&self, _context: &Context, event: E) -> Result<Outcome<E>> {
        let mut latch = self.latch.lock();
        if self.limit > 0 && latch.len() == self.limit {
            latch.pop_front();
        }
        latch.push_back(event.clone());
        Ok(Outcome::Next(event))
    }
}
