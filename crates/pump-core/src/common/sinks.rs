use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::context::Context;
use crate::error::Result;
use crate::processor::{Event, Sink};

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl<E: Event> Sink<E> for NullSink {
    fn name(&self) -> &str {
        "NullSink"
    }

    fn consume(&self, _context: &Context, _event: E) -> Result<()> {
        Ok(())
    }
}

/// Closure-backed sink.
pub struct FnSink<E> {
    name: String,
    f: Box<dyn Fn(&Context, E) -> Result<()> + Send + Sync>,
}

impl<E: Event> FnSink<E> {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Context, E) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl<E: Event> Sink<E> for FnSink<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&self, context: &Context, event: E) -> Result<()> {
        (self.f)(context, event)
    }
}

/// Records consumed events in memory. Clones share the same record.
pub struct CollectSink<E> {
    items: Arc<Mutex<Vec<(Context, E)>>>,
    count: Arc<watch::Sender<usize>>,
}

impl<E> Clone for CollectSink<E> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            count: self.count.clone(),
        }
    }
}

impl<E: Event> Default for CollectSink<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> CollectSink<E> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
            count: Arc::new(watch::Sender::new(0)),
        }
    }

    pub fn events(&self) -> Vec<E> {
        self.items.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn contexts(&self) -> Vec<Context> {
        self.items.lock().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `n` events have been consumed.
    pub async fn wait_for(&self, n: usize) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

impl<E: Event> Sink<E> for CollectSink<E> {
    fn name(&self) -> &str {
        "CollectSink"
    }

    fn consume(&self, context: &Context, event: E) -> Result<()> {
        let len = {
            let mut items = self.items.lock();
            items.push((context.clone(), event));
            items.len()
        };
        self.count.send_replace(len);
        Ok(())
    }
}
