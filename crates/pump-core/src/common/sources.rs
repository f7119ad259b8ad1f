use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::processor::Event;
use crate::source::Source;
use crate::trigger::CycleSource;

/// A source with no work of its own.
///
/// Events are submitted from outside with [`Pipeline::process`]; `main` only
/// waits for cancellation.
#[derive(Debug, Clone)]
pub struct ManualSource {
    id: String,
}

impl ManualSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl<E: Event> Source<E> for ManualSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn main(&self, _pipeline: Arc<Pipeline<E>>, cancel: CancellationToken) -> Result<()> {
        cancel.cancelled().await;
        Ok(())
    }
}

type ItemsFn<E> = dyn Fn() -> Vec<E> + Send + Sync;

/// Cycle source submitting a fresh batch of items on every cycle.
///
/// Each item waits for the pipeline to be ready before it is dispatched.
pub struct IteratorSource<E> {
    id: String,
    items: Box<ItemsFn<E>>,
}

impl<E: Event> IteratorSource<E> {
    /// Replay `items` on every cycle.
    pub fn new(id: impl Into<String>, items: impl IntoIterator<Item = E>) -> Self {
        let items: Vec<E> = items.into_iter().collect();
        Self::from_fn(id, move || items.clone())
    }

    /// Ask `f` for the items of each cycle.
    pub fn from_fn<F>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Vec<E> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            items: Box::new(f),
        }
    }
}

#[async_trait]
impl<E: Event> CycleSource<E> for IteratorSource<E> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn cycle(&self, pipeline: &Arc<Pipeline<E>>) -> Result<()> {
        for item in (self.items)() {
            pipeline.process_when_ready(Context::new(), item).await?;
        }
        Ok(())
    }
}
