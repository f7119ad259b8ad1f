//! Stage contracts: processors, sinks and generators.
//!
//! A pipeline is an ordered list of *depths*; each depth is an ordered list of
//! stages. Processors and sinks run synchronously inside the dispatch walk.
//! A generator ends its depth: its `generate` runs as a deferred task and
//! delivers results into the next depth through an [`Injector`].

use std::fmt;
use std::sync::Weak;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{PumpError, Result};
use crate::pipeline::{Injector, Pipeline};

/// Bound satisfied by every event type a pipeline can carry.
pub trait Event: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Event for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// Result of a processor invocation.
pub enum Outcome<E> {
    /// Continue with the next processor of the same depth.
    Next(E),
    /// The event was consumed or filtered out.
    Drop,
    /// Fan out: every item is dispatched into the next depth.
    Many(Box<dyn Iterator<Item = E> + Send>),
}

impl<E> Outcome<E> {
    /// Fan out over any iterable.
    pub fn many<I>(items: I) -> Self
    where
        I: IntoIterator<Item = E>,
        I::IntoIter: Send + 'static,
    {
        Outcome::Many(Box::new(items.into_iter()))
    }

    pub fn is_drop(&self) -> bool {
        matches!(self, Outcome::Drop)
    }
}

impl<E: fmt::Debug> fmt::Debug for Outcome<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Next(event) => f.debug_tuple("Next").field(event).finish(),
            Outcome::Drop => f.write_str("Drop"),
            Outcome::Many(_) => f.write_str("Many(..)"),
        }
    }
}

/// A synchronous transformation stage.
pub trait Processor<E: Event>: Send + Sync {
    /// Stage name used in logs and errors.
    fn name(&self) -> &str;

    /// Transform one event.
    ///
    /// Must not block: long-running work belongs in a [`Generator`].
    fn process(&self, context: &Context, event: E) -> Result<Outcome<E>>;

    /// Called once when the owning pipeline is built.
    fn attach(&self, _pipeline: &Weak<Pipeline<E>>) {}
}

/// A terminal stage. A sink always consumes the event it receives.
pub trait Sink<E: Event>: Send + Sync {
    fn name(&self) -> &str;

    fn consume(&self, context: &Context, event: E) -> Result<()>;

    /// Called once when the owning pipeline is built.
    fn attach(&self, _pipeline: &Weak<Pipeline<E>>) {}
}

/// A stage that produces zero, one or many events asynchronously.
#[async_trait]
pub trait Generator<E: Event>: Send + Sync {
    fn name(&self) -> &str;

    /// Deferred work for one event.
    ///
    /// `depth` is the depth results must be injected into.
    async fn generate(
        &self,
        context: Context,
        event: E,
        depth: usize,
        injector: &Injector<E>,
    ) -> Result<()>;

    /// Called once when the owning pipeline is built.
    fn attach(&self, _pipeline: &Weak<Pipeline<E>>) {}

    /// Called when the owning pipeline starts.
    fn on_start(&self, _injector: &Injector<E>) {}

    /// Called when the owning pipeline stops, after its source has stopped.
    async fn on_stop(&self) {}
}

/// Hook deciding whether an error puts the pipeline into error state.
///
/// Returning `false` suppresses the error and keeps the pipeline ready.
pub trait ErrorHandler<E: Event>: Send + Sync {
    fn handle_error(&self, cause: &PumpError, context: &Context, event: Option<&E>) -> bool;
}

impl<E, F> ErrorHandler<E> for F
where
    E: Event,
    F: Fn(&PumpError, &Context, Option<&E>) -> bool + Send + Sync,
{
    fn handle_error(&self, cause: &PumpError, context: &Context, event: Option<&E>) -> bool {
        self(cause, context, event)
    }
}

/// Default hook: every error enters error state.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailOnError;

impl<E: Event> ErrorHandler<E> for FailOnError {
    fn handle_error(&self, _cause: &PumpError, _context: &Context, _event: Option<&E>) -> bool {
        true
    }
}
