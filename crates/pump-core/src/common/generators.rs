use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::pipeline::Injector;
use crate::processor::{Event, Generator};

type ExpandFn<E> = dyn Fn(&Context, E) -> Vec<E> + Send + Sync;

/// Expands one event into many, injecting each item separately.
pub struct IteratorGenerator<E> {
    name: String,
    expand: Box<ExpandFn<E>>,
}

impl<E: Event> IteratorGenerator<E> {
    pub fn new<F, I>(name: impl Into<String>, expand: F) -> Self
    where
        F: Fn(&Context, E) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = E>,
    {
        Self {
            name: name.into(),
            expand: Box::new(move |context, event| expand(context, event).into_iter().collect()),
        }
    }
}

#[async_trait]
impl<E: Event> Generator<E> for IteratorGenerator<E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        context: Context,
        event: E,
        depth: usize,
        injector: &Injector<E>,
    ) -> Result<()> {
        let items = (self.expand)(&context, event);
        for item in items {
            injector.inject(context.clone(), item, depth)?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}
