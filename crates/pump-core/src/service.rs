//! Registry of running pipelines.
//!
//! `PumpService` owns every pipeline of an application, resolves source
//! addresses for routing and drives the collective lifecycle: start, stop,
//! operator error reset and shutdown.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{PumpError, Result};
use crate::internal::InternalSource;
use crate::metrics::PipelineSnapshot;
use crate::pipeline::Pipeline;
use crate::processor::Event;

pub struct PumpService<E: Event> {
    pipelines: RwLock<Vec<Arc<Pipeline<E>>>>,
    shutdown: CancellationToken,
}

impl<E: Event> Default for PumpService<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> PumpService<E> {
    pub fn new() -> Self {
        Self {
            pipelines: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a pipeline. Ids must be unique.
    pub fn add_pipeline(&self, pipeline: Arc<Pipeline<E>>) -> Result<()> {
        let mut pipelines = self.pipelines.write();
        if pipelines.iter().any(|p| p.id() == pipeline.id()) {
            return Err(PumpError::config(format!(
                "pipeline '{}' is already registered",
                pipeline.id()
            )));
        }
        info!(pipeline = pipeline.id(), "Pipeline registered");
        pipelines.push(pipeline);
        Ok(())
    }

    pub fn pipeline(&self, id: &str) -> Option<Arc<Pipeline<E>>> {
        self.pipelines.read().iter().find(|p| p.id() == id).cloned()
    }

    /// All pipelines in registration order.
    pub fn pipelines(&self) -> Vec<Arc<Pipeline<E>>> {
        self.pipelines.read().clone()
    }

    /// Resolve `"<pipeline>"` or `"<pipeline>.<source>"` to an internal source.
    pub fn locate(&self, address: &str) -> Result<InternalSource<E>> {
        let (pipeline_id, source_id) = match address.split_once('.') {
            Some((pipeline, source)) => (pipeline, Some(source)),
            None => (address, None),
        };
        let pipeline = self
            .pipeline(pipeline_id)
            .ok_or_else(|| PumpError::NotFound(format!("pipeline '{pipeline_id}'")))?;
        let source = pipeline.source();
        if let Some(source_id) = source_id
            && source.id() != source_id
        {
            return Err(PumpError::NotFound(format!("source '{address}'")));
        }

        let any: &dyn Any = &*source;
        any.downcast_ref::<InternalSource<E>>()
            .cloned()
            .ok_or_else(|| {
                PumpError::NotFound(format!("'{address}' is not an internal source"))
            })
    }

    pub fn start(&self) {
        for pipeline in self.pipelines() {
            pipeline.start();
        }
    }

    /// Stop every pipeline, in registration order.
    pub async fn stop(&self) {
        for pipeline in self.pipelines() {
            pipeline.stop().await;
        }
    }

    /// Reset the error state of every pipeline.
    pub fn clear_errors(&self) {
        for pipeline in self.pipelines() {
            pipeline.clear_error();
        }
    }

    pub fn snapshot(&self) -> Vec<PipelineSnapshot> {
        self.pipelines().iter().map(|p| p.snapshot()).collect()
    }

    /// Token cancelled when the application should shut down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown.cancelled().await;
    }
}
