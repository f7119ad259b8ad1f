//! Source contract and lifecycle supervision.
//!
//! A [`Source`] is the single entry point of external work into a pipeline.
//! [`SourceRunner`] wraps its `main` in a supervising task:
//! - cooperative cancellation ends the task silently;
//! - any other error is logged and forwarded to [`Pipeline::set_error`];
//! - a clean return just ends the task.

use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::{PumpError, Result};
use crate::pipeline::Pipeline;
use crate::processor::Event;

/// A unit of external work feeding one pipeline.
///
/// Implementations must await [`Pipeline::ready`] before each unit of work
/// they start and should return promptly once `cancel` fires.
#[async_trait]
pub trait Source<E: Event>: Any + Send + Sync {
    fn id(&self) -> &str;

    /// Run until finished or cancelled.
    async fn main(&self, pipeline: Arc<Pipeline<E>>, cancel: CancellationToken) -> Result<()>;

    /// Called once when the owning pipeline is built.
    fn attach(&self, _pipeline: &Weak<Pipeline<E>>) {}
}

struct RunningTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Supervises the task running a source's `main`.
pub struct SourceRunner<E: Event> {
    source: Arc<dyn Source<E>>,
    task: Mutex<Option<RunningTask>>,
    stop_timeout: Duration,
}

impl<E: Event> SourceRunner<E> {
    pub(crate) fn new(source: Arc<dyn Source<E>>, stop_timeout: Duration) -> Self {
        Self {
            source,
            task: Mutex::new(None),
            stop_timeout,
        }
    }

    pub fn source(&self) -> &Arc<dyn Source<E>> {
        &self.source
    }

    /// Spawn the supervising task. Does nothing if a task already exists.
    pub fn start(&self, pipeline: Arc<Pipeline<E>>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(self.source.clone(), pipeline, cancel.clone()));
        *task = Some(RunningTask { handle, cancel });
    }

    /// Cancel the task and wait for it to finish.
    ///
    /// A task that ignores cancellation for longer than the stop timeout is
    /// aborted.
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        let source_id = self.source.id();

        task.cancel.cancel();
        let mut handle = task.handle;
        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(())) => debug!(source = source_id, "Source task stopped"),
            Ok(Err(e)) if e.is_cancelled() => debug!(source = source_id, "Source task aborted"),
            Ok(Err(e)) => warn!(source = source_id, error = %e, "Source task panicked"),
            Err(_) => {
                warn!(
                    source = source_id,
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "Source task did not terminate, aborting"
                );
                handle.abort();
            }
        }
    }

    /// Start again if the previous task has finished.
    ///
    /// A panic of the previous task is surfaced as [`PumpError::Task`] and the
    /// source is not restarted. A task that is still running is left alone.
    pub async fn restart(&self, pipeline: Arc<Pipeline<E>>) -> Result<()> {
        let finished = {
            let mut task = self.task.lock();
            match task.as_ref() {
                Some(running) if running.handle.is_finished() => task.take(),
                Some(_) => return Ok(()),
                None => None,
            }
        };

        if let Some(previous) = finished
            && let Err(e) = previous.handle.await
            && e.is_panic()
        {
            return Err(PumpError::Task(format!(
                "source '{}' panicked: {e}",
                self.source.id()
            )));
        }

        self.start(pipeline);
        Ok(())
    }

    /// Whether a supervising task exists and has not finished yet.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

async fn supervise<E: Event>(
    source: Arc<dyn Source<E>>,
    pipeline: Arc<Pipeline<E>>,
    cancel: CancellationToken,
) {
    info!(pipeline = pipeline.id(), source = source.id(), "Source started");

    match source.main(pipeline.clone(), cancel).await {
        Ok(()) => info!(pipeline = pipeline.id(), source = source.id(), "Source finished"),
        Err(e) if e.is_cancelled() => {
            debug!(pipeline = pipeline.id(), source = source.id(), "Source cancelled")
        }
        Err(e) => {
            error!(
                pipeline = pipeline.id(),
                source = source.id(),
                error = %e,
                "Source failed"
            );
            pipeline.set_error(Context::new(), None, Some(e));
        }
    }
}
