//! # Pipeline
//!
//! A pipeline owns exactly one [`Source`] and an ordered list of *depths*.
//! Each depth is an ordered list of stages; a new depth begins right after
//! every [`Generator`], so `depths == generators + 1`.
//!
//! ## Dispatch
//!
//! [`Pipeline::process`] walks depth 0 synchronously. Each processor either
//! passes the event on, drops it, or fans it out into the next depth. An
//! event that reaches the end of its depth without being consumed by a sink
//! is a construction error.
//!
//! Generators hand their event to a deferred task. Results come back through
//! [`Injector::inject`], which sends them to the pipeline's dispatcher task
//! instead of re-entering the dispatch walk on the caller's stack.
//!
//! ## Readiness
//!
//! Any collaborator may hold a [`ThrottleToken`] on the pipeline. The
//! pipeline is ready while no token is held and no error is active;
//! [`Pipeline::ready`] suspends until that is the case. Waiters resume in
//! the order they started waiting.

use std::cell::Cell;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};
use crate::config::PipelineConfig;
use crate::context::Context;
use crate::error::{PumpError, Result};
use crate::metrics::{PipelineMetrics, PipelineSnapshot};
use crate::processor::{ErrorHandler, Event, FailOnError, Generator, Outcome, Processor, Sink};
use crate::source::{Source, SourceRunner};

/// Opaque identity held in a pipeline's throttle set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThrottleToken(Arc<str>);

impl ThrottleToken {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ThrottleToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ThrottleToken {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for ThrottleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The error that put a pipeline into error state.
#[derive(Debug, Clone)]
pub struct ErrorState<E> {
    pub context: Context,
    pub event: Option<E>,
    pub cause: Arc<PumpError>,
}

/// Work delivered back to the dispatcher by deferred tasks.
enum Reentry<E> {
    Event {
        context: Context,
        event: E,
        depth: usize,
    },
    Error {
        context: Context,
        cause: PumpError,
    },
}

/// Handle used by deferred tasks to deliver results into a pipeline.
pub struct Injector<E> {
    pipeline: Arc<str>,
    depths: usize,
    tx: mpsc::UnboundedSender<Reentry<E>>,
}

impl<E> Clone for Injector<E> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            depths: self.depths,
            tx: self.tx.clone(),
        }
    }
}

impl<E: Event> Injector<E> {
    /// Schedule `event` for dispatch at `depth`.
    pub fn inject(&self, context: Context, event: E, depth: usize) -> Result<()> {
        if depth >= self.depths {
            return Err(PumpError::construction(format!(
                "pipeline '{}' has no depth {depth} (depths: {})",
                self.pipeline, self.depths
            )));
        }
        self.tx
            .send(Reentry::Event {
                context,
                event,
                depth,
            })
            .map_err(|_| PumpError::ChannelClosed("pipeline dispatcher"))
    }

    /// Forward a failure of a deferred task to the pipeline's error state.
    pub fn report_error(&self, context: Context, cause: PumpError) {
        if self.tx.send(Reentry::Error { context, cause }).is_err() {
            warn!(pipeline = %self.pipeline, "Dispatcher gone, dropping deferred error");
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline
    }

    pub fn depths(&self) -> usize {
        self.depths
    }
}

/// Synchronous face of a generator inside the dispatch walk.
pub(crate) struct GeneratorStage<E: Event> {
    generator: Arc<dyn Generator<E>>,
    depth: usize,
    injector: Injector<E>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl<E: Event> Processor<E> for GeneratorStage<E> {
    fn name(&self) -> &str {
        self.generator.name()
    }

    /// Spawn `generate` for the next depth and report the event consumed.
    fn process(&self, context: &Context, event: E) -> Result<Outcome<E>> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            PumpError::construction(format!(
                "generator '{}' requires a tokio runtime",
                self.generator.name()
            ))
        })?;

        let generator = self.generator.clone();
        let injector = self.injector.clone();
        let cancel = self.cancel.clone();
        let context = context.clone();
        let depth = self.depth + 1;
        self.tasks.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = generator.generate(context.clone(), event, depth, &injector) => {
                        if let Err(e) = result
                            && !e.is_cancelled()
                        {
                            injector.report_error(context, e);
                        }
                    }
                }
            },
            &handle,
        );
        Ok(Outcome::Drop)
    }
}

enum Stage<E: Event> {
    Processor(Arc<dyn Processor<E>>),
    Sink(Arc<dyn Sink<E>>),
    Generator(GeneratorStage<E>),
}

impl<E: Event> Stage<E> {
    fn name(&self) -> &str {
        match self {
            Stage::Processor(p) => p.name(),
            Stage::Sink(s) => s.name(),
            Stage::Generator(g) => g.name(),
        }
    }
}

struct Readiness<E> {
    throttles: HashSet<ThrottleToken>,
    error: Option<ErrorState<E>>,
    /// Pending `ready()` calls, oldest first.
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl<E> Readiness<E> {
    fn is_ready(&self) -> bool {
        self.throttles.is_empty() && self.error.is_none()
    }
}

/// A source plus its depth-indexed processor chain.
pub struct Pipeline<E: Event> {
    id: Arc<str>,
    depths: Vec<Vec<Stage<E>>>,
    generators: Vec<Arc<dyn Generator<E>>>,
    source: SourceRunner<E>,
    state: Mutex<Readiness<E>>,
    ready: AtomicBool,
    /// Readiness last announced on the bus.
    published: ReentrantMutex<Cell<bool>>,
    bus: EventBus,
    error_handler: Arc<dyn ErrorHandler<E>>,
    metrics: PipelineMetrics,
    injector: Injector<E>,
    reentry_rx: Mutex<Option<mpsc::UnboundedReceiver<Reentry<E>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    stop_timeout: Duration,
}

impl<E: Event> Pipeline<E> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Number of depths (generators + 1).
    pub fn depth_count(&self) -> usize {
        self.depths.len()
    }

    /// Stage names per depth, in dispatch order.
    pub fn layout(&self) -> Vec<Vec<String>> {
        self.depths
            .iter()
            .map(|stages| stages.iter().map(|s| s.name().to_string()).collect())
            .collect()
    }

    pub fn source(&self) -> Arc<dyn Source<E>> {
        self.source.source().clone()
    }

    pub fn injector(&self) -> &Injector<E> {
        &self.injector
    }

    /// Dispatch a new event at depth 0.
    pub fn process(&self, context: Context, event: E) -> Result<()> {
        self.metrics.record_in();
        self.dispatch(&context, event, 0)
    }

    /// Wait until the pipeline is ready, then dispatch at depth 0.
    pub async fn process_when_ready(&self, context: Context, event: E) -> Result<()> {
        self.ready().await;
        self.process(context, event)
    }

    /// Schedule `event` for dispatch at `depth` on the dispatcher task.
    pub fn inject(&self, context: Context, event: E, depth: usize) -> Result<()> {
        self.injector.inject(context, event, depth)
    }

    fn dispatch(&self, context: &Context, event: E, depth: usize) -> Result<()> {
        let stages = self.depths.get(depth).ok_or_else(|| {
            PumpError::construction(format!("pipeline '{}' has no depth {depth}", self.id))
        })?;

        let mut event = event;
        for stage in stages {
            let outcome = match stage {
                Stage::Processor(processor) => processor.process(context, event)?,
                Stage::Sink(sink) => {
                    sink.consume(context, event)?;
                    self.metrics.record_out();
                    return Ok(());
                }
                Stage::Generator(generator) => {
                    generator.process(context, event)?;
                    return Ok(());
                }
            };

            match outcome {
                Outcome::Next(next) => event = next,
                Outcome::Drop => {
                    self.metrics.record_drop();
                    return Ok(());
                }
                Outcome::Many(items) => {
                    if depth + 1 >= self.depths.len() {
                        return Err(PumpError::construction(format!(
                            "'{}' fanned out at the last depth of pipeline '{}'",
                            stage.name(),
                            self.id
                        )));
                    }
                    for item in items {
                        self.dispatch(context, item, depth + 1)?;
                    }
                    return Ok(());
                }
            }
        }

        Err(PumpError::construction(format!(
            "event reached the end of depth {depth} in pipeline '{}' without being consumed by a sink",
            self.id
        )))
    }

    /// Add (`enable`) or remove a throttle token.
    pub fn throttle(&self, token: impl Into<ThrottleToken>, enable: bool) {
        let token = token.into();
        {
            let mut state = self.state.lock();
            let changed = if enable {
                state.throttles.insert(token.clone())
            } else {
                state.throttles.remove(&token)
            };
            if changed {
                debug!(pipeline = %self.id, token = %token, enable, "Throttle updated");
            }
            self.refresh_readiness(&mut state);
        }
        self.publish_readiness();
    }

    /// Currently held throttle tokens, sorted.
    pub fn throttles(&self) -> Vec<ThrottleToken> {
        let mut tokens: Vec<_> = self.state.lock().throttles.iter().cloned().collect();
        tokens.sort();
        tokens
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Resolve once no throttle token is held and no error is active.
    pub async fn ready(&self) {
        let waiter = {
            let mut state = self.state.lock();
            if state.is_ready() {
                return;
            }
            state.waiters.retain(|waiter| !waiter.is_closed());
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        // Senders are only dropped unfired together with the pipeline.
        let _ = waiter.await;
    }

    /// Record an error, or clear the error state when `cause` is `None`.
    ///
    /// The error handler may suppress the error, in which case the pipeline
    /// keeps running.
    pub fn set_error(&self, context: Context, event: Option<E>, cause: Option<PumpError>) {
        let Some(cause) = cause else {
            self.clear_error();
            return;
        };

        if !self
            .error_handler
            .handle_error(&cause, &context, event.as_ref())
        {
            self.metrics.record_suppressed();
            warn!(pipeline = %self.id, error = %cause, "Error suppressed");
            return;
        }

        self.metrics.record_error();
        error!(pipeline = %self.id, error = %cause, "Pipeline stopped due to an error");
        {
            let mut state = self.state.lock();
            if state.error.is_some() {
                warn!(pipeline = %self.id, "Replacing an already active error");
            }
            state.error = Some(ErrorState {
                context,
                event,
                cause: Arc::new(cause),
            });
            self.refresh_readiness(&mut state);
        }
        self.publish_readiness();
    }

    /// Reset the error state.
    pub fn clear_error(&self) {
        {
            let mut state = self.state.lock();
            if state.error.take().is_none() {
                return;
            }
            info!(pipeline = %self.id, "Error cleared");
            self.refresh_readiness(&mut state);
        }
        self.publish_readiness();
    }

    pub fn is_error(&self) -> bool {
        self.state.lock().error.is_some()
    }

    pub fn error_state(&self) -> Option<ErrorState<E>> {
        self.state.lock().error.clone()
    }

    fn refresh_readiness(&self, state: &mut Readiness<E>) {
        let ready = state.is_ready();
        self.ready.store(ready, Ordering::SeqCst);
        if ready {
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    /// Announce the current readiness if it differs from the last announcement.
    ///
    /// Announcements are serialised, so subscribers always see alternating
    /// topics and the last one matches the current state. A listener may
    /// re-enter from the publishing thread.
    fn publish_readiness(&self) {
        let published = self.published.lock();
        let ready = self.is_ready();
        if published.get() == ready {
            return;
        }
        published.set(ready);
        if ready {
            debug!(pipeline = %self.id, "Pipeline ready");
            self.bus.publish(Topic::Ready, &self.id);
        } else {
            debug!(pipeline = %self.id, "Pipeline not ready");
            self.bus.publish(Topic::NotReady, &self.id);
        }
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let state = self.state.lock();
        let mut throttles: Vec<String> = state.throttles.iter().map(|t| t.to_string()).collect();
        throttles.sort();
        PipelineSnapshot {
            id: self.id.to_string(),
            ready: self.is_ready(),
            error: state.error.as_ref().map(|e| e.cause.to_string()),
            throttles,
            depths: self.depths.len(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Start the dispatcher, the generators and the source.
    pub fn start(self: &Arc<Self>) {
        if let Some(rx) = self.reentry_rx.lock().take() {
            for generator in &self.generators {
                generator.on_start(&self.injector);
            }
            *self.dispatcher.lock() = Some(tokio::spawn(self.clone().run_dispatcher(rx)));
            info!(pipeline = %self.id, depths = self.depths.len(), "Pipeline started");
        }
        self.source.start(self.clone());
    }

    /// Stop the source, let deferred work finish, then stop the dispatcher.
    ///
    /// Generator tasks get the stop timeout to complete before they are
    /// cancelled. Everything injected up to that point is still dispatched.
    pub async fn stop(&self) {
        self.source.stop().await;

        self.tasks.close();
        if tokio::time::timeout(self.stop_timeout, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                pipeline = %self.id,
                pending = self.tasks.len(),
                "Generator tasks did not finish, cancelling"
            );
            self.cancel.cancel();
            self.tasks.wait().await;
        }
        for generator in &self.generators {
            generator.on_stop().await;
        }

        self.cancel.cancel();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher
            && let Err(e) = handle.await
        {
            warn!(pipeline = %self.id, error = %e, "Dispatcher task failed");
        }
        info!(pipeline = %self.id, "Pipeline stopped");
    }

    /// Restart the source if its task has finished.
    pub async fn restart_source(self: &Arc<Self>) -> Result<()> {
        self.source.restart(self.clone()).await
    }

    async fn run_dispatcher(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Reentry<E>>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => self.handle_reentry(message),
                    None => break,
                },
            }
        }

        // Results injected before the stop still reach their depth.
        let mut drained = 0usize;
        while let Ok(message) = rx.try_recv() {
            self.handle_reentry(message);
            drained += 1;
        }
        debug!(pipeline = %self.id, drained, "Dispatcher stopped");
    }

    fn handle_reentry(&self, message: Reentry<E>) {
        match message {
            Reentry::Event {
                context,
                event,
                depth,
            } => {
                if let Err(e) = self.dispatch(&context, event, depth) {
                    self.set_error(context, None, Some(e));
                }
            }
            Reentry::Error { context, cause } => self.set_error(context, None, Some(cause)),
        }
    }
}

impl<E: Event> fmt::Debug for Pipeline<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("depths", &self.layout())
            .field("ready", &self.is_ready())
            .finish()
    }
}

enum StageSpec<E: Event> {
    Processor(Arc<dyn Processor<E>>),
    Sink(Arc<dyn Sink<E>>),
    Generator(Arc<dyn Generator<E>>),
}

/// Builder assembling a [`Pipeline`].
///
/// Stages are appended in dispatch order; appending a generator opens the
/// next depth.
pub struct PipelineBuilder<E: Event> {
    id: String,
    config: PipelineConfig,
    source: Option<Arc<dyn Source<E>>>,
    depths: Vec<Vec<StageSpec<E>>>,
    error_handler: Arc<dyn ErrorHandler<E>>,
}

impl<E: Event> PipelineBuilder<E> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: PipelineConfig::default(),
            source: None,
            depths: vec![Vec::new()],
            error_handler: Arc::new(FailOnError),
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn source<S: Source<E>>(self, source: S) -> Self {
        self.source_arc(Arc::new(source))
    }

    pub fn source_arc(mut self, source: Arc<dyn Source<E>>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn processor<P: Processor<E> + 'static>(self, processor: P) -> Self {
        self.processor_arc(Arc::new(processor))
    }

    pub fn processor_arc(mut self, processor: Arc<dyn Processor<E>>) -> Self {
        self.push(StageSpec::Processor(processor));
        self
    }

    pub fn sink<S: Sink<E> + 'static>(self, sink: S) -> Self {
        self.sink_arc(Arc::new(sink))
    }

    pub fn sink_arc(mut self, sink: Arc<dyn Sink<E>>) -> Self {
        self.push(StageSpec::Sink(sink));
        self
    }

    pub fn generator<G: Generator<E> + 'static>(self, generator: G) -> Self {
        self.generator_arc(Arc::new(generator))
    }

    pub fn generator_arc(mut self, generator: Arc<dyn Generator<E>>) -> Self {
        self.push(StageSpec::Generator(generator));
        self.depths.push(Vec::new());
        self
    }

    pub fn error_handler<H: ErrorHandler<E> + 'static>(mut self, handler: H) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    fn push(&mut self, stage: StageSpec<E>) {
        if let Some(last) = self.depths.last_mut() {
            last.push(stage);
        }
    }

    /// Validate the wiring and create the pipeline.
    pub fn build(self) -> Result<Arc<Pipeline<E>>> {
        let source = self.source.ok_or_else(|| {
            PumpError::construction(format!("pipeline '{}' has no source", self.id))
        })?;

        for (depth, stages) in self.depths.iter().enumerate() {
            if stages.is_empty() {
                return Err(PumpError::construction(if depth == 0 {
                    format!("pipeline '{}' has no stages", self.id)
                } else {
                    format!(
                        "generator at depth {} of pipeline '{}' has no successor stage",
                        depth - 1,
                        self.id
                    )
                }));
            }
            let last = stages.len() - 1;
            if let Some(index) = stages[..last]
                .iter()
                .position(|stage| matches!(stage, StageSpec::Sink(_)))
            {
                return Err(PumpError::construction(format!(
                    "sink at position {index} of depth {depth} in pipeline '{}' is followed by other stages",
                    self.id
                )));
            }
        }

        let id: Arc<str> = self.id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let injector = Injector {
            pipeline: id.clone(),
            depths: self.depths.len(),
            tx,
        };
        let tasks = TaskTracker::new();
        let cancel = CancellationToken::new();

        let mut generators = Vec::new();
        let mut depths = Vec::with_capacity(self.depths.len());
        for (depth, specs) in self.depths.into_iter().enumerate() {
            let mut stages = Vec::with_capacity(specs.len());
            for spec in specs {
                stages.push(match spec {
                    StageSpec::Processor(p) => Stage::Processor(p),
                    StageSpec::Sink(s) => Stage::Sink(s),
                    StageSpec::Generator(g) => {
                        generators.push(g.clone());
                        Stage::Generator(GeneratorStage {
                            generator: g,
                            depth,
                            injector: injector.clone(),
                            tasks: tasks.clone(),
                            cancel: cancel.clone(),
                        })
                    }
                });
            }
            depths.push(stages);
        }

        let pipeline = Arc::new(Pipeline {
            bus: EventBus::with_capacity(id.clone(), self.config.bus_capacity),
            id,
            depths,
            generators,
            source: SourceRunner::new(source, self.config.stop_timeout()),
            state: Mutex::new(Readiness {
                throttles: HashSet::new(),
                error: None,
                waiters: VecDeque::new(),
            }),
            ready: AtomicBool::new(true),
            published: ReentrantMutex::new(Cell::new(true)),
            error_handler: self.error_handler,
            metrics: PipelineMetrics::default(),
            injector,
            reentry_rx: Mutex::new(Some(rx)),
            dispatcher: Mutex::new(None),
            tasks,
            cancel,
            stop_timeout: self.config.stop_timeout(),
        });

        let weak = Arc::downgrade(&pipeline);
        pipeline.source.source().attach(&weak);
        for stage in pipeline.depths.iter().flatten() {
            attach_stage(stage, &weak);
        }

        Ok(pipeline)
    }
}

fn attach_stage<E: Event>(stage: &Stage<E>, pipeline: &Weak<Pipeline<E>>) {
    match stage {
        Stage::Processor(p) => p.attach(pipeline),
        Stage::Sink(s) => s.attach(pipeline),
        Stage::Generator(g) => g.generator.attach(pipeline),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMessage;
    use crate::common::{CollectSink, FnProcessor, ManualSource};
    use crate::test_utils::init_tracing;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Uppercase;

    impl Processor<String> for Uppercase {
        fn name(&self) -> &str {
            "Uppercase"
        }

        fn process(&self, _context: &Context, event: String) -> Result<Outcome<String>> {
            Ok(Outcome::Next(event.to_uppercase()))
        }
    }

    struct SplitChars;

    #[async_trait]
    impl Generator<String> for SplitChars {
        fn name(&self) -> &str {
            "SplitChars"
        }

        async fn generate(
            &self,
            context: Context,
            event: String,
            depth: usize,
            injector: &Injector<String>,
        ) -> Result<()> {
            for c in event.chars() {
                injector.inject(context.clone(), c.to_string(), depth)?;
            }
            Ok(())
        }
    }

    fn collect_topics(pipeline: &Pipeline<String>) -> Arc<Mutex<Vec<Topic>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        pipeline
            .bus()
            .listen(&[Topic::Ready, Topic::NotReady], move |msg: &BusMessage| {
                sink.lock().push(msg.topic)
            });
        seen
    }

    #[test]
    fn depth_count_follows_generators() {
        let plain = PipelineBuilder::<String>::new("plain")
            .source(ManualSource::new("manual"))
            .processor(Uppercase)
            .sink(CollectSink::new())
            .build()
            .unwrap();
        assert_eq!(plain.depth_count(), 1);

        let generated = PipelineBuilder::<String>::new("generated")
            .source(ManualSource::new("manual"))
            .generator(SplitChars)
            .processor(Uppercase)
            .generator(SplitChars)
            .sink(CollectSink::new())
            .build()
            .unwrap();
        assert_eq!(generated.depth_count(), 3);
        assert_eq!(
            generated.layout(),
            vec![
                vec!["SplitChars".to_string()],
                vec!["Uppercase".to_string(), "SplitChars".to_string()],
                vec!["CollectSink".to_string()],
            ]
        );
    }

    #[test]
    fn builder_rejects_bad_wiring() {
        let no_source = PipelineBuilder::<String>::new("p")
            .sink(CollectSink::new())
            .build();
        assert!(no_source.unwrap_err().is_construction());

        let dangling_generator = PipelineBuilder::<String>::new("p")
            .source(ManualSource::new("m"))
            .generator(SplitChars)
            .build();
        assert!(dangling_generator.unwrap_err().is_construction());

        let after_sink = PipelineBuilder::<String>::new("p")
            .source(ManualSource::new("m"))
            .sink(CollectSink::new())
            .processor(Uppercase)
            .build();
        assert!(after_sink.unwrap_err().is_construction());
    }

    #[test]
    fn uppercase_reaches_sink_once() {
        let sink = CollectSink::new();
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .processor(Uppercase)
            .sink(sink.clone())
            .build()
            .unwrap();

        pipeline.process(Context::new(), "abc".to_string()).unwrap();
        assert_eq!(sink.events(), vec!["ABC".to_string()]);
        let metrics = pipeline.metrics().snapshot();
        assert_eq!(metrics.events_in, 1);
        assert_eq!(metrics.events_out, 1);
    }

    #[test]
    fn unconsumed_event_is_a_construction_error() {
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .processor(Uppercase)
            .build()
            .unwrap();

        let err = pipeline.process(Context::new(), "abc".to_string()).unwrap_err();
        assert!(err.is_construction(), "{err}");
    }

    #[test]
    fn filtered_event_is_dropped() {
        let sink = CollectSink::new();
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .processor(FnProcessor::new("skip-empty", |_: &Context, event: String| {
                Ok(if event.is_empty() {
                    Outcome::Drop
                } else {
                    Outcome::Next(event)
                })
            }))
            .sink(sink.clone())
            .build()
            .unwrap();

        pipeline.process(Context::new(), String::new()).unwrap();
        pipeline.process(Context::new(), "x".to_string()).unwrap();
        assert_eq!(sink.events(), vec!["x".to_string()]);
        assert_eq!(pipeline.metrics().snapshot().events_dropped, 1);
    }

    #[tokio::test]
    async fn fan_out_skips_rest_of_depth() {
        let sink = CollectSink::new();
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .processor(FnProcessor::new("words", |_: &Context, event: String| {
                let words: Vec<String> = event.split(' ').map(str::to_string).collect();
                Ok(Outcome::many(words))
            }))
            .generator(SplitChars)
            .processor(Uppercase)
            .sink(sink.clone())
            .build()
            .unwrap();

        pipeline.process(Context::new(), "ab cd".to_string()).unwrap();
        assert_eq!(sink.events(), vec!["AB".to_string(), "CD".to_string()]);
        assert_eq!(pipeline.metrics().snapshot().events_in, 1);
        assert_eq!(pipeline.metrics().snapshot().events_out, 2);
    }

    #[test]
    fn fan_out_at_last_depth_is_a_construction_error() {
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .processor(FnProcessor::new("twice", |_: &Context, event: String| {
                Ok(Outcome::many(vec![event.clone(), event]))
            }))
            .sink(CollectSink::new())
            .build()
            .unwrap();

        let err = pipeline.process(Context::new(), "a".to_string()).unwrap_err();
        assert!(err.is_construction());
    }

    #[tokio::test]
    async fn generator_results_are_injected_one_by_one() {
        init_tracing();
        let sink = CollectSink::new();
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .generator(SplitChars)
            .sink(sink.clone())
            .build()
            .unwrap();
        assert_eq!(pipeline.depth_count(), 2);
        pipeline.start();

        pipeline.process(Context::new(), "abc".to_string()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), sink.wait_for(3))
            .await
            .unwrap();

        assert_eq!(sink.events(), vec!["a", "b", "c"]);
        assert_eq!(pipeline.metrics().snapshot().events_in, 1);
        assert_eq!(pipeline.metrics().snapshot().events_out, 3);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn generator_stage_always_consumes() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let stage = GeneratorStage {
            generator: Arc::new(SplitChars) as Arc<dyn Generator<String>>,
            depth: 0,
            injector: Injector {
                pipeline: Arc::from("p"),
                depths: 2,
                tx,
            },
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        };

        for input in ["", "abc", "a much longer event"] {
            let outcome = stage.process(&Context::new(), input.to_string()).unwrap();
            assert!(outcome.is_drop());
        }
    }

    #[test]
    fn inject_rejects_missing_depth() {
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .sink(CollectSink::<String>::new())
            .build()
            .unwrap();

        let err = pipeline.inject(Context::new(), "x".to_string(), 1).unwrap_err();
        assert!(err.is_construction());
        pipeline.inject(Context::new(), "x".to_string(), 0).unwrap();
    }

    #[tokio::test]
    async fn ready_waits_for_every_token() {
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .sink(CollectSink::<String>::new())
            .build()
            .unwrap();
        let topics = collect_topics(&pipeline);

        pipeline.throttle("A", true);
        pipeline.throttle("B", true);
        pipeline.throttle("A", false);
        assert!(!pipeline.is_ready());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), pipeline.ready())
                .await
                .is_err()
        );

        let waiter = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.ready().await })
        };
        pipeline.throttle("B", false);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        assert!(pipeline.is_ready());
        assert_eq!(*topics.lock(), vec![Topic::NotReady, Topic::Ready]);
    }

    #[test]
    fn removing_unknown_token_is_harmless() {
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .sink(CollectSink::<String>::new())
            .build()
            .unwrap();
        let topics = collect_topics(&pipeline);

        pipeline.throttle("ghost", false);
        pipeline.throttle("A", true);
        pipeline.throttle("A", true);
        assert_eq!(pipeline.throttles(), vec![ThrottleToken::from("A")]);
        assert_eq!(*topics.lock(), vec![Topic::NotReady]);
    }

    #[test]
    fn error_state_follows_handler() {
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .sink(CollectSink::<String>::new())
            .error_handler(|cause: &PumpError, _: &Context, _: Option<&String>| {
                !matches!(cause, PumpError::Processing { .. })
            })
            .build()
            .unwrap();

        pipeline.set_error(
            Context::new(),
            Some("bad".to_string()),
            Some(PumpError::processing("parser", std::io::Error::other("bad"))),
        );
        assert!(!pipeline.is_error());
        assert!(pipeline.is_ready());

        pipeline.set_error(
            Context::new(),
            Some("worse".to_string()),
            Some(PumpError::other(std::io::Error::other("boom"))),
        );
        assert!(pipeline.is_error());
        assert!(!pipeline.is_ready());
        let state = pipeline.error_state().unwrap();
        assert_eq!(state.event.as_deref(), Some("worse"));
        assert_eq!(pipeline.snapshot().error.as_deref(), Some("boom"));

        pipeline.set_error(Context::new(), None, None);
        assert!(!pipeline.is_error());
        assert!(pipeline.is_ready());

        let metrics = pipeline.metrics().snapshot();
        assert_eq!(metrics.errors, 1);
        assert_eq!(metrics.suppressed, 1);
    }

    #[test]
    fn error_and_throttle_both_gate_readiness() {
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .sink(CollectSink::<String>::new())
            .build()
            .unwrap();

        pipeline.throttle("A", true);
        pipeline.set_error(Context::new(), None, Some(PumpError::config("broken")));
        pipeline.throttle("A", false);
        assert!(!pipeline.is_ready());
        pipeline.clear_error();
        assert!(pipeline.is_ready());
    }

    #[tokio::test]
    async fn ready_waiters_resume_in_arrival_order() {
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .sink(CollectSink::<String>::new())
            .build()
            .unwrap();
        pipeline.throttle("A", true);

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for i in 0..5 {
            let pipeline = pipeline.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                pipeline.ready().await;
                order.lock().push(i);
            }));
            // Let waiter `i` register before the next one is spawned.
            tokio::task::yield_now().await;
        }

        pipeline.throttle("A", false);
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn concurrent_toggles_publish_alternating_topics() {
        let pipeline = PipelineBuilder::new("p")
            .source(ManualSource::new("m"))
            .sink(CollectSink::<String>::new())
            .build()
            .unwrap();
        let topics = collect_topics(&pipeline);

        std::thread::scope(|scope| {
            for token in ["A", "B", "C"] {
                let pipeline = &pipeline;
                scope.spawn(move || {
                    for _ in 0..500 {
                        pipeline.throttle(token, true);
                        pipeline.throttle(token, false);
                    }
                });
            }
        });

        let topics = topics.lock();
        assert!(!topics.is_empty());
        assert!(
            topics.windows(2).all(|pair| pair[0] != pair[1]),
            "readiness topics must alternate"
        );
        assert_eq!(topics.last(), Some(&Topic::Ready));
        assert!(pipeline.is_ready());
    }
}
