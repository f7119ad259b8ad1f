//! Declarative pipeline construction.
//!
//! A [`StageRegistry`] maps type identifiers to constructor functions. A
//! [`PipelineDefinition`] names its source and stages by those identifiers
//! and is resolved into a [`PipelineBuilder`] at startup.
//!
//! ```toml
//! [[triggers]]
//! id = "once"
//! kind = "run_once"
//!
//! [[pipelines]]
//! id = "main"
//! source = { type = "lines", triggers = ["once"], args = { lines = ["a b"] } }
//! stages = [{ type = "uppercase" }, { type = "print" }]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{LatchProcessor, NullSink};
use crate::config::{
    InternalSourceConfig, LatchConfig, OpportunisticConfig, PeriodicConfig, PipelineConfig,
};
use crate::error::{PumpError, Result};
use crate::internal::InternalSource;
use crate::pipeline::PipelineBuilder;
use crate::processor::{Event, Generator, Processor, Sink};
use crate::routing::{RouterSink, TeeProcessor};
use crate::service::PumpService;
use crate::source::Source;
use crate::trigger::{
    CycleSource, OpportunisticTrigger, PeriodicTrigger, RunOnceTrigger, Trigger, TriggerSource,
};

/// One source or stage of a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Registered type identifier.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    /// Triggers a trigger-driven source subscribes to.
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl StageDefinition {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            triggers: Vec::new(),
            args: serde_json::Value::Null,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    /// The explicit id, or the type identifier.
    pub fn id_or_kind(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.kind)
    }

    /// Deserialize `args` into `T`; missing args use `T`'s defaults.
    pub fn parse_args<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.args.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.args.clone()).map_err(|e| {
            PumpError::config(format!("invalid args for '{}': {e}", self.id_or_kind()))
        })
    }

    /// A required string argument.
    pub fn str_arg(&self, key: &str) -> Result<&str> {
        self.args.get(key).and_then(|v| v.as_str()).ok_or_else(|| {
            PumpError::config(format!(
                "'{}' requires a string argument '{key}'",
                self.id_or_kind()
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    #[serde(default)]
    pub config: PipelineConfig,
    pub source: StageDefinition,
    /// Processors, generators and the final sink, in dispatch order.
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    RunOnce,
    Opportunistic(OpportunisticConfig),
    Periodic(PeriodicConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub id: String,
    #[serde(default)]
    pub max_triggered: Option<usize>,
    #[serde(flatten)]
    pub kind: TriggerKind,
}

impl TriggerDefinition {
    pub fn create(&self) -> Arc<Trigger> {
        let trigger = Trigger::new(self.id.clone());
        Arc::new(match self.max_triggered {
            Some(max) => trigger.with_max_triggered(max),
            None => trigger,
        })
    }
}

/// Start the firing policy described by `definition` for `trigger`.
pub fn spawn_trigger(
    definition: &TriggerDefinition,
    trigger: Arc<Trigger>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    debug!(trigger = trigger.id(), kind = ?definition.kind, "Spawning trigger policy");
    match &definition.kind {
        TriggerKind::RunOnce => RunOnceTrigger::new(trigger, shutdown).spawn(cancel),
        TriggerKind::Opportunistic(config) => {
            OpportunisticTrigger::new(trigger, config.clone()).spawn(cancel)
        }
        TriggerKind::Periodic(config) => PeriodicTrigger::new(trigger, config.clone()).spawn(cancel),
    }
}

/// What constructors may reach while building.
pub struct FactoryContext<E: Event> {
    pub service: Arc<PumpService<E>>,
    pub triggers: HashMap<String, Arc<Trigger>>,
}

impl<E: Event> FactoryContext<E> {
    pub fn new(service: Arc<PumpService<E>>) -> Self {
        Self {
            service,
            triggers: HashMap::new(),
        }
    }

    pub fn with_trigger(mut self, trigger: Arc<Trigger>) -> Self {
        self.triggers.insert(trigger.id().to_string(), trigger);
        self
    }

    pub fn trigger(&self, id: &str) -> Result<Arc<Trigger>> {
        self.triggers
            .get(id)
            .cloned()
            .ok_or_else(|| PumpError::config(format!("unknown trigger '{id}'")))
    }

    /// Wrap `cycle` in a [`TriggerSource`] subscribed to the triggers listed
    /// in `definition`.
    pub fn trigger_source<C: CycleSource<E>>(
        &self,
        definition: &StageDefinition,
        cycle: C,
    ) -> Result<Arc<dyn Source<E>>> {
        if definition.triggers.is_empty() {
            return Err(PumpError::config(format!(
                "source '{}' is not subscribed to any trigger",
                definition.id_or_kind()
            )));
        }
        let mut source = TriggerSource::new(cycle);
        for id in &definition.triggers {
            source = source.on(&self.trigger(id)?);
        }
        Ok(Arc::new(source))
    }
}

type Ctor<T, E> = Arc<dyn Fn(&StageDefinition, &FactoryContext<E>) -> Result<T> + Send + Sync>;

enum Factory<E: Event> {
    Source(Ctor<Arc<dyn Source<E>>, E>),
    Processor(Ctor<Arc<dyn Processor<E>>, E>),
    Sink(Ctor<Arc<dyn Sink<E>>, E>),
    Generator(Ctor<Arc<dyn Generator<E>>, E>),
}

impl<E: Event> Factory<E> {
    fn kind(&self) -> &'static str {
        match self {
            Factory::Source(_) => "source",
            Factory::Processor(_) => "processor",
            Factory::Sink(_) => "sink",
            Factory::Generator(_) => "generator",
        }
    }
}

/// Type identifier to constructor mapping.
pub struct StageRegistry<E: Event> {
    factories: HashMap<String, Factory<E>>,
}

impl<E: Event> Default for StageRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> StageRegistry<E> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry preloaded with the generic stages.
    ///
    /// | type       | kind      | args |
    /// |------------|-----------|------|
    /// | `internal` | source    | [`InternalSourceConfig`] |
    /// | `null`     | sink      | |
    /// | `latch`    | processor | [`LatchConfig`] |
    /// | `route`    | sink      | `target` address |
    /// | `tee`      | processor | `target` address |
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_source("internal", |def, _| {
            let config: InternalSourceConfig = def.parse_args()?;
            Ok(Arc::new(InternalSource::new(def.id_or_kind(), config)?))
        });
        registry.register_sink("null", |_, _| Ok(Arc::new(NullSink)));
        registry.register_processor("latch", |def, _| {
            let config: LatchConfig = def.parse_args()?;
            Ok(Arc::new(LatchProcessor::from_config(&config)))
        });
        registry.register_sink("route", |def, ctx| {
            Ok(Arc::new(RouterSink::fixed(
                def.id_or_kind(),
                &ctx.service,
                def.str_arg("target")?,
            )))
        });
        registry.register_processor("tee", |def, ctx| {
            Ok(Arc::new(TeeProcessor::new(
                def.id_or_kind(),
                &ctx.service,
                def.str_arg("target")?,
            )))
        });
        registry
    }

    pub fn register_source<F>(&mut self, kind: &str, f: F)
    where
        F: Fn(&StageDefinition, &FactoryContext<E>) -> Result<Arc<dyn Source<E>>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Factory::Source(Arc::new(f)));
    }

    pub fn register_processor<F>(&mut self, kind: &str, f: F)
    where
        F: Fn(&StageDefinition, &FactoryContext<E>) -> Result<Arc<dyn Processor<E>>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.to_string(), Factory::Processor(Arc::new(f)));
    }

    pub fn register_sink<F>(&mut self, kind: &str, f: F)
    where
        F: Fn(&StageDefinition, &FactoryContext<E>) -> Result<Arc<dyn Sink<E>>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Factory::Sink(Arc::new(f)));
    }

    pub fn register_generator<F>(&mut self, kind: &str, f: F)
    where
        F: Fn(&StageDefinition, &FactoryContext<E>) -> Result<Arc<dyn Generator<E>>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.to_string(), Factory::Generator(Arc::new(f)));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    fn factory(&self, kind: &str) -> Result<&Factory<E>> {
        self.factories
            .get(kind)
            .ok_or_else(|| PumpError::config(format!("unknown stage type '{kind}'")))
    }

    /// Resolve every stage of `definition`.
    pub fn build(
        &self,
        definition: &PipelineDefinition,
        ctx: &FactoryContext<E>,
    ) -> Result<PipelineBuilder<E>> {
        let source = match self.factory(&definition.source.kind)? {
            Factory::Source(f) => f(&definition.source, ctx)?,
            other => {
                return Err(PumpError::config(format!(
                    "'{}' is a {}, not a source",
                    definition.source.kind,
                    other.kind()
                )));
            }
        };

        let mut builder = PipelineBuilder::new(definition.id.clone())
            .config(definition.config.clone())
            .source_arc(source);
        for stage in &definition.stages {
            builder = match self.factory(&stage.kind)? {
                Factory::Processor(f) => builder.processor_arc(f(stage, ctx)?),
                Factory::Sink(f) => builder.sink_arc(f(stage, ctx)?),
                Factory::Generator(f) => builder.generator_arc(f(stage, ctx)?),
                Factory::Source(_) => {
                    return Err(PumpError::config(format!(
                        "source type '{}' cannot be used as a stage",
                        stage.kind
                    )));
                }
            };
        }
        debug!(pipeline = %definition.id, stages = definition.stages.len(), "Pipeline definition resolved");
        Ok(builder)
    }
}

impl<E: Event> fmt::Debug for StageRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("StageRegistry").field("types", &kinds).finish()
    }
}
