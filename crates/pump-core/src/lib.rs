//! # Pump Core
//!
//! Dataflow execution core for event pipelines.
//!
//! A [`Pipeline`] owns one [`Source`] and an ordered list of *depths*, each an
//! ordered list of stages. Sources push events into depth 0; processors
//! transform or drop them; a [`Generator`] hands an event to a deferred task
//! which injects its results into the next depth. Sinks end a depth.
//!
//! Flow control is cooperative: any collaborator can hold a throttle token
//! on a pipeline, and trigger-driven sources only start a new cycle once the
//! pipeline is ready again. [`InternalSource`] and [`Router`] carry that
//! backpressure across pipeline boundaries.
//!
//! ## Features
//!
//! - Depth-indexed dispatch with generator re-entry through a channel
//! - Trigger fan-out with bounded, shuffled arming
//! - Bounded out-of-band worker pools with sentinel drain
//! - Queue-backed pipeline handoff with watermark backpressure
//! - Declarative construction through a stage registry

pub mod bus;
pub mod common;
pub mod config;
mod context;
pub mod error;
pub mod internal;
pub mod metrics;
pub mod oob;
pub mod pipeline;
pub mod processor;
pub mod registry;
pub mod routing;
pub mod service;
pub mod source;
pub mod trigger;

#[cfg(test)]
pub(crate) mod test_utils;

/// Re-export key traits and types
pub use bus::{BusMessage, EventBus, Topic};
pub use context::Context;
pub use error::{PumpError, Result};
pub use internal::InternalSource;
pub use metrics::{MetricsSnapshot, PipelineSnapshot};
pub use oob::{OobGenerator, OobProcessor};
pub use pipeline::{Injector, Pipeline, PipelineBuilder, ThrottleToken};
pub use processor::{ErrorHandler, Event, Generator, Outcome, Processor, Sink};
pub use registry::{FactoryContext, PipelineDefinition, StageDefinition, StageRegistry, TriggerDefinition};
pub use routing::{Router, RouterSink, TeeProcessor};
pub use service::PumpService;
pub use source::Source;
pub use tokio_util::sync::CancellationToken;
pub use trigger::{CycleSource, Trigger, TriggerSource};
